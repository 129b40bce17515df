// Copyright 2026 the Sluice Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! [`KmsDevice`] on top of a DRM device node.

use std::collections::HashSet;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::Path;
use std::time::Duration;

use drm::buffer::{self, Buffer as _, DrmFourcc, DrmModifier, PlanarBuffer};
use drm::control::{self, AtomicCommitFlags, FbCmd2Flags, atomic::AtomicModeReq};
use drm::control::{Device as _, Event, framebuffer, plane};
use drm::{ClientCapability, Device as _};
use parking_lot::Mutex;
use rustix::event::{EventfdFlags, PollFd, PollFlags, Timespec};
use rustix::fs::OFlags;
use rustix::io::Errno;
use sluice_core::{
    BlobId, CommitFlags, CommitRequest, CompletionEvent, DumbAllocation, Error, FbId,
    FramebufferLayout, GemHandle, KmsDevice, Modifier, Result,
};

use crate::flips::FlipTracker;

struct DrmFile(File);

impl AsFd for DrmFile {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl drm::Device for DrmFile {}
impl control::Device for DrmFile {}

/// A DRM device node driven through the atomic API.
///
/// Opening enables the universal-planes and atomic client capabilities and
/// records which objects are CRTCs and planes, so that page-flip events can
/// be mapped back to the commits that caused them.
pub struct DrmDevice {
    file: DrmFile,
    crtcs: HashSet<u32>,
    planes: HashSet<u32>,
    /// Ids of every `CRTC_ID` property on planes and connectors.
    crtc_id_props: HashSet<u32>,
    flips: Mutex<FlipTracker>,
    wakeup: OwnedFd,
}

impl fmt::Debug for DrmDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrmDevice")
            .field("crtcs", &self.crtcs.len())
            .field("planes", &self.planes.len())
            .field("pending_flips", &self.flips.lock().pending_len())
            .finish_non_exhaustive()
    }
}

impl DrmDevice {
    /// Opens the device node at `path` (typically `/dev/dri/cardN`).
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = DrmFile(OpenOptions::new().read(true).write(true).open(path)?);
        file.set_client_capability(ClientCapability::UniversalPlanes, true)?;
        file.set_client_capability(ClientCapability::Atomic, true)?;

        let resources = file.resource_handles()?;
        let crtcs: HashSet<u32> = resources.crtcs().iter().map(|&c| u32::from(c)).collect();
        let plane_handles = file.plane_handles()?;
        let planes: HashSet<u32> = plane_handles.iter().map(|&p| u32::from(p)).collect();

        let mut crtc_id_props = HashSet::new();
        for &plane in &plane_handles {
            collect_crtc_id_props(&file, plane, &mut crtc_id_props)?;
        }
        for &connector in resources.connectors() {
            collect_crtc_id_props(&file, connector, &mut crtc_id_props)?;
        }

        let wakeup = rustix::event::eventfd(0, EventfdFlags::CLOEXEC | EventfdFlags::NONBLOCK)
            .map_err(io::Error::from)?;

        tracing::info!(
            path = %path.display(),
            crtcs = crtcs.len(),
            planes = planes.len(),
            "opened DRM device"
        );
        Ok(Self {
            file,
            crtcs,
            planes,
            crtc_id_props,
            flips: Mutex::new(FlipTracker::default()),
            wakeup,
        })
    }

    /// CRTCs whose page flip completes a commit of `req`.
    ///
    /// That is every CRTC the request touches directly, every CRTC a plane
    /// or connector is routed to, and the current CRTC of any plane written
    /// without a `CRTC_ID`.
    fn affected_crtcs(&self, req: &CommitRequest) -> Result<Vec<u32>> {
        let mut crtcs = Vec::new();
        let mut routed = HashSet::new();
        for (obj, prop, value) in req.iter() {
            if self.crtcs.contains(&obj.0) {
                crtcs.push(obj.0);
            }
            if self.crtc_id_props.contains(&prop.0) {
                routed.insert(obj.0);
                if let Ok(crtc) = u32::try_from(value)
                    && crtc != 0
                {
                    crtcs.push(crtc);
                }
            }
        }
        for &obj in &req.objects {
            if !self.planes.contains(&obj.0) || routed.contains(&obj.0) {
                continue;
            }
            let handle = handle::<plane::Handle>(obj.0)?;
            if let Some(crtc) = self.file.get_plane(handle)?.crtc() {
                crtcs.push(u32::from(crtc));
            }
        }
        Ok(crtcs)
    }

    fn drain_wakeup(&self) {
        let mut buf = [0_u8; 8];
        // Non-blocking; EAGAIN just means nobody woke us.
        _ = rustix::io::read(&self.wakeup, &mut buf);
    }
}

fn collect_crtc_id_props<H>(file: &DrmFile, object: H, out: &mut HashSet<u32>) -> Result<()>
where
    H: control::ResourceHandle,
{
    let props = file.get_properties(object)?;
    let (ids, _) = props.as_props_and_values();
    for &id in ids {
        if file.get_property(id)?.name().to_bytes() == b"CRTC_ID" {
            out.insert(u32::from(id));
        }
    }
    Ok(())
}

fn handle<T: From<control::RawResourceHandle>>(raw: u32) -> Result<T> {
    control::from_u32(raw).ok_or_else(|| Error::invalid("zero object id"))
}

fn commit_flags(flags: CommitFlags) -> AtomicCommitFlags {
    let mut out = AtomicCommitFlags::empty();
    out.set(AtomicCommitFlags::TEST_ONLY, flags.contains(CommitFlags::TEST_ONLY));
    out.set(AtomicCommitFlags::NONBLOCK, flags.contains(CommitFlags::NONBLOCK));
    out.set(
        AtomicCommitFlags::ALLOW_MODESET,
        flags.contains(CommitFlags::ALLOW_MODESET),
    );
    out.set(
        AtomicCommitFlags::PAGE_FLIP_EVENT,
        flags.contains(CommitFlags::PAGE_FLIP_EVENT),
    );
    out
}

fn timespec(timeout: Duration) -> Timespec {
    Timespec {
        tv_sec: timeout.as_secs().try_into().unwrap_or(i64::MAX),
        tv_nsec: timeout.subsec_nanos().into(),
    }
}

/// Adapts a [`FramebufferLayout`] to the shape `ADDFB2` expects.
struct Planar<'a> {
    layout: &'a FramebufferLayout,
    format: DrmFourcc,
    handles: [Option<buffer::Handle>; 4],
}

impl PlanarBuffer for Planar<'_> {
    fn size(&self) -> (u32, u32) {
        (self.layout.width, self.layout.height)
    }

    fn format(&self) -> DrmFourcc {
        self.format
    }

    fn modifier(&self) -> Option<DrmModifier> {
        match self.layout.modifiers[0] {
            Modifier::INVALID => None,
            Modifier(raw) => Some(DrmModifier::from(raw)),
        }
    }

    fn pitches(&self) -> [u32; 4] {
        self.layout.pitches
    }

    fn handles(&self) -> [Option<buffer::Handle>; 4] {
        self.handles
    }

    fn offsets(&self) -> [u32; 4] {
        self.layout.offsets
    }
}

impl KmsDevice for DrmDevice {
    fn atomic_commit(&self, req: &CommitRequest, flags: CommitFlags, tag: u64) -> Result<()> {
        let mut atomic = AtomicModeReq::new();
        for (obj, prop, value) in req.iter() {
            atomic.add_raw_property(handle(obj.0)?, handle(prop.0)?, value);
        }

        let wants_event =
            flags.contains(CommitFlags::PAGE_FLIP_EVENT) && !flags.contains(CommitFlags::TEST_ONLY);
        let expected = if wants_event {
            Some(self.affected_crtcs(req)?)
        } else {
            None
        };

        // Registered under the lock so a fast flip cannot be read first.
        let mut flips = self.flips.lock();
        self.file
            .atomic_commit(commit_flags(flags), atomic)
            .map_err(Error::from_commit_io)?;
        if let Some(crtcs) = expected {
            tracing::trace!(tag, ?crtcs, "awaiting page flip");
            flips.expect(tag, crtcs);
            if flips.has_ready() {
                drop(flips);
                self.wake();
            }
        }
        Ok(())
    }

    fn create_dumb(&self, width: u32, height: u32, bpp: u32) -> Result<DumbAllocation> {
        let format = match bpp {
            8 => DrmFourcc::C8,
            16 => DrmFourcc::Rgb565,
            _ => DrmFourcc::Xrgb8888,
        };
        let dumb = self
            .file
            .create_dumb_buffer((width, height), format, bpp)
            .map_err(|err| Error::exhausted(format!("dumb buffer {width}x{height}: {err}")))?;
        let pitch = dumb.pitch();
        Ok(DumbAllocation {
            handle: GemHandle(u32::from(dumb.handle())),
            pitch,
            size: u64::from(pitch) * u64::from(height),
        })
    }

    fn close_handle(&self, gem: GemHandle) -> Result<()> {
        self.file.close_buffer(handle(gem.0)?)?;
        Ok(())
    }

    fn import_fd(&self, fd: BorrowedFd<'_>) -> Result<GemHandle> {
        let gem = self.file.prime_fd_to_buffer(fd)?;
        Ok(GemHandle(u32::from(gem)))
    }

    fn export_fd(&self, gem: GemHandle) -> Result<OwnedFd> {
        let flags = (OFlags::CLOEXEC | OFlags::RDWR).bits();
        Ok(self.file.buffer_to_prime_fd(handle(gem.0)?, flags)?)
    }

    fn add_framebuffer(&self, layout: &FramebufferLayout) -> Result<FbId> {
        let format = DrmFourcc::try_from(layout.format.0)
            .map_err(|_| Error::invalid(format!("unknown format {:?}", layout.format)))?;
        let mut handles = [None; 4];
        for (slot, gem) in handles.iter_mut().zip(&layout.handles).take(layout.layers) {
            *slot = Some(handle(gem.0)?);
        }
        let planar = Planar {
            layout,
            format,
            handles,
        };
        let flags = if planar.modifier().is_some() {
            FbCmd2Flags::MODIFIERS
        } else {
            FbCmd2Flags::empty()
        };
        let fb = self.file.add_planar_framebuffer(&planar, flags)?;
        Ok(FbId(u32::from(fb)))
    }

    fn remove_framebuffer(&self, fb: FbId) -> Result<()> {
        self.file
            .destroy_framebuffer(handle::<framebuffer::Handle>(fb.0)?)?;
        Ok(())
    }

    fn create_blob(&self, data: &[u8]) -> Result<BlobId> {
        let mut bytes = data.to_vec();
        let blob = drm_ffi::mode::create_property_blob(self.file.as_fd(), &mut bytes)?;
        Ok(BlobId(blob.blob_id))
    }

    fn destroy_blob(&self, blob: BlobId) -> Result<()> {
        self.file.destroy_property_blob(u64::from(blob.0))?;
        Ok(())
    }

    fn read_events(&self, timeout: Duration) -> Result<Vec<CompletionEvent>> {
        let ready = self.flips.lock().take_ready();
        if !ready.is_empty() {
            return Ok(ready);
        }

        let mut fds = [
            PollFd::new(&self.file, PollFlags::IN),
            PollFd::new(&self.wakeup, PollFlags::IN),
        ];
        match rustix::event::poll(&mut fds, Some(&timespec(timeout))) {
            Ok(_) => {}
            Err(Errno::INTR) => return Ok(Vec::new()),
            Err(err) => return Err(io::Error::from(err).into()),
        }
        let drm_ready = fds[0].revents().contains(PollFlags::IN);
        if fds[1].revents().contains(PollFlags::IN) {
            self.drain_wakeup();
        }

        let mut flips = self.flips.lock();
        let mut out = flips.take_ready();
        if drm_ready {
            for event in self.file.receive_events()? {
                match event {
                    Event::PageFlip(flip) => {
                        let crtc = u32::from(flip.crtc);
                        out.extend(flips.flipped(crtc, flip.frame, flip.duration));
                    }
                    _ => tracing::trace!("ignoring non-flip DRM event"),
                }
            }
        }
        Ok(out)
    }

    fn wake(&self) {
        if let Err(err) = rustix::io::write(&self.wakeup, &1_u64.to_ne_bytes()) {
            tracing::debug!(%err, "wakeup write failed");
        }
    }
}

// Only the object-id helpers are testable without a device node.
#[cfg(test)]
mod tests {
    use sluice_core::{CommitFlags, Error};

    use super::{AtomicCommitFlags, commit_flags, handle, plane};

    #[test]
    fn commit_flags_translate_bit_for_bit() {
        let flags = commit_flags(CommitFlags::NONBLOCK | CommitFlags::PAGE_FLIP_EVENT);
        assert_eq!(
            flags,
            AtomicCommitFlags::NONBLOCK | AtomicCommitFlags::PAGE_FLIP_EVENT
        );
        assert_eq!(
            commit_flags(CommitFlags::TEST_ONLY | CommitFlags::ALLOW_MODESET),
            AtomicCommitFlags::TEST_ONLY | AtomicCommitFlags::ALLOW_MODESET
        );
    }

    #[test]
    fn zero_ids_are_invalid() {
        assert!(matches!(
            handle::<plane::Handle>(0),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(u32::from(handle::<plane::Handle>(31).unwrap()), 31);
    }
}
