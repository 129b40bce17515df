// Copyright 2026 the Sluice Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Scriptable in-memory [`KmsDevice`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rustix::fs::MemfdFlags;
use sluice_core::device::{DumbAllocation, FramebufferLayout};
use sluice_core::{
    BlobId, CommitFlags, CommitRequest, CompletionEvent, Error, FbId, GemHandle, KmsDevice,
    ObjectId, PropertyId, Result,
};

/// One call to [`KmsDevice::atomic_commit`] as the fake saw it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedCommit {
    /// The flattened request.
    pub request: CommitRequest,
    /// Flags passed with the request.
    pub flags: CommitFlags,
    /// Completion tag.
    pub tag: u64,
}

impl RecordedCommit {
    /// Returns `true` for validation-only commits.
    #[must_use]
    pub fn is_test(&self) -> bool {
        self.flags.contains(CommitFlags::TEST_ONLY)
    }

    /// Value written to `(obj, prop)` by this commit.
    #[must_use]
    pub fn value(&self, obj: ObjectId, prop: PropertyId) -> Option<u64> {
        self.request
            .iter()
            .find(|&(o, p, _)| o == obj && p == prop)
            .map(|(_, _, v)| v)
    }
}

/// Kernel object counters kept by [`FakeDevice`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FakeCounters {
    /// Dumb buffers created.
    pub dumb_created: usize,
    /// PRIME imports that produced a new handle.
    pub imports: usize,
    /// GEM handles closed.
    pub handles_closed: usize,
    /// GEM handles currently open.
    pub live_handles: usize,
    /// Framebuffers registered.
    pub framebuffers_added: usize,
    /// Framebuffers removed.
    pub framebuffers_removed: usize,
    /// Blobs created.
    pub blobs_created: usize,
    /// Blobs destroyed.
    pub blobs_destroyed: usize,
}

#[derive(Default)]
struct FakeState {
    commits: Vec<RecordedCommit>,
    applied: HashMap<(ObjectId, PropertyId), u64>,
    rejected: HashSet<(ObjectId, PropertyId)>,
    busy_remaining: u32,
    io_failures: u32,
    auto_complete: bool,
    in_flight: VecDeque<CompletionEvent>,
    ready: VecDeque<CompletionEvent>,
    woken: bool,
    sequence: u32,
    next_id: u32,
    handles: HashSet<GemHandle>,
    by_identity: HashMap<(u64, u64), GemHandle>,
    framebuffers: HashMap<FbId, FramebufferLayout>,
    blobs: HashMap<BlobId, Vec<u8>>,
    counters: FakeCounters,
}

impl FakeState {
    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-memory stand-in for a KMS device.
///
/// Commits are recorded and, unless a failure is scripted, applied to a
/// property map. Non-blocking commits that request an event stay in flight
/// until the test completes them with [`complete_next`](Self::complete_next)
/// or [`complete_all`](Self::complete_all), or immediately when
/// [`set_auto_complete`](Self::set_auto_complete) is on.
///
/// PRIME imports are keyed by the identity (device and inode) of the file
/// behind the descriptor, so two descriptors for the same file import as the
/// same handle.
#[derive(Default)]
pub struct FakeDevice {
    state: Mutex<FakeState>,
    events: Condvar,
}

impl std::fmt::Debug for FakeDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("FakeDevice")
            .field("commits", &state.commits.len())
            .field("in_flight", &state.in_flight.len())
            .field("counters", &state.counters)
            .finish_non_exhaustive()
    }
}

impl FakeDevice {
    /// Creates a device that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every commit that writes `(obj, prop)` fail validation.
    pub fn reject(&self, obj: ObjectId, prop: PropertyId) {
        self.state.lock().rejected.insert((obj, prop));
    }

    /// Clears every rule installed with [`reject`](Self::reject).
    pub fn accept_all(&self) {
        self.state.lock().rejected.clear();
    }

    /// Fails the next `count` real commits with [`Error::Busy`].
    pub fn fail_busy(&self, count: u32) {
        self.state.lock().busy_remaining = count;
    }

    /// Fails the next `count` real commits with an I/O error.
    pub fn fail_io(&self, count: u32) {
        self.state.lock().io_failures = count;
    }

    /// Completes non-blocking commits as soon as they are submitted.
    pub fn set_auto_complete(&self, on: bool) {
        let mut state = self.state.lock();
        state.auto_complete = on;
        if on {
            let flushed: Vec<_> = state.in_flight.drain(..).collect();
            state.ready.extend(flushed);
            self.events.notify_all();
        }
    }

    /// Delivers the completion of the oldest in-flight commit.
    ///
    /// Returns `false` when nothing was in flight.
    pub fn complete_next(&self) -> bool {
        let mut state = self.state.lock();
        let Some(event) = state.in_flight.pop_front() else {
            return false;
        };
        state.ready.push_back(event);
        self.events.notify_all();
        true
    }

    /// Delivers every in-flight completion. Returns how many there were.
    pub fn complete_all(&self) -> usize {
        let mut state = self.state.lock();
        let flushed: Vec<_> = state.in_flight.drain(..).collect();
        let count = flushed.len();
        state.ready.extend(flushed);
        self.events.notify_all();
        count
    }

    /// Tags of the commits still in flight, oldest first.
    #[must_use]
    pub fn in_flight_tags(&self) -> Vec<u64> {
        self.state.lock().in_flight.iter().map(|e| e.tag).collect()
    }

    /// Delivers an arbitrary completion event, whether or not a commit with
    /// its tag is in flight.
    pub fn inject_event(&self, event: CompletionEvent) {
        self.state.lock().ready.push_back(event);
        self.events.notify_all();
    }

    /// Number of commits waiting for [`complete_next`](Self::complete_next).
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Every commit seen so far, test-only ones included.
    #[must_use]
    pub fn commits(&self) -> Vec<RecordedCommit> {
        self.state.lock().commits.clone()
    }

    /// Real (non test-only) commits seen so far.
    #[must_use]
    pub fn real_commits(&self) -> Vec<RecordedCommit> {
        let state = self.state.lock();
        state.commits.iter().filter(|c| !c.is_test()).cloned().collect()
    }

    /// Number of test-only commits seen so far.
    #[must_use]
    pub fn test_commit_count(&self) -> usize {
        let state = self.state.lock();
        state.commits.iter().filter(|c| c.is_test()).count()
    }

    /// Forgets the recorded commits.
    pub fn clear_commits(&self) {
        self.state.lock().commits.clear();
    }

    /// Current value of `(obj, prop)` after every applied commit.
    #[must_use]
    pub fn value(&self, obj: ObjectId, prop: PropertyId) -> Option<u64> {
        self.state.lock().applied.get(&(obj, prop)).copied()
    }

    /// Kernel object counters.
    #[must_use]
    pub fn counters(&self) -> FakeCounters {
        let state = self.state.lock();
        FakeCounters {
            live_handles: state.handles.len(),
            ..state.counters
        }
    }

    /// Layout of a registered framebuffer.
    #[must_use]
    pub fn framebuffer(&self, fb: FbId) -> Option<FramebufferLayout> {
        self.state.lock().framebuffers.get(&fb).copied()
    }

    /// Payload of a live blob.
    #[must_use]
    pub fn blob(&self, blob: BlobId) -> Option<Vec<u8>> {
        self.state.lock().blobs.get(&blob).cloned()
    }

    /// Creates a descriptor that behaves like an exported dma-buf: a fresh
    /// file that imports as a handle of its own.
    pub fn new_dmabuf(&self) -> Result<OwnedFd> {
        rustix::fs::memfd_create("sluice-fake-dmabuf", MemfdFlags::CLOEXEC)
            .map_err(|errno| Error::Io(io::Error::from(errno)))
    }
}

fn identity(fd: BorrowedFd<'_>) -> Result<(u64, u64)> {
    let stat = rustix::fs::fstat(fd).map_err(|errno| Error::Io(io::Error::from(errno)))?;
    Ok((u64::from(stat.st_dev), u64::from(stat.st_ino)))
}

impl KmsDevice for FakeDevice {
    fn atomic_commit(&self, req: &CommitRequest, flags: CommitFlags, tag: u64) -> Result<()> {
        let mut state = self.state.lock();
        state.commits.push(RecordedCommit {
            request: req.clone(),
            flags,
            tag,
        });

        if req.iter().any(|(o, p, _)| state.rejected.contains(&(o, p))) {
            return Err(Error::Rejected);
        }
        if flags.contains(CommitFlags::TEST_ONLY) {
            return Ok(());
        }
        if state.busy_remaining > 0 {
            state.busy_remaining -= 1;
            return Err(Error::Busy);
        }
        if state.io_failures > 0 {
            state.io_failures -= 1;
            return Err(Error::Io(io::Error::other("injected I/O failure")));
        }

        for (obj, prop, value) in req.iter() {
            state.applied.insert((obj, prop), value);
        }
        if flags.contains(CommitFlags::PAGE_FLIP_EVENT) {
            state.sequence += 1;
            let event = CompletionEvent {
                tag,
                sequence: state.sequence,
                timestamp: Duration::from_millis(u64::from(state.sequence) * 16),
            };
            if state.auto_complete {
                state.ready.push_back(event);
                self.events.notify_all();
            } else {
                state.in_flight.push_back(event);
            }
        }
        Ok(())
    }

    fn create_dumb(&self, width: u32, height: u32, bpp: u32) -> Result<DumbAllocation> {
        let pitch = width
            .checked_mul(bpp.div_ceil(8))
            .ok_or_else(|| Error::exhausted("dumb buffer pitch overflows"))?;
        let mut state = self.state.lock();
        let handle = GemHandle(state.next_id());
        state.handles.insert(handle);
        state.counters.dumb_created += 1;
        Ok(DumbAllocation {
            handle,
            pitch,
            size: u64::from(pitch) * u64::from(height),
        })
    }

    fn close_handle(&self, handle: GemHandle) -> Result<()> {
        let mut state = self.state.lock();
        if !state.handles.remove(&handle) {
            return Err(Error::invalid(format!("{handle:?} is not open")));
        }
        state.by_identity.retain(|_, h| *h != handle);
        state.counters.handles_closed += 1;
        Ok(())
    }

    fn import_fd(&self, fd: BorrowedFd<'_>) -> Result<GemHandle> {
        let key = identity(fd)?;
        let mut state = self.state.lock();
        if let Some(&handle) = state.by_identity.get(&key) {
            return Ok(handle);
        }
        let handle = GemHandle(state.next_id());
        state.handles.insert(handle);
        state.by_identity.insert(key, handle);
        state.counters.imports += 1;
        Ok(handle)
    }

    fn export_fd(&self, handle: GemHandle) -> Result<OwnedFd> {
        if !self.state.lock().handles.contains(&handle) {
            return Err(Error::invalid(format!("{handle:?} is not open")));
        }
        let fd = self.new_dmabuf()?;
        let key = identity(fd.as_fd())?;
        self.state.lock().by_identity.insert(key, handle);
        Ok(fd)
    }

    fn add_framebuffer(&self, layout: &FramebufferLayout) -> Result<FbId> {
        let mut state = self.state.lock();
        if let Some(missing) = layout.handles[..layout.layers]
            .iter()
            .find(|&&h| !state.handles.contains(&h))
        {
            return Err(Error::invalid(format!("{missing:?} is not open")));
        }
        let fb = FbId(state.next_id());
        state.framebuffers.insert(fb, *layout);
        state.counters.framebuffers_added += 1;
        Ok(fb)
    }

    fn remove_framebuffer(&self, fb: FbId) -> Result<()> {
        let mut state = self.state.lock();
        if state.framebuffers.remove(&fb).is_none() {
            return Err(Error::invalid(format!("{fb:?} is not registered")));
        }
        state.counters.framebuffers_removed += 1;
        Ok(())
    }

    fn create_blob(&self, data: &[u8]) -> Result<BlobId> {
        let mut state = self.state.lock();
        let blob = BlobId(state.next_id());
        state.blobs.insert(blob, data.to_vec());
        state.counters.blobs_created += 1;
        Ok(blob)
    }

    fn destroy_blob(&self, blob: BlobId) -> Result<()> {
        let mut state = self.state.lock();
        if state.blobs.remove(&blob).is_none() {
            return Err(Error::invalid(format!("{blob:?} does not exist")));
        }
        state.counters.blobs_destroyed += 1;
        Ok(())
    }

    fn read_events(&self, timeout: Duration) -> Result<Vec<CompletionEvent>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if !state.ready.is_empty() {
                return Ok(state.ready.drain(..).collect());
            }
            if state.woken {
                state.woken = false;
                return Ok(Vec::new());
            }
            if self.events.wait_until(&mut state, deadline).timed_out() {
                return Ok(state.ready.drain(..).collect());
            }
        }
    }

    fn wake(&self) {
        self.state.lock().woken = true;
        self.events.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsFd;
    use std::time::Duration;

    use sluice_core::{
        CommitFlags, CommitRequest, CompletionEvent, Error, KmsDevice, ObjectId, PropertyId,
    };

    use super::FakeDevice;

    fn request(value: u64) -> CommitRequest {
        CommitRequest::from_grouped([(ObjectId(1), PropertyId(2), value)])
    }

    #[test]
    fn nonblocking_commit_completes_on_demand() {
        let dev = FakeDevice::new();
        let flags = CommitFlags::NONBLOCK | CommitFlags::PAGE_FLIP_EVENT;
        dev.atomic_commit(&request(5), flags, 42).unwrap();

        assert!(dev.read_events(Duration::ZERO).unwrap().is_empty(), "still in flight");
        assert!(dev.complete_next(), "one commit was in flight");
        let events = dev.read_events(Duration::ZERO).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].tag, 42);
        assert_eq!(dev.value(ObjectId(1), PropertyId(2)), Some(5));
    }

    #[test]
    fn test_only_commits_are_not_applied() {
        let dev = FakeDevice::new();
        dev.atomic_commit(&request(1), CommitFlags::TEST_ONLY, 0).unwrap();
        assert_eq!(dev.value(ObjectId(1), PropertyId(2)), None);
        assert_eq!(dev.test_commit_count(), 1);
    }

    #[test]
    fn scripted_failures() {
        let dev = FakeDevice::new();
        dev.reject(ObjectId(1), PropertyId(2));
        assert!(matches!(
            dev.atomic_commit(&request(1), CommitFlags::TEST_ONLY, 0),
            Err(Error::Rejected)
        ));
        dev.accept_all();
        dev.fail_busy(1);
        assert!(matches!(
            dev.atomic_commit(&request(1), CommitFlags::empty(), 0),
            Err(Error::Busy)
        ));
        dev.atomic_commit(&request(1), CommitFlags::empty(), 0).unwrap();
    }

    #[test]
    fn injected_events_leave_in_flight_commits_alone() {
        let dev = FakeDevice::new();
        let flags = CommitFlags::NONBLOCK | CommitFlags::PAGE_FLIP_EVENT;
        dev.atomic_commit(&request(5), flags, 42).unwrap();
        assert_eq!(dev.in_flight_tags(), [42]);

        dev.inject_event(CompletionEvent {
            tag: 7,
            sequence: 0,
            timestamp: Duration::ZERO,
        });
        let events = dev.read_events(Duration::ZERO).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].tag, 7);
        assert_eq!(dev.in_flight(), 1, "real commit still pending");
    }

    #[test]
    fn wake_interrupts_read() {
        let dev = FakeDevice::new();
        dev.wake();
        assert!(dev.read_events(Duration::from_secs(5)).unwrap().is_empty());
    }

    #[test]
    fn same_file_imports_as_same_handle() {
        let dev = FakeDevice::new();
        let a = dev.new_dmabuf().unwrap();
        let a_dup = a.try_clone().unwrap();
        let b = dev.new_dmabuf().unwrap();

        let ha = dev.import_fd(a.as_fd()).unwrap();
        assert_eq!(dev.import_fd(a_dup.as_fd()).unwrap(), ha);
        assert_ne!(dev.import_fd(b.as_fd()).unwrap(), ha);
        assert_eq!(dev.counters().imports, 2);
    }
}
