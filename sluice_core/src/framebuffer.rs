// Copyright 2026 the Sluice Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Framebuffers composed from buffer objects.
//!
//! A framebuffer is split in two:
//!
//! - [`FramebufferAllocation`] is the recyclable part: the kernel
//!   registration, the 1–4 backing [`BufferObject`]s, and the layer layout.
//!   Dropping it is *true destruction*: the kernel framebuffer is removed,
//!   the buffer objects are released, and the on-destroy hook runs last.
//! - [`Framebuffer`] wraps an allocation with per-use state (active area,
//!   crop, metadata) and is shared as `Arc<Framebuffer>`.
//!
//! When the last `Arc<Framebuffer>` drops, the [`PreRelease`] hook (if any)
//! is offered the allocation first. A pool takes it back onto its free list;
//! otherwise the allocation is dropped and destruction proceeds.

use std::fmt;
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytemuck::{Pod, Zeroable};
use kurbo::Rect;

use crate::bo::BufferObject;
use crate::device::{Card, FramebufferLayout};
use crate::error::{Error, Result};
use crate::format::{Fourcc, Modifier};
use crate::id::{FbId, GemHandle};
use crate::txn::PropertyOwner;

/// Maximum number of layers (and backing buffer objects) per framebuffer.
pub const MAX_LAYERS: usize = 4;

/// Placement of one framebuffer layer inside its backing buffer object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Layer {
    /// Index into the framebuffer's buffer-object list.
    pub buffer: usize,
    /// Row pitch in bytes.
    pub pitch: u32,
    /// Byte offset of the first row.
    pub offset: u32,
    /// Layout modifier of this layer.
    pub modifier: Modifier,
}

/// Everything needed to register a framebuffer with the kernel.
#[derive(Clone, Debug)]
pub struct FramebufferDesc {
    /// Visible width in pixels.
    pub width: u32,
    /// Visible height in pixels.
    pub height: u32,
    /// Padded allocation width; at least `width`.
    pub padded_width: u32,
    /// Padded allocation height; at least `height`.
    pub padded_height: u32,
    /// Pixel format.
    pub format: Fourcc,
    /// Backing memory, 1–4 objects.
    pub buffers: Vec<Arc<BufferObject>>,
    /// Layer layout, 1–4 layers.
    pub layers: Vec<Layer>,
}

impl FramebufferDesc {
    fn validate(&self, card: &Card) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::invalid("framebuffer has a zero dimension"));
        }
        if self.padded_width < self.width || self.padded_height < self.height {
            return Err(Error::invalid("padded size is smaller than the visible size"));
        }
        if self.buffers.is_empty() || self.buffers.len() > MAX_LAYERS {
            return Err(Error::invalid(format!(
                "framebuffer needs 1..={MAX_LAYERS} buffer objects, got {}",
                self.buffers.len()
            )));
        }
        if self.layers.is_empty() || self.layers.len() > MAX_LAYERS {
            return Err(Error::invalid(format!(
                "framebuffer needs 1..={MAX_LAYERS} layers, got {}",
                self.layers.len()
            )));
        }
        if let Some(layer) = self.layers.iter().find(|l| l.buffer >= self.buffers.len()) {
            return Err(Error::invalid(format!(
                "layer references buffer object {} of {}",
                layer.buffer,
                self.buffers.len()
            )));
        }
        if self
            .buffers
            .iter()
            .any(|bo| !Arc::ptr_eq(&bo.card().inner, &card.inner))
        {
            return Err(Error::invalid("buffer object belongs to another card"));
        }
        Ok(())
    }

    fn layout(&self) -> FramebufferLayout {
        let mut layout = FramebufferLayout {
            width: self.padded_width,
            height: self.padded_height,
            format: self.format,
            modifiers: [Modifier::LINEAR; MAX_LAYERS],
            layers: self.layers.len(),
            handles: [GemHandle(0); MAX_LAYERS],
            pitches: [0; MAX_LAYERS],
            offsets: [0; MAX_LAYERS],
        };
        for (i, layer) in self.layers.iter().enumerate() {
            layout.handles[i] = self.buffers[layer.buffer].handle();
            layout.pitches[i] = layer.pitch;
            layout.offsets[i] = layer.offset;
            layout.modifiers[i] = layer.modifier;
        }
        layout
    }
}

type DestroyHook = Box<dyn FnOnce(FbId) + Send + Sync>;

/// The recyclable, kernel-registered part of a framebuffer.
///
/// Dropping an allocation removes the kernel framebuffer, releases the
/// buffer objects, and finally runs the on-destroy hook.
#[derive(Default)]
pub struct FramebufferAllocation {
    card: Option<Card>,
    id: FbId,
    width: u32,
    height: u32,
    padded_width: u32,
    padded_height: u32,
    format: Fourcc,
    buffers: Vec<Arc<BufferObject>>,
    layers: Vec<Layer>,
    on_destroy: Option<DestroyHook>,
}

impl fmt::Debug for FramebufferAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramebufferAllocation")
            .field("id", &self.id)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("buffers", &self.buffers)
            .field("layers", &self.layers)
            .finish_non_exhaustive()
    }
}

impl FramebufferAllocation {
    /// Registers `desc` with the kernel.
    pub fn register(card: &Card, desc: FramebufferDesc) -> Result<Self> {
        desc.validate(card)?;
        let id = card.device().add_framebuffer(&desc.layout())?;
        tracing::debug!(
            fb = id.0,
            width = desc.width,
            height = desc.height,
            format = ?desc.format,
            "registered framebuffer"
        );
        Ok(Self {
            card: Some(card.clone()),
            id,
            width: desc.width,
            height: desc.height,
            padded_width: desc.padded_width,
            padded_height: desc.padded_height,
            format: desc.format,
            buffers: desc.buffers,
            layers: desc.layers,
            on_destroy: None,
        })
    }

    /// Kernel framebuffer id.
    #[must_use]
    pub fn id(&self) -> FbId {
        self.id
    }

    /// Visible width.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Visible height.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Padded allocation size.
    #[must_use]
    pub fn padded_size(&self) -> (u32, u32) {
        (self.padded_width, self.padded_height)
    }

    /// Pixel format.
    #[must_use]
    pub fn format(&self) -> Fourcc {
        self.format
    }

    /// Modifier of the first layer.
    #[must_use]
    pub fn modifier(&self) -> Modifier {
        self.layers.first().map_or(Modifier::LINEAR, |l| l.modifier)
    }

    /// Backing buffer objects.
    #[must_use]
    pub fn buffers(&self) -> &[Arc<BufferObject>] {
        &self.buffers
    }

    /// Layer layout.
    #[must_use]
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Installs a hook that runs after true destruction.
    ///
    /// Recycling through a pool does not trigger it.
    pub fn set_on_destroy(&mut self, hook: impl FnOnce(FbId) + Send + Sync + 'static) {
        self.on_destroy = Some(Box::new(hook));
    }
}

impl Drop for FramebufferAllocation {
    fn drop(&mut self) {
        let Some(card) = self.card.take() else {
            return;
        };
        if let Err(err) = card.device().remove_framebuffer(self.id) {
            tracing::warn!(fb = self.id.0, %err, "failed to remove framebuffer");
        }
        self.buffers.clear();
        tracing::debug!(fb = self.id.0, "destroyed framebuffer");
        if let Some(hook) = self.on_destroy.take() {
            hook(self.id);
        }
    }
}

/// Decides the fate of an allocation whose last framebuffer reference
/// dropped.
pub trait PreRelease: Send + Sync {
    /// Returns `None` when the hook took the allocation over, or gives it
    /// back to let destruction proceed.
    fn pre_release(&self, alloc: FramebufferAllocation) -> Option<FramebufferAllocation>;
}

/// Visible sub-rectangle of a framebuffer, in whole pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ActiveArea {
    /// Left edge.
    pub x: u32,
    /// Top edge.
    pub y: u32,
    /// Width.
    pub width: u32,
    /// Height.
    pub height: u32,
}

/// Dynamic-range metadata attached to a framebuffer.
///
/// The three states keep "leave the property alone" apart from "clear it".
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Metadata {
    /// Not specified; the property is left untouched.
    #[default]
    Unset,
    /// Explicitly empty; the property is reset to 0.
    Cleared,
    /// Opaque payload uploaded as a property blob.
    Present(Vec<u8>),
}

impl Metadata {
    /// Wraps a typed HDR output metadata payload.
    #[must_use]
    pub fn hdr(meta: &HdrOutputMetadata) -> Self {
        Self::Present(bytemuck::bytes_of(meta).to_vec())
    }
}

/// Kernel `hdr_output_metadata` layout (infoframe type 1).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct HdrOutputMetadata {
    /// Metadata container type; 0 for static metadata type 1.
    pub metadata_type: u32,
    /// Electro-optical transfer function.
    pub eotf: u8,
    /// Static metadata descriptor id.
    pub descriptor: u8,
    /// Display primaries (x, y) in 0.00002 units.
    pub display_primaries: [[u16; 2]; 3],
    /// White point (x, y) in 0.00002 units.
    pub white_point: [u16; 2],
    /// Maximum mastering luminance in cd/m².
    pub max_display_mastering_luminance: u16,
    /// Minimum mastering luminance in 0.0001 cd/m².
    pub min_display_mastering_luminance: u16,
    /// Maximum content light level.
    pub max_cll: u16,
    /// Maximum frame-average light level.
    pub max_fall: u16,
    reserved: [u8; 2],
}

impl HdrOutputMetadata {
    /// EOTF code for SMPTE ST 2084 (PQ).
    pub const EOTF_ST2084: u8 = 2;
    /// EOTF code for hybrid log-gamma.
    pub const EOTF_HLG: u8 = 3;

    /// Builds static type-1 metadata with the given EOTF and luminance
    /// levels; primaries default to zero (driver defaults).
    #[must_use]
    pub fn new(eotf: u8, max_cll: u16, max_fall: u16) -> Self {
        Self {
            eotf,
            max_cll,
            max_fall,
            ..Self::default()
        }
    }
}

/// A framebuffer ready to be referenced from transactions.
pub struct Framebuffer {
    alloc: FramebufferAllocation,
    active: ActiveArea,
    crop: Rect,
    metadata: Metadata,
    commits: AtomicU64,
    pre_release: Option<Box<dyn PreRelease>>,
}

impl fmt::Debug for Framebuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Framebuffer")
            .field("alloc", &self.alloc)
            .field("active", &self.active)
            .field("crop", &self.crop)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

impl Framebuffer {
    /// Registers `desc` with the kernel and wraps it.
    pub fn new(card: &Card, desc: FramebufferDesc) -> Result<Self> {
        FramebufferAllocation::register(card, desc).map(Self::from_allocation)
    }

    /// Wraps an existing allocation. Per-use state starts fresh: the active
    /// area and crop cover the whole visible size, metadata is unset.
    #[must_use]
    pub fn from_allocation(alloc: FramebufferAllocation) -> Self {
        let active = ActiveArea {
            x: 0,
            y: 0,
            width: alloc.width,
            height: alloc.height,
        };
        Self {
            crop: Rect::new(0.0, 0.0, f64::from(alloc.width), f64::from(alloc.height)),
            alloc,
            active,
            metadata: Metadata::Unset,
            commits: AtomicU64::new(0),
            pre_release: None,
        }
    }

    /// The underlying allocation.
    #[must_use]
    pub fn allocation(&self) -> &FramebufferAllocation {
        &self.alloc
    }

    /// Kernel framebuffer id.
    #[must_use]
    pub fn id(&self) -> FbId {
        self.alloc.id
    }

    /// Visible width.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.alloc.width
    }

    /// Visible height.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.alloc.height
    }

    /// Pixel format.
    #[must_use]
    pub fn format(&self) -> Fourcc {
        self.alloc.format
    }

    /// Sets the active area; it must lie inside the visible size.
    pub fn set_active(&mut self, area: ActiveArea) -> Result<()> {
        let right = area.x.checked_add(area.width);
        let bottom = area.y.checked_add(area.height);
        match (right, bottom) {
            (Some(r), Some(b))
                if area.width > 0
                    && area.height > 0
                    && r <= self.alloc.width
                    && b <= self.alloc.height => {}
            _ => {
                return Err(Error::invalid(format!(
                    "active area {area:?} outside {}x{}",
                    self.alloc.width, self.alloc.height
                )));
            }
        }
        self.active = area;
        Ok(())
    }

    /// The active area.
    #[must_use]
    pub fn active(&self) -> ActiveArea {
        self.active
    }

    /// Sets the sub-pixel source crop; it must be finite, non-empty, and
    /// inside the visible size.
    pub fn set_crop(&mut self, crop: Rect) -> Result<()> {
        let crop = crop.abs();
        let inside = crop.x0 >= 0.0
            && crop.y0 >= 0.0
            && crop.x1 <= f64::from(self.alloc.width)
            && crop.y1 <= f64::from(self.alloc.height);
        if !crop.is_finite() || crop.is_zero_area() || !inside {
            return Err(Error::invalid(format!(
                "crop {crop:?} outside {}x{}",
                self.alloc.width, self.alloc.height
            )));
        }
        self.crop = crop;
        Ok(())
    }

    /// The source crop.
    #[must_use]
    pub fn crop(&self) -> Rect {
        self.crop
    }

    /// The crop as `[x, y, width, height]` in 16.16 fixed point, the unit of
    /// plane `SRC_*` properties.
    #[must_use]
    pub fn crop_fixed(&self) -> [u32; 4] {
        [
            to_fixed_16_16(self.crop.x0),
            to_fixed_16_16(self.crop.y0),
            to_fixed_16_16(self.crop.width()),
            to_fixed_16_16(self.crop.height()),
        ]
    }

    /// Replaces the metadata.
    pub fn set_metadata(&mut self, metadata: Metadata) {
        self.metadata = metadata;
    }

    /// The metadata.
    #[must_use]
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Installs the hook consulted when the last reference drops.
    pub fn set_pre_release(&mut self, hook: Box<dyn PreRelease>) {
        self.pre_release = Some(hook);
    }

    /// Installs a hook that runs after true destruction of the allocation.
    pub fn set_on_destroy(&mut self, hook: impl FnOnce(FbId) + Send + Sync + 'static) {
        self.alloc.set_on_destroy(hook);
    }

    /// Number of applied commits that referenced this framebuffer.
    #[must_use]
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }
}

impl PropertyOwner for Framebuffer {
    fn value(&self) -> u64 {
        u64::from(self.alloc.id.0)
    }

    fn on_commit(&self, _value: u64) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        let alloc = mem::take(&mut self.alloc);
        if let Some(hook) = self.pre_release.take() {
            // `None` means the hook recycled the allocation.
            drop(hook.pre_release(alloc));
        }
    }
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    reason = "crop coordinates are validated to be non-negative and below 65536"
)]
fn to_fixed_16_16(v: f64) -> u32 {
    (v * 65536.0).round() as u32
}

#[cfg(test)]
mod tests {
    use super::{HdrOutputMetadata, Metadata, to_fixed_16_16};

    #[test]
    fn fixed_point_has_sixteen_fraction_bits() {
        assert_eq!(to_fixed_16_16(1.0), 0x1_0000);
        assert_eq!(to_fixed_16_16(0.5), 0x8000);
        assert_eq!(to_fixed_16_16(1920.25), (1920 << 16) | 0x4000);
    }

    #[test]
    fn hdr_metadata_matches_kernel_size() {
        assert_eq!(size_of::<HdrOutputMetadata>(), 32);
        let meta = HdrOutputMetadata::new(HdrOutputMetadata::EOTF_ST2084, 1000, 400);
        let Metadata::Present(bytes) = Metadata::hdr(&meta) else {
            panic!("hdr metadata must be present");
        };
        assert_eq!(bytes.len(), 32);
        assert_eq!(bytes[4], HdrOutputMetadata::EOTF_ST2084);
    }

    #[test]
    fn metadata_defaults_to_unset() {
        assert_eq!(Metadata::default(), Metadata::Unset);
    }
}
