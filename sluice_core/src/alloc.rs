// Copyright 2026 the Sluice Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Framebuffer allocators.
//!
//! A [`FramebufferAllocator`] turns `(width, height, format, modifier)` into a
//! registered [`Framebuffer`]. Pools call it on a miss and ask it whether a
//! recycled allocation fits a new request.

use std::fmt;

use crate::bo::BufferObject;
use crate::device::Card;
use crate::error::{Error, Result};
use crate::format::{Fourcc, Modifier};
use crate::framebuffer::{Framebuffer, FramebufferAllocation, FramebufferDesc, Layer};

/// Produces framebuffers for a pool.
pub trait FramebufferAllocator: Send + Sync + fmt::Debug {
    /// Allocates and registers a new framebuffer.
    fn allocate(
        &self,
        width: u32,
        height: u32,
        format: Fourcc,
        modifier: Modifier,
    ) -> Result<Framebuffer>;

    /// Returns `true` when `alloc` can serve a request for the given
    /// parameters. The default requires an exact match.
    fn reusable(
        &self,
        alloc: &FramebufferAllocation,
        width: u32,
        height: u32,
        format: Fourcc,
        modifier: Modifier,
    ) -> bool {
        alloc.width() == width
            && alloc.height() == height
            && alloc.format() == format
            && alloc.modifier() == modifier
    }
}

/// Allocates linear framebuffers from kernel dumb buffers.
///
/// Supported formats: `XRGB8888`, `ARGB8888`, `XBGR8888`, `ABGR8888`,
/// `RGB565`, and `NV12`. NV12 needs even dimensions and is laid out as one
/// buffer object holding the luma plane followed by the interleaved chroma
/// plane.
#[derive(Clone, Debug)]
pub struct DumbAllocator {
    card: Card,
}

impl DumbAllocator {
    /// Creates an allocator drawing from `card`.
    #[must_use]
    pub fn new(card: Card) -> Self {
        Self { card }
    }

    /// Returns `true` if `format` can be allocated.
    #[must_use]
    pub fn supports(format: Fourcc) -> bool {
        packed_bpp(format).is_some() || format == Fourcc::NV12
    }
}

fn packed_bpp(format: Fourcc) -> Option<u32> {
    match format {
        Fourcc::XRGB8888 | Fourcc::ARGB8888 | Fourcc::XBGR8888 | Fourcc::ABGR8888 => Some(32),
        Fourcc::RGB565 => Some(16),
        _ => None,
    }
}

impl FramebufferAllocator for DumbAllocator {
    fn allocate(
        &self,
        width: u32,
        height: u32,
        format: Fourcc,
        modifier: Modifier,
    ) -> Result<Framebuffer> {
        if modifier != Modifier::LINEAR {
            return Err(Error::invalid(format!(
                "dumb buffers are linear, got modifier {:#x}",
                modifier.0
            )));
        }
        let desc = if let Some(bpp) = packed_bpp(format) {
            let bo = BufferObject::create_dumb(&self.card, width, height, bpp)?;
            let pitch = bo.pitch().unwrap_or(width * bpp / 8);
            FramebufferDesc {
                width,
                height,
                padded_width: width,
                padded_height: height,
                format,
                buffers: vec![bo],
                layers: vec![Layer {
                    buffer: 0,
                    pitch,
                    offset: 0,
                    modifier,
                }],
            }
        } else if format == Fourcc::NV12 {
            if width % 2 != 0 || height % 2 != 0 {
                return Err(Error::invalid(format!(
                    "NV12 needs even dimensions, got {width}x{height}"
                )));
            }
            let rows = height
                .checked_add(height / 2)
                .ok_or_else(|| Error::invalid("NV12 height overflows"))?;
            let bo = BufferObject::create_dumb(&self.card, width, rows, 8)?;
            let pitch = bo.pitch().unwrap_or(width);
            let chroma_offset = pitch
                .checked_mul(height)
                .ok_or_else(|| Error::invalid("NV12 plane offset overflows"))?;
            FramebufferDesc {
                width,
                height,
                padded_width: width,
                padded_height: height,
                format,
                buffers: vec![bo],
                layers: vec![
                    Layer {
                        buffer: 0,
                        pitch,
                        offset: 0,
                        modifier,
                    },
                    Layer {
                        buffer: 0,
                        pitch,
                        offset: chroma_offset,
                        modifier,
                    },
                ],
            }
        } else {
            return Err(Error::invalid(format!("unsupported format {format:?}")));
        };
        Framebuffer::new(&self.card, desc)
    }
}

#[cfg(test)]
mod tests {
    use super::DumbAllocator;
    use crate::format::Fourcc;

    #[test]
    fn format_table() {
        for format in [
            Fourcc::XRGB8888,
            Fourcc::ARGB8888,
            Fourcc::XBGR8888,
            Fourcc::ABGR8888,
            Fourcc::RGB565,
            Fourcc::NV12,
        ] {
            assert!(DumbAllocator::supports(format), "{format:?} is supported");
        }
        assert!(
            !DumbAllocator::supports(Fourcc::from_chars(*b"YUYV")),
            "packed YUV is not"
        );
    }
}
