// Copyright 2026 the Sluice Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Pixel format codes and layout modifiers.

use core::fmt;

/// A DRM four-character pixel format code.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Fourcc(pub u32);

impl Fourcc {
    /// `XR24`: 32-bit xRGB, little-endian.
    pub const XRGB8888: Self = Self::from_chars(*b"XR24");
    /// `AR24`: 32-bit ARGB, little-endian.
    pub const ARGB8888: Self = Self::from_chars(*b"AR24");
    /// `XB24`: 32-bit xBGR, little-endian.
    pub const XBGR8888: Self = Self::from_chars(*b"XB24");
    /// `AB24`: 32-bit ABGR, little-endian.
    pub const ABGR8888: Self = Self::from_chars(*b"AB24");
    /// `RG16`: 16-bit RGB 5:6:5.
    pub const RGB565: Self = Self::from_chars(*b"RG16");
    /// `NV12`: 2-plane 4:2:0 YCbCr.
    pub const NV12: Self = Self::from_chars(*b"NV12");

    /// Builds a code from its four ASCII characters.
    #[must_use]
    pub const fn from_chars(c: [u8; 4]) -> Self {
        Self(u32::from_le_bytes(c))
    }

    /// Returns the four characters of the code.
    #[must_use]
    pub const fn chars(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }
}

impl fmt::Debug for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = self.chars();
        if c.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
            write!(f, "Fourcc({})", c.iter().map(|&b| char::from(b)).collect::<String>())
        } else {
            write!(f, "Fourcc({:#010x})", self.0)
        }
    }
}

/// A DRM format modifier describing tiling/compression of a buffer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Modifier(pub u64);

impl Modifier {
    /// Plain row-major layout.
    pub const LINEAR: Self = Self(0);
    /// The producer did not say; the driver picks.
    pub const INVALID: Self = Self(0x00ff_ffff_ffff_ffff);
}

impl Default for Modifier {
    fn default() -> Self {
        Self::LINEAR
    }
}

#[cfg(test)]
mod tests {
    use super::Fourcc;

    #[test]
    fn fourcc_matches_kernel_encoding() {
        // DRM_FORMAT_XRGB8888 from drm_fourcc.h.
        assert_eq!(Fourcc::XRGB8888.0, 0x3432_5258);
        assert_eq!(format!("{:?}", Fourcc::NV12), "Fourcc(NV12)");
    }

    #[test]
    fn non_ascii_fourcc_prints_hex() {
        assert_eq!(format!("{:?}", Fourcc(1)), "Fourcc(0x00000001)");
    }
}
