// Copyright 2026 the Sluice Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Kernel object and handle identifiers.
//!
//! The ids are assigned by the kernel (or by a discovery layer that reads
//! them from the kernel). Sluice never interprets them beyond "zero is not a
//! valid id".

use core::fmt;

macro_rules! kernel_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name(pub u32);

        impl $name {
            /// Returns `true` when the id is non-zero.
            #[inline]
            #[must_use]
            pub const fn is_valid(self) -> bool {
                self.0 != 0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl From<u32> for $name {
            fn from(raw: u32) -> Self {
                Self(raw)
            }
        }
    };
}

kernel_id!(
    /// A KMS mode object: plane, CRTC, or connector.
    ObjectId
);
kernel_id!(
    /// A property of a KMS mode object.
    PropertyId
);
kernel_id!(
    /// A GEM buffer handle, local to one open device file.
    GemHandle
);
kernel_id!(
    /// A registered KMS framebuffer.
    FbId
);
kernel_id!(
    /// A kernel-stored property blob.
    BlobId
);

#[cfg(test)]
mod tests {
    use super::{ObjectId, PropertyId};

    #[test]
    fn zero_is_invalid() {
        assert!(!ObjectId(0).is_valid(), "zero object id must be invalid");
        assert!(PropertyId(7).is_valid(), "non-zero property id is valid");
    }

    #[test]
    fn debug_names_the_kind() {
        assert_eq!(format!("{:?}", ObjectId(31)), "ObjectId(31)");
    }
}
