// Copyright 2026 the Sluice Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Error taxonomy shared by every sluice crate.
//!
//! The variants map one-to-one onto how a failure is handled:
//!
//! | Variant | Handling |
//! |---|---|
//! | [`Error::InvalidArgument`] | Rejected synchronously, never retried. |
//! | [`Error::ResourceExhausted`] | Surfaced to the caller. |
//! | [`Error::Busy`] | Retried inside the commit queue, surfaced only when retries run out. |
//! | [`Error::Rejected`] | Kernel validation failure; isolate the offending properties. |
//! | [`Error::Io`] | Any other kernel failure; not retried. |
//! | [`Error::Shutdown`] | The pool or queue was torn down. |

use std::io;

/// Result alias using [`Error`].
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Errors produced by kernel-facing and bookkeeping operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A zero or otherwise unusable id, or an unsupported format/geometry.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Allocation failed, or a pool is full with nothing free to evict.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Transient kernel contention (`EBUSY`).
    #[error("device busy")]
    Busy,

    /// The kernel refused the property values of an atomic commit.
    #[error("atomic commit rejected by the kernel")]
    Rejected,

    /// Any other kernel call failure.
    #[error("kernel I/O error: {0}")]
    Io(#[from] io::Error),

    /// The pool was killed or the queue was shut down.
    #[error("{0} has been shut down")]
    Shutdown(&'static str),
}

impl Error {
    /// Convenience constructor for [`Error::InvalidArgument`].
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Convenience constructor for [`Error::ResourceExhausted`].
    pub fn exhausted(msg: impl Into<String>) -> Self {
        Self::ResourceExhausted(msg.into())
    }

    /// Classifies the raw error of an atomic-commit ioctl.
    ///
    /// `EBUSY` is transient. The errno values the kernel uses to refuse a
    /// property set (`EINVAL`, `ERANGE`, `ENOENT`, `EACCES`) become
    /// [`Error::Rejected`]. Everything else stays an I/O error.
    #[must_use]
    pub fn from_commit_io(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(EBUSY) => Self::Busy,
            Some(EINVAL | ERANGE | ENOENT | EACCES) => Self::Rejected,
            _ => Self::Io(err),
        }
    }

    /// Returns `true` for failures worth retrying after a short delay.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Busy)
    }
}

// Linux errno values; identical on every architecture the kernel supports.
const ENOENT: i32 = 2;
const EACCES: i32 = 13;
const EBUSY: i32 = 16;
const EINVAL: i32 = 22;
const ERANGE: i32 = 34;

#[cfg(test)]
mod tests {
    use super::Error;
    use std::io;

    #[test]
    fn commit_errno_classification() {
        let busy = Error::from_commit_io(io::Error::from_raw_os_error(16));
        assert!(matches!(busy, Error::Busy), "EBUSY is transient");
        assert!(busy.is_transient(), "busy must report transient");

        let rejected = Error::from_commit_io(io::Error::from_raw_os_error(22));
        assert!(matches!(rejected, Error::Rejected), "EINVAL is a rejection");

        let fatal = Error::from_commit_io(io::Error::from_raw_os_error(5));
        assert!(matches!(fatal, Error::Io(_)), "EIO stays fatal");
        assert!(!fatal.is_transient(), "fatal errors are not transient");
    }

    #[test]
    fn display_names_the_failure() {
        assert_eq!(
            Error::invalid("object id is zero").to_string(),
            "invalid argument: object id is zero"
        );
        assert_eq!(Error::Shutdown("pool").to_string(), "pool has been shut down");
    }
}
