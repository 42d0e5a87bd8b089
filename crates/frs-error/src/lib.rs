#![forbid(unsafe_code)]
//! Error types for fsreshape.
//!
//! Defines `FrsError` and a `Result<T>` alias used throughout the workspace.
//! Includes errno mappings so log messages can carry the POSIX view of a
//! failure the way the rest of the toolchain expects.

use thiserror::Error;

/// Unified error type for all fsreshape operations.
#[derive(Debug, Error)]
pub enum FrsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("arithmetic overflow in extent computation")]
    Overflow,

    #[error(
        "extent conflict at logical {logical}: already mapped to physical {existing}, \
         refusing remap to {conflicting}"
    )]
    OverlapConflict {
        logical: u64,
        existing: u64,
        conflicting: u64,
    },

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("storage too small: requested {requested} bytes, only {available} available")]
    StorageTooSmall { requested: u64, available: u64 },

    #[error("mmap(MAP_FIXED) violated the requested address")]
    MapMoved,

    #[error("already open")]
    AlreadyOpen,

    #[error("not open")]
    NotOpen,

    #[error("invalid state: {0}")]
    Invalid(String),
}

impl FrsError {
    /// Convert this error into the POSIX errno it most closely corresponds to.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Overflow => libc::EOVERFLOW,
            Self::OverlapConflict { .. } | Self::Invalid(_) => libc::EINVAL,
            Self::Unsupported(_) => libc::EOPNOTSUPP,
            Self::StorageTooSmall { .. } => libc::ENOSPC,
            Self::MapMoved => libc::EFAULT,
            Self::AlreadyOpen => libc::EISCONN,
            Self::NotOpen => libc::ENOTCONN,
        }
    }

    /// Build an `Io` error from a raw errno value.
    #[must_use]
    pub fn from_errno(errno: libc::c_int) -> Self {
        Self::Io(std::io::Error::from_raw_os_error(errno))
    }
}

/// Result alias using `FrsError`.
pub type Result<T> = std::result::Result<T, FrsError>;
