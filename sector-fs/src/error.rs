//! Error types for the file system.
//!
//! Device failures surface as [`FsError::Io`] and are never retried. Every
//! variant maps to exactly one POSIX errno through [`FsError::to_errno`], which
//! is what the system-call layer hands back to user programs.

use thiserror::Error;

use crate::block_dev::DiskError;
use crate::SectorId;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("I/O error: {0}")]
    Io(#[from] DiskError),
    #[error("out of space: {needed} sectors needed, {free} free")]
    OutOfSpace { needed: usize, free: usize },
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),
    #[error("no free entry in directory for {0}")]
    DirectoryFull(String),
    #[error("{path} is still open by {handles} handle(s)")]
    InUse { path: String, handles: usize },
    #[error("name too long: {0}")]
    NameTooLong(String),
    #[error("sector {sector} out of range (max {max})")]
    SectorOutOfRange { sector: SectorId, max: usize },
    #[error("sector {sector} is not allocated")]
    NotAllocated { sector: SectorId },
    #[error("offset {offset} past end of file ({length} bytes)")]
    OffsetOutOfRange { offset: usize, length: usize },
    #[error("permission denied: {0}")]
    PermissionDenied(&'static str),
    #[error("corruption at sector {sector}: {detail}")]
    Corruption { sector: SectorId, detail: String },
}

pub type Result<T, E = FsError> = core::result::Result<T, E>;

impl FsError {
    pub fn corruption(sector: SectorId, detail: impl Into<String>) -> Self {
        Self::Corruption {
            sector,
            detail: detail.into(),
        }
    }

    pub fn to_errno(&self) -> i32 {
        match self {
            Self::Io(_) => 5,                     // EIO
            Self::OutOfSpace { .. } => 28,        // ENOSPC
            Self::AlreadyExists(_) => 17,         // EEXIST
            Self::NotFound(_) => 2,               // ENOENT
            Self::DirectoryNotEmpty(_) => 39,     // ENOTEMPTY
            Self::DirectoryFull(_) => 28,         // ENOSPC
            Self::InUse { .. } => 16,             // EBUSY
            Self::NameTooLong(_) => 36,           // ENAMETOOLONG
            Self::SectorOutOfRange { .. } => 22,  // EINVAL
            Self::NotAllocated { .. } => 22,      // EINVAL
            Self::OffsetOutOfRange { .. } => 22,  // EINVAL
            Self::PermissionDenied(_) => 13,      // EACCES
            Self::Corruption { .. } => 5,         // EIO
        }
    }
}
