//! Filesystem error surface.

use rfuse3::Errno;
use thiserror::Error;

use crate::store::StoreError;

pub type FsResult<T> = Result<T, FsError>;

/// Errors surfaced by the filesystem core, one POSIX errno each.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("no such file or directory: {0}")]
    NotFound(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("store i/o failure: {0}")]
    IOError(#[from] StoreError),

    #[error("operation not supported")]
    NotSupported,

    #[error("unknown file handle: {0}")]
    StaleHandle(u64),

    /// Reserved for a compare-and-swap flush mode; nothing raises it today.
    #[error("conflicting concurrent update")]
    Conflict,
}

impl From<FsError> for Errno {
    fn from(err: FsError) -> Self {
        match err {
            FsError::NotFound(_) => libc::ENOENT.into(),
            FsError::IsADirectory(_) => libc::EISDIR.into(),
            FsError::NotADirectory(_) => libc::ENOTDIR.into(),
            FsError::DirectoryNotEmpty(_) => libc::ENOTEMPTY.into(),
            FsError::AlreadyExists(_) => libc::EEXIST.into(),
            FsError::IOError(_) => libc::EIO.into(),
            FsError::NotSupported => libc::ENOSYS.into(),
            FsError::StaleHandle(_) => libc::EBADF.into(),
            FsError::Conflict => libc::EBUSY.into(),
        }
    }
}
