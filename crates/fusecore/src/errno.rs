//! Mapping of failures onto the protocol's error codes.

use crate::backend::BackendError;
use fusecore_kernel as kernel;
use std::io;

/// A failure of a filesystem operation, as replied to the kernel.
///
/// Every variant maps to exactly one errno value; see [`Errno::code`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, thiserror::Error)]
pub enum Errno {
    #[error("no such file or directory")]
    NotFound,

    #[error("permission denied")]
    PermissionDenied,

    #[error("invalid file handle")]
    InvalidHandle,

    #[error("file exists")]
    AlreadyExists,

    #[error("directory not empty")]
    NotEmpty,

    #[error("input/output error")]
    IoError,

    #[error("read-only filesystem")]
    ReadOnly,

    #[error("interrupted")]
    Interrupted,

    #[error("not a directory")]
    NotADirectory,

    #[error("is a directory")]
    IsADirectory,

    #[error("invalid argument")]
    InvalidArgument,

    #[error("file name too long")]
    NameTooLong,

    #[error("no space left on device")]
    NoSpace,

    #[error("file too large")]
    FileTooLarge,

    #[error("cross-device link")]
    CrossDevice,

    #[error("function not implemented")]
    NotSupported,
}

impl Errno {
    /// Return the (positive) errno value of this failure.
    pub const fn code(self) -> i32 {
        match self {
            Self::NotFound => kernel::ENOENT,
            Self::PermissionDenied => kernel::EACCES,
            Self::InvalidHandle => kernel::EBADF,
            Self::AlreadyExists => kernel::EEXIST,
            Self::NotEmpty => kernel::ENOTEMPTY,
            Self::IoError => kernel::EIO,
            Self::ReadOnly => kernel::EROFS,
            Self::Interrupted => kernel::EINTR,
            Self::NotADirectory => kernel::ENOTDIR,
            Self::IsADirectory => kernel::EISDIR,
            Self::InvalidArgument => kernel::EINVAL,
            Self::NameTooLong => kernel::ENAMETOOLONG,
            Self::NoSpace => kernel::ENOSPC,
            Self::FileTooLarge => kernel::EFBIG,
            Self::CrossDevice => kernel::EXDEV,
            Self::NotSupported => kernel::ENOSYS,
        }
    }

    /// Convert an errno value back to a failure.
    ///
    /// Values outside of the vocabulary collapse to `IoError`.
    pub fn from_code(code: i32) -> Self {
        match code {
            libc::ENOENT => Self::NotFound,
            libc::EACCES | libc::EPERM => Self::PermissionDenied,
            libc::EBADF | libc::ESTALE => Self::InvalidHandle,
            libc::EEXIST => Self::AlreadyExists,
            libc::ENOTEMPTY => Self::NotEmpty,
            libc::EROFS => Self::ReadOnly,
            libc::EINTR => Self::Interrupted,
            libc::ENOTDIR => Self::NotADirectory,
            libc::EISDIR => Self::IsADirectory,
            libc::EINVAL => Self::InvalidArgument,
            libc::ENAMETOOLONG => Self::NameTooLong,
            libc::ENOSPC | libc::EDQUOT => Self::NoSpace,
            libc::EFBIG => Self::FileTooLarge,
            libc::EXDEV => Self::CrossDevice,
            libc::ENOSYS | libc::ENOTSUP => Self::NotSupported,
            _ => Self::IoError,
        }
    }

    fn from_io_error(err: &io::Error) -> Self {
        if let Some(code) = err.raw_os_error() {
            return match Self::from_code(code) {
                // cancellation is reported by the transport, never by the store.
                Self::Interrupted => Self::IoError,
                errno => errno,
            };
        }

        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound,
            io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            io::ErrorKind::AlreadyExists => Self::AlreadyExists,
            io::ErrorKind::InvalidInput => Self::InvalidArgument,
            io::ErrorKind::Unsupported => Self::NotSupported,
            _ => Self::IoError,
        }
    }
}

impl From<BackendError> for Errno {
    fn from(err: BackendError) -> Self {
        Self::from(&err)
    }
}

impl From<&BackendError> for Errno {
    fn from(err: &BackendError) -> Self {
        match err {
            BackendError::NotFound => Self::NotFound,
            BackendError::PermissionDenied => Self::PermissionDenied,
            BackendError::AlreadyExists => Self::AlreadyExists,
            BackendError::NotEmpty => Self::NotEmpty,
            BackendError::NotADirectory => Self::NotADirectory,
            BackendError::IsADirectory => Self::IsADirectory,
            BackendError::ReadOnly => Self::ReadOnly,
            BackendError::NoSpace => Self::NoSpace,
            BackendError::FileTooLarge => Self::FileTooLarge,
            BackendError::InvalidInput => Self::InvalidArgument,
            BackendError::NameTooLong => Self::NameTooLong,
            BackendError::CrossDevice => Self::CrossDevice,
            BackendError::Unsupported => Self::NotSupported,
            BackendError::Stale => Self::InvalidHandle,
            BackendError::Io(err) => Self::from_io_error(err),
            BackendError::Other(..) => Self::IoError,
        }
    }
}
