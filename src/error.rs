//! Closed error space for the versioning engine and the operation dispatcher.
//!
//! Mirrors the shape of [`crate::vfs::NfsError`] style from the original NFS trait, but
//! narrowed to the POSIX errors this filesystem can actually produce and with a direct
//! conversion to the `libc` errno values `fuser` replies expect.

use std::io;

/// Convenient result alias used throughout `path`, `backing`, and `engine`.
pub type FsResult<T> = Result<T, FsError>;

/// Closed set of POSIX-style failures the overlay filesystem can report.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FsError {
    NotFound,
    IsDir,
    NotDir,
    Exists,
    NameTooLong,
    NoSpace,
    NotEmpty,
    Invalid,
    Io,
}

impl FsError {
    /// Map to the negative-errno convention `fuser`'s `reply.error` expects.
    pub fn to_errno(self) -> i32 {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::IsDir => libc::EISDIR,
            FsError::NotDir => libc::ENOTDIR,
            FsError::Exists => libc::EEXIST,
            FsError::NameTooLong => libc::ENAMETOOLONG,
            FsError::NoSpace => libc::ENOSPC,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::Invalid => libc::EINVAL,
            FsError::Io => libc::EIO,
        }
    }
}

impl std::fmt::Display for FsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            FsError::NotFound => "no such file or directory",
            FsError::IsDir => "is a directory",
            FsError::NotDir => "not a directory",
            FsError::Exists => "already exists",
            FsError::NameTooLong => "name too long",
            FsError::NoSpace => "no space left on device",
            FsError::NotEmpty => "directory not empty",
            FsError::Invalid => "invalid argument",
            FsError::Io => "I/O error",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for FsError {}

impl From<io::Error> for FsError {
    fn from(err: io::Error) -> Self {
        use io::ErrorKind::*;
        match err.kind() {
            NotFound => FsError::NotFound,
            AlreadyExists => FsError::Exists,
            InvalidInput | InvalidData => FsError::Invalid,
            NotADirectory => FsError::NotDir,
            IsADirectory => FsError::IsDir,
            StorageFull | OutOfMemory => FsError::NoSpace,
            DirectoryNotEmpty => FsError::NotEmpty,
            _ => FsError::Io,
        }
    }
}
