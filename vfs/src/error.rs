use std::io;

use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Path, name or inode absent.
    #[error("no such file or directory")]
    NotFound,

    #[error("file exists")]
    AlreadyExists,

    /// The directory block has no unfilled entry left.
    #[error("directory is full")]
    Full,

    /// No free block or inode slot.
    #[error("no space left on device")]
    Exhausted,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("not a directory")]
    NotADirectory,

    #[error("is a directory")]
    IsADirectory,

    #[error("directory not empty")]
    DirectoryNotEmpty,

    /// On-disk structures contradict each other.
    #[error("integrity violation: {0}")]
    IntegrityViolation(&'static str),

    #[error("device I/O error: {0}")]
    Io(#[from] io::Error),
}
