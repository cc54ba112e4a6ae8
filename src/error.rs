//! Error channel for the file system core.
//!
//! Most failure kinds here are recoverable and returned as `Err` so callers
//! can decide how to surface them; out-of-memory during cache eviction is
//! the one exception and remains a `panic!`, since it can only happen if a
//! caller pins more entries than the cache has room for.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("no such file or directory")]
    NotFound,

    #[error("a directory entry with that name already exists")]
    AlreadyExists,

    #[error("directory is not empty")]
    DirectoryNotEmpty,

    #[error("free map has no sectors left to allocate")]
    OutOfDisk,

    #[error("heap allocation failed")]
    OutOfMemory,

    #[error("on-disk inode failed its magic check")]
    CorruptInode,

    #[error("entry is not a directory")]
    NotADirectory,

    #[error("entry is a directory")]
    IsADirectory,

    #[error("name is empty or contains '/'")]
    InvalidName,

    #[error("path is empty")]
    EmptyPath,

    #[error("i/o error talking to the block device")]
    Io(#[from] std::io::Error),
}

pub type FsResult<T> = Result<T, FsError>;
