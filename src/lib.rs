//! A Unix-like on-disk file system core: a write-back buffer cache, an
//! extensible inode layer with direct/indirect/double-indirect block
//! pointers, and a hierarchical directory namespace, all built atop a
//! pluggable fixed-size [`device::BlockDevice`].
//!
//! The crate is organized leaves-first, matching the component order the
//! design was drafted in: [`device`] (the two external collaborators),
//! [`cache`] (buffer cache), [`inode`] (files), [`dir`] (directories),
//! [`path`] (path resolution), and [`mount`] (the `init`/`done`-scoped
//! facade most callers actually use).

pub mod cache;
pub mod device;
pub mod dir;
pub mod error;
pub mod inode;
pub mod mount;
pub mod path;

pub use device::Sector;
pub use error::{FsError, FsResult};
pub use mount::{Cwd, FileHandle, Mount, OpenEntry};

/// Sector holding the persisted free-map bitmap.
pub const FREE_MAP_SECTOR: Sector = Sector::new(0);

/// Sector holding the root directory's inode.
pub const ROOT_DIR_SECTOR: Sector = Sector::new(1);
