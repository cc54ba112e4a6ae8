//! Path resolution.
//!
//! Splits a path into the directory containing the final component and the
//! component's name, walking `.`/`..` and intermediate directories along
//! the way in two passes: one over every component but the last, one that
//! hands back the last component's name unresolved. An absolute path
//! (leading `/`) starts from the root; a relative one starts from the
//! caller's current directory.

use std::sync::Arc;

use crate::device::Sector;
use crate::dir::Directory;
use crate::error::{FsError, FsResult};
use crate::inode::InodeTable;

/// The directory a path's final component lives in, plus that component's
/// name (possibly `.`, `..`, or empty if the path was `/` or `""`).
pub struct Resolved {
    pub dir: Directory,
    pub name: String,
}

fn components(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Resolves `path` to its containing directory and final component name.
/// `cwd` is ignored for absolute paths (and for any path when `cwd` is
/// `None`, i.e. no current directory is set).
pub fn resolve(
    table: &Arc<InodeTable>,
    root_sector: Sector,
    cwd: Option<&Directory>,
    path: &str,
) -> FsResult<Resolved> {
    let tokens = components(path);
    let starts_at_root = path.starts_with('/') || cwd.is_none();

    let mut dir = if starts_at_root {
        Directory::open(Arc::clone(table), table.open(root_sector)?)?
    } else {
        cwd.unwrap().reopen()
    };

    if tokens.is_empty() {
        return Ok(Resolved {
            dir,
            name: String::new(),
        });
    }

    for token in &tokens[..tokens.len() - 1] {
        dir = step(table, dir, token)?;
    }
    Ok(Resolved {
        dir,
        name: tokens[tokens.len() - 1].to_string(),
    })
}

/// Advances into a single path component that is known not to be the
/// final one, i.e. it is expected to resolve to a directory. A component
/// that resolves to something else is not an error here: the inode is
/// closed and the walk continues with `dir` unchanged, so the final lookup
/// fails with the usual "not found" instead of a misleading error about an
/// intermediate component.
fn step(table: &Arc<InodeTable>, dir: Directory, token: &str) -> FsResult<Directory> {
    if token == "." {
        return Ok(dir);
    }
    let sector = dir.lookup(token).ok_or(FsError::NotFound)?;
    let inode = table.open(sector)?;
    if !inode.is_dir() {
        return Ok(dir);
    }
    Directory::open(Arc::clone(table), inode)
}
