use vfs::{Error, Result};

use crate::dir::Directory;
use crate::inode::{InodeId, InodeTable};

/// Walks `path` from the root directory. Empty components are skipped, so
/// `""`, `"/"` and `"//a//b/"` are all accepted.
pub fn resolve(table: &InodeTable, path: &str) -> Result<InodeId> {
    path.split('/')
        .filter(|name| !name.is_empty())
        .try_fold(InodeId::ROOT, |inum, name| {
            Directory::open(table, inum)?.lookup(name)
        })
}

/// Splits `path` into the parent directory path and the final component.
///
/// ```
/// assert_eq!(nufs::split_parent("/a/b.txt").unwrap(), ("/a", "b.txt"));
/// assert_eq!(nufs::split_parent("top").unwrap(), ("/", "top"));
/// ```
pub fn split_parent(path: &str) -> Result<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(Error::InvalidArgument("path names no entry"));
    }

    match trimmed.rsplit_once('/') {
        Some(("", name)) => Ok(("/", name)),
        Some((parent, name)) => Ok((parent, name)),
        None => Ok(("/", trimmed)),
    }
}
