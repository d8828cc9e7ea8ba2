//! # Storage layer
//!
//! [`Storage`] is the engine's only public entry point for file operations.
//! It owns the [`InodeTable`] (and through it the block arena) behind one
//! reader-writer lock: queries share the lock, every mutation holds it
//! exclusively and writes the modified blocks back before releasing it.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use block_dev::BlockDevice;
use log::{debug, info};
use vfs::{DirEntry, Error, FileType, Permission, Result, Stat, StatFs};

use crate::arena::BlockArena;
use crate::dir::{Directory, DirectoryMut};
use crate::inode::{InodeId, InodeTable};
use crate::layout::{self, NAME_MAX};
use crate::path::resolve;
use crate::{now, BLOCK_COUNT, BLOCK_SIZE, INODE_COUNT};

const ROOT_MODE: u32 = 0o040755;
/// Bits `chmod` may change.
const PERMISSION_BITS: u32 = 0o7777;

/// Names the inode an operation works on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target<'a> {
    /// Absolute path, resolved from the root
    Path(&'a str),
    /// An inode number obtained from an earlier lookup
    Inode(InodeId),
}

impl<'a> From<&'a str> for Target<'a> {
    fn from(path: &'a str) -> Self {
        Self::Path(path)
    }
}

impl From<InodeId> for Target<'_> {
    fn from(inum: InodeId) -> Self {
        Self::Inode(inum)
    }
}

/// Owner reported for every inode; the image stores none.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug)]
pub struct Storage {
    table: RwLock<InodeTable>,
    owner: Owner,
}

impl Storage {
    /// Loads the image on `device`, creating the root directory when the
    /// image is blank.
    pub fn open(device: Arc<dyn BlockDevice>) -> Result<Self> {
        let mut table = InodeTable::new(BlockArena::load(device)?);

        if table.get(InodeId::ROOT).is_none() {
            info!("blank image, creating the root directory");
            table.claim(InodeId::ROOT)?;
            table.on_disk_mut(InodeId::ROOT, |root| {
                root.mode = ROOT_MODE;
                root.refs = 1;
                root.size = BLOCK_SIZE as u32;
            })?;
            let mut root = DirectoryMut::open(&mut table, InodeId::ROOT)?;
            root.insert(".", InodeId::ROOT)?;
            root.insert("..", InodeId::ROOT)?;
        }
        table.arena_mut().sync()?;

        Ok(Self {
            table: RwLock::new(table),
            owner: Owner::default(),
        })
    }

    pub fn with_owner(self, owner: Owner) -> Self {
        Self { owner, ..self }
    }

    pub fn resolve(&self, path: &str) -> Result<InodeId> {
        resolve(&self.shared(), path)
    }

    pub fn stat<'a>(&self, target: impl Into<Target<'a>>) -> Result<Stat> {
        let table = self.shared();
        let inum = target_inum(&table, target.into())?;
        self.stat_of(&table, inum)
    }

    /// Reads file bytes from `offset` on; returns fewer than `buf.len()`
    /// bytes only at the end of the file.
    pub fn read<'a>(&self, target: impl Into<Target<'a>>, buf: &mut [u8], offset: u64) -> Result<usize> {
        let table = self.shared();
        let inum = regular_file(&table, target.into())?;
        let Ok(offset) = usize::try_from(offset) else {
            return Ok(0);
        };
        table.read_at(inum, offset, buf)
    }

    /// Writes `buf` at `offset`, growing the file first when needed. A gap
    /// between the old end and `offset` reads back as zeros.
    pub fn write<'a>(&self, target: impl Into<Target<'a>>, buf: &[u8], offset: u64) -> Result<usize> {
        let target = target.into();
        self.mutate(|table| {
            let inum = regular_file(table, target)?;
            debug!("write({inum}, {} bytes at {offset})", buf.len());

            let offset = usize::try_from(offset)
                .map_err(|_| Error::InvalidArgument("offset past the largest file size"))?;
            let written = table.write_at(inum, offset, buf)?;
            touch(table, inum)?;
            Ok(written)
        })
    }

    pub fn truncate<'a>(&self, target: impl Into<Target<'a>>, size: u64) -> Result<()> {
        let target = target.into();
        self.mutate(|table| {
            let inum = regular_file(table, target)?;
            debug!("truncate({inum}, {size})");

            let size =
                u32::try_from(size).map_err(|_| Error::InvalidArgument("size past the largest file size"))?;
            table.resize(inum, size)?;
            touch(table, inum)
        })
    }

    /// Creates a regular file `name` in `parent`.
    pub fn create<'a>(&self, parent: impl Into<Target<'a>>, name: &str, mode: u32) -> Result<InodeId> {
        let parent = parent.into();
        self.mutate(|table| {
            let parent = target_inum(table, parent)?;
            debug!("create({parent}, {name:?}, {mode:o})");

            let kind = FileType::from_mode(mode).ok_or(Error::InvalidArgument("unsupported file type"))?;
            if kind == FileType::Directory {
                return Err(Error::InvalidArgument("directories are created by mkdir"));
            }
            prepare_entry(table, parent, name)?;

            let inum = table.allocate()?;
            table.on_disk_mut(inum, |disk_inode| {
                disk_inode.mode = FileType::Regular as u32 | (mode & PERMISSION_BITS);
            })?;
            if let Err(err) = add_link(table, parent, name, inum) {
                table.free(inum)?;
                return Err(err);
            }
            touch(table, parent)?;

            Ok(inum)
        })
    }

    /// Creates directory `name` in `parent` holding `.` and `..`.
    pub fn mkdir<'a>(&self, parent: impl Into<Target<'a>>, name: &str, mode: u32) -> Result<InodeId> {
        let parent = parent.into();
        self.mutate(|table| {
            let parent = target_inum(table, parent)?;
            debug!("mkdir({parent}, {name:?}, {mode:o})");
            prepare_entry(table, parent, name)?;

            let inum = table.allocate()?;
            table.on_disk_mut(inum, |disk_inode| {
                disk_inode.mode = FileType::Directory as u32 | (mode & PERMISSION_BITS);
                disk_inode.size = BLOCK_SIZE as u32;
            })?;
            let mut dir = DirectoryMut::open(table, inum)?;
            dir.insert(".", inum)?;
            dir.insert("..", parent)?;

            if let Err(err) = add_link(table, parent, name, inum) {
                table.free(inum)?;
                return Err(err);
            }
            touch(table, parent)?;

            Ok(inum)
        })
    }

    /// Removes the entry `name` of a non-directory; the inode is freed with
    /// its last link.
    pub fn unlink<'a>(&self, parent: impl Into<Target<'a>>, name: &str) -> Result<()> {
        let parent = parent.into();
        self.mutate(|table| {
            let parent = target_inum(table, parent)?;
            debug!("unlink({parent}, {name:?})");
            check_name(name)?;

            let inum = Directory::open(table, parent)?.lookup(name)?;
            if table.inode_kind(inum)? == FileType::Directory {
                return Err(Error::IsADirectory);
            }
            remove_link(table, parent, name)?;
            touch(table, parent)
        })
    }

    /// Removes the empty directory `name`.
    pub fn rmdir<'a>(&self, parent: impl Into<Target<'a>>, name: &str) -> Result<()> {
        let parent = parent.into();
        self.mutate(|table| {
            let parent = target_inum(table, parent)?;
            debug!("rmdir({parent}, {name:?})");
            check_name(name)?;

            let inum = Directory::open(table, parent)?.lookup(name)?;
            if !Directory::open(table, inum)?.is_empty()? {
                return Err(Error::DirectoryNotEmpty);
            }
            remove_link(table, parent, name)?;
            touch(table, parent)
        })
    }

    /// Adds the name `new_name` in `new_parent` for an existing file.
    pub fn link<'a, 'b>(
        &self,
        target: impl Into<Target<'a>>,
        new_parent: impl Into<Target<'b>>,
        new_name: &str,
    ) -> Result<()> {
        let (target, new_parent) = (target.into(), new_parent.into());
        self.mutate(|table| {
            let inum = target_inum(table, target)?;
            let new_parent = target_inum(table, new_parent)?;
            debug!("link({inum}, {new_parent}, {new_name:?})");

            if table.inode_kind(inum)? == FileType::Directory {
                return Err(Error::IsADirectory);
            }
            prepare_entry(table, new_parent, new_name)?;
            add_link(table, new_parent, new_name, inum)?;
            touch(table, new_parent)
        })
    }

    /// Moves `old_parent/old_name` to `new_parent/new_name`, replacing a
    /// compatible destination.
    pub fn rename<'a, 'b>(
        &self,
        old_parent: impl Into<Target<'a>>,
        old_name: &str,
        new_parent: impl Into<Target<'b>>,
        new_name: &str,
    ) -> Result<()> {
        let (old_parent, new_parent) = (old_parent.into(), new_parent.into());
        self.mutate(|table| {
            let old_parent = target_inum(table, old_parent)?;
            let new_parent = target_inum(table, new_parent)?;
            debug!("rename({old_parent}, {old_name:?}, {new_parent}, {new_name:?})");
            check_name(old_name)?;
            check_name(new_name)?;

            let inum = Directory::open(table, old_parent)?.lookup(old_name)?;
            let is_dir = table.inode_kind(inum)? == FileType::Directory;
            if is_dir && old_parent != new_parent && is_within(table, new_parent, inum)? {
                return Err(Error::InvalidArgument("cannot move a directory into itself"));
            }

            let existing = Directory::open(table, new_parent)?.lookup(new_name);
            match existing {
                Ok(existing) if existing == inum => return Ok(()),
                Ok(existing) => {
                    match (is_dir, table.inode_kind(existing)? == FileType::Directory) {
                        (true, false) => return Err(Error::NotADirectory),
                        (false, true) => return Err(Error::IsADirectory),
                        (true, true) if !Directory::open(table, existing)?.is_empty()? => {
                            return Err(Error::DirectoryNotEmpty);
                        }
                        _ => {}
                    }
                    DirectoryMut::open(table, new_parent)?.replace(new_name, inum)?;
                    drop_link(table, existing)?;
                }
                Err(Error::NotFound) => DirectoryMut::open(table, new_parent)?.insert(new_name, inum)?,
                Err(err) => return Err(err),
            }

            DirectoryMut::open(table, old_parent)?.delete(old_name)?;
            if is_dir && old_parent != new_parent {
                DirectoryMut::open(table, inum)?.replace("..", new_parent)?;
            }
            touch(table, old_parent)?;
            touch(table, new_parent)
        })
    }

    /// Filled entries of a directory, `.` and `..` included.
    pub fn list<'a>(&self, target: impl Into<Target<'a>>) -> Result<Vec<DirEntry>> {
        let table = self.shared();
        let inum = target_inum(&table, target.into())?;

        Directory::open(&table, inum)?
            .list()?
            .into_iter()
            .map(|(name, child)| -> Result<DirEntry> {
                Ok(DirEntry {
                    inode: u32::from(child).into(),
                    name,
                    stat: self.stat_of(&table, child)?,
                })
            })
            .collect()
    }

    /// Inode named `name` inside `parent`.
    pub fn lookup<'a>(&self, parent: impl Into<Target<'a>>, name: &str) -> Result<InodeId> {
        let table = self.shared();
        let parent = target_inum(&table, parent.into())?;
        Directory::open(&table, parent)?.lookup(name)
    }

    /// Replaces the permission bits; the file type is kept.
    pub fn chmod<'a>(&self, target: impl Into<Target<'a>>, mode: u32) -> Result<()> {
        let target = target.into();
        self.mutate(|table| {
            let inum = target_inum(table, target)?;
            debug!("chmod({inum}, {mode:o})");
            table.on_disk_mut(inum, |disk_inode| {
                disk_inode.mode = (disk_inode.mode & FileType::MASK) | (mode & PERMISSION_BITS);
            })
        })
    }

    /// Sets the access and modification times, in seconds since the epoch.
    /// `None` keeps the current value.
    pub fn set_times<'a>(&self, target: impl Into<Target<'a>>, atime: Option<i64>, mtime: Option<i64>) -> Result<()> {
        let target = target.into();
        self.mutate(|table| {
            let inum = target_inum(table, target)?;
            debug!("set_times({inum}, {atime:?}, {mtime:?})");
            table.on_disk_mut(inum, |disk_inode| {
                disk_inode.atime = atime.unwrap_or(disk_inode.atime);
                disk_inode.mtime = mtime.unwrap_or(disk_inode.mtime);
            })
        })
    }

    /// Succeeds when the target exists. Permission bits are not enforced.
    pub fn access<'a>(&self, target: impl Into<Target<'a>>) -> Result<()> {
        target_inum(&self.shared(), target.into()).map(|_| ())
    }

    pub fn statfs(&self) -> StatFs {
        let table = self.shared();
        StatFs {
            block_size: BLOCK_SIZE as u32,
            total_blocks: BLOCK_COUNT as u64,
            free_blocks: table.arena().free_blocks() as u64,
            total_inodes: INODE_COUNT as u64,
            free_inodes: table.free_inodes() as u64,
            name_max: NAME_MAX as u32,
        }
    }

    /// Writes every modified block back to the device.
    pub fn sync(&self) -> Result<()> {
        self.exclusive().arena_mut().sync()
    }
}

impl Storage {
    fn shared(&self) -> RwLockReadGuard<'_, InodeTable> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn exclusive(&self) -> RwLockWriteGuard<'_, InodeTable> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` under the write lock and flushes whatever it modified.
    fn mutate<V>(&self, f: impl FnOnce(&mut InodeTable) -> Result<V>) -> Result<V> {
        let mut table = self.exclusive();
        let result = f(&mut *table);
        let synced = table.arena_mut().sync();
        let value = result?;
        synced?;
        Ok(value)
    }

    fn stat_of(&self, table: &InodeTable, inum: InodeId) -> Result<Stat> {
        let disk_inode = table.get(inum).ok_or(Error::NotFound)?;
        Ok(Stat {
            inode: u32::from(inum).into(),
            kind: disk_inode.kind(),
            perm: Permission::from_mode(disk_inode.mode),
            links: disk_inode.refs,
            size: disk_inode.size.into(),
            blocks: table.chain(inum)?.len() as u64,
            block_size: BLOCK_SIZE as u32,
            uid: self.owner.uid,
            gid: self.owner.gid,
            atime: disk_inode.atime,
            mtime: disk_inode.mtime,
        })
    }
}

impl InodeTable {
    fn inode_kind(&self, inum: InodeId) -> Result<FileType> {
        self.on_disk(inum, layout::DiskInode::kind)
    }
}

/// Linked inode named by `target`. Unlinked slots, such as chain
/// continuations, are not addressable.
fn target_inum(table: &InodeTable, target: Target<'_>) -> Result<InodeId> {
    let inum = match target {
        Target::Path(path) => resolve(table, path)?,
        Target::Inode(inum) => inum,
    };
    match table.get(inum) {
        Some(disk_inode) if disk_inode.refs > 0 => Ok(inum),
        _ => Err(Error::NotFound),
    }
}

fn regular_file(table: &InodeTable, target: Target<'_>) -> Result<InodeId> {
    let inum = target_inum(table, target)?;
    match table.inode_kind(inum)? {
        FileType::Directory => Err(Error::IsADirectory),
        FileType::Regular => Ok(inum),
    }
}

/// Rejects the names every directory reserves, then validates the bytes.
fn check_name(name: &str) -> Result<()> {
    if name == "." || name == ".." {
        return Err(Error::InvalidArgument("'.' and '..' are reserved"));
    }
    layout::DirEntry::validate(name)
}

/// Checks that `name` can be added to `parent` before anything is allocated.
fn prepare_entry(table: &InodeTable, parent: InodeId, name: &str) -> Result<()> {
    check_name(name)?;
    let dir = Directory::open(table, parent)?;
    match dir.lookup(name) {
        Ok(_) => return Err(Error::AlreadyExists),
        Err(Error::NotFound) => {}
        Err(err) => return Err(err),
    }
    if dir.free_slots()? == 0 {
        return Err(Error::Full);
    }
    Ok(())
}

/// Inserts the entry first; the count only moves once the entry exists.
fn add_link(table: &mut InodeTable, parent: InodeId, name: &str, inum: InodeId) -> Result<()> {
    DirectoryMut::open(table, parent)?.insert(name, inum)?;
    table.on_disk_mut(inum, |disk_inode| disk_inode.refs += 1)
}

fn remove_link(table: &mut InodeTable, parent: InodeId, name: &str) -> Result<()> {
    let inum = DirectoryMut::open(table, parent)?.delete(name)?;
    drop_link(table, inum)
}

/// Takes one link away from `inum`, freeing it with the last one.
fn drop_link(table: &mut InodeTable, inum: InodeId) -> Result<()> {
    // `.` and `..` are not counted, so a directory goes with its only name
    let refs = table.on_disk_mut(inum, |disk_inode| {
        disk_inode.refs = disk_inode.refs.saturating_sub(1);
        disk_inode.refs
    })?;
    if refs == 0 {
        table.free(inum)?;
    }
    Ok(())
}

fn touch(table: &mut InodeTable, inum: InodeId) -> Result<()> {
    table.on_disk_mut(inum, |disk_inode| disk_inode.mtime = now())
}

/// Whether `dir` is `ancestor` or lies somewhere below it.
fn is_within(table: &InodeTable, mut dir: InodeId, ancestor: InodeId) -> Result<bool> {
    for _ in 0..INODE_COUNT {
        if dir == ancestor {
            return Ok(true);
        }
        if dir == InodeId::ROOT {
            return Ok(false);
        }
        dir = Directory::open(table, dir)?.lookup("..")?;
    }
    Err(Error::IntegrityViolation("directory tree loops"))
}
