//! # Directory index
//!
//! A directory owns exactly one data block, read as [`DIR_CAPACITY`] fixed
//! slots. Lookups, inserts and deletes scan the slots in physical order.

use log::trace;
use vfs::{Error, Result};

use crate::arena::BlockId;
use crate::inode::{InodeId, InodeTable};
use crate::layout::{DirEntry, OnDisk};
use crate::BLOCK_SIZE;

/// Entries one directory block can hold.
pub const DIR_CAPACITY: usize = BLOCK_SIZE / DirEntry::SIZE;

/// Resolves the data block of `inum`, which must be a directory.
fn dir_block(table: &InodeTable, inum: InodeId) -> Result<BlockId> {
    let disk_inode = table.get(inum).ok_or(Error::NotFound)?;
    if !disk_inode.is_dir() {
        return Err(Error::NotADirectory);
    }
    Ok(disk_inode.block)
}

fn slot_offset(slot: usize) -> usize {
    slot * DirEntry::SIZE
}

/// Read-only view of a directory.
#[derive(Debug, Clone, Copy)]
pub struct Directory<'a> {
    table: &'a InodeTable,
    block: BlockId,
}

impl<'a> Directory<'a> {
    pub fn open(table: &'a InodeTable, inum: InodeId) -> Result<Self> {
        let block = dir_block(table, inum)?;
        Ok(Self { table, block })
    }

    fn entry(&self, slot: usize) -> Result<DirEntry> {
        self.table
            .arena()
            .map(self.block, slot_offset(slot), |entry: &DirEntry| entry.clone())
    }

    fn entries(&self) -> impl Iterator<Item = Result<(usize, DirEntry)>> + '_ {
        (0..DIR_CAPACITY).map(|slot| self.entry(slot).map(|entry| (slot, entry)))
    }

    /// Slot and inode of the filled entry named `name`.
    fn find(&self, name: &str) -> Result<Option<(usize, InodeId)>> {
        for item in self.entries() {
            let (slot, entry) = item?;
            if entry.is_filled() && entry.name() == name {
                return Ok(Some((slot, entry.inum())));
            }
        }
        Ok(None)
    }

    fn first_free(&self) -> Result<Option<usize>> {
        for item in self.entries() {
            let (slot, entry) = item?;
            if !entry.is_filled() {
                return Ok(Some(slot));
            }
        }
        Ok(None)
    }

    /// Inode named `name` in this directory.
    pub fn lookup(&self, name: &str) -> Result<InodeId> {
        self.find(name)?
            .map(|(_, inum)| inum)
            .ok_or(Error::NotFound)
    }

    /// Filled entries in slot order.
    pub fn list(&self) -> Result<Vec<(String, InodeId)>> {
        let mut listing = Vec::new();
        for item in self.entries() {
            let (_, entry) = item?;
            if entry.is_filled() {
                listing.push((entry.name().to_owned(), entry.inum()));
            }
        }
        Ok(listing)
    }

    pub fn free_slots(&self) -> Result<usize> {
        let mut free = 0;
        for item in self.entries() {
            let (_, entry) = item?;
            if !entry.is_filled() {
                free += 1;
            }
        }
        Ok(free)
    }

    /// Whether nothing besides `.` and `..` is left.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self
            .list()?
            .iter()
            .all(|(name, _)| name == "." || name == ".."))
    }
}

/// Mutable view of a directory.
#[derive(Debug)]
pub struct DirectoryMut<'a> {
    table: &'a mut InodeTable,
    inum: InodeId,
    block: BlockId,
}

impl<'a> DirectoryMut<'a> {
    pub fn open(table: &'a mut InodeTable, inum: InodeId) -> Result<Self> {
        let block = dir_block(table, inum)?;
        Ok(Self { table, inum, block })
    }

    /// Read-only access to the same directory.
    pub fn view(&self) -> Directory<'_> {
        Directory {
            table: &*self.table,
            block: self.block,
        }
    }

    fn put(&mut self, slot: usize, new_entry: DirEntry) -> Result<()> {
        self.table
            .arena_mut()
            .map_mut(self.block, slot_offset(slot), |entry: &mut DirEntry| {
                *entry = new_entry
            })
    }

    /// Fills the first free slot with `name -> inum`.
    pub fn insert(&mut self, name: &str, inum: InodeId) -> Result<()> {
        let new_entry = DirEntry::new(name, inum)?;
        let slot = self.view().first_free()?.ok_or(Error::Full)?;

        trace!("dir {}: insert {name:?} -> {inum} at slot {slot}", self.inum);
        self.put(slot, new_entry)
    }

    /// Clears the entry named `name` and returns the inode it pointed to.
    pub fn delete(&mut self, name: &str) -> Result<InodeId> {
        let (slot, inum) = self.view().find(name)?.ok_or(Error::NotFound)?;

        trace!("dir {}: delete {name:?} -> {inum} at slot {slot}", self.inum);
        self.put(slot, DirEntry::default())?;
        Ok(inum)
    }

    /// Points the existing entry `name` at `inum`; returns the inode it
    /// pointed to before.
    pub fn replace(&mut self, name: &str, inum: InodeId) -> Result<InodeId> {
        let new_entry = DirEntry::new(name, inum)?;
        let (slot, old) = self.view().find(name)?.ok_or(Error::NotFound)?;

        trace!("dir {}: {name:?} now -> {inum} (was {old})", self.inum);
        self.put(slot, new_entry)?;
        Ok(old)
    }
}
