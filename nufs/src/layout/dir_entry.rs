use vfs::{Error, Result};

use super::{le_u32, put_u32, OnDisk};
use crate::InodeId;

/// Longest name a directory entry can hold, in bytes.
pub const NAME_MAX: usize = 55;

/// One slot of a directory block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    // the last byte is always left as \0
    name: [u8; NAME_MAX + 1],
    inum: InodeId,
    filled: bool,
}

impl DirEntry {
    pub fn new(name: &str, inum: InodeId) -> Result<Self> {
        Self::validate(name)?;

        let bytes = name.as_bytes();
        let mut raw = [0; NAME_MAX + 1];
        raw[..bytes.len()].copy_from_slice(bytes);

        Ok(Self {
            name: raw,
            inum,
            filled: true,
        })
    }

    pub fn validate(name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::InvalidArgument("empty file name"));
        }
        if name.len() > NAME_MAX {
            return Err(Error::InvalidArgument("file name too long"));
        }
        if name.contains(['/', '\0']) {
            return Err(Error::InvalidArgument("file name contains '/' or NUL"));
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        let len = self.name.iter().position(|&c| c == 0).unwrap_or(NAME_MAX);
        core::str::from_utf8(&self.name[..len]).unwrap_or_default()
    }

    #[inline]
    pub fn inum(&self) -> InodeId {
        self.inum
    }

    #[inline]
    pub fn is_filled(&self) -> bool {
        self.filled
    }
}

impl Default for DirEntry {
    fn default() -> Self {
        Self {
            name: [0; NAME_MAX + 1],
            inum: InodeId::default(),
            filled: false,
        }
    }
}

impl OnDisk for DirEntry {
    const SIZE: usize = 64;

    fn decode(bytes: &[u8]) -> Self {
        let mut name = [0; NAME_MAX + 1];
        name.copy_from_slice(&bytes[..NAME_MAX + 1]);
        Self {
            name,
            inum: le_u32(bytes, 56).into(),
            filled: le_u32(bytes, 60) == 1,
        }
    }

    fn encode(&self, bytes: &mut [u8]) {
        bytes[..NAME_MAX + 1].copy_from_slice(&self.name);
        put_u32(bytes, 56, self.inum.into());
        put_u32(bytes, 60, u32::from(self.filled));
    }
}
