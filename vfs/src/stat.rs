use enumflags2::{bitflags, BitFlags};

/// Attribute record handed to driver adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub inode: u64,
    pub kind: FileType,
    pub perm: BitFlags<Permission>,
    /// Hard link count
    pub links: u32,
    /// File size
    pub size: u64,
    /// Occupying blocks
    pub blocks: u64,
    /// Optimal I/O block size
    pub block_size: u32,
    pub uid: u32,
    pub gid: u32,
    /// Seconds since the Unix epoch
    pub atime: i64,
    pub mtime: i64,
}

impl Stat {
    /// POSIX `st_mode`: type bits and permission bits.
    #[inline]
    pub fn mode(&self) -> u32 {
        self.kind as u32 | self.perm.bits()
    }
}

/// Usage summary of a mounted image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatFs {
    pub block_size: u32,
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub total_inodes: u64,
    pub free_inodes: u64,
    /// Longest file name, in bytes
    pub name_max: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum FileType {
    Directory = 0o040000,
    #[default]
    Regular = 0o100000,
}

impl FileType {
    /// `S_IFMT`
    pub const MASK: u32 = 0o170000;

    /// Type encoded in `mode`. Missing type bits mean a regular file; any
    /// other type is not representable.
    pub fn from_mode(mode: u32) -> Option<Self> {
        match mode & Self::MASK {
            0o040000 => Some(Self::Directory),
            0 | 0o100000 => Some(Self::Regular),
            _ => None,
        }
    }
}

#[allow(clippy::upper_case_acronyms)]
#[bitflags]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    SetUid = 0o4000,
    SetGid = 0o2000,
    Sticky = 0o1000,
    OwnerRead = 0o400,
    OwnerWrite = 0o200,
    OwnerExec = 0o100,
    GroupRead = 0o040,
    GroupWrite = 0o020,
    GroupExec = 0o010,
    OtherRead = 0o004,
    OtherWrite = 0o002,
    OtherExec = 0o001,
}

impl Permission {
    /// Permission bits of `mode`, type bits dropped.
    #[inline]
    pub fn from_mode(mode: u32) -> BitFlags<Self> {
        BitFlags::from_bits_truncate(mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_splits_into_type_and_permission() {
        assert_eq!(FileType::from_mode(0o100644), Some(FileType::Regular));
        assert_eq!(FileType::from_mode(0o040755), Some(FileType::Directory));
        assert_eq!(FileType::from_mode(0o644), Some(FileType::Regular));
        assert_eq!(FileType::from_mode(0o120777), None);

        let perm = Permission::from_mode(0o100644);
        assert_eq!(perm.bits(), 0o644);
        assert!(perm.contains(Permission::OwnerWrite));
        assert!(!perm.contains(Permission::GroupWrite));
    }

    #[test]
    fn stat_mode_recombines() {
        let stat = Stat {
            inode: 1,
            kind: FileType::Directory,
            perm: Permission::from_mode(0o755),
            links: 1,
            size: 0,
            blocks: 1,
            block_size: 4096,
            uid: 0,
            gid: 0,
            atime: 0,
            mtime: 0,
        };
        assert_eq!(stat.mode(), 0o040755);
    }
}
