use crate::Stat;

/// One filled slot of a directory, paired with the attributes of the inode it
/// names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Inode number
    pub inode: u64,
    pub name: String,
    pub stat: Stat,
}
