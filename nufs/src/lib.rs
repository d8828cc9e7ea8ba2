/* nufs 的整体架构，自上而下 */

// 存储层：按路径或 inode 号提供的文件系统操作
mod storage;
pub use storage::{Owner, Storage, Target};

// 路径解析
mod path;
pub use path::{resolve, split_parent};

// 目录层：单块目录的查找、插入与删除
mod dir;
pub use dir::{Directory, DirectoryMut, DIR_CAPACITY};

// 索引节点层：inode 表与 extent 链
mod inode;
pub use inode::{chain_len, Extent, InodeId, InodeTable};

// 块管理层：常驻内存的镜像与块位图
mod arena;
pub use arena::{BlockArena, BlockId};

// 磁盘数据结构层
pub mod layout;

#[cfg(test)]
mod tests;

use std::time::{SystemTime, UNIX_EPOCH};

pub const BLOCK_SIZE: usize = 4096;
pub const BLOCK_COUNT: usize = 256;
pub const INODE_COUNT: usize = 256;
/// Size of a disk image in bytes (1 MiB).
pub const IMAGE_SIZE: usize = BLOCK_SIZE * BLOCK_COUNT;

type DataBlock = [u8; BLOCK_SIZE];

/// Seconds since the Unix epoch.
pub(crate) fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs() as i64)
}
