use std::sync::Arc;

use block_dev::{BlockDevice, RamDisk};
use vfs::Error;

use crate::layout::{Bitmap, DirEntry, DiskInode, OnDisk, BLOCK_BITMAP, FIRST_DATA_BLOCK, NAME_MAX};
use crate::{BlockArena, BlockId, Directory, DirectoryMut, InodeId, InodeTable};
use crate::{BLOCK_COUNT, BLOCK_SIZE, DIR_CAPACITY, INODE_COUNT};

const BS: u32 = BLOCK_SIZE as u32;

fn ram_disk() -> Arc<dyn BlockDevice> {
    Arc::new(RamDisk::new(BLOCK_SIZE, BLOCK_COUNT))
}

fn table() -> InodeTable {
    InodeTable::new(BlockArena::load(ram_disk()).unwrap())
}

/// Every live chain starting at `head` satisfies the suffix-size rule.
fn assert_chain(table: &InodeTable, head: InodeId, expected: &[u32]) {
    let chain = table.chain(head).unwrap();
    let sizes: Vec<u32> = chain.iter().map(|extent| extent.size).collect();
    assert_eq!(sizes, expected);
    for extent in &chain {
        assert!(table.arena().is_allocated(extent.block));
    }
}

#[test]
fn bitmap_first_clear() {
    let mut block = [0u8; BLOCK_SIZE];
    let bitmap = Bitmap::new(3, 20);

    assert_eq!(bitmap.first_clear(&block, 0), Some(0));
    for index in 0..10 {
        bitmap.put(&mut block, index, true);
    }
    assert_eq!(bitmap.first_clear(&block, 0), Some(10));
    assert_eq!(bitmap.first_clear(&block, 13), Some(13));
    assert_eq!(block[3], 0xff);
    assert_eq!(block[4], 0b11);

    bitmap.put(&mut block, 4, false);
    assert!(!bitmap.get(&block, 4));
    assert_eq!(bitmap.first_clear(&block, 0), Some(4));
    assert_eq!(bitmap.count_clear(&block), 11);

    for index in 0..20 {
        bitmap.put(&mut block, index, true);
    }
    assert_eq!(bitmap.first_clear(&block, 0), None);
}

#[test]
fn arena_reserves_metadata_blocks() {
    let mut arena = BlockArena::load(ram_disk()).unwrap();
    assert_eq!(arena.free_blocks(), BLOCK_COUNT - FIRST_DATA_BLOCK);

    let first = arena.alloc_block().unwrap();
    assert_eq!(first, BlockId::new(FIRST_DATA_BLOCK as u32));
    assert!(BLOCK_BITMAP.get(arena.get_block(BlockId::BITMAPS).unwrap(), FIRST_DATA_BLOCK));

    assert!(matches!(
        arena.free_block(BlockId::BITMAPS),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        arena.free_block(BlockId::new(BLOCK_COUNT as u32)),
        Err(Error::InvalidArgument(_))
    ));
    arena.free_block(first).unwrap();
    assert!(matches!(
        arena.free_block(first),
        Err(Error::IntegrityViolation(_))
    ));
}

#[test]
fn arena_exhaustion() {
    let mut arena = BlockArena::load(ram_disk()).unwrap();
    let data_blocks = BLOCK_COUNT - FIRST_DATA_BLOCK;
    for _ in 0..data_blocks {
        arena.alloc_block().unwrap();
    }
    assert_eq!(arena.free_blocks(), 0);
    assert!(matches!(arena.alloc_block(), Err(Error::Exhausted)));
}

#[test]
fn allocated_block_is_zeroed() {
    let mut arena = BlockArena::load(ram_disk()).unwrap();
    let block_id = arena.alloc_block().unwrap();
    arena.get_block_mut(block_id).unwrap().fill(0xaa);
    arena.free_block(block_id).unwrap();

    let again = arena.alloc_block().unwrap();
    assert_eq!(again, block_id);
    assert!(arena.get_block(again).unwrap().iter().all(|&byte| byte == 0));
}

#[test]
fn arena_sync_writes_dirty_blocks() {
    let disk = Arc::new(RamDisk::new(BLOCK_SIZE, BLOCK_COUNT));
    let mut arena = BlockArena::load(disk.clone()).unwrap();
    let block_id = arena.alloc_block().unwrap();
    arena.get_block_mut(block_id).unwrap()[..5].copy_from_slice(b"hello");

    let offset = u32::from(block_id) as usize * BLOCK_SIZE;
    assert_ne!(&disk.snapshot()[offset..offset + 5], b"hello");
    arena.sync().unwrap();
    assert_eq!(&disk.snapshot()[offset..offset + 5], b"hello");
}

#[test]
fn disk_inode_encoding() {
    let disk_inode = DiskInode {
        refs: 2,
        mode: 0o100600,
        size: 9000,
        block: BlockId::new(7),
        next: Some(InodeId::new(3)),
        atime: -1,
        mtime: 1_700_000_000,
    };
    let mut bytes = [0u8; DiskInode::SIZE];
    disk_inode.encode(&mut bytes);
    assert_eq!(&bytes[8..12], &9000u32.to_le_bytes());
    assert_eq!(DiskInode::decode(&bytes), disk_inode);

    let tail = DiskInode { next: None, ..disk_inode };
    tail.encode(&mut bytes);
    assert_eq!(&bytes[16..20], &[0xff; 4]);
    assert_eq!(DiskInode::decode(&bytes).next, None);
}

#[test]
fn dir_entry_names() {
    let entry = DirEntry::new("hello.txt", InodeId::new(9)).unwrap();
    assert_eq!(entry.name(), "hello.txt");
    assert_eq!(entry.inum(), InodeId::new(9));
    assert!(entry.is_filled());

    let longest = "n".repeat(NAME_MAX);
    assert_eq!(DirEntry::new(&longest, InodeId::ROOT).unwrap().name(), longest);
    for bad in ["", "a/b", "nul\0", "n".repeat(NAME_MAX + 1).as_str()] {
        assert!(matches!(
            DirEntry::new(bad, InodeId::ROOT),
            Err(Error::InvalidArgument(_))
        ));
    }
}

#[test]
fn inode_zero_is_never_allocated() {
    let mut table = table();
    assert_eq!(table.allocate().unwrap(), InodeId::new(1));
    assert!(table.get(InodeId::RESERVED).is_none());
    assert_eq!(table.free_inodes(), INODE_COUNT - 2);
}

#[test]
fn allocate_and_free_conserve_resources() {
    let mut table = table();
    let blocks = table.arena().free_blocks();
    let inodes = table.free_inodes();

    let inum = table.allocate().unwrap();
    let disk_inode = table.get(inum).unwrap();
    assert_eq!(disk_inode.mode, DiskInode::DEFAULT_MODE);
    assert_eq!((disk_inode.refs, disk_inode.size, disk_inode.next), (0, 0, None));
    assert_eq!(table.arena().free_blocks(), blocks - 1);
    assert_eq!(table.free_inodes(), inodes - 1);

    table.grow(inum, 3 * BS).unwrap();
    assert_eq!(table.arena().free_blocks(), blocks - 3);
    assert_eq!(table.free_inodes(), inodes - 3);

    table.free(inum).unwrap();
    assert_eq!(table.arena().free_blocks(), blocks);
    assert_eq!(table.free_inodes(), inodes);
    assert!(table.get(inum).is_none());
}

#[test]
fn free_requires_no_links() {
    let mut table = table();
    let inum = table.allocate().unwrap();
    table.on_disk_mut(inum, |disk_inode| disk_inode.refs = 1).unwrap();
    assert!(matches!(table.free(inum), Err(Error::InvalidArgument(_))));
}

#[test]
fn grow_keeps_suffix_sizes() {
    let mut table = table();
    let inum = table.allocate().unwrap();

    table.grow(inum, 10).unwrap();
    assert_chain(&table, inum, &[10]);
    table.grow(inum, BS - 10).unwrap();
    assert_chain(&table, inum, &[BS]);
    table.grow(inum, 1).unwrap();
    assert_chain(&table, inum, &[BS + 1, 1]);
    table.grow(inum, 2 * BS).unwrap();
    assert_chain(&table, inum, &[3 * BS + 1, 2 * BS + 1, BS + 1, 1]);
    table.grow(inum, 0).unwrap();
    assert_chain(&table, inum, &[3 * BS + 1, 2 * BS + 1, BS + 1, 1]);
}

#[test]
fn grow_rolls_back_on_exhaustion() {
    let mut table = table();
    let inum = table.allocate().unwrap();
    table.grow(inum, 100).unwrap();

    let free = table.arena().free_blocks() as u32;
    let free_inodes = table.free_inodes();
    let err = table.grow(inum, (free + 1) * BS).unwrap_err();
    assert!(matches!(err, Error::Exhausted));

    assert_chain(&table, inum, &[100]);
    assert_eq!(table.arena().free_blocks() as u32, free);
    assert_eq!(table.free_inodes(), free_inodes);
}

#[test]
fn grow_rejects_overflow() {
    let mut table = table();
    let inum = table.allocate().unwrap();
    table.grow(inum, 1).unwrap();
    assert!(matches!(
        table.grow(inum, u32::MAX),
        Err(Error::InvalidArgument(_))
    ));
    assert_chain(&table, inum, &[1]);
}

#[test]
fn shrink_releases_tail_nodes() {
    let mut table = table();
    let inum = table.allocate().unwrap();
    table.grow(inum, 10000).unwrap();
    let free = table.arena().free_blocks();

    table.shrink(inum, 8000).unwrap();
    assert_chain(&table, inum, &[2000]);
    assert_eq!(table.arena().free_blocks(), free + 2);

    table.grow(inum, BS).unwrap();
    assert_chain(&table, inum, &[2000 + BS, 2000]);
    table.shrink(inum, 2000).unwrap();
    assert_chain(&table, inum, &[BS]);
}

#[test]
fn shrink_to_zero_is_rejected() {
    let mut table = table();
    let inum = table.allocate().unwrap();
    table.grow(inum, 100).unwrap();

    assert!(matches!(table.shrink(inum, 100), Err(Error::InvalidArgument(_))));
    assert!(matches!(table.shrink(inum, 101), Err(Error::InvalidArgument(_))));
    assert_chain(&table, inum, &[100]);

    table.clear(inum).unwrap();
    assert_chain(&table, inum, &[0]);
}

#[test]
fn shrink_zeroes_bytes_past_the_end() {
    let mut table = table();
    let inum = table.allocate().unwrap();
    table.write_at(inum, 0, &[0xee; 300]).unwrap();
    table.resize(inum, 100).unwrap();
    table.resize(inum, 300).unwrap();

    let mut buf = [0xffu8; 300];
    assert_eq!(table.read_at(inum, 0, &mut buf).unwrap(), 300);
    assert!(buf[..100].iter().all(|&byte| byte == 0xee));
    assert!(buf[100..].iter().all(|&byte| byte == 0));
}

#[test]
fn read_write_across_blocks() {
    let mut table = table();
    let inum = table.allocate().unwrap();
    let data: Vec<u8> = (0..3 * BLOCK_SIZE + 17).map(|i| (i % 251) as u8).collect();

    assert_eq!(table.write_at(inum, 0, &data).unwrap(), data.len());
    assert_chain(
        &table,
        inum,
        &[3 * BS + 17, 2 * BS + 17, BS + 17, 17],
    );

    let mut buf = vec![0; data.len() + 100];
    assert_eq!(table.read_at(inum, 0, &mut buf).unwrap(), data.len());
    assert_eq!(&buf[..data.len()], &data[..]);

    let mut middle = [0; 10];
    let offset = BLOCK_SIZE - 5;
    assert_eq!(table.read_at(inum, offset, &mut middle).unwrap(), 10);
    assert_eq!(&middle, &data[offset..offset + 10]);

    assert_eq!(table.read_at(inum, data.len(), &mut middle).unwrap(), 0);
    assert_eq!(table.read_at(inum, data.len() + 5, &mut middle).unwrap(), 0);
}

#[test]
fn write_past_end_fills_zeros() {
    let mut table = table();
    let inum = table.allocate().unwrap();
    table.write_at(inum, BLOCK_SIZE + 10, b"tail").unwrap();
    assert_chain(&table, inum, &[BS + 14, 14]);

    let mut buf = vec![0xffu8; BLOCK_SIZE + 14];
    assert_eq!(table.read_at(inum, 0, &mut buf).unwrap(), buf.len());
    assert!(buf[..BLOCK_SIZE + 10].iter().all(|&byte| byte == 0));
    assert_eq!(&buf[BLOCK_SIZE + 10..], b"tail");
}

#[test]
fn chain_detects_broken_links() {
    let mut table = table();
    let inum = table.allocate().unwrap();
    table.grow(inum, 2 * BS).unwrap();
    let second = table.chain(inum).unwrap()[1].inode;

    table.on_disk_mut(second, |disk_inode| disk_inode.size += 1).unwrap();
    assert!(matches!(table.chain(inum), Err(Error::IntegrityViolation(_))));
    table.on_disk_mut(second, |disk_inode| disk_inode.size -= 1).unwrap();

    table.on_disk_mut(inum, |disk_inode| disk_inode.next = None).unwrap();
    assert!(matches!(table.chain(inum), Err(Error::IntegrityViolation(_))));
}

#[test]
fn directory_slots() {
    let mut table = table();
    let inum = table.allocate().unwrap();
    assert!(matches!(
        Directory::open(&table, inum),
        Err(Error::NotADirectory)
    ));
    table
        .on_disk_mut(inum, |disk_inode| disk_inode.mode = 0o040755)
        .unwrap();

    let mut dir = DirectoryMut::open(&mut table, inum).unwrap();
    dir.insert(".", inum).unwrap();
    dir.insert("..", InodeId::ROOT).unwrap();
    assert!(dir.view().is_empty().unwrap());

    dir.insert("a", InodeId::new(20)).unwrap();
    dir.insert("b", InodeId::new(21)).unwrap();
    assert!(!dir.view().is_empty().unwrap());
    assert_eq!(dir.delete("a").unwrap(), InodeId::new(20));
    assert!(matches!(dir.delete("a"), Err(Error::NotFound)));

    // the freed slot is reused first
    dir.insert("c", InodeId::new(22)).unwrap();
    let names: Vec<String> = dir.view().list().unwrap().into_iter().map(|(name, _)| name).collect();
    assert_eq!(names, [".", "..", "c", "b"]);

    assert_eq!(dir.replace("b", InodeId::new(30)).unwrap(), InodeId::new(21));
    assert_eq!(dir.view().lookup("b").unwrap(), InodeId::new(30));
    assert_eq!(dir.view().free_slots().unwrap(), DIR_CAPACITY - 4);
}
