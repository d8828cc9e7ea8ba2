use std::ffi::OsStr;
use std::io;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use block_dev::BlockDevice;
use fuser::{FileType as FuseFileType, MountOption};
use nufs::{Owner, Storage, BLOCK_COUNT, BLOCK_SIZE, IMAGE_SIZE};
use vfs::Error;

use crate::{errno, open_image, pack, to_file_attr, BlockFile, MountOptions, NuFuse};

#[test]
fn errno_mapping() {
    let cases = [
        (Error::NotFound, libc::ENOENT),
        (Error::AlreadyExists, libc::EEXIST),
        (Error::Full, libc::ENOSPC),
        (Error::Exhausted, libc::ENOSPC),
        (Error::InvalidArgument("bad"), libc::EINVAL),
        (Error::NotADirectory, libc::ENOTDIR),
        (Error::IsADirectory, libc::EISDIR),
        (Error::DirectoryNotEmpty, libc::ENOTEMPTY),
        (Error::IntegrityViolation("broken"), libc::EIO),
        (Error::Io(io::Error::from_raw_os_error(libc::EROFS)), libc::EROFS),
        (Error::Io(io::Error::new(io::ErrorKind::Other, "short read")), libc::EIO),
    ];
    for (error, expected) in cases {
        assert_eq!(errno(&error), expected, "{error}");
    }
}

#[test]
fn file_attr_from_stat() {
    let dir = tempfile::tempdir().unwrap();
    let storage = open_image(dir.path().join("fs.img"))
        .unwrap()
        .with_owner(Owner { uid: 42, gid: 7 });
    let inum = storage.create("/", "f", 0o100640).unwrap();
    storage.write(inum, &[1; BLOCK_SIZE + 1], 0).unwrap();
    storage.set_times(inum, Some(100), Some(200)).unwrap();

    let attr = to_file_attr(&storage.stat(inum).unwrap());
    assert_eq!(attr.ino, u64::from(u32::from(inum)));
    assert_eq!(attr.size, BLOCK_SIZE as u64 + 1);
    assert_eq!(attr.blocks, 2 * BLOCK_SIZE as u64 / 512);
    assert_eq!(attr.kind, FuseFileType::RegularFile);
    assert_eq!(attr.perm, 0o640);
    assert_eq!(attr.nlink, 1);
    assert_eq!((attr.uid, attr.gid), (42, 7));
    assert_eq!(attr.atime, UNIX_EPOCH + Duration::from_secs(100));
    assert_eq!(attr.mtime, UNIX_EPOCH + Duration::from_secs(200));

    let root = to_file_attr(&storage.stat("/").unwrap());
    assert_eq!(root.ino, fuser::FUSE_ROOT_ID);
    assert_eq!(root.kind, FuseFileType::Directory);
    assert_eq!(root.perm, 0o755);
}

#[test]
fn block_file_is_sized_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fs.img");

    let block_file = BlockFile::open(&path).unwrap();
    assert_eq!(std::fs::metadata(&path).unwrap().len(), IMAGE_SIZE as u64);
    assert_eq!(block_file.block_count(), BLOCK_COUNT);

    let mut buf = [0; BLOCK_SIZE];
    block_file.write_block(7, &[9; BLOCK_SIZE]).unwrap();
    block_file.read_block(7, &mut buf).unwrap();
    assert_eq!(buf, [9; BLOCK_SIZE]);
    assert!(block_file.read_block(BLOCK_COUNT, &mut buf).is_err());
    assert!(block_file.write_block(0, &[0; 16]).is_err());
}

#[test]
fn image_file_persists() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fs.img");

    {
        let storage = Storage::open(Arc::new(BlockFile::open(&path).unwrap())).unwrap();
        storage.mkdir("/", "etc", 0o755).unwrap();
        storage.create("/etc", "motd", 0o100644).unwrap();
        storage.write("/etc/motd", b"welcome", 0).unwrap();
    }

    let storage = open_image(&path).unwrap();
    let mut buf = [0; 16];
    assert_eq!(storage.read("/etc/motd", &mut buf, 0).unwrap(), 7);
    assert_eq!(&buf[..7], b"welcome");
    assert_eq!(std::fs::metadata(&path).unwrap().len(), IMAGE_SIZE as u64);
}

#[test]
fn mount_options() {
    let options = MountOptions {
        read_only: true,
        allow_other: false,
        auto_unmount: true,
    }
    .to_fuse();

    assert!(options.contains(&MountOption::RO));
    assert!(options.contains(&MountOption::AutoUnmount));
    assert!(!options.contains(&MountOption::AllowOther));
    assert!(options.contains(&MountOption::FSName("nufs".to_owned())));
}

fn ram_fuse(read_only: bool) -> NuFuse {
    let disk = Arc::new(block_dev::RamDisk::new(BLOCK_SIZE, BLOCK_COUNT));
    NuFuse::new(Storage::open(disk).unwrap(), read_only)
}

#[test]
fn rename_flags_are_refused() {
    let fuse = ram_fuse(false);
    let a = fuse.storage.create("/", "a", 0o100644).unwrap();
    let b = fuse.storage.create("/", "b", 0o100644).unwrap();
    let root = fuser::FUSE_ROOT_ID;

    for flags in [libc::RENAME_EXCHANGE as u32, libc::RENAME_NOREPLACE as u32] {
        let err = fuse
            .do_rename(root, OsStr::new("a"), root, OsStr::new("b"), flags)
            .unwrap_err();
        assert_eq!(errno(&err), libc::EINVAL);
    }
    assert_eq!(fuse.storage.lookup("/", "a").unwrap(), a);
    assert_eq!(fuse.storage.lookup("/", "b").unwrap(), b);
    assert_eq!(fuse.storage.stat(b).unwrap().links, 1);

    fuse.do_rename(root, OsStr::new("a"), root, OsStr::new("b"), 0).unwrap();
    assert_eq!(fuse.storage.lookup("/", "b").unwrap(), a);
    assert!(matches!(fuse.storage.lookup("/", "a"), Err(Error::NotFound)));
}

#[test]
fn negative_offsets_are_invalid() {
    let fuse = ram_fuse(false);
    let inum = fuse.storage.create("/", "f", 0o100644).unwrap();
    let ino = u64::from(u32::from(inum));
    fuse.storage.write(inum, b"data", 0).unwrap();

    let err = fuse.do_read(ino, -1, 4).unwrap_err();
    assert_eq!(errno(&err), libc::EINVAL);
    let err = fuse.do_write(ino, -1, b"x").unwrap_err();
    assert_eq!(errno(&err), libc::EINVAL);
    assert_eq!(fuse.do_read(ino, 0, 16).unwrap(), b"data");
}

#[test]
fn read_only_rename_is_refused() {
    let fuse = ram_fuse(true);
    fuse.storage.create("/", "a", 0o100644).unwrap();
    let root = fuser::FUSE_ROOT_ID;

    let err = fuse
        .do_rename(root, OsStr::new("a"), root, OsStr::new("b"), 0)
        .unwrap_err();
    assert_eq!(errno(&err), libc::EROFS);
    assert!(fuse.storage.lookup("/", "a").is_ok());
}

#[test]
fn pack_copies_files_and_drops_oversized_ones() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("src");
    std::fs::create_dir(&source).unwrap();
    std::fs::write(source.join("small"), b"tiny file").unwrap();

    let storage = open_image(dir.path().join("fs.img")).unwrap();
    pack(&storage, &source).unwrap();
    let mut buf = [0; 16];
    assert_eq!(storage.read("/small", &mut buf, 0).unwrap(), 9);
    assert_eq!(&buf[..9], b"tiny file");

    std::fs::remove_file(source.join("small")).unwrap();
    std::fs::write(source.join("huge"), vec![1; IMAGE_SIZE]).unwrap();
    let free = storage.statfs();
    assert!(pack(&storage, &source).is_err());
    assert!(matches!(storage.lookup("/", "huge"), Err(Error::NotFound)));
    assert_eq!(storage.statfs(), free);
}
