//! FUSE driver for nufs images.
//!
//! Kernel requests arrive through `fuser`, get forwarded to [`Storage`] by
//! inode number, and engine errors are turned into errno values by [`errno`].
//! FUSE inode numbers are the image's own inode numbers; both use 1 for the
//! root directory.

mod block_file;

#[cfg(test)]
mod tests;

use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::{self, Read};
use std::os::raw::c_int;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType as FuseFileType, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyCreate,
    ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
    TimeOrNow,
};
use log::{debug, info, trace, warn};
use nufs::{InodeId, Storage};
use typed_bytesize::ByteSizeIec;
use vfs::{Error, FileType, Result, Stat};

pub use self::block_file::BlockFile;

/// How long the kernel may cache attributes and entries.
const ATTR_TTL: Duration = Duration::from_secs(1);
/// Unit of `FileAttr::blocks`.
const SECTOR_SIZE: u64 = 512;

/// Opens (or creates) the image file at `path` and loads it.
pub fn open_image(path: impl AsRef<Path>) -> Result<Storage> {
    let block_file = BlockFile::open(path)?;
    Storage::open(Arc::new(block_file))
}

/// Copies every regular file directly under `source` into the image root.
///
/// A file that does not fit leaves no entry behind.
pub fn pack(storage: &Storage, source: &Path) -> io::Result<()> {
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            warn!("skipping {:?}: name is not UTF-8", entry.file_name());
            continue;
        };

        let mut data = Vec::new();
        File::open(entry.path())?.read_to_end(&mut data)?;
        info!("packing {name:?} ({})", ByteSizeIec(data.len() as u64));

        let inum = storage.create("/", &name, 0o100644).map_err(io::Error::other)?;
        if let Err(err) = storage.write(inum, &data, 0) {
            storage.unlink("/", &name).map_err(io::Error::other)?;
            return Err(io::Error::other(err));
        }
    }
    Ok(())
}

/// POSIX errno for an engine error.
pub fn errno(error: &Error) -> c_int {
    match error {
        Error::NotFound => libc::ENOENT,
        Error::AlreadyExists => libc::EEXIST,
        Error::Full => libc::ENOSPC,
        Error::Exhausted => libc::ENOSPC,
        Error::InvalidArgument(_) => libc::EINVAL,
        Error::NotADirectory => libc::ENOTDIR,
        Error::IsADirectory => libc::EISDIR,
        Error::DirectoryNotEmpty => libc::ENOTEMPTY,
        Error::IntegrityViolation(_) => libc::EIO,
        Error::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
    }
}

/// Logs a failed request and returns the errno to reply with.
fn log_error(operation: &'static str, ino: u64, error: &Error) -> c_int {
    let errno = errno(error);
    // missing names are routine for lookups
    if matches!(error, Error::NotFound) {
        trace!("{operation}({ino}): {error}");
    } else {
        warn!("{operation}({ino}) failed with errno {errno}: {error}");
    }
    errno
}

fn inum(ino: u64) -> Result<InodeId> {
    u32::try_from(ino).map(InodeId::new).map_err(|_| Error::NotFound)
}

fn file_name(name: &OsStr) -> Result<&str> {
    name.to_str()
        .ok_or(Error::InvalidArgument("file name is not UTF-8"))
}

fn system_time(secs: i64) -> SystemTime {
    match u64::try_from(secs) {
        Ok(secs) => UNIX_EPOCH + Duration::from_secs(secs),
        Err(_) => UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs()),
    }
}

fn unix_secs(time: TimeOrNow) -> i64 {
    let time = match time {
        TimeOrNow::SpecificTime(time) => time,
        TimeOrNow::Now => SystemTime::now(),
    };
    match time.duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_secs() as i64,
        Err(before) => -(before.duration().as_secs() as i64),
    }
}

fn to_fuse_file_type(kind: FileType) -> FuseFileType {
    match kind {
        FileType::Directory => FuseFileType::Directory,
        FileType::Regular => FuseFileType::RegularFile,
    }
}

fn to_file_attr(stat: &Stat) -> FileAttr {
    let mtime = system_time(stat.mtime);
    FileAttr {
        ino: stat.inode,
        size: stat.size,
        blocks: stat.blocks * (u64::from(stat.block_size) / SECTOR_SIZE),
        atime: system_time(stat.atime),
        mtime,
        ctime: mtime,
        crtime: mtime,
        kind: to_fuse_file_type(stat.kind),
        perm: stat.perm.bits() as u16,
        nlink: stat.links,
        uid: stat.uid,
        gid: stat.gid,
        rdev: 0,
        blksize: stat.block_size,
        flags: 0,
    }
}

#[derive(Debug, Clone, Default)]
pub struct MountOptions {
    pub read_only: bool,
    pub allow_other: bool,
    pub auto_unmount: bool,
}

impl MountOptions {
    fn to_fuse(&self) -> Vec<MountOption> {
        let mut options = vec![
            MountOption::FSName("nufs".to_owned()),
            MountOption::Subtype("nufs".to_owned()),
            MountOption::DefaultPermissions,
        ];
        if self.read_only {
            options.push(MountOption::RO);
        }
        if self.allow_other {
            options.push(MountOption::AllowOther);
        }
        if self.auto_unmount {
            options.push(MountOption::AutoUnmount);
        }
        options
    }
}

/// Serves `storage` at `mountpoint` until it is unmounted.
pub fn mount(storage: Storage, mountpoint: impl AsRef<Path>, options: &MountOptions) -> io::Result<()> {
    let mountpoint = mountpoint.as_ref();
    info!("mounting at {}", mountpoint.display());
    fuser::mount2(NuFuse::new(storage, options.read_only), mountpoint, &options.to_fuse())
}

/// `fuser` adapter over a [`Storage`].
#[derive(Debug)]
pub struct NuFuse {
    storage: Storage,
    read_only: bool,
}

impl NuFuse {
    pub fn new(storage: Storage, read_only: bool) -> Self {
        Self { storage, read_only }
    }

    fn writable(&self) -> Result<()> {
        if self.read_only {
            return Err(Error::Io(io::Error::from_raw_os_error(libc::EROFS)));
        }
        Ok(())
    }

    fn attr(&self, inum: InodeId) -> Result<FileAttr> {
        self.storage.stat(inum).map(|stat| to_file_attr(&stat))
    }

    fn do_lookup(&self, parent: u64, name: &OsStr) -> Result<FileAttr> {
        let inum = self.storage.lookup(inum(parent)?, file_name(name)?)?;
        self.attr(inum)
    }

    fn do_setattr(
        &self,
        ino: u64,
        mode: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
    ) -> Result<FileAttr> {
        let inum = inum(ino)?;
        if mode.is_some() || size.is_some() || atime.is_some() || mtime.is_some() {
            self.writable()?;
        }
        if let Some(mode) = mode {
            self.storage.chmod(inum, mode)?;
        }
        if let Some(size) = size {
            self.storage.truncate(inum, size)?;
        }
        if atime.is_some() || mtime.is_some() {
            self.storage
                .set_times(inum, atime.map(unix_secs), mtime.map(unix_secs))?;
        }
        self.attr(inum)
    }

    fn do_readdir(&self, ino: u64, offset: i64, reply: &mut ReplyDirectory) -> Result<()> {
        let entries = self.storage.list(inum(ino)?)?;
        let skip = usize::try_from(offset).unwrap_or(0);

        for (index, entry) in entries.iter().enumerate().skip(skip) {
            let next = (index + 1) as i64;
            if reply.add(entry.inode, next, to_fuse_file_type(entry.stat.kind), &entry.name) {
                break;
            }
        }
        Ok(())
    }

    fn do_create(&self, parent: u64, name: &OsStr, mode: u32, umask: u32) -> Result<FileAttr> {
        self.writable()?;
        let inum = self
            .storage
            .create(inum(parent)?, file_name(name)?, mode & !umask)?;
        self.attr(inum)
    }

    fn do_mkdir(&self, parent: u64, name: &OsStr, mode: u32, umask: u32) -> Result<FileAttr> {
        self.writable()?;
        let inum = self
            .storage
            .mkdir(inum(parent)?, file_name(name)?, mode & !umask)?;
        self.attr(inum)
    }

    fn do_link(&self, ino: u64, new_parent: u64, new_name: &OsStr) -> Result<FileAttr> {
        self.writable()?;
        let target = inum(ino)?;
        self.storage
            .link(target, inum(new_parent)?, file_name(new_name)?)?;
        self.attr(target)
    }

    /// Renames `name` to `new_name`. Exchange and no-replace requests are
    /// refused, since the engine only knows plain replacement.
    fn do_rename(
        &self,
        parent: u64,
        name: &OsStr,
        new_parent: u64,
        new_name: &OsStr,
        flags: u32,
    ) -> Result<()> {
        self.writable()?;
        if flags != 0 {
            return Err(Error::InvalidArgument("unsupported rename flags"));
        }
        self.storage.rename(
            inum(parent)?,
            file_name(name)?,
            inum(new_parent)?,
            file_name(new_name)?,
        )
    }

    fn do_read(&self, ino: u64, offset: i64, size: u32) -> Result<Vec<u8>> {
        let offset = u64::try_from(offset).map_err(|_| Error::InvalidArgument("negative offset"))?;
        let mut buf = vec![0; size as usize];
        let len = self.storage.read(inum(ino)?, &mut buf, offset)?;
        buf.truncate(len);
        Ok(buf)
    }

    fn do_write(&self, ino: u64, offset: i64, data: &[u8]) -> Result<u32> {
        self.writable()?;
        let offset = u64::try_from(offset).map_err(|_| Error::InvalidArgument("negative offset"))?;
        let written = self.storage.write(inum(ino)?, data, offset)?;
        Ok(written as u32)
    }
}

impl Filesystem for NuFuse {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> std::result::Result<(), c_int> {
        let statfs = self.storage.statfs();
        info!(
            "nufs ready: {}/{} blocks, {}/{} inodes free",
            statfs.free_blocks, statfs.total_blocks, statfs.free_inodes, statfs.total_inodes
        );
        Ok(())
    }

    fn destroy(&mut self) {
        match self.storage.sync() {
            Ok(()) => info!("nufs unmounted"),
            Err(err) => warn!("final sync failed: {err}"),
        }
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        match self.do_lookup(parent, name) {
            Ok(attr) => reply.entry(&ATTR_TTL, &attr, 0),
            Err(err) => reply.error(log_error("lookup", parent, &err)),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match inum(ino).and_then(|inum| self.attr(inum)) {
            Ok(attr) => reply.attr(&ATTR_TTL, &attr),
            Err(err) => reply.error(log_error("getattr", ino, &err)),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!("setattr({ino}, mode={mode:?}, size={size:?})");
        match self.do_setattr(ino, mode, size, atime, mtime) {
            Ok(attr) => reply.attr(&ATTR_TTL, &attr),
            Err(err) => reply.error(log_error("setattr", ino, &err)),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        match self.do_create(parent, name, mode, umask) {
            Ok(attr) => reply.entry(&ATTR_TTL, &attr, 0),
            Err(err) => reply.error(log_error("mknod", parent, &err)),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        match self.do_mkdir(parent, name, mode, umask) {
            Ok(attr) => reply.entry(&ATTR_TTL, &attr, 0),
            Err(err) => reply.error(log_error("mkdir", parent, &err)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = self
            .writable()
            .and_then(|()| self.storage.unlink(inum(parent)?, file_name(name)?));
        match result {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(log_error("unlink", parent, &err)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = self
            .writable()
            .and_then(|()| self.storage.rmdir(inum(parent)?, file_name(name)?));
        match result {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(log_error("rmdir", parent, &err)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        match self.do_rename(parent, name, newparent, newname, flags) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(log_error("rename", parent, &err)),
        }
    }

    fn link(&mut self, _req: &Request<'_>, ino: u64, newparent: u64, newname: &OsStr, reply: ReplyEntry) {
        match self.do_link(ino, newparent, newname) {
            Ok(attr) => reply.entry(&ATTR_TTL, &attr, 0),
            Err(err) => reply.error(log_error("link", ino, &err)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        // stateless: no file handles are tracked
        match inum(ino).and_then(|inum| self.storage.access(inum)) {
            Ok(()) => reply.opened(0, 0),
            Err(err) => reply.error(log_error("open", ino, &err)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        match self.do_read(ino, offset, size) {
            Ok(data) => reply.data(&data),
            Err(err) => reply.error(log_error("read", ino, &err)),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        match self.do_write(ino, offset, data) {
            Ok(written) => reply.written(written),
            Err(err) => reply.error(log_error("write", ino, &err)),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        // every mutation is already on the device when it returns
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match self.storage.sync() {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(log_error("fsync", ino, &err)),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match inum(ino).and_then(|inum| self.storage.list(inum)) {
            Ok(_) => reply.opened(0, 0),
            Err(err) => reply.error(log_error("opendir", ino, &err)),
        }
    }

    fn readdir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        match self.do_readdir(ino, offset, &mut reply) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(log_error("readdir", ino, &err)),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let statfs = self.storage.statfs();
        reply.statfs(
            statfs.total_blocks,
            statfs.free_blocks,
            statfs.free_blocks,
            statfs.total_inodes,
            statfs.free_inodes,
            statfs.block_size,
            statfs.name_max,
            statfs.block_size,
        );
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let result = inum(ino).and_then(|inum| self.storage.access(inum));
        match result {
            Ok(()) if self.read_only && mask & libc::W_OK != 0 => reply.error(libc::EROFS),
            Ok(()) => reply.ok(),
            Err(err) => reply.error(log_error("access", ino, &err)),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        match self.do_create(parent, name, mode, umask) {
            Ok(attr) => reply.created(&ATTR_TTL, &attr, 0, 0, 0),
            Err(err) => reply.error(log_error("create", parent, &err)),
        }
    }
}
