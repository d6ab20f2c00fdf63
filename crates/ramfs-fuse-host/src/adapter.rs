// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! ramfs FUSE adapter implementation
//!
//! Maps FUSE operations to ramfs core calls and core errors to errnos.
//! The adapter itself is stateless: every handle it issues is `0`, and all
//! lifetime bookkeeping (lookup counts, cursor registries) lives in the
//! core.

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    fuse_forget_one, FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate,
    ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyLock, ReplyOpen, ReplyStatfs,
    ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use libc::{c_int, EINVAL, ENAMETOOLONG, ENODATA, ERANGE, F_UNLCK, XATTR_CREATE, XATTR_REPLACE};
use tracing::{debug, info};

use ramfs_core::{
    Credentials, FileKind, FsConfig, FsError, InodeAttr, RamFs, SetAttrRequest, SetXattrMode,
    BLOCK_SIZE, NAME_MAX,
};

fn errno_from_fs_error(err: &FsError) -> i32 {
    match err {
        FsError::NotFound => libc::ENOENT,
        FsError::AlreadyExists => libc::EEXIST,
        FsError::AccessDenied => libc::EACCES,
        FsError::OperationNotPermitted => libc::EPERM,
        FsError::InvalidArgument => libc::EINVAL,
        FsError::NotADirectory => libc::ENOTDIR,
        FsError::IsADirectory => libc::EISDIR,
        FsError::NotEmpty => libc::ENOTEMPTY,
        FsError::OutOfMemory => libc::ENOMEM,
    }
}

/// Errno mapping for the xattr operations, where an absent attribute is
/// `ENODATA` rather than `ENOENT`.
fn xattr_errno(err: &FsError) -> i32 {
    match err {
        FsError::NotFound => ENODATA,
        other => errno_from_fs_error(other),
    }
}

fn to_fuse_file_type(kind: FileKind) -> FileType {
    match kind {
        FileKind::RegularFile => FileType::RegularFile,
        FileKind::Directory => FileType::Directory,
        FileKind::Symlink => FileType::Symlink,
        FileKind::CharDevice => FileType::CharDevice,
        FileKind::BlockDevice => FileType::BlockDevice,
        FileKind::Fifo => FileType::NamedPipe,
        FileKind::Socket => FileType::Socket,
    }
}

fn to_file_attr(attr: &InodeAttr) -> FileAttr {
    FileAttr {
        ino: attr.ino,
        size: attr.size,
        blocks: attr.blocks,
        atime: attr.atime,
        mtime: attr.mtime,
        ctime: attr.ctime,
        crtime: attr.crtime,
        kind: to_fuse_file_type(attr.kind),
        perm: (attr.mode & 0o7777) as u16,
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: attr.rdev,
        blksize: BLOCK_SIZE as u32,
        flags: 0,
    }
}

/// Validates a path component from the kernel, or the errno to reply.
fn component(name: &OsStr) -> Result<&str, i32> {
    if name.len() > NAME_MAX {
        return Err(ENAMETOOLONG);
    }
    name.to_str().ok_or(EINVAL)
}

fn time_or_now(t: TimeOrNow) -> SystemTime {
    match t {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

/// ramfs FUSE filesystem adapter
pub struct RamFsFuse {
    /// Core filesystem instance
    fs: Arc<RamFs>,
    /// TTL for attribute cache responses
    attr_ttl: Duration,
    /// TTL for directory entry cache responses
    entry_ttl: Duration,
}

impl RamFsFuse {
    /// Create a new FUSE adapter with the given configuration
    pub fn new(config: FsConfig) -> Self {
        info!(
            target: "ramfs::fuse",
            default_uid = config.security.default_uid,
            default_gid = config.security.default_gid,
            "mount default owner"
        );
        let attr_ttl = Duration::from_millis(config.cache.attr_ttl_ms);
        let entry_ttl = Duration::from_millis(config.cache.entry_ttl_ms);
        Self {
            fs: Arc::new(RamFs::new(config)),
            attr_ttl,
            entry_ttl,
        }
    }

    fn cred(req: &Request<'_>) -> Credentials {
        Credentials {
            uid: req.uid(),
            gid: req.gid(),
        }
    }
}

impl Filesystem for RamFsFuse {
    fn init(&mut self, _req: &Request, _config: &mut KernelConfig) -> Result<(), c_int> {
        let stats = self.fs.statfs();
        info!(
            target: "ramfs::fuse",
            total_blocks = stats.blocks,
            total_inodes = stats.files,
            "ramfs FUSE adapter initialized"
        );
        Ok(())
    }

    fn destroy(&mut self) {
        info!(target: "ramfs::fuse", "ramfs FUSE adapter destroyed");
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = match component(name) {
            Ok(name) => name,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        match self.fs.lookup(parent, name) {
            Ok(attr) => reply.entry(&self.entry_ttl, &to_file_attr(&attr), 0),
            Err(err) => reply.error(errno_from_fs_error(&err)),
        }
    }

    fn forget(&mut self, _req: &Request, ino: u64, nlookup: u64) {
        self.fs.forget(ino, nlookup);
    }

    fn batch_forget(&mut self, _req: &Request, nodes: &[fuse_forget_one]) {
        for node in nodes {
            self.fs.forget(node.nodeid, node.nlookup);
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.fs.getattr(ino) {
            Ok(attr) => reply.attr(&self.attr_ttl, &to_file_attr(&attr)),
            Err(err) => reply.error(errno_from_fs_error(&err)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
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
        let request = SetAttrRequest {
            mode,
            uid,
            gid,
            size,
            atime: atime.map(time_or_now),
            mtime: mtime.map(time_or_now),
        };
        match self.fs.setattr(ino, request) {
            Ok(attr) => reply.attr(&self.attr_ttl, &to_file_attr(&attr)),
            Err(err) => reply.error(errno_from_fs_error(&err)),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        match self.fs.readlink(ino) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(err) => reply.error(errno_from_fs_error(&err)),
        }
    }

    fn mknod(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let name = match component(name) {
            Ok(name) => name,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        match self.fs.mknod(parent, name, mode, rdev, Self::cred(req)) {
            Ok(attr) => reply.entry(&self.entry_ttl, &to_file_attr(&attr), 0),
            Err(err) => reply.error(errno_from_fs_error(&err)),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let name = match component(name) {
            Ok(name) => name,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        match self.fs.mkdir(parent, name, mode, Self::cred(req)) {
            Ok(attr) => reply.entry(&self.entry_ttl, &to_file_attr(&attr), 0),
            Err(err) => reply.error(errno_from_fs_error(&err)),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = match component(name) {
            Ok(name) => name,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        match self.fs.unlink(parent, name) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno_from_fs_error(&err)),
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = match component(name) {
            Ok(name) => name,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        match self.fs.rmdir(parent, name) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno_from_fs_error(&err)),
        }
    }

    fn symlink(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        link: &std::path::Path,
        reply: ReplyEntry,
    ) {
        let name = match component(name) {
            Ok(name) => name,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        let target = link.to_string_lossy();
        match self.fs.symlink(parent, name, &target, Self::cred(req)) {
            Ok(attr) => reply.entry(&self.entry_ttl, &to_file_attr(&attr), 0),
            Err(err) => reply.error(errno_from_fs_error(&err)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (name, newname) = match (component(name), component(newname)) {
            (Ok(name), Ok(newname)) => (name, newname),
            (Err(errno), _) | (_, Err(errno)) => {
                reply.error(errno);
                return;
            }
        };
        match self.fs.rename(parent, name, newparent, newname) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno_from_fs_error(&err)),
        }
    }

    fn link(
        &mut self,
        _req: &Request,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let newname = match component(newname) {
            Ok(newname) => newname,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        match self.fs.link(ino, newparent, newname) {
            Ok(attr) => reply.entry(&self.entry_ttl, &to_file_attr(&attr), 0),
            Err(err) => reply.error(errno_from_fs_error(&err)),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!(
            target: "ramfs::fuse",
            ino,
            raw_flags = format_args!("{flags:#x}"),
            "open"
        );
        match self.fs.open(ino) {
            Ok(()) => reply.opened(0, 0),
            Err(err) => reply.error(errno_from_fs_error(&err)),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if offset < 0 {
            reply.error(EINVAL);
            return;
        }
        match self.fs.read(ino, offset as u64, size) {
            Ok(data) => reply.data(&data),
            Err(err) => reply.error(errno_from_fs_error(&err)),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if offset < 0 {
            reply.error(EINVAL);
            return;
        }
        match self.fs.write(ino, offset as u64, data) {
            Ok(written) => reply.written(written),
            Err(err) => reply.error(errno_from_fs_error(&err)),
        }
    }

    fn flush(&mut self, _req: &Request, ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.fs.flush(ino) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno_from_fs_error(&err)),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.fs.release(ino) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno_from_fs_error(&err)),
        }
    }

    fn fsync(&mut self, _req: &Request, ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match self.fs.fsync(ino) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno_from_fs_error(&err)),
        }
    }

    fn opendir(&mut self, _req: &Request, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.fs.opendir(ino) {
            Ok(()) => reply.opened(0, 0),
            Err(err) => reply.error(errno_from_fs_error(&err)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let result = self.fs.readdir(ino, offset, |entry| {
            // `add` returns true when the reply buffer is full; the cursor
            // must not advance past an entry the kernel will never see.
            !reply.add(entry.ino, entry.offset, to_fuse_file_type(entry.kind), &entry.name)
        });
        match result {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno_from_fs_error(&err)),
        }
    }

    fn releasedir(&mut self, _req: &Request, ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        match self.fs.releasedir(ino) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno_from_fs_error(&err)),
        }
    }

    fn fsyncdir(&mut self, _req: &Request, ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match self.fs.fsyncdir(ino) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno_from_fs_error(&err)),
        }
    }

    fn statfs(&mut self, _req: &Request, ino: u64, reply: ReplyStatfs) {
        if let Err(err) = self.fs.getattr(ino) {
            reply.error(errno_from_fs_error(&err));
            return;
        }
        let stats = self.fs.statfs();
        reply.statfs(
            stats.blocks,
            stats.bfree,
            stats.bavail,
            stats.files,
            stats.ffree,
            stats.bsize,
            stats.namelen,
            stats.frsize,
        );
    }

    fn setxattr(
        &mut self,
        _req: &Request,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        position: u32,
        reply: ReplyEmpty,
    ) {
        let name = match name.to_str() {
            Some(name) => name,
            None => {
                reply.error(EINVAL);
                return;
            }
        };
        let mode = if flags & XATTR_CREATE != 0 {
            SetXattrMode::Create
        } else if flags & XATTR_REPLACE != 0 {
            SetXattrMode::Replace
        } else {
            SetXattrMode::Any
        };
        match self.fs.setxattr(ino, name, value, mode, position) {
            Ok(()) => reply.ok(),
            Err(FsError::AlreadyExists) => reply.error(libc::EEXIST),
            Err(FsError::NotFound) if mode == SetXattrMode::Replace => reply.error(ENODATA),
            Err(err) => reply.error(errno_from_fs_error(&err)),
        }
    }

    fn getxattr(&mut self, _req: &Request, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        let name = match name.to_str() {
            Some(name) => name,
            None => {
                reply.error(EINVAL);
                return;
            }
        };
        match self.fs.getxattr(ino, name) {
            Ok(value) => {
                if size == 0 {
                    reply.size(value.len() as u32);
                } else if value.len() <= size as usize {
                    reply.data(&value);
                } else {
                    reply.error(ERANGE);
                }
            }
            Err(err) => reply.error(xattr_errno(&err)),
        }
    }

    fn listxattr(&mut self, _req: &Request, ino: u64, size: u32, reply: ReplyXattr) {
        match self.fs.listxattr(ino) {
            Ok(names) => {
                let mut buffer = Vec::new();
                for name in &names {
                    buffer.extend_from_slice(name.as_bytes());
                    buffer.push(0); // NUL terminator
                }
                if size == 0 {
                    reply.size(buffer.len() as u32);
                } else if buffer.len() <= size as usize {
                    reply.data(&buffer);
                } else {
                    reply.error(ERANGE);
                }
            }
            Err(err) => reply.error(errno_from_fs_error(&err)),
        }
    }

    fn removexattr(&mut self, _req: &Request, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = match name.to_str() {
            Some(name) => name,
            None => {
                reply.error(EINVAL);
                return;
            }
        };
        match self.fs.removexattr(ino, name) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(xattr_errno(&err)),
        }
    }

    fn access(&mut self, req: &Request, ino: u64, mask: i32, reply: ReplyEmpty) {
        match self.fs.access(ino, mask as u32, Self::cred(req)) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno_from_fs_error(&err)),
        }
    }

    fn create(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let name = match component(name) {
            Ok(name) => name,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        match self.fs.create(parent, name, mode, Self::cred(req)) {
            Ok(attr) => reply.created(&self.entry_ttl, &to_file_attr(&attr), 0, 0, 0),
            Err(err) => reply.error(errno_from_fs_error(&err)),
        }
    }

    /// Advisory locking is out of scope; report "no conflicting lock".
    #[allow(clippy::too_many_arguments)]
    fn getlk(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        _lock_owner: u64,
        _start: u64,
        _end: u64,
        _typ: i32,
        _pid: u32,
        reply: ReplyLock,
    ) {
        if let Err(err) = self.fs.getattr(ino) {
            reply.error(errno_from_fs_error(&err));
            return;
        }
        reply.locked(0, 0, F_UNLCK, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ramfs_core::ROOT_INO;

    #[test]
    fn cache_ttls_follow_config() {
        let mut config = FsConfig::default();
        config.cache.attr_ttl_ms = 1500;
        config.cache.entry_ttl_ms = 2500;

        let fuse = RamFsFuse::new(config);
        assert_eq!(fuse.attr_ttl, Duration::from_millis(1500));
        assert_eq!(fuse.entry_ttl, Duration::from_millis(2500));
    }

    #[test]
    fn errno_mapping_is_total() {
        let cases = [
            (FsError::NotFound, libc::ENOENT),
            (FsError::AlreadyExists, libc::EEXIST),
            (FsError::AccessDenied, libc::EACCES),
            (FsError::OperationNotPermitted, libc::EPERM),
            (FsError::InvalidArgument, libc::EINVAL),
            (FsError::NotADirectory, libc::ENOTDIR),
            (FsError::IsADirectory, libc::EISDIR),
            (FsError::NotEmpty, libc::ENOTEMPTY),
            (FsError::OutOfMemory, libc::ENOMEM),
        ];
        for (err, errno) in cases {
            assert_eq!(errno_from_fs_error(&err), errno, "{err:?}");
        }
        assert_eq!(xattr_errno(&FsError::NotFound), libc::ENODATA);
        assert_eq!(xattr_errno(&FsError::OutOfMemory), libc::ENOMEM);
    }

    #[test]
    fn attr_conversion_carries_type_and_permissions() {
        let fuse = RamFsFuse::new(FsConfig::default());
        let attr = fuse.fs.getattr(ROOT_INO).expect("root getattr");
        let fuse_attr = to_file_attr(&attr);
        assert_eq!(fuse_attr.ino, ROOT_INO);
        assert_eq!(fuse_attr.kind, FileType::Directory);
        assert_eq!(fuse_attr.perm, 0o777);
        assert_eq!(fuse_attr.nlink, 3);
        assert_eq!(fuse_attr.blksize, BLOCK_SIZE as u32);
    }

    #[test]
    fn component_guards_length() {
        let long = "x".repeat(NAME_MAX + 1);
        assert_eq!(component(OsStr::new(&long)), Err(ENAMETOOLONG));
        assert_eq!(component(OsStr::new("ok")), Ok("ok"));
    }
}
