// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-memory inode records: attributes, variant content, extended
//! attributes, and per-directory readdir cursor state.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::SystemTime;

use crate::error::{FsError, FsResult};
use crate::types::{
    nblocks, Credentials, FileKind, Ino, SetXattrMode, INO_NOTFOUND, S_IFMT,
};

/// Synthetic byte size of an empty directory.
pub(crate) const DIR_BASE_SIZE: u64 = 48;

/// Synthetic byte cost of one directory entry.
pub(crate) fn dir_entry_size(name: &str) -> u64 {
    48 + name.len() as u64
}

/// Device-node flavors carried by `InodeKind::Special`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SpecialKind {
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
}

/// Byte storage backing a regular file. Grows on write; gaps zero-fill.
#[derive(Debug, Default)]
pub(crate) struct FileContent {
    pub(crate) data: RwLock<Vec<u8>>,
}

/// Immutable symlink target, captured at creation.
#[derive(Debug)]
pub(crate) struct SymlinkContent {
    pub(crate) target: String,
}

/// Resumption state for one readdir stream: the generation the directory
/// had when the cursor last advanced, and the last name handed out.
#[derive(Clone, Debug)]
pub(crate) struct DirCursor {
    pub(crate) id: u64,
    pub(crate) generation: u64,
    pub(crate) last: Option<String>,
}

/// Ordered name -> ino mapping plus the readdir cursor registry.
#[derive(Debug)]
pub(crate) struct DirContent {
    pub(crate) children: RwLock<BTreeMap<String, Ino>>,
    /// Bumped on every children mutation; stale cursors fall back to
    /// name-based resumption.
    generation: AtomicU64,
    cursors: Mutex<HashMap<u64, DirCursor>>,
    next_cursor: AtomicU64,
}

impl DirContent {
    pub(crate) fn new() -> Self {
        Self {
            children: RwLock::new(BTreeMap::new()),
            generation: AtomicU64::new(0),
            cursors: Mutex::new(HashMap::new()),
            next_cursor: AtomicU64::new(1),
        }
    }

    /// Child ino for `name`, or `INO_NOTFOUND`.
    pub(crate) fn child(&self, name: &str) -> Ino {
        self.children.read().unwrap().get(name).copied().unwrap_or(INO_NOTFOUND)
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn new_cursor(&self) -> DirCursor {
        DirCursor {
            id: self.next_cursor.fetch_add(1, Ordering::Relaxed),
            generation: self.generation(),
            last: None,
        }
    }

    pub(crate) fn take_cursor(&self, id: u64) -> Option<DirCursor> {
        self.cursors.lock().unwrap().remove(&id)
    }

    pub(crate) fn store_cursor(&self, cursor: DirCursor) {
        self.cursors.lock().unwrap().insert(cursor.id, cursor);
    }

    /// Drops every cursor of this directory; called from releasedir.
    pub(crate) fn clear_cursors(&self) {
        self.cursors.lock().unwrap().clear();
    }
}

/// Variant content of an inode. The tag doubles as the runtime type
/// discriminator for per-operation checks.
#[derive(Debug)]
pub(crate) enum InodeKind {
    /// Reserved slot-0 sentinel; never resolvable through a directory.
    NoBlock,
    File(FileContent),
    Directory(DirContent),
    Symlink(SymlinkContent),
    Special(SpecialKind),
}

/// The mutable attribute block shared by every inode variant.
#[derive(Clone, Copy, Debug)]
pub(crate) struct AttrState {
    pub(crate) mode: u32,
    pub(crate) uid: u32,
    pub(crate) gid: u32,
    pub(crate) nlink: u32,
    pub(crate) size: u64,
    pub(crate) blocks: u64,
    pub(crate) rdev: u32,
    pub(crate) atime: SystemTime,
    pub(crate) mtime: SystemTime,
    pub(crate) ctime: SystemTime,
    pub(crate) crtime: SystemTime,
}

#[derive(Debug)]
pub(crate) struct Inode {
    pub(crate) ino: Ino,
    pub(crate) kind: InodeKind,
    pub(crate) attr: RwLock<AttrState>,
    /// Kernel-side lookup count: entry replies increment, forget decrements.
    pub(crate) nlookup: AtomicU64,
    xattrs: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl Inode {
    pub(crate) fn new(
        ino: Ino,
        kind: InodeKind,
        mode: u32,
        nlink: u32,
        cred: Credentials,
        rdev: u32,
    ) -> Self {
        let type_bits = match &kind {
            InodeKind::NoBlock => 0,
            InodeKind::File(_) => FileKind::RegularFile.mode_bits(),
            InodeKind::Directory(_) => FileKind::Directory.mode_bits(),
            InodeKind::Symlink(_) => FileKind::Symlink.mode_bits(),
            InodeKind::Special(s) => match s {
                SpecialKind::CharDevice => FileKind::CharDevice.mode_bits(),
                SpecialKind::BlockDevice => FileKind::BlockDevice.mode_bits(),
                SpecialKind::Fifo => FileKind::Fifo.mode_bits(),
                SpecialKind::Socket => FileKind::Socket.mode_bits(),
            },
        };
        let size = match &kind {
            InodeKind::Directory(_) => DIR_BASE_SIZE,
            InodeKind::Symlink(link) => link.target.len() as u64,
            _ => 0,
        };
        let now = SystemTime::now();
        Self {
            ino,
            kind,
            attr: RwLock::new(AttrState {
                mode: type_bits | (mode & !S_IFMT),
                uid: cred.uid,
                gid: cred.gid,
                nlink,
                size,
                blocks: nblocks(size),
                rdev,
                atime: now,
                mtime: now,
                ctime: now,
                crtime: now,
            }),
            nlookup: AtomicU64::new(0),
            xattrs: RwLock::new(BTreeMap::new()),
        }
    }

    pub(crate) fn file_kind(&self) -> FileKind {
        match &self.kind {
            // The sentinel is never exposed through a reply.
            InodeKind::NoBlock | InodeKind::File(_) => FileKind::RegularFile,
            InodeKind::Directory(_) => FileKind::Directory,
            InodeKind::Symlink(_) => FileKind::Symlink,
            InodeKind::Special(SpecialKind::CharDevice) => FileKind::CharDevice,
            InodeKind::Special(SpecialKind::BlockDevice) => FileKind::BlockDevice,
            InodeKind::Special(SpecialKind::Fifo) => FileKind::Fifo,
            InodeKind::Special(SpecialKind::Socket) => FileKind::Socket,
        }
    }

    /// Attribute snapshot in the shape replied to the bridge.
    pub(crate) fn attr_snapshot(&self) -> crate::types::InodeAttr {
        let attr = self.attr.read().unwrap();
        crate::types::InodeAttr {
            ino: self.ino,
            kind: self.file_kind(),
            mode: attr.mode,
            uid: attr.uid,
            gid: attr.gid,
            nlink: attr.nlink,
            size: attr.size,
            blocks: attr.blocks,
            rdev: attr.rdev,
            atime: attr.atime,
            mtime: attr.mtime,
            ctime: attr.ctime,
            crtime: attr.crtime,
        }
    }

    pub(crate) fn directory(&self) -> Option<&DirContent> {
        match &self.kind {
            InodeKind::Directory(dir) => Some(dir),
            _ => None,
        }
    }

    pub(crate) fn is_dir(&self) -> bool {
        matches!(self.kind, InodeKind::Directory(_))
    }

    pub(crate) fn nlink(&self) -> u32 {
        self.attr.read().unwrap().nlink
    }

    /// Another directory entry now points here.
    pub(crate) fn add_hard_link(&self) {
        let mut attr = self.attr.write().unwrap();
        attr.nlink += 1;
        attr.ctime = SystemTime::now();
    }

    /// A directory entry pointing here went away.
    pub(crate) fn remove_hard_link(&self) {
        let mut attr = self.attr.write().unwrap();
        attr.nlink = attr.nlink.saturating_sub(1);
        attr.ctime = SystemTime::now();
    }

    /// Drops the link count to zero outright; used when a directory is
    /// removed (directories never have extra hard links).
    pub(crate) fn clear_links(&self) {
        let mut attr = self.attr.write().unwrap();
        attr.nlink = 0;
        attr.ctime = SystemTime::now();
    }

    pub(crate) fn touch_mtime(&self) {
        let mut attr = self.attr.write().unwrap();
        let now = SystemTime::now();
        attr.mtime = now;
        attr.ctime = now;
    }

    pub(crate) fn forget(&self, released: u64) {
        let _ = self.nlookup.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            Some(current.saturating_sub(released))
        });
    }

    // ── Extended attributes ─────────────────────────────────────────────

    pub(crate) fn set_xattr(
        &self,
        name: &str,
        value: &[u8],
        mode: SetXattrMode,
        position: u32,
    ) -> FsResult<()> {
        let mut xattrs = self.xattrs.write().unwrap();
        let exists = xattrs.contains_key(name);
        match mode {
            SetXattrMode::Create if exists => return Err(FsError::AlreadyExists),
            SetXattrMode::Replace if !exists => return Err(FsError::NotFound),
            _ => {}
        }
        let offset = position as usize;
        if offset == 0 {
            let mut buf = Vec::new();
            buf.try_reserve_exact(value.len()).map_err(|_| FsError::OutOfMemory)?;
            buf.extend_from_slice(value);
            xattrs.insert(name.to_string(), buf);
            return Ok(());
        }
        // Positioned write: splice into the existing value, zero-filling
        // any gap before the offset.
        let buf = xattrs.entry(name.to_string()).or_default();
        let end = offset + value.len();
        if end > buf.len() {
            let extra = end - buf.len();
            buf.try_reserve(extra).map_err(|_| FsError::OutOfMemory)?;
            buf.resize(end, 0);
        }
        buf[offset..end].copy_from_slice(value);
        Ok(())
    }

    pub(crate) fn get_xattr(&self, name: &str) -> FsResult<Vec<u8>> {
        self.xattrs.read().unwrap().get(name).cloned().ok_or(FsError::NotFound)
    }

    pub(crate) fn list_xattrs(&self) -> Vec<String> {
        self.xattrs.read().unwrap().keys().cloned().collect()
    }

    pub(crate) fn remove_xattr(&self, name: &str) -> FsResult<()> {
        self.xattrs.write().unwrap().remove(name).map(|_| ()).ok_or(FsError::NotFound)
    }
}
