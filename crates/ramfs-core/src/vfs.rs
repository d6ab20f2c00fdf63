// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The filesystem context: indexed inode slot table, deleted-slot queue,
//! block/inode accounting, and every namespace operation.
//!
//! Lock order, where multiple guards are held: directory children before
//! the slot table before file content before inode attributes. Attribute
//! locks and the accounting atomics are leaves. Operations that take the
//! children locks of two already-linked directories (rmdir, rename) first
//! serialize on `tree_lock`, so their nested acquisitions cannot form a
//! cycle.

use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use tracing::debug;

use crate::config::FsConfig;
use crate::error::{FsError, FsResult};
use crate::inode::{
    dir_entry_size, DirContent, FileContent, Inode, InodeKind, SpecialKind, SymlinkContent,
};
use crate::types::{
    nblocks, Credentials, DirEntry, Ino, InodeAttr, SetAttrRequest, SetXattrMode, StatvfsData,
    BLOCK_SIZE, FS_ID, INO_NOTFOUND, NAME_MAX, ROOT_INO, S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO,
    S_IFMT, S_IFREG, S_IFSOCK,
};

/// Cap on entries emitted per readdir reply, independent of the kernel's
/// byte budget.
const READDIR_MAX_ENTRIES: usize = 1024;

/// The in-memory filesystem.
///
/// Slot `0` holds the no-block sentinel, slot `1` the root directory.
/// Freed slots become `None` and queue up for reuse; indices never shift.
pub struct RamFs {
    config: FsConfig,
    slots: RwLock<Vec<Option<Arc<Inode>>>>,
    deleted: Mutex<VecDeque<Ino>>,
    /// Serializes operations that span more than one existing directory.
    tree_lock: Mutex<()>,
    used_blocks: AtomicU64,
    used_inodes: AtomicU64,
}

impl RamFs {
    /// Builds the filesystem with the sentinel and an empty root directory
    /// owned by `config.security.default_{uid,gid}`.
    pub fn new(config: FsConfig) -> Self {
        let cred = Credentials {
            uid: config.security.default_uid,
            gid: config.security.default_gid,
        };
        let fs = Self {
            config,
            slots: RwLock::new(Vec::new()),
            deleted: Mutex::new(VecDeque::new()),
            tree_lock: Mutex::new(()),
            used_blocks: AtomicU64::new(0),
            used_inodes: AtomicU64::new(0),
        };

        // Slot 0: the reserved sentinel. Not counted as a usable inode.
        fs.slots
            .write()
            .unwrap()
            .push(Some(Arc::new(Inode::new(0, InodeKind::NoBlock, 0, 0, cred, 0))));

        // Slot 1: the root directory. nlink 3 covers ".", the self entry
        // in "..", and the external mount reference.
        let (root_ino, root) =
            fs.register(InodeKind::Directory(DirContent::new()), S_IFDIR | 0o777, 3, cred, 0);
        debug_assert_eq!(root_ino, ROOT_INO);
        {
            let dirc = root.directory().expect("root is a directory");
            let mut children = dirc.children.write().unwrap();
            children.insert(".".to_string(), root_ino);
            children.insert("..".to_string(), root_ino);
        }
        fs.apply_size_delta(&root, (dir_entry_size(".") + dir_entry_size("..")) as i64);
        fs
    }

    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    // ── Inode store ─────────────────────────────────────────────────────

    /// Places a new inode in the table, preferring a reclaimed slot over
    /// appending, and charges the accounting counters.
    fn register(
        &self,
        kind: InodeKind,
        mode: u32,
        nlink: u32,
        cred: Credentials,
        rdev: u32,
    ) -> (Ino, Arc<Inode>) {
        let mut slots = self.slots.write().unwrap();
        let reclaimed = self.deleted.lock().unwrap().pop_front();
        let ino = reclaimed.unwrap_or(slots.len() as Ino);
        let inode = Arc::new(Inode::new(ino, kind, mode, nlink, cred, rdev));
        match reclaimed {
            Some(_) => slots[ino as usize] = Some(Arc::clone(&inode)),
            None => slots.push(Some(Arc::clone(&inode))),
        }
        drop(slots);
        self.used_inodes.fetch_add(1, Ordering::AcqRel);
        self.used_blocks.fetch_add(inode.attr_snapshot().blocks, Ordering::AcqRel);
        debug!(target: "ramfs::core", ino, reused = reclaimed.is_some(), "inode registered");
        (ino, inode)
    }

    /// Tombstones a slot once both lifetime axes have reached zero. The
    /// check is repeated under the table write lock, so concurrent callers
    /// collapse to a single free.
    fn free(&self, ino: Ino) {
        if ino <= ROOT_INO {
            return;
        }
        let blocks = {
            let mut slots = self.slots.write().unwrap();
            let Some(slot) = slots.get_mut(ino as usize) else { return };
            let Some(inode) = slot.as_ref() else { return };
            if inode.nlookup.load(Ordering::Acquire) != 0 || inode.nlink() != 0 {
                return;
            }
            let blocks = inode.attr.read().unwrap().blocks;
            *slot = None;
            blocks
        };
        self.used_blocks.fetch_sub(blocks, Ordering::AcqRel);
        self.used_inodes.fetch_sub(1, Ordering::AcqRel);
        self.deleted.lock().unwrap().push_back(ino);
        debug!(target: "ramfs::core", ino, "inode slot reclaimed");
    }

    fn maybe_free(&self, inode: &Inode) {
        if inode.nlookup.load(Ordering::Acquire) == 0 && inode.nlink() == 0 {
            self.free(inode.ino);
        }
    }

    /// Resolves a slot, rejecting out-of-range and tombstoned indices.
    /// Inodes with `nlink == 0` still resolve: the kernel may hold open
    /// handles to unlinked files.
    fn inode(&self, ino: Ino) -> FsResult<Arc<Inode>> {
        let slots = self.slots.read().unwrap();
        slots.get(ino as usize).and_then(|slot| slot.clone()).ok_or(FsError::NotFound)
    }

    /// Resolves a slot for name-space use: unlinked inodes read as absent.
    fn live(&self, ino: Ino) -> FsResult<Arc<Inode>> {
        let inode = self.inode(ino)?;
        if inode.nlink() == 0 {
            return Err(FsError::NotFound);
        }
        Ok(inode)
    }

    fn dir(&self, ino: Ino) -> FsResult<Arc<Inode>> {
        let inode = self.live(ino)?;
        if !inode.is_dir() {
            return Err(FsError::NotADirectory);
        }
        Ok(inode)
    }

    /// Entry replies hand a reference to the kernel; count it.
    fn entry_reply(&self, inode: &Inode) -> InodeAttr {
        inode.nlookup.fetch_add(1, Ordering::AcqRel);
        inode.attr_snapshot()
    }

    // ── Accounting ──────────────────────────────────────────────────────

    fn adjust_used_blocks(&self, old_blocks: u64, new_blocks: u64) {
        if new_blocks >= old_blocks {
            self.used_blocks.fetch_add(new_blocks - old_blocks, Ordering::AcqRel);
        } else {
            self.used_blocks.fetch_sub(old_blocks - new_blocks, Ordering::AcqRel);
        }
    }

    /// Shifts an inode's synthetic size (directories, xattr-free metadata)
    /// and keeps `blocks` plus the global counter in step.
    fn apply_size_delta(&self, inode: &Inode, delta: i64) {
        let mut attr = inode.attr.write().unwrap();
        let old_blocks = attr.blocks;
        attr.size = if delta >= 0 {
            attr.size.saturating_add(delta as u64)
        } else {
            attr.size.saturating_sub(delta.unsigned_abs())
        };
        attr.blocks = nblocks(attr.size);
        let new_blocks = attr.blocks;
        drop(attr);
        self.adjust_used_blocks(old_blocks, new_blocks);
    }

    /// Records a regular file's new content length. Callers may still hold
    /// the content lock; attributes order after content.
    fn update_file_size(&self, inode: &Inode, new_size: u64, touch_times: bool) {
        let mut attr = inode.attr.write().unwrap();
        let old_blocks = attr.blocks;
        attr.size = new_size;
        attr.blocks = nblocks(new_size);
        if touch_times {
            let now = SystemTime::now();
            attr.mtime = now;
            attr.ctime = now;
        }
        let new_blocks = attr.blocks;
        drop(attr);
        self.adjust_used_blocks(old_blocks, new_blocks);
    }

    // ── Namespace operations ────────────────────────────────────────────

    pub fn lookup(&self, parent: Ino, name: &str) -> FsResult<InodeAttr> {
        let parent_dir = self.dir(parent)?;
        let child_ino = parent_dir.directory().expect("checked directory").child(name);
        if child_ino == INO_NOTFOUND {
            return Err(FsError::NotFound);
        }
        let child = self.live(child_ino)?;
        Ok(self.entry_reply(&child))
    }

    /// Releases `nlookup` kernel references; frees the slot when the inode
    /// is also unlinked. No reply is associated with this operation.
    pub fn forget(&self, ino: Ino, nlookup: u64) {
        if ino <= ROOT_INO {
            return;
        }
        let Ok(inode) = self.inode(ino) else { return };
        inode.forget(nlookup);
        self.maybe_free(&inode);
    }

    pub fn getattr(&self, ino: Ino) -> FsResult<InodeAttr> {
        Ok(self.inode(ino)?.attr_snapshot())
    }

    pub fn setattr(&self, ino: Ino, req: SetAttrRequest) -> FsResult<InodeAttr> {
        let inode = self.inode(ino)?;
        if let Some(size) = req.size {
            match &inode.kind {
                InodeKind::File(file) => {
                    let mut data = file.data.write().unwrap();
                    let current = data.len() as u64;
                    if size > current {
                        data.try_reserve((size - current) as usize)
                            .map_err(|_| FsError::OutOfMemory)?;
                    }
                    data.resize(size as usize, 0);
                    self.update_file_size(&inode, size, true);
                }
                InodeKind::Directory(_) => return Err(FsError::IsADirectory),
                _ => return Err(FsError::InvalidArgument),
            }
        }
        let mut attr = inode.attr.write().unwrap();
        if let Some(mode) = req.mode {
            attr.mode = (attr.mode & S_IFMT) | (mode & !S_IFMT);
        }
        if let Some(uid) = req.uid {
            attr.uid = uid;
        }
        if let Some(gid) = req.gid {
            attr.gid = gid;
        }
        if let Some(atime) = req.atime {
            attr.atime = atime;
        }
        if let Some(mtime) = req.mtime {
            attr.mtime = mtime;
        }
        attr.ctime = SystemTime::now();
        drop(attr);
        Ok(inode.attr_snapshot())
    }

    pub fn readlink(&self, ino: Ino) -> FsResult<String> {
        let inode = self.inode(ino)?;
        match &inode.kind {
            InodeKind::Symlink(link) => Ok(link.target.clone()),
            _ => Err(FsError::InvalidArgument),
        }
    }

    pub fn mknod(
        &self,
        parent: Ino,
        name: &str,
        mode: u32,
        rdev: u32,
        cred: Credentials,
    ) -> FsResult<InodeAttr> {
        let kind = match mode & S_IFMT {
            S_IFREG => InodeKind::File(FileContent::default()),
            S_IFCHR => InodeKind::Special(SpecialKind::CharDevice),
            S_IFBLK => InodeKind::Special(SpecialKind::BlockDevice),
            S_IFIFO => InodeKind::Special(SpecialKind::Fifo),
            S_IFSOCK => InodeKind::Special(SpecialKind::Socket),
            _ => return Err(FsError::InvalidArgument),
        };
        self.create_node(parent, name, kind, mode, rdev, cred)
    }

    pub fn mkdir(
        &self,
        parent: Ino,
        name: &str,
        mode: u32,
        cred: Credentials,
    ) -> FsResult<InodeAttr> {
        self.create_node(
            parent,
            name,
            InodeKind::Directory(DirContent::new()),
            mode | S_IFDIR,
            0,
            cred,
        )
    }

    /// Creates and "opens" a regular file. The open handle itself is
    /// stateless; the entry reply carries the attributes.
    pub fn create(
        &self,
        parent: Ino,
        name: &str,
        mode: u32,
        cred: Credentials,
    ) -> FsResult<InodeAttr> {
        self.create_node(parent, name, InodeKind::File(FileContent::default()), mode, 0, cred)
    }

    pub fn symlink(
        &self,
        parent: Ino,
        name: &str,
        target: &str,
        cred: Credentials,
    ) -> FsResult<InodeAttr> {
        self.create_node(
            parent,
            name,
            InodeKind::Symlink(SymlinkContent { target: target.to_string() }),
            0o777,
            0,
            cred,
        )
    }

    /// Shared creation path: allocates the inode, seeds `.`/`..` for
    /// directories, links the name into the parent, and issues the entry.
    /// All-or-nothing: the name check and every mutation happen under the
    /// parent's children write guard.
    fn create_node(
        &self,
        parent: Ino,
        name: &str,
        kind: InodeKind,
        mode: u32,
        rdev: u32,
        cred: Credentials,
    ) -> FsResult<InodeAttr> {
        if name.is_empty() || name.len() > NAME_MAX {
            return Err(FsError::InvalidArgument);
        }
        let parent_dir = self.dir(parent)?;
        let dirc = parent_dir.directory().expect("checked directory");
        let mut children = dirc.children.write().unwrap();
        if children.contains_key(name) {
            return Err(FsError::AlreadyExists);
        }
        let is_dir = matches!(kind, InodeKind::Directory(_));
        let nlink = if is_dir { 2 } else { 1 };
        let (ino, inode) = self.register(kind, mode, nlink, cred, rdev);
        if is_dir {
            let child_dirc = inode.directory().expect("just created directory");
            let mut grandchildren = child_dirc.children.write().unwrap();
            grandchildren.insert(".".to_string(), ino);
            grandchildren.insert("..".to_string(), parent);
            drop(grandchildren);
            self.apply_size_delta(&inode, (dir_entry_size(".") + dir_entry_size("..")) as i64);
            // The new directory's ".." is one more reference to the parent.
            parent_dir.add_hard_link();
        }
        children.insert(name.to_string(), ino);
        dirc.bump_generation();
        drop(children);
        self.apply_size_delta(&parent_dir, dir_entry_size(name) as i64);
        parent_dir.touch_mtime();
        Ok(self.entry_reply(&inode))
    }

    pub fn unlink(&self, parent: Ino, name: &str) -> FsResult<()> {
        let parent_dir = self.dir(parent)?;
        let dirc = parent_dir.directory().expect("checked directory");
        let mut children = dirc.children.write().unwrap();
        let child_ino = named_child(&children, name)?;
        let child = self.inode(child_ino)?;
        if child.is_dir() {
            return Err(FsError::IsADirectory);
        }
        children.remove(name);
        dirc.bump_generation();
        drop(children);
        self.apply_size_delta(&parent_dir, -(dir_entry_size(name) as i64));
        parent_dir.touch_mtime();
        child.remove_hard_link();
        // Freed now only if the kernel forgot it already.
        self.maybe_free(&child);
        Ok(())
    }

    pub fn rmdir(&self, parent: Ino, name: &str) -> FsResult<()> {
        let _tree = self.tree_lock.lock().unwrap();
        let parent_dir = self.dir(parent)?;
        let dirc = parent_dir.directory().expect("checked directory");
        let mut children = dirc.children.write().unwrap();
        let child_ino = named_child(&children, name)?;
        // "." resolves to the parent itself.
        if child_ino == parent {
            return Err(FsError::InvalidArgument);
        }
        let child = self.live(child_ino)?;
        let Some(child_dirc) = child.directory() else {
            return Err(FsError::NotADirectory);
        };
        // "." and ".." are always present; anything more means non-empty.
        // This also protects "..": the grandparent still holds this parent.
        if child_dirc.children.read().unwrap().len() > 2 {
            return Err(FsError::NotEmpty);
        }
        children.remove(name);
        dirc.bump_generation();
        drop(children);
        self.apply_size_delta(&parent_dir, -(dir_entry_size(name) as i64));
        parent_dir.remove_hard_link();
        parent_dir.touch_mtime();
        child.clear_links();
        self.maybe_free(&child);
        Ok(())
    }

    pub fn rename(
        &self,
        parent: Ino,
        name: &str,
        newparent: Ino,
        newname: &str,
    ) -> FsResult<()> {
        if newname.is_empty() || newname.len() > NAME_MAX {
            return Err(FsError::InvalidArgument);
        }
        let _tree = self.tree_lock.lock().unwrap();
        let src_parent = self.dir(parent)?;
        let dst_parent = self.dir(newparent)?;
        if parent == newparent {
            self.rename_within(&src_parent, name, newname)
        } else {
            self.rename_across(&src_parent, &dst_parent, name, newname)
        }
    }

    fn rename_within(&self, dir: &Arc<Inode>, name: &str, newname: &str) -> FsResult<()> {
        let dirc = dir.directory().expect("checked directory");
        let mut children = dirc.children.write().unwrap();
        let src_ino = named_child(&children, name)?;
        if name == newname {
            return Ok(());
        }
        let src = self.inode(src_ino)?;
        let mut displaced = None;
        if let Some(&existing_ino) = children.get(newname) {
            if existing_ino == src_ino {
                // Both names are hard links to the same inode; POSIX says
                // do nothing.
                return Ok(());
            }
            let existing = self.inode(existing_ino)?;
            check_replaceable(&src, &existing)?;
            displaced = Some(existing);
        }
        children.insert(newname.to_string(), src_ino);
        children.remove(name);
        dirc.bump_generation();
        drop(children);
        let delta = if displaced.is_some() {
            -(dir_entry_size(name) as i64)
        } else {
            dir_entry_size(newname) as i64 - dir_entry_size(name) as i64
        };
        self.apply_size_delta(dir, delta);
        if let Some(existing) = displaced {
            self.drop_displaced(dir, &existing);
        }
        dir.touch_mtime();
        Ok(())
    }

    fn rename_across(
        &self,
        src_parent: &Arc<Inode>,
        dst_parent: &Arc<Inode>,
        name: &str,
        newname: &str,
    ) -> FsResult<()> {
        let src_dirc = src_parent.directory().expect("checked directory");
        let dst_dirc = dst_parent.directory().expect("checked directory");
        // Both children maps stay locked across the whole move; ino order
        // keeps concurrent two-directory operations from deadlocking.
        let (mut src_children, mut dst_children) = if src_parent.ino < dst_parent.ino {
            let src = src_dirc.children.write().unwrap();
            let dst = dst_dirc.children.write().unwrap();
            (src, dst)
        } else {
            let dst = dst_dirc.children.write().unwrap();
            let src = src_dirc.children.write().unwrap();
            (src, dst)
        };
        let src_ino = named_child(&src_children, name)?;
        let src = self.inode(src_ino)?;
        let mut displaced = None;
        if let Some(&existing_ino) = dst_children.get(newname) {
            if existing_ino == src_ino {
                return Ok(());
            }
            let existing = self.inode(existing_ino)?;
            check_replaceable(&src, &existing)?;
            displaced = Some(existing);
        }
        dst_children.insert(newname.to_string(), src_ino);
        src_children.remove(name);
        if let Some(moved_dirc) = src.directory() {
            // The moved directory's ".." follows it to the new parent.
            moved_dirc.children.write().unwrap().insert("..".to_string(), dst_parent.ino);
            moved_dirc.bump_generation();
            src_parent.remove_hard_link();
            dst_parent.add_hard_link();
        }
        src_dirc.bump_generation();
        dst_dirc.bump_generation();
        drop(src_children);
        drop(dst_children);
        self.apply_size_delta(src_parent, -(dir_entry_size(name) as i64));
        if displaced.is_none() {
            self.apply_size_delta(dst_parent, dir_entry_size(newname) as i64);
        }
        if let Some(existing) = displaced {
            self.drop_displaced(dst_parent, &existing);
        }
        src_parent.touch_mtime();
        dst_parent.touch_mtime();
        Ok(())
    }

    /// Unlink bookkeeping for an entry overwritten by rename.
    fn drop_displaced(&self, parent_dir: &Inode, existing: &Arc<Inode>) {
        if existing.is_dir() {
            existing.clear_links();
            // Its ".." no longer references the parent.
            parent_dir.remove_hard_link();
        } else {
            existing.remove_hard_link();
        }
        self.maybe_free(existing);
    }

    pub fn link(&self, ino: Ino, newparent: Ino, newname: &str) -> FsResult<InodeAttr> {
        if newname.is_empty() || newname.len() > NAME_MAX {
            return Err(FsError::InvalidArgument);
        }
        let target = self.live(ino)?;
        if target.is_dir() {
            return Err(FsError::OperationNotPermitted);
        }
        let parent_dir = self.dir(newparent)?;
        let dirc = parent_dir.directory().expect("checked directory");
        let mut children = dirc.children.write().unwrap();
        if children.contains_key(newname) {
            return Err(FsError::AlreadyExists);
        }
        children.insert(newname.to_string(), ino);
        dirc.bump_generation();
        drop(children);
        self.apply_size_delta(&parent_dir, dir_entry_size(newname) as i64);
        parent_dir.touch_mtime();
        target.add_hard_link();
        Ok(self.entry_reply(&target))
    }

    // ── File I/O ────────────────────────────────────────────────────────

    pub fn read(&self, ino: Ino, offset: u64, size: u32) -> FsResult<Vec<u8>> {
        let inode = self.inode(ino)?;
        let file = file_content(&inode)?;
        let data = file.data.read().unwrap();
        let len = data.len() as u64;
        if offset >= len {
            return Ok(Vec::new());
        }
        let end = len.min(offset.saturating_add(size as u64));
        Ok(data[offset as usize..end as usize].to_vec())
    }

    pub fn write(&self, ino: Ino, offset: u64, buf: &[u8]) -> FsResult<u32> {
        let inode = self.inode(ino)?;
        let file = file_content(&inode)?;
        let end = offset
            .checked_add(buf.len() as u64)
            .filter(|&end| end <= isize::MAX as u64)
            .ok_or(FsError::InvalidArgument)? as usize;
        let mut data = file.data.write().unwrap();
        if end > data.len() {
            let extra = end - data.len();
            data.try_reserve(extra).map_err(|_| FsError::OutOfMemory)?;
            data.resize(end, 0);
        }
        data[offset as usize..end].copy_from_slice(buf);
        let new_size = data.len() as u64;
        self.update_file_size(&inode, new_size, true);
        drop(data);
        Ok(buf.len() as u32)
    }

    // ── Handle lifecycle (stateless; checks only) ───────────────────────

    pub fn open(&self, ino: Ino) -> FsResult<()> {
        let inode = self.inode(ino)?;
        match &inode.kind {
            InodeKind::Directory(_) => Err(FsError::IsADirectory),
            InodeKind::NoBlock => Err(FsError::InvalidArgument),
            _ => Ok(()),
        }
    }

    pub fn release(&self, ino: Ino) -> FsResult<()> {
        let inode = self.inode(ino)?;
        if inode.is_dir() {
            return Err(FsError::IsADirectory);
        }
        Ok(())
    }

    pub fn opendir(&self, ino: Ino) -> FsResult<()> {
        self.dir(ino).map(|_| ())
    }

    /// Closes a directory stream and prunes its readdir cursor registry.
    pub fn releasedir(&self, ino: Ino) -> FsResult<()> {
        let inode = self.inode(ino)?;
        match inode.directory() {
            Some(dirc) => {
                dirc.clear_cursors();
                Ok(())
            }
            None => Err(FsError::NotADirectory),
        }
    }

    pub fn flush(&self, ino: Ino) -> FsResult<()> {
        self.inode(ino).map(|_| ())
    }

    pub fn fsync(&self, ino: Ino) -> FsResult<()> {
        self.inode(ino).map(|_| ())
    }

    pub fn fsyncdir(&self, ino: Ino) -> FsResult<()> {
        let inode = self.inode(ino)?;
        if !inode.is_dir() {
            return Err(FsError::NotADirectory);
        }
        Ok(())
    }

    // ── Readdir ─────────────────────────────────────────────────────────

    /// Streams directory entries to `fill`. `offset == 0` starts a new
    /// iteration; otherwise `offset` names a cursor from a prior call.
    ///
    /// `fill` returns whether the entry was accepted; the cursor advances
    /// only past accepted entries, so a rejected entry is re-emitted on the
    /// next call. Entries whose slot has been freed are skipped. An
    /// exhausted (or unknown) cursor produces no entries, which the
    /// adapter turns into the empty end-of-stream reply.
    pub fn readdir<F>(&self, ino: Ino, offset: i64, mut fill: F) -> FsResult<()>
    where
        F: FnMut(&DirEntry) -> bool,
    {
        let inode = self.inode(ino)?;
        let Some(dirc) = inode.directory() else {
            return Err(FsError::NotADirectory);
        };
        let mut cursor = if offset == 0 {
            dirc.new_cursor()
        } else {
            match dirc.take_cursor(offset as u64) {
                Some(cursor) => cursor,
                None => return Ok(()),
            }
        };
        if cursor.generation != dirc.generation() && cursor.last.is_some() {
            debug!(
                target: "ramfs::core",
                ino,
                cursor = cursor.id,
                "directory changed during pagination; resuming at nearest successor"
            );
        }
        let resume_after = cursor.last.clone();
        let children = dirc.children.read().unwrap();
        let range: Box<dyn Iterator<Item = (&String, &Ino)>> = match resume_after.as_deref() {
            None => Box::new(children.iter()),
            Some(last) => Box::new(children.range::<str, _>((Excluded(last), Unbounded))),
        };
        let mut emitted = 0usize;
        let mut exhausted = true;
        for (name, &child_ino) in range {
            if emitted >= READDIR_MAX_ENTRIES {
                exhausted = false;
                break;
            }
            if child_ino == INO_NOTFOUND {
                continue;
            }
            // Never emit a name whose inode has been freed mid-stream.
            let Ok(child) = self.inode(child_ino) else { continue };
            let entry = DirEntry {
                ino: child_ino,
                offset: cursor.id as i64,
                kind: child.file_kind(),
                name: name.clone(),
            };
            if !fill(&entry) {
                exhausted = false;
                break;
            }
            cursor.last = Some(name.clone());
            emitted += 1;
        }
        drop(children);
        if !exhausted {
            cursor.generation = dirc.generation();
            dirc.store_cursor(cursor);
        }
        Ok(())
    }

    // ── Extended attributes ─────────────────────────────────────────────

    pub fn setxattr(
        &self,
        ino: Ino,
        name: &str,
        value: &[u8],
        mode: SetXattrMode,
        position: u32,
    ) -> FsResult<()> {
        self.inode(ino)?.set_xattr(name, value, mode, position)
    }

    pub fn getxattr(&self, ino: Ino, name: &str) -> FsResult<Vec<u8>> {
        self.inode(ino)?.get_xattr(name)
    }

    pub fn listxattr(&self, ino: Ino) -> FsResult<Vec<String>> {
        Ok(self.inode(ino)?.list_xattrs())
    }

    pub fn removexattr(&self, ino: Ino, name: &str) -> FsResult<()> {
        self.inode(ino)?.remove_xattr(name)
    }

    // ── Attributes and statistics ───────────────────────────────────────

    /// Permissive other -> group -> owner mode-bit walk. `mask == 0`
    /// (`F_OK`) only asks whether the inode exists.
    pub fn access(&self, ino: Ino, mask: u32, cred: Credentials) -> FsResult<()> {
        let inode = self.inode(ino)?;
        if mask == 0 {
            return Ok(());
        }
        let attr = inode.attr.read().unwrap();
        let mut bits = mask & 0o7;
        if attr.mode & bits == bits {
            return Ok(());
        }
        bits <<= 3;
        if attr.mode & bits == bits && cred.gid == attr.gid {
            return Ok(());
        }
        bits <<= 3;
        if cred.uid == attr.uid && attr.mode & bits == bits {
            return Ok(());
        }
        Err(FsError::AccessDenied)
    }

    pub fn statfs(&self) -> StatvfsData {
        let used_blocks = self.used_blocks.load(Ordering::Acquire);
        let used_inodes = self.used_inodes.load(Ordering::Acquire);
        let total_blocks = self.config.limits.total_blocks;
        let total_inodes = self.config.limits.total_inodes;
        let free_blocks = total_blocks.saturating_sub(used_blocks);
        let free_inodes = total_inodes.saturating_sub(used_inodes);
        StatvfsData {
            blocks: total_blocks,
            bfree: free_blocks,
            bavail: free_blocks,
            files: total_inodes,
            ffree: free_inodes,
            bsize: BLOCK_SIZE as u32,
            namelen: NAME_MAX as u32,
            frsize: BLOCK_SIZE as u32,
            fsid: FS_ID,
        }
    }
}

/// Looks up `name` in a held children map, treating tombstoned entries as
/// absent.
fn named_child(children: &BTreeMap<String, Ino>, name: &str) -> FsResult<Ino> {
    children
        .get(name)
        .copied()
        .filter(|&ino| ino != INO_NOTFOUND)
        .ok_or(FsError::NotFound)
}

fn file_content(inode: &Inode) -> FsResult<&FileContent> {
    match &inode.kind {
        InodeKind::File(file) => Ok(file),
        InodeKind::Directory(_) => Err(FsError::IsADirectory),
        _ => Err(FsError::InvalidArgument),
    }
}

/// Whether rename may replace `existing` with `src` (POSIX overwrite
/// rules).
fn check_replaceable(src: &Inode, existing: &Inode) -> FsResult<()> {
    match (src.is_dir(), existing.is_dir()) {
        (true, false) => return Err(FsError::NotADirectory),
        (false, true) => return Err(FsError::IsADirectory),
        _ => {}
    }
    if let Some(dirc) = existing.directory() {
        if dirc.children.read().unwrap().len() > 2 {
            return Err(FsError::NotEmpty);
        }
    }
    Ok(())
}


#[cfg(test)]
mod proptests {
    use super::tests::{check_invariants, cred, test_fs};
    use super::*;
    use proptest::prelude::*;

    #[derive(Clone, Debug)]
    enum Op {
        Mkdir(u8, u8),
        Create(u8, u8),
        Symlink(u8, u8),
        Unlink(u8, u8),
        Rmdir(u8, u8),
        Link(u8, u8, u8),
        Rename(u8, u8, u8, u8),
        Write(u8, u16),
        Truncate(u8, u16),
        Forget(u8),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (any::<u8>(), any::<u8>()).prop_map(|(p, n)| Op::Mkdir(p, n)),
            (any::<u8>(), any::<u8>()).prop_map(|(p, n)| Op::Create(p, n)),
            (any::<u8>(), any::<u8>()).prop_map(|(p, n)| Op::Symlink(p, n)),
            (any::<u8>(), any::<u8>()).prop_map(|(p, n)| Op::Unlink(p, n)),
            (any::<u8>(), any::<u8>()).prop_map(|(p, n)| Op::Rmdir(p, n)),
            (any::<u8>(), any::<u8>(), any::<u8>()).prop_map(|(f, p, n)| Op::Link(f, p, n)),
            (any::<u8>(), any::<u8>(), any::<u8>(), any::<u8>())
                .prop_map(|(p, n, q, m)| Op::Rename(p, n, q, m)),
            (any::<u8>(), any::<u16>()).prop_map(|(f, len)| Op::Write(f, len)),
            (any::<u8>(), any::<u16>()).prop_map(|(f, size)| Op::Truncate(f, size)),
            any::<u8>().prop_map(Op::Forget),
        ]
    }

    const NAMES: [&str; 5] = ["alpha", "beta", "gamma", "delta", "omega"];

    /// Drives a random operation sequence against a fresh filesystem,
    /// re-checking the structural invariants after every step. Individual
    /// operations are free to fail; the table must stay consistent.
    fn run_ops(ops: &[Op]) {
        let fs = test_fs();
        let mut dirs: Vec<Ino> = vec![ROOT_INO];
        let mut nodes: Vec<Ino> = Vec::new();
        for op in ops {
            match *op {
                Op::Mkdir(p, n) => {
                    let parent = dirs[p as usize % dirs.len()];
                    if let Ok(attr) = fs.mkdir(parent, NAMES[n as usize % NAMES.len()], 0o755, cred())
                    {
                        dirs.push(attr.ino);
                    }
                }
                Op::Create(p, n) => {
                    let parent = dirs[p as usize % dirs.len()];
                    if let Ok(attr) =
                        fs.create(parent, NAMES[n as usize % NAMES.len()], 0o644, cred())
                    {
                        nodes.push(attr.ino);
                    }
                }
                Op::Symlink(p, n) => {
                    let parent = dirs[p as usize % dirs.len()];
                    if let Ok(attr) =
                        fs.symlink(parent, NAMES[n as usize % NAMES.len()], "/target", cred())
                    {
                        nodes.push(attr.ino);
                    }
                }
                Op::Unlink(p, n) => {
                    let parent = dirs[p as usize % dirs.len()];
                    let _ = fs.unlink(parent, NAMES[n as usize % NAMES.len()]);
                }
                Op::Rmdir(p, n) => {
                    let parent = dirs[p as usize % dirs.len()];
                    let _ = fs.rmdir(parent, NAMES[n as usize % NAMES.len()]);
                }
                Op::Link(f, p, n) => {
                    if nodes.is_empty() {
                        continue;
                    }
                    let target = nodes[f as usize % nodes.len()];
                    let parent = dirs[p as usize % dirs.len()];
                    let _ = fs.link(target, parent, NAMES[n as usize % NAMES.len()]);
                }
                Op::Rename(p, n, q, m) => {
                    let src = dirs[p as usize % dirs.len()];
                    let dst = dirs[q as usize % dirs.len()];
                    let _ = fs.rename(
                        src,
                        NAMES[n as usize % NAMES.len()],
                        dst,
                        NAMES[m as usize % NAMES.len()],
                    );
                }
                Op::Write(f, len) => {
                    if nodes.is_empty() {
                        continue;
                    }
                    let target = nodes[f as usize % nodes.len()];
                    let _ = fs.write(target, 0, &vec![0x5a; len as usize % 4096]);
                }
                Op::Truncate(f, size) => {
                    if nodes.is_empty() {
                        continue;
                    }
                    let target = nodes[f as usize % nodes.len()];
                    let _ = fs.setattr(
                        target,
                        SetAttrRequest { size: Some(u64::from(size % 8192)), ..Default::default() },
                    );
                }
                Op::Forget(f) => {
                    if nodes.is_empty() {
                        continue;
                    }
                    let idx = f as usize % nodes.len();
                    fs.forget(nodes[idx], 1);
                    nodes.swap_remove(idx);
                }
            }
            check_invariants(&fs);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn random_sequences_preserve_invariants(
            ops in proptest::collection::vec(op_strategy(), 1..60)
        ) {
            run_ops(&ops);
        }

        #[test]
        fn write_then_read_yields_written_bytes(
            offset in 0u64..8192,
            data in proptest::collection::vec(any::<u8>(), 1..512)
        ) {
            let fs = test_fs();
            let file = fs.create(ROOT_INO, "f", 0o644, cred()).unwrap();
            prop_assert_eq!(fs.write(file.ino, offset, &data).unwrap(), data.len() as u32);
            prop_assert_eq!(fs.read(file.ino, offset, data.len() as u32).unwrap(), data.clone());
            prop_assert_eq!(
                fs.getattr(file.ino).unwrap().size,
                offset + data.len() as u64
            );
        }

        #[test]
        fn xattr_set_get_remove_laws(
            name in "user\\.[a-z]{1,12}",
            value in proptest::collection::vec(any::<u8>(), 0..256)
        ) {
            let fs = test_fs();
            let file = fs.create(ROOT_INO, "f", 0o644, cred()).unwrap();
            fs.setxattr(file.ino, &name, &value, SetXattrMode::Any, 0).unwrap();
            prop_assert_eq!(fs.getxattr(file.ino, &name).unwrap(), value);
            fs.removexattr(file.ino, &name).unwrap();
            prop_assert_eq!(fs.getxattr(file.ino, &name), Err(FsError::NotFound));
        }

        #[test]
        fn readdir_emits_current_children_exactly_once(
            count in 1usize..40,
            batch in 1usize..10
        ) {
            let fs = test_fs();
            let dir = fs.mkdir(ROOT_INO, "d", 0o755, cred()).unwrap();
            for i in 0..count {
                fs.create(dir.ino, &format!("c{i:03}"), 0o644, cred()).unwrap();
            }
            let mut seen = Vec::new();
            let mut offset = 0i64;
            loop {
                let mut page = Vec::new();
                fs.readdir(dir.ino, offset, |entry| {
                    if page.len() == batch {
                        return false;
                    }
                    page.push((entry.name.clone(), entry.offset));
                    true
                }).unwrap();
                let Some(last) = page.last() else { break };
                offset = last.1;
                seen.extend(page.into_iter().map(|(name, _)| name));
            }
            let mut expected: Vec<String> =
                (0..count).map(|i| format!("c{i:03}")).collect();
            expected.push(".".to_string());
            expected.push("..".to_string());
            expected.sort();
            seen.sort();
            prop_assert_eq!(seen, expected);
        }
    }
}
