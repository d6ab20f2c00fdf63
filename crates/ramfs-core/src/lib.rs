// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! ramfs core: an in-memory POSIX filesystem.
//!
//! The whole hierarchy lives in process memory — an indexed inode slot
//! table with FIFO slot reclamation, per-directory ordered children maps,
//! byte buffers for regular files, and extended attributes — behind the
//! [`RamFs`] context object. A bridge layer (see the `ramfs-fuse-host`
//! crate) maps kernel filesystem requests onto these operations.
//!
//! Nothing is durable: unmounting discards all state.

pub mod config;
pub mod error;
pub mod types;
pub mod vfs;

mod inode;

pub use config::{CachePolicy, FsConfig, FsLimits, SecurityPolicy};
pub use error::{FsError, FsResult};
pub use types::{
    nblocks, Credentials, DirEntry, FileKind, Ino, InodeAttr, SetAttrRequest, SetXattrMode,
    StatvfsData, BLOCK_SIZE, FS_ID, INO_NOTFOUND, NAME_MAX, ROOT_INO,
};
pub use vfs::RamFs;
