// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Configuration for the ramfs core

use serde::{Deserialize, Serialize};

/// Capacity limits reported through statfs.
///
/// These bound what the filesystem *reports*, not what it stores; the store
/// grows until allocation fails.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct FsLimits {
    /// Total number of blocks reported in `f_blocks`.
    pub total_blocks: u64,
    /// Total number of inodes reported in `f_files`.
    pub total_inodes: u64,
}

impl Default for FsLimits {
    fn default() -> Self {
        Self {
            total_blocks: u64::MAX,
            total_inodes: u64::MAX,
        }
    }
}

/// TTLs handed to the kernel with attr and entry replies.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct CachePolicy {
    pub attr_ttl_ms: u64,
    pub entry_ttl_ms: u64,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            attr_ttl_ms: 1000,
            entry_ttl_ms: 1000,
        }
    }
}

/// Ownership defaults for the root directory and the no-block sentinel.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct SecurityPolicy {
    pub default_uid: u32,
    pub default_gid: u32,
}

/// Top-level filesystem configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FsConfig {
    #[serde(default)]
    pub limits: FsLimits,
    #[serde(default)]
    pub cache: CachePolicy,
    #[serde(default)]
    pub security: SecurityPolicy,
}
