// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! ramfs FUSE host
//!
//! Mounts an in-memory POSIX filesystem at the given mountpoint. All
//! state lives in process memory and is discarded on unmount.

mod adapter;

use adapter::RamFsFuse;
use anyhow::{anyhow, Result};
use clap::Parser;
use ramfs_core::{FsConfig, BLOCK_SIZE};
use std::fs;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
struct Args {
    /// Mount point for the filesystem
    mount_point: PathBuf,

    /// Configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Reported filesystem capacity as a size string (e.g. "512M", "2G")
    #[arg(long, value_parser = parse_size)]
    capacity: Option<u64>,

    /// Reported total inode count
    #[arg(long)]
    inodes: Option<u64>,

    /// Allow other users to access the filesystem
    #[arg(long)]
    allow_other: bool,

    /// Allow root to access the filesystem
    #[arg(long)]
    allow_root: bool,

    /// Auto unmount on process exit
    #[arg(long)]
    auto_unmount: bool,
}

/// Parses a byte count with an optional K/M/G/T/P/E binary suffix.
fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let Some(last) = s.chars().last() else {
        return Err("empty size".to_string());
    };
    let (digits, unit) = if last.is_ascii_digit() {
        (s, 1u64)
    } else {
        let unit = match last.to_ascii_lowercase() {
            'k' => 1u64 << 10,
            'm' => 1u64 << 20,
            'g' => 1u64 << 30,
            't' => 1u64 << 40,
            'p' => 1u64 << 50,
            'e' => 1u64 << 60,
            _ => return Err(format!("unsupported size unit '{last}'")),
        };
        (s[..s.len() - last.len_utf8()].trim_end(), unit)
    };
    let value: u64 = digits.parse().map_err(|_| format!("invalid size '{s}'"))?;
    value.checked_mul(unit).ok_or_else(|| format!("size '{s}' overflows"))
}

fn load_config(config_path: Option<PathBuf>) -> Result<FsConfig> {
    match config_path {
        Some(path) => {
            let content = fs::read_to_string(&path)?;
            let config: FsConfig = serde_json::from_str(&content)?;
            Ok(config)
        }
        None => Ok(FsConfig::default()),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    info!("Starting ramfs FUSE host");
    info!("Mount point: {}", args.mount_point.display());

    let from_file = args.config.is_some();
    let mut config = load_config(args.config)?;
    if !from_file {
        // Without a config file the root directory belongs to whoever
        // mounts the filesystem.
        config.security.default_uid = unsafe { libc::getuid() };
        config.security.default_gid = unsafe { libc::getgid() };
    }
    if let Some(capacity) = args.capacity {
        config.limits.total_blocks = capacity / BLOCK_SIZE;
    }
    if let Some(inodes) = args.inodes {
        config.limits.total_inodes = inodes;
    }

    info!("Configuration loaded: {:?}", config);

    let filesystem = RamFsFuse::new(config);

    let mut mount_options = vec![
        fuser::MountOption::FSName("ramfs".to_string()),
        fuser::MountOption::Subtype("ramfs".to_string()),
        fuser::MountOption::DefaultPermissions,
    ];
    if args.allow_other {
        mount_options.push(fuser::MountOption::AllowOther);
    }
    if args.allow_root {
        mount_options.push(fuser::MountOption::AllowRoot);
    }
    if args.auto_unmount {
        mount_options.push(fuser::MountOption::AutoUnmount);
    }

    info!("Mounting filesystem...");
    let session = fuser::spawn_mount2(filesystem, &args.mount_point, &mount_options)?;
    info!("ramfs mounted; blocking until unmount");
    match session.guard.join() {
        Ok(Ok(())) => info!("FUSE session exited cleanly"),
        Ok(Err(err)) => return Err(err.into()),
        Err(panic) => {
            return Err(anyhow!("FUSE session panicked: {:?}", panic));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_loading_default() {
        let config = load_config(None).unwrap();
        assert_eq!(config.limits.total_blocks, u64::MAX);
        assert_eq!(config.cache.attr_ttl_ms, 1000);
    }

    #[test]
    fn test_config_loading_from_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        let config_json = r#"{
            "limits": {
                "total_blocks": 1048576,
                "total_inodes": 65536
            },
            "cache": {
                "attr_ttl_ms": 500,
                "entry_ttl_ms": 750
            },
            "security": {
                "default_uid": 1000,
                "default_gid": 1000
            }
        }"#;
        temp_file.write_all(config_json.as_bytes()).unwrap();
        temp_file.flush().unwrap();

        let config = load_config(Some(temp_file.path().to_path_buf())).unwrap();
        assert_eq!(config.limits.total_blocks, 1_048_576);
        assert_eq!(config.limits.total_inodes, 65_536);
        assert_eq!(config.cache.attr_ttl_ms, 500);
        assert_eq!(config.cache.entry_ttl_ms, 750);
        assert_eq!(config.security.default_uid, 1000);
    }

    #[test]
    fn test_config_sections_default_independently() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(br#"{"limits": {"total_blocks": 42, "total_inodes": 7}}"#).unwrap();
        temp_file.flush().unwrap();

        let config = load_config(Some(temp_file.path().to_path_buf())).unwrap();
        assert_eq!(config.limits.total_blocks, 42);
        assert_eq!(config.cache.attr_ttl_ms, 1000);
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("512"), Ok(512));
        assert_eq!(parse_size("512M"), Ok(512 << 20));
        assert_eq!(parse_size("2g"), Ok(2 << 30));
        assert_eq!(parse_size("1T"), Ok(1 << 40));
        assert_eq!(parse_size("64 K"), Ok(64 << 10));
        assert!(parse_size("").is_err());
        assert!(parse_size("12Q").is_err());
        assert!(parse_size("x1M").is_err());
    }

    #[test]
    fn test_adapter_creation() {
        let _adapter = RamFsFuse::new(FsConfig::default());
    }
}
