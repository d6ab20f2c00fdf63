// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for the ramfs core

/// Core filesystem error type
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("access denied")]
    AccessDenied,
    #[error("operation not permitted")]
    OperationNotPermitted,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("directory not empty")]
    NotEmpty,
    #[error("out of memory")]
    OutOfMemory,
}

pub type FsResult<T> = Result<T, FsError>;
