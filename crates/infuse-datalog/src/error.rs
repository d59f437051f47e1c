// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

use thiserror::Error;

/// Block logger and TDF data logger errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LoggerError {
    /// Geometry or arguments are malformed, or the store is corrupt
    #[error("invalid state or arguments")]
    Invalid,
    /// Block is outside the readable range
    #[error("block not found")]
    NotFound,
    /// Operation collides with an erase in progress or a held claim
    #[error("resource busy")]
    Busy,
    /// Media is full
    #[error("out of storage")]
    NoMemory,
    /// Record can never fit an empty block
    #[error("record larger than block")]
    NoSpace,
    /// Backend is offline
    #[error("backend not connected")]
    NotConnected,
    /// Claim wait expired
    #[error("timed out")]
    Timeout,
    /// Underlying media failure
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for LoggerError {
    fn from(err: std::io::Error) -> Self {
        LoggerError::Io(err.to_string())
    }
}
