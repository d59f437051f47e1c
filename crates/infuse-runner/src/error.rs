// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

use infuse_kv::KvError;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RunnerError {
    /// Malformed schedule or task table
    #[error("invalid schedule")]
    Invalid,
    /// Unknown task or schedule reference
    #[error("not found")]
    NotFound,
    #[error("timed out")]
    Timeout,
    #[error("schedule storage: {0}")]
    Kv(#[from] KvError),
    #[error("executor: {0}")]
    Executor(String),
}

impl From<std::io::Error> for RunnerError {
    fn from(err: std::io::Error) -> Self {
        RunnerError::Executor(err.to_string())
    }
}
