// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Telemetry block loggers
//!
//! A [`DataLogger`] presents a monotonically addressed sequence of
//! fixed-size blocks over one of three backends:
//!
//! * [`FlashRingBackend`] - a wrap-around ring on a flash partition,
//!   with erase-ahead and a per-block wrap counter that lets a boot-time
//!   scan recover the write head without a sidecar index.
//! * [`FsBackend`] - the same block contract atop fixed-size files on a
//!   removable volume, one file series per device ID.
//! * [`TransportBackend`] - a non-persistent path that forwards blocks
//!   to a live transport whose payload size may change at runtime.
//!
//! On top sits the [`TdfLogger`], which packs TDF records into a pending
//! block sized to its backend, auto-flushes, re-encodes on block-size
//! shrink, and keeps buffering through transport disconnects.

mod error;
mod flash;
mod fs;
mod logger;
mod tdf_logger;
mod transport;

pub use error::LoggerError;
pub use flash::{FlashPartition, FlashRingBackend, MemFlash};
pub use fs::{FsBackend, FsClaim, FsConfig, MediaPower};
pub use logger::{BlockHeader, DataLogger, EraseMode, LoggerBackend};
pub use tdf_logger::{TdfLogger, TdfLoggerMask, TdfLoggerRegistry, TdfSink, TDF_BLOCK_TYPE};
pub use transport::{Transport, TransportBackend};
