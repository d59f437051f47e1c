// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Epoch tick helpers
//!
//! TDF timestamps count ticks since the GPS epoch (1980-01-06 00:00:00
//! UTC) at 65536 ticks per second. On the wire a timestamp is 6 bytes:
//! a u32 of whole seconds followed by a u16 of subsecond ticks, which
//! gives sub-16us resolution until 2116.

/// Ticks per second of the epoch time scale
pub const TICKS_PER_SECOND: u64 = 65536;

/// Seconds between the Unix epoch and the GPS epoch, ignoring leap
/// seconds (civil time conversion is handled upstream of this crate)
pub const GPS_UNIX_OFFSET_SECONDS: u64 = 315_964_800;

/// Whole seconds of an epoch tick count
pub fn seconds(ticks: u64) -> u32 {
    (ticks >> 16) as u32
}

/// Subsecond ticks of an epoch tick count
pub fn subseconds(ticks: u64) -> u16 {
    (ticks & 0xFFFF) as u16
}

/// Rebuild an epoch tick count from its wire parts
pub fn from_parts(seconds: u32, subseconds: u16) -> u64 {
    ((seconds as u64) << 16) | subseconds as u64
}

/// Convert a Unix second count to epoch ticks
pub fn from_unix_seconds(unix: u64) -> u64 {
    unix.saturating_sub(GPS_UNIX_OFFSET_SECONDS) * TICKS_PER_SECOND
}
