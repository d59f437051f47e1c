// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Tagged Data Format (TDF) codec
//!
//! TDF is the on-wire and on-flash telemetry encoding used across the
//! Infuse data pipeline. A buffer holds a sequence of self-describing
//! records, each tagged with a 12-bit reading identifier:
//!
//! ```text
//! ┌──────────────┬─────┬───────────────────────────┬─────────┐
//! │ Header (u16) │ Len │ Variant fields            │ Payload │
//! ├──────────────┼─────┼───────────────────────────┼─────────┤
//! │ T FFF IIIIII │ u8  │ count / period / time /   │ bytes   │
//! │ 1 3   12 bit │     │ base, per format          │         │
//! └──────────────┴─────┴───────────────────────────┴─────────┘
//! ```
//!
//! * `T` - absolute timestamp present (6 bytes, epoch seconds + 1/65536s)
//! * `FFF` - data format selector ([`TdfDataFormat`])
//! * `IIIIII` - reading identifier, 1..=4095
//!
//! Array variants carry multiple samples per header: time arrays space
//! samples by a fixed period, indexed arrays tag them with a 24-bit base
//! index, and diff arrays store one full baseline sample followed by
//! per-field 8 or 16-bit residuals.
//!
//! [`TdfBuffer`] packs records into a size-limited buffer (partial array
//! packing when a full array does not fit), [`TdfParser`] walks a buffer
//! back into [`TdfParsed`] records.

pub mod epoch;
mod reader;
mod record;
mod writer;

pub use reader::{tdf_find, TdfParsed, TdfParser};
pub use record::{DiffKind, TdfDataFormat, TdfError, TDF_ID_MAX};
pub use writer::TdfBuffer;
