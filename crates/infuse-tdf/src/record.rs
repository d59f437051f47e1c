// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Record-level constants and shared types

use thiserror::Error;

/// Largest valid reading identifier (12 bits, 0 is reserved)
pub const TDF_ID_MAX: u16 = 0x0FFF;

/// Mandatory prefix of every record: header word + sample length byte
pub(crate) const RECORD_HEADER_SIZE: usize = 3;
/// Absolute timestamp: u32 epoch seconds + u16 subseconds
pub(crate) const TIME_SIZE: usize = 6;
/// Array sample count
pub(crate) const COUNT_SIZE: usize = 1;
/// Sample period for time and diff arrays
pub(crate) const PERIOD_SIZE: usize = 4;
/// Base sample index for indexed arrays
pub(crate) const BASE_IDX_SIZE: usize = 3;

/// Largest base index an indexed array can carry (24 bits)
pub(crate) const BASE_IDX_MAX: u32 = 0x00FF_FFFF;

pub(crate) const HEADER_ID_MASK: u16 = 0x0FFF;
pub(crate) const HEADER_FORMAT_SHIFT: u16 = 12;
pub(crate) const HEADER_FORMAT_MASK: u16 = 0x7000;
pub(crate) const HEADER_TIMESTAMP_FLAG: u16 = 0x8000;

/// TDF codec errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TdfError {
    /// Argument out of range (id, length, count, base index)
    #[error("invalid argument")]
    InvalidArgument,
    /// Record cannot fit the remaining buffer space, but would fit an
    /// empty buffer
    #[error("no room left in buffer")]
    NoRoom,
    /// Record cannot fit even an empty buffer
    #[error("record larger than buffer capacity")]
    NoSpace,
    /// No further records in the buffer
    #[error("end of buffer")]
    EndOfBuffer,
    /// Buffer ends mid-record
    #[error("truncated record")]
    Truncated,
    /// Header references a data format this decoder does not know
    #[error("unknown data format {0}")]
    UnknownVariant(u8),
    /// Header or field contents are not valid TDF
    #[error("invalid record contents")]
    Invalid,
}

/// Diff array field geometry: the integer width of each sample field and
/// the width of the per-field residuals that follow the baseline sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffKind {
    /// Bytes per sample field (2 or 4)
    pub field_width: usize,
    /// Bytes per residual (1 or 2)
    pub residual_width: usize,
}

impl DiffKind {
    /// Number of fields in a sample of `sample_len` bytes.
    ///
    /// `sample_len` must be a multiple of [`Self::field_width`].
    pub fn num_fields(&self, sample_len: usize) -> usize {
        sample_len / self.field_width
    }

    /// Residual bytes appended per additional sample
    pub fn residual_row(&self, sample_len: usize) -> usize {
        self.num_fields(sample_len) * self.residual_width
    }

    pub(crate) fn residual_max(&self) -> i64 {
        match self.residual_width {
            1 => i8::MAX as i64,
            _ => i16::MAX as i64,
        }
    }

    pub(crate) fn residual_min(&self) -> i64 {
        match self.residual_width {
            1 => i8::MIN as i64,
            _ => i16::MIN as i64,
        }
    }
}

/// Record data format, the 3-bit selector in the header word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TdfDataFormat {
    /// One sample
    Single = 0,
    /// `count` samples spaced `period` ticks apart
    TimeArray = 1,
    /// `count` samples tagged with a 24-bit base sample index
    IdxArray = 2,
    /// Diff array, 16-bit fields with 8-bit residuals
    Diff16x8 = 3,
    /// Diff array, 32-bit fields with 8-bit residuals
    Diff32x8 = 4,
    /// Diff array, 32-bit fields with 16-bit residuals
    Diff32x16 = 5,
}

impl TdfDataFormat {
    pub(crate) fn from_bits(bits: u8) -> Result<Self, TdfError> {
        match bits {
            0 => Ok(TdfDataFormat::Single),
            1 => Ok(TdfDataFormat::TimeArray),
            2 => Ok(TdfDataFormat::IdxArray),
            3 => Ok(TdfDataFormat::Diff16x8),
            4 => Ok(TdfDataFormat::Diff32x8),
            5 => Ok(TdfDataFormat::Diff32x16),
            other => Err(TdfError::UnknownVariant(other)),
        }
    }

    /// Field geometry for diff formats, `None` otherwise
    pub fn diff_kind(&self) -> Option<DiffKind> {
        match self {
            TdfDataFormat::Diff16x8 => Some(DiffKind {
                field_width: 2,
                residual_width: 1,
            }),
            TdfDataFormat::Diff32x8 => Some(DiffKind {
                field_width: 4,
                residual_width: 1,
            }),
            TdfDataFormat::Diff32x16 => Some(DiffKind {
                field_width: 4,
                residual_width: 2,
            }),
            _ => None,
        }
    }
}
