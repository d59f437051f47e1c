// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TDF record parser
//!
//! [`TdfParser`] walks a buffer of encoded records. Any parse error ends
//! the walk, which also covers full-block buffers padded with 0xFF or
//! zero bytes after the last record.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::epoch;
use crate::record::{
    TdfDataFormat, TdfError, HEADER_FORMAT_MASK, HEADER_FORMAT_SHIFT, HEADER_ID_MASK,
    HEADER_TIMESTAMP_FLAG, RECORD_HEADER_SIZE,
};

/// One decoded record, borrowing its payload from the parsed buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TdfParsed<'a> {
    /// Reading identifier
    pub tdf_id: u16,
    /// Bytes per sample
    pub tdf_len: u8,
    /// Wire format of the record
    pub format: TdfDataFormat,
    /// Samples in the record (1 for single records; for diff arrays this
    /// counts the baseline plus residual rows)
    pub count: u8,
    /// Absolute epoch tick time of the first sample, 0 when the record
    /// carries no timestamp
    pub time: u64,
    /// Sample period in epoch ticks (time and diff arrays)
    pub period: u32,
    /// Base sample index (indexed arrays)
    pub base_idx: u32,
    /// Raw payload: samples, or baseline plus residuals for diff arrays
    pub data: &'a [u8],
}

impl<'a> TdfParsed<'a> {
    /// Raw bytes of sample `idx` for non-diff records
    pub fn sample(&self, idx: usize) -> Result<&'a [u8], TdfError> {
        if self.format.diff_kind().is_some() || idx >= self.count as usize {
            return Err(TdfError::InvalidArgument);
        }
        let len = self.tdf_len as usize;
        Ok(&self.data[idx * len..(idx + 1) * len])
    }

    /// Absolute time of sample `idx`, 0 when the record is untimestamped
    pub fn sample_time(&self, idx: usize) -> u64 {
        if self.time == 0 {
            0
        } else {
            self.time + self.period as u64 * idx as u64
        }
    }

    /// Reconstruct sample `idx` of a diff array by applying the residual
    /// rows to the baseline sample
    pub fn diff_reconstruct(&self, idx: usize) -> Result<Vec<u8>, TdfError> {
        let kind = self.format.diff_kind().ok_or(TdfError::InvalidArgument)?;
        if idx >= self.count as usize {
            return Err(TdfError::InvalidArgument);
        }
        let len = self.tdf_len as usize;
        let fields = kind.num_fields(len);
        let row = kind.residual_row(len);
        let mut out = Vec::with_capacity(len);
        for field in 0..fields {
            let offset = field * kind.field_width;
            let mut value = match kind.field_width {
                2 => u16::from_le_bytes([self.data[offset], self.data[offset + 1]]) as i64,
                _ => u32::from_le_bytes([
                    self.data[offset],
                    self.data[offset + 1],
                    self.data[offset + 2],
                    self.data[offset + 3],
                ]) as i64,
            };
            for r in 0..idx {
                let base = len + r * row + field * kind.residual_width;
                let residual = match kind.residual_width {
                    1 => self.data[base] as i8 as i64,
                    _ => i16::from_le_bytes([self.data[base], self.data[base + 1]]) as i64,
                };
                value += residual;
            }
            match kind.field_width {
                2 => out.extend_from_slice(&(value as u16).to_le_bytes()),
                _ => out.extend_from_slice(&(value as u32).to_le_bytes()),
            }
        }
        Ok(out)
    }
}

/// Cursor over a buffer of encoded TDF records
#[derive(Debug)]
pub struct TdfParser<'a> {
    buf: &'a [u8],
    offset: usize,
    time: u64,
}

impl<'a> TdfParser<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        TdfParser {
            buf,
            offset: 0,
            time: 0,
        }
    }

    /// Byte offset of the next unparsed record
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Absolute time of the newest timestamped sample seen, 0 if none
    pub fn last_time(&self) -> u64 {
        self.time
    }

    /// Decode the next record
    pub fn next(&mut self) -> Result<TdfParsed<'a>, TdfError> {
        let remaining = &self.buf[self.offset..];
        if remaining.len() <= RECORD_HEADER_SIZE {
            return Err(TdfError::EndOfBuffer);
        }
        let mut cur = Cursor::new(remaining);
        let header = cur
            .read_u16::<LittleEndian>()
            .map_err(|_| TdfError::Truncated)?;
        let tdf_len = cur.read_u8().map_err(|_| TdfError::Truncated)?;

        let tdf_id = header & HEADER_ID_MASK;
        if tdf_id == 0 || tdf_len == 0 {
            return Err(TdfError::Invalid);
        }
        let format =
            TdfDataFormat::from_bits(((header & HEADER_FORMAT_MASK) >> HEADER_FORMAT_SHIFT) as u8)?;

        let count = if format == TdfDataFormat::Single {
            1
        } else {
            let count = cur.read_u8().map_err(|_| TdfError::Truncated)?;
            if count == 0 {
                return Err(TdfError::Invalid);
            }
            count
        };
        let period = match format {
            TdfDataFormat::TimeArray
            | TdfDataFormat::Diff16x8
            | TdfDataFormat::Diff32x8
            | TdfDataFormat::Diff32x16 => cur
                .read_u32::<LittleEndian>()
                .map_err(|_| TdfError::Truncated)?,
            _ => 0,
        };
        let time = if header & HEADER_TIMESTAMP_FLAG != 0 {
            let seconds = cur
                .read_u32::<LittleEndian>()
                .map_err(|_| TdfError::Truncated)?;
            let subseconds = cur
                .read_u16::<LittleEndian>()
                .map_err(|_| TdfError::Truncated)?;
            epoch::from_parts(seconds, subseconds)
        } else {
            0
        };
        let base_idx = if format == TdfDataFormat::IdxArray {
            cur.read_u24::<LittleEndian>()
                .map_err(|_| TdfError::Truncated)?
        } else {
            0
        };

        let len = tdf_len as usize;
        let data_len = match format.diff_kind() {
            Some(kind) => {
                if len % kind.field_width != 0 {
                    return Err(TdfError::Invalid);
                }
                len + (count as usize - 1) * kind.residual_row(len)
            }
            None => count as usize * len,
        };
        let field_end = cur.position() as usize;
        if remaining.len() < field_end + data_len {
            return Err(TdfError::Truncated);
        }
        let data = &remaining[field_end..field_end + data_len];
        self.offset += field_end + data_len;
        if time != 0 {
            self.time = time + period as u64 * (count as u64 - 1);
        }
        Ok(TdfParsed {
            tdf_id,
            tdf_len,
            format,
            count,
            time,
            period,
            base_idx,
            data,
        })
    }
}

/// Scan a buffer for the first record with the given reading identifier
pub fn tdf_find(buf: &[u8], tdf_id: u16) -> Option<TdfParsed<'_>> {
    let mut parser = TdfParser::new(buf);
    while let Ok(parsed) = parser.next() {
        if parsed.tdf_id == tdf_id {
            return Some(parsed);
        }
    }
    None
}
