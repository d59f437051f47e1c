// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TDF record encoder
//!
//! [`TdfBuffer`] packs records into a capacity-limited byte buffer. When
//! a requested array does not fully fit, the encoder packs as many
//! samples as the remaining space allows and reports how many it
//! consumed, so callers can re-add the remainder to the next buffer.

use crate::record::{
    DiffKind, TdfDataFormat, TdfError, BASE_IDX_MAX, BASE_IDX_SIZE, COUNT_SIZE,
    HEADER_FORMAT_SHIFT, HEADER_ID_MASK, HEADER_TIMESTAMP_FLAG, PERIOD_SIZE, RECORD_HEADER_SIZE,
    TDF_ID_MAX, TIME_SIZE,
};

/// Size-limited TDF record accumulator
#[derive(Debug)]
pub struct TdfBuffer {
    data: Vec<u8>,
    capacity: usize,
    time: u64,
}

impl TdfBuffer {
    pub fn new(capacity: usize) -> Self {
        TdfBuffer {
            data: Vec::with_capacity(capacity),
            capacity,
            time: 0,
        }
    }

    /// Encoded bytes accumulated so far
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes still available before the capacity limit
    pub fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.data.len())
    }

    /// Absolute time of the newest timestamped sample, 0 if none yet
    pub fn last_time(&self) -> u64 {
        self.time
    }

    /// Drop all accumulated records
    pub fn reset(&mut self) {
        self.data.clear();
        self.time = 0;
    }

    /// Hand out the accumulated bytes and leave the buffer empty
    pub fn take(&mut self) -> Vec<u8> {
        self.time = 0;
        std::mem::take(&mut self.data)
    }

    /// Change the capacity limit. Existing contents are kept even when
    /// they exceed the new limit; the caller is expected to drain or
    /// re-encode them.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
    }

    /// Append a record of `num` samples of `len` bytes each.
    ///
    /// `format` selects the encoding: [`TdfDataFormat::Single`] and
    /// [`TdfDataFormat::TimeArray`] are interchangeable requests (the
    /// encoder emits a single record for one sample and a time array
    /// otherwise), [`TdfDataFormat::IdxArray`] tags samples with the
    /// 24-bit base index passed in `idx_period`, and the diff formats
    /// request residual compression with automatic fallback to a time
    /// array when the samples do not diff-encode.
    ///
    /// `idx_period` is the base sample index for indexed arrays and the
    /// sample period in epoch ticks for every other array. `time` is the
    /// absolute epoch tick timestamp of the first sample, 0 for
    /// untimestamped data.
    ///
    /// Returns the number of samples consumed, which is less than `num`
    /// when the buffer could only fit a prefix.
    pub fn add(
        &mut self,
        tdf_id: u16,
        len: u8,
        num: u8,
        format: TdfDataFormat,
        time: u64,
        idx_period: u32,
        data: &[u8],
    ) -> Result<usize, TdfError> {
        let sample_len = len as usize;
        if tdf_id == 0 || tdf_id > TDF_ID_MAX || len == 0 || num == 0 {
            return Err(TdfError::InvalidArgument);
        }
        if data.len() < sample_len * num as usize {
            return Err(TdfError::InvalidArgument);
        }
        if format == TdfDataFormat::IdxArray && idx_period > BASE_IDX_MAX {
            return Err(TdfError::InvalidArgument);
        }

        let time_size = if time != 0 { TIME_SIZE } else { 0 };
        let min_size = RECORD_HEADER_SIZE
            + time_size
            + sample_len
            + if format == TdfDataFormat::IdxArray {
                COUNT_SIZE + BASE_IDX_SIZE
            } else {
                0
            };
        if min_size > self.capacity {
            return Err(TdfError::NoSpace);
        }

        let mut num = num as usize;
        let mut diff: Option<DiffKind> = None;
        if let Some(kind) = format.diff_kind() {
            if sample_len % kind.field_width != 0 {
                return Err(TdfError::InvalidArgument);
            }
            // Residual compression only pays off from three samples, and
            // only when the run starts with two encodable diffs.
            if num > 2 {
                match first_valid_diff_index(data, sample_len, num, kind) {
                    Some(0) => diff = Some(kind),
                    Some(start) => num = start,
                    None => {}
                }
            }
        }

        let array_header = |num: usize| -> usize {
            if format == TdfDataFormat::IdxArray {
                COUNT_SIZE + BASE_IDX_SIZE
            } else if num > 1 {
                COUNT_SIZE + PERIOD_SIZE
            } else {
                0
            }
        };

        let fixed = RECORD_HEADER_SIZE + time_size;
        let remaining = self.remaining();
        let mut payload_space = remaining.saturating_sub(fixed + array_header(num));
        let total_payload = match diff {
            Some(kind) => sample_len + (num - 1) * kind.residual_row(sample_len),
            None => num * sample_len,
        };

        if payload_space < total_payload {
            let mut can_fit = match diff {
                Some(kind) if payload_space >= sample_len => {
                    1 + (payload_space - sample_len) / kind.residual_row(sample_len)
                }
                Some(_) => 0,
                None => payload_space / sample_len,
            };
            if can_fit == 0 && format != TdfDataFormat::IdxArray && num > 1 {
                // Not even one array sample fits, but dropping down to a
                // single record reclaims the count and period fields.
                payload_space = remaining.saturating_sub(fixed);
                can_fit = payload_space / sample_len;
            }
            if can_fit == 0 {
                return Err(TdfError::NoRoom);
            }
            num = num.min(can_fit);
            if num == 1 {
                diff = None;
            }
        }

        let wire_format = if format == TdfDataFormat::IdxArray {
            TdfDataFormat::IdxArray
        } else if diff.is_some() {
            format
        } else if num > 1 {
            TdfDataFormat::TimeArray
        } else {
            TdfDataFormat::Single
        };

        self.write_header(tdf_id, len, wire_format, time);
        let mut count_pos = None;
        match wire_format {
            TdfDataFormat::Single => {
                self.write_time(time);
            }
            TdfDataFormat::IdxArray => {
                self.data.push(num as u8);
                self.write_time(time);
                self.data.extend_from_slice(&idx_period.to_le_bytes()[..3]);
            }
            _ => {
                count_pos = Some(self.data.len());
                self.data.push(num as u8);
                self.data.extend_from_slice(&idx_period.to_le_bytes());
                self.write_time(time);
            }
        }

        if let Some(kind) = diff {
            // Baseline sample, then per-field residuals for each further
            // sample until one does not encode.
            self.data.extend_from_slice(&data[..sample_len]);
            let mut written = 1;
            while written < num {
                let prev = &data[(written - 1) * sample_len..written * sample_len];
                let next = &data[written * sample_len..(written + 1) * sample_len];
                if !push_residuals(&mut self.data, prev, next, kind) {
                    break;
                }
                written += 1;
            }
            num = written;
            if let Some(pos) = count_pos {
                self.data[pos] = num as u8;
            }
        } else {
            self.data.extend_from_slice(&data[..num * sample_len]);
        }

        if time != 0 {
            self.time = match wire_format {
                TdfDataFormat::Single | TdfDataFormat::IdxArray => time,
                _ => time + idx_period as u64 * (num as u64 - 1),
            };
        }
        Ok(num)
    }

    /// Append an already diff-encoded payload: one baseline sample
    /// followed by `rows - 1` residual rows. Used when re-logging a
    /// parsed diff array without expanding it.
    ///
    /// Returns the number of rows consumed. A single-row fit degrades to
    /// a plain record holding the baseline sample.
    pub fn add_precomputed_diff(
        &mut self,
        tdf_id: u16,
        len: u8,
        rows: u8,
        format: TdfDataFormat,
        time: u64,
        period: u32,
        payload: &[u8],
    ) -> Result<usize, TdfError> {
        let kind = format.diff_kind().ok_or(TdfError::InvalidArgument)?;
        let sample_len = len as usize;
        if tdf_id == 0 || tdf_id > TDF_ID_MAX || len == 0 || rows == 0 {
            return Err(TdfError::InvalidArgument);
        }
        if sample_len % kind.field_width != 0 {
            return Err(TdfError::InvalidArgument);
        }
        let row = kind.residual_row(sample_len);
        let rows = rows as usize;
        if payload.len() < sample_len + (rows - 1) * row {
            return Err(TdfError::InvalidArgument);
        }

        let time_size = if time != 0 { TIME_SIZE } else { 0 };
        let fixed = RECORD_HEADER_SIZE + time_size;
        if fixed + sample_len > self.capacity {
            return Err(TdfError::NoSpace);
        }

        let remaining = self.remaining();
        let array_space = remaining
            .checked_sub(fixed + COUNT_SIZE + PERIOD_SIZE)
            .unwrap_or(0);
        let mut fit = if array_space >= sample_len {
            1 + (array_space - sample_len) / row
        } else {
            0
        };
        if fit < 2 {
            // Baseline alone as a plain record, if even that fits
            let single_space = remaining.checked_sub(fixed).unwrap_or(0);
            if single_space < sample_len {
                return Err(TdfError::NoRoom);
            }
            fit = 1;
        }
        let rows = rows.min(fit);

        if rows == 1 {
            self.write_header(tdf_id, len, TdfDataFormat::Single, time);
            self.write_time(time);
            self.data.extend_from_slice(&payload[..sample_len]);
        } else {
            self.write_header(tdf_id, len, format, time);
            self.data.push(rows as u8);
            self.data.extend_from_slice(&period.to_le_bytes());
            self.write_time(time);
            self.data
                .extend_from_slice(&payload[..sample_len + (rows - 1) * row]);
        }
        if time != 0 {
            self.time = time + period as u64 * (rows as u64 - 1);
        }
        Ok(rows)
    }

    fn write_header(&mut self, tdf_id: u16, len: u8, format: TdfDataFormat, time: u64) {
        let mut header = (tdf_id & HEADER_ID_MASK) | ((format as u16) << HEADER_FORMAT_SHIFT);
        if time != 0 {
            header |= HEADER_TIMESTAMP_FLAG;
        }
        self.data.extend_from_slice(&header.to_le_bytes());
        self.data.push(len);
    }

    fn write_time(&mut self, time: u64) {
        if time != 0 {
            self.data
                .extend_from_slice(&crate::epoch::seconds(time).to_le_bytes());
            self.data
                .extend_from_slice(&crate::epoch::subseconds(time).to_le_bytes());
        }
    }
}

fn read_field(bytes: &[u8], kind: DiffKind) -> i64 {
    match kind.field_width {
        2 => u16::from_le_bytes([bytes[0], bytes[1]]) as i64,
        _ => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64,
    }
}

fn row_diff_valid(prev: &[u8], next: &[u8], kind: DiffKind) -> bool {
    let fields = kind.num_fields(prev.len());
    for field in 0..fields {
        let offset = field * kind.field_width;
        let delta = read_field(&next[offset..], kind) - read_field(&prev[offset..], kind);
        if delta < kind.residual_min() || delta > kind.residual_max() {
            return false;
        }
    }
    true
}

/// Index of the first sample from which two consecutive diffs encode,
/// `None` if no such run exists.
fn first_valid_diff_index(
    data: &[u8],
    sample_len: usize,
    num: usize,
    kind: DiffKind,
) -> Option<usize> {
    for start in 0..num - 2 {
        let a = &data[start * sample_len..(start + 1) * sample_len];
        let b = &data[(start + 1) * sample_len..(start + 2) * sample_len];
        let c = &data[(start + 2) * sample_len..(start + 3) * sample_len];
        if row_diff_valid(a, b, kind) && row_diff_valid(b, c, kind) {
            return Some(start);
        }
    }
    None
}

fn push_residuals(out: &mut Vec<u8>, prev: &[u8], next: &[u8], kind: DiffKind) -> bool {
    if !row_diff_valid(prev, next, kind) {
        return false;
    }
    let fields = kind.num_fields(prev.len());
    for field in 0..fields {
        let offset = field * kind.field_width;
        let delta = read_field(&next[offset..], kind) - read_field(&prev[offset..], kind);
        match kind.residual_width {
            1 => out.push(delta as i8 as u8),
            _ => out.extend_from_slice(&(delta as i16).to_le_bytes()),
        }
    }
    true
}
