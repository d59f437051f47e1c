// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Buffered TDF data logger
//!
//! Packs TDF records into a pending block sized to the backend's
//! current payload capacity. Arrays that do not fit are split across
//! blocks (indexed arrays advance their base index, timed records their
//! timestamp). When the backend's block size shrinks between calls the
//! pending content is reparsed through the codec and re-emitted, diff
//! arrays included, at the largest prefix that fits.
//!
//! A disconnected transport does not stop logging: the pending buffer
//! grows to its configured maximum and keeps accepting records. A flush
//! attempt while disconnected discards the oldest buffered block so the
//! newest data keeps its place.

use byteorder::{ByteOrder, LittleEndian};
use infuse_tdf::{TdfBuffer, TdfDataFormat, TdfError, TdfParsed, TdfParser};

use crate::error::LoggerError;
use crate::logger::{DataLogger, LoggerBackend};

/// Block type tag of TDF payload blocks
pub const TDF_BLOCK_TYPE: u8 = 1;

/// Auto-flush once less than this remains: the smallest useful TDF is a
/// 3-byte header plus one data byte
const AUTO_FLUSH_WATERMARK: usize = 4;

/// Guard word framing a pending-buffer snapshot
const SNAPSHOT_GUARD: u32 = 0x2154_4446; // "FDT!"

/// Buffered TDF packer over a [`DataLogger`]
pub struct TdfLogger<B: LoggerBackend> {
    logger: DataLogger<B>,
    pending: TdfBuffer,
    max_pending: usize,
}

impl<B: LoggerBackend> TdfLogger<B> {
    /// `max_pending` bounds the pending buffer while the backend is
    /// disconnected
    pub fn new(logger: DataLogger<B>, max_pending: usize) -> Self {
        let payload = logger.payload_size();
        let capacity = if payload == 0 { max_pending } else { payload };
        TdfLogger {
            logger,
            pending: TdfBuffer::new(capacity),
            max_pending,
        }
    }

    pub fn logger(&self) -> &DataLogger<B> {
        &self.logger
    }

    pub fn logger_mut(&mut self) -> &mut DataLogger<B> {
        &mut self.logger
    }

    /// Tear down the buffered layer, handing the block logger back.
    /// Unflushed pending data is lost unless snapshotted first.
    pub fn into_logger(self) -> DataLogger<B> {
        self.logger
    }

    /// Bytes currently buffered
    pub fn bytes_pending(&self) -> usize {
        self.pending.len()
    }

    /// Bytes of pending space left before the next flush
    pub fn bytes_remaining(&self) -> usize {
        self.pending.remaining()
    }

    /// Append a TDF record, splitting and flushing as needed.
    ///
    /// `period_or_base` is the base sample index for indexed arrays and
    /// the sample period in epoch ticks otherwise, as in
    /// [`TdfBuffer::add`].
    pub fn log(
        &mut self,
        tdf_id: u16,
        sample_len: u8,
        count: u8,
        format: TdfDataFormat,
        time: u64,
        period_or_base: u32,
        data: &[u8],
    ) -> Result<(), LoggerError> {
        if count == 0 || data.len() < sample_len as usize * count as usize {
            return Err(LoggerError::Invalid);
        }
        let mut time = time;
        let mut base_or_period = period_or_base;
        let mut remaining = count as usize;
        let mut data = data;
        loop {
            self.sync_capacity()?;
            match self.pending.add(
                tdf_id,
                sample_len,
                remaining as u8,
                format,
                time,
                base_or_period,
                data,
            ) {
                Ok(written) if written == remaining => {
                    self.auto_flush()?;
                    return Ok(());
                }
                Ok(written) => {
                    data = &data[written * sample_len as usize..];
                    remaining -= written;
                    if format == TdfDataFormat::IdxArray {
                        // Continuations resume at the next index with no
                        // timestamp
                        base_or_period += written as u32;
                        time = 0;
                    } else if time != 0 {
                        time += base_or_period as u64 * written as u64;
                    }
                    self.flush_or_drop()?;
                }
                Err(TdfError::NoRoom) => self.flush_or_drop()?,
                Err(TdfError::NoSpace) => return Err(LoggerError::NoSpace),
                Err(_) => return Err(LoggerError::Invalid),
            }
        }
    }

    /// Seal and write the pending block. While the backend is
    /// disconnected this fails with `NotConnected` and the buffered
    /// content is discarded, oldest first; records appended afterwards
    /// start a fresh block.
    pub fn flush(&mut self) -> Result<(), LoggerError> {
        self.sync_capacity()?;
        if self.pending.is_empty() {
            return Ok(());
        }
        if self.logger.payload_size() == 0 {
            log::warn!(
                "dropping {} buffered tdf bytes while disconnected",
                self.pending.len()
            );
            self.pending.reset();
            return Err(LoggerError::NotConnected);
        }
        let raw = self.pending.take();
        let result = if self.logger.backend().persistent() {
            // Full-block media: pad the tail so the parser stops cleanly
            let mut padded = raw.clone();
            padded.resize(self.logger.payload_size(), 0xFF);
            self.logger.write(TDF_BLOCK_TYPE, &padded)
        } else {
            self.logger.write(TDF_BLOCK_TYPE, &raw)
        };
        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                // Retain on failure; whether to drop is the caller's call
                let _ = restore_records(&mut self.pending, &raw);
                Err(err)
            }
        }
    }

    /// Snapshot the pending buffer for retention across a logger
    /// restart
    pub fn snapshot_pending(&self) -> Vec<u8> {
        let bytes = self.pending.as_slice();
        let mut out = vec![0u8; bytes.len() + 12];
        LittleEndian::write_u32(&mut out[..4], SNAPSHOT_GUARD);
        LittleEndian::write_u32(&mut out[4..8], bytes.len() as u32);
        out[8..8 + bytes.len()].copy_from_slice(bytes);
        LittleEndian::write_u32(&mut out[8 + bytes.len()..], SNAPSHOT_GUARD);
        out
    }

    /// Validate and re-adopt a pending buffer snapshot. Returns whether
    /// the snapshot was accepted; a corrupt snapshot leaves the logger
    /// empty. `now` (epoch ticks) rejects snapshots whose newest
    /// timestamp lies in the future; pass 0 to skip the check.
    pub fn restore_pending(&mut self, snapshot: &[u8], now: u64) -> Result<bool, LoggerError> {
        let Some(bytes) = snapshot_payload(snapshot) else {
            log::warn!("pending snapshot rejected: bad framing");
            return Ok(false);
        };
        if bytes.len() > self.max_pending {
            log::warn!("pending snapshot rejected: {} bytes too large", bytes.len());
            return Ok(false);
        }
        // Every record must parse, and the newest timestamp must not be
        // ahead of the current time
        let mut parser = TdfParser::new(bytes);
        loop {
            match parser.next() {
                Ok(_) => {}
                Err(TdfError::EndOfBuffer) => break,
                Err(err) => {
                    log::warn!("pending snapshot rejected: {err}");
                    return Ok(false);
                }
            }
        }
        if now != 0 && parser.last_time() > now {
            log::warn!("pending snapshot rejected: future timestamp");
            return Ok(false);
        }
        self.relog_bytes(bytes)?;
        Ok(true)
    }

    /// Current pending capacity given the backend's block size
    fn target_capacity(&self) -> usize {
        let payload = self.logger.payload_size();
        if payload == 0 {
            self.max_pending
        } else {
            payload
        }
    }

    /// Track backend block-size changes, re-encoding pending content
    /// that no longer fits
    fn sync_capacity(&mut self) -> Result<(), LoggerError> {
        let target = self.target_capacity();
        if target == self.pending.capacity() {
            return Ok(());
        }
        if self.pending.len() <= target {
            self.pending.set_capacity(target);
            return Ok(());
        }
        log::debug!(
            "block size shrank to {target}, re-encoding {} pending bytes",
            self.pending.len()
        );
        let old = self.pending.take();
        self.pending.set_capacity(target);
        self.relog_bytes(&old)
    }

    /// Re-append previously encoded records through the codec
    fn relog_bytes(&mut self, bytes: &[u8]) -> Result<(), LoggerError> {
        let mut parser = TdfParser::new(bytes);
        loop {
            let record = match parser.next() {
                Ok(record) => record,
                Err(TdfError::EndOfBuffer) => return Ok(()),
                Err(err) => {
                    log::warn!("dropping unparseable pending tail: {err}");
                    return Ok(());
                }
            };
            if record.format.diff_kind().is_some() {
                self.append_precomputed(&record)?;
            } else {
                let period_or_base = if record.format == TdfDataFormat::IdxArray {
                    record.base_idx
                } else {
                    record.period
                };
                self.log(
                    record.tdf_id,
                    record.tdf_len,
                    record.count,
                    record.format,
                    record.time,
                    period_or_base,
                    record.data,
                )?;
            }
        }
    }

    /// Re-append a parsed diff array without expanding it, splitting at
    /// the largest prefix that fits each block
    fn append_precomputed(&mut self, record: &TdfParsed<'_>) -> Result<(), LoggerError> {
        let kind = match record.format.diff_kind() {
            Some(kind) => kind,
            None => return Err(LoggerError::Invalid),
        };
        let len = record.tdf_len as usize;
        let row = kind.residual_row(len);
        let total = record.count as usize;
        let mut consumed = 0usize;
        while consumed < total {
            let rows_left = total - consumed;
            let payload: Vec<u8> = if consumed == 0 {
                record.data.to_vec()
            } else {
                // Continuation baseline is the first sample not yet
                // written, rebuilt from the original residuals
                let mut payload = record
                    .diff_reconstruct(consumed)
                    .map_err(|_| LoggerError::Invalid)?;
                payload.extend_from_slice(&record.data[len + consumed * row..]);
                payload
            };
            let time = if record.time != 0 {
                record.time + record.period as u64 * consumed as u64
            } else {
                0
            };
            match self.pending.add_precomputed_diff(
                record.tdf_id,
                record.tdf_len,
                rows_left as u8,
                record.format,
                time,
                record.period,
                &payload,
            ) {
                Ok(written) if written == rows_left => {
                    self.auto_flush()?;
                    return Ok(());
                }
                Ok(written) => {
                    consumed += written;
                    self.flush_or_drop()?;
                }
                Err(TdfError::NoRoom) => self.flush_or_drop()?,
                Err(TdfError::NoSpace) => return Err(LoggerError::NoSpace),
                Err(_) => return Err(LoggerError::Invalid),
            }
        }
        Ok(())
    }

    /// Flush after an append filled the block past the low watermark
    fn auto_flush(&mut self) -> Result<(), LoggerError> {
        if self.pending.remaining() >= AUTO_FLUSH_WATERMARK {
            return Ok(());
        }
        self.flush_or_drop()
    }

    /// Flush mid-append. A disconnected drop counts as progress so the
    /// newest record being appended survives.
    fn flush_or_drop(&mut self) -> Result<(), LoggerError> {
        match self.flush() {
            Err(LoggerError::NotConnected) => Ok(()),
            result => result,
        }
    }
}

/// Reload raw record bytes into an empty buffer by reparsing them
fn restore_records(pending: &mut TdfBuffer, bytes: &[u8]) -> Result<(), TdfError> {
    let mut parser = TdfParser::new(bytes);
    loop {
        let record = match parser.next() {
            Ok(record) => record,
            Err(TdfError::EndOfBuffer) => return Ok(()),
            Err(err) => return Err(err),
        };
        if record.format.diff_kind().is_some() {
            pending.add_precomputed_diff(
                record.tdf_id,
                record.tdf_len,
                record.count,
                record.format,
                record.time,
                record.period,
                record.data,
            )?;
        } else {
            let period_or_base = if record.format == TdfDataFormat::IdxArray {
                record.base_idx
            } else {
                record.period
            };
            pending.add(
                record.tdf_id,
                record.tdf_len,
                record.count,
                record.format,
                record.time,
                period_or_base,
                record.data,
            )?;
        }
    }
}

fn snapshot_payload(snapshot: &[u8]) -> Option<&[u8]> {
    if snapshot.len() < 12 {
        return None;
    }
    let guard = LittleEndian::read_u32(&snapshot[..4]);
    let len = LittleEndian::read_u32(&snapshot[4..8]) as usize;
    if guard != SNAPSHOT_GUARD || snapshot.len() != len + 12 {
        return None;
    }
    if LittleEndian::read_u32(&snapshot[8 + len..]) != SNAPSHOT_GUARD {
        return None;
    }
    Some(&snapshot[8..8 + len])
}

/// Bitmask addressing registered logger destinations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TdfLoggerMask(pub u8);

impl TdfLoggerMask {
    /// On-board flash ring
    pub const FLASH: TdfLoggerMask = TdfLoggerMask(1 << 0);
    /// Removable media
    pub const REMOVABLE: TdfLoggerMask = TdfLoggerMask(1 << 1);
    /// Serial link
    pub const SERIAL: TdfLoggerMask = TdfLoggerMask(1 << 2);
    /// UDP uplink
    pub const UDP: TdfLoggerMask = TdfLoggerMask(1 << 3);
    pub const ALL: TdfLoggerMask = TdfLoggerMask(0xFF);

    pub fn intersects(self, other: TdfLoggerMask) -> bool {
        self.0 & other.0 != 0
    }
}

impl std::ops::BitOr for TdfLoggerMask {
    type Output = TdfLoggerMask;

    fn bitor(self, rhs: TdfLoggerMask) -> TdfLoggerMask {
        TdfLoggerMask(self.0 | rhs.0)
    }
}

/// Object-safe face of a [`TdfLogger`] for the registry
pub trait TdfSink: Send {
    fn log(
        &mut self,
        tdf_id: u16,
        sample_len: u8,
        count: u8,
        format: TdfDataFormat,
        time: u64,
        period_or_base: u32,
        data: &[u8],
    ) -> Result<(), LoggerError>;
    fn flush(&mut self) -> Result<(), LoggerError>;
    fn bytes_pending(&self) -> usize;
    fn bytes_remaining(&self) -> usize;
}

impl<B: LoggerBackend> TdfSink for TdfLogger<B> {
    fn log(
        &mut self,
        tdf_id: u16,
        sample_len: u8,
        count: u8,
        format: TdfDataFormat,
        time: u64,
        period_or_base: u32,
        data: &[u8],
    ) -> Result<(), LoggerError> {
        TdfLogger::log(
            self,
            tdf_id,
            sample_len,
            count,
            format,
            time,
            period_or_base,
            data,
        )
    }

    fn flush(&mut self) -> Result<(), LoggerError> {
        TdfLogger::flush(self)
    }

    fn bytes_pending(&self) -> usize {
        TdfLogger::bytes_pending(self)
    }

    fn bytes_remaining(&self) -> usize {
        TdfLogger::bytes_remaining(self)
    }
}

/// Named logger destinations addressed by [`TdfLoggerMask`]
#[derive(Default)]
pub struct TdfLoggerRegistry {
    slots: Vec<(TdfLoggerMask, Box<dyn TdfSink>)>,
}

impl TdfLoggerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, mask: TdfLoggerMask, sink: Box<dyn TdfSink>) {
        self.slots.push((mask, sink));
    }

    /// Append to every destination selected by `mask`. All destinations
    /// are attempted; the first error is reported.
    #[allow(clippy::too_many_arguments)]
    pub fn log_mask(
        &mut self,
        mask: TdfLoggerMask,
        tdf_id: u16,
        sample_len: u8,
        count: u8,
        format: TdfDataFormat,
        time: u64,
        period_or_base: u32,
        data: &[u8],
    ) -> Result<(), LoggerError> {
        let mut result = Ok(());
        for (slot_mask, sink) in &mut self.slots {
            if slot_mask.intersects(mask) {
                let outcome = sink.log(
                    tdf_id,
                    sample_len,
                    count,
                    format,
                    time,
                    period_or_base,
                    data,
                );
                if let (Ok(()), Err(err)) = (&result, outcome) {
                    result = Err(err);
                }
            }
        }
        result
    }

    /// Flush every destination selected by `mask`
    pub fn flush_mask(&mut self, mask: TdfLoggerMask) -> Result<(), LoggerError> {
        let mut result = Ok(());
        for (slot_mask, sink) in &mut self.slots {
            if slot_mask.intersects(mask) {
                if let (Ok(()), Err(err)) = (&result, sink.flush()) {
                    result = Err(err);
                }
            }
        }
        result
    }
}
