// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Data logger core
//!
//! Shared state machine over any [`LoggerBackend`]: logical block
//! addressing, wrap counting, erase-ahead, boot-time recovery and bulk
//! erase. Logical block addresses (LBAs) increase monotonically for the
//! lifetime of the log; `physical = lba % physical_blocks`.
//!
//! Persistent block layout:
//!
//! ```text
//! ┌────────────┬────────────┬──────────────────────────┐
//! │ wrap_count │ block_type │ payload                  │
//! │ u8         │ u8         │ block_size - 2 bytes     │
//! └────────────┴────────────┴──────────────────────────┘
//! ```
//!
//! `wrap_count` is `1 + lba / physical_blocks` (modulo its valid range
//! 1..=254). 0xFF is the flash erase value and marks an unused block; a
//! zero wrap count never occurs in a healthy store and is treated as
//! corruption.

use crate::error::LoggerError;

/// Persistent per-block header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub wrap_count: u8,
    pub block_type: u8,
}

impl BlockHeader {
    pub const SIZE: usize = 2;
    /// Wrap byte of an erased block (flash erase value)
    pub const ERASED: u8 = 0xFF;

    pub fn write_to(&self, out: &mut [u8]) {
        out[0] = self.wrap_count;
        out[1] = self.block_type;
    }

    pub fn read_from(bytes: &[u8]) -> Self {
        BlockHeader {
            wrap_count: bytes[0],
            block_type: bytes[1],
        }
    }

    pub fn is_erased(&self) -> bool {
        self.wrap_count == Self::ERASED
    }

    pub fn is_valid(&self) -> bool {
        self.wrap_count != 0 && self.wrap_count != Self::ERASED
    }
}

/// Wrap counter for a logical block address, cycling through 1..=254
pub(crate) fn wrap_count(lba: u32, physical_blocks: u32) -> u8 {
    ((lba / physical_blocks) % 254 + 1) as u8
}

/// Physical storage seam of the data logger
pub trait LoggerBackend: Send {
    /// Total addressable capacity in blocks; `u32::MAX` for an endless
    /// ring or a transport
    fn logical_blocks(&self) -> u32;
    /// Blocks physically present before the ring wraps
    fn physical_blocks(&self) -> u32;
    /// Current block size in bytes, 0 when a transport is disconnected
    fn block_size(&self) -> usize;
    /// Bytes of each block consumed by the persistent header
    fn block_overhead(&self) -> usize;
    /// Blocks per erase unit, 1 when the medium needs no erase
    fn erase_blocks(&self) -> u32;
    /// Write granularity `file_next` rounds up to, in blocks
    fn block_align(&self) -> u32 {
        1
    }
    /// Whether blocks survive and can be read back
    fn persistent(&self) -> bool;
    fn connected(&self) -> bool {
        true
    }

    /// Backend-specific head recovery, bypassing the header scan.
    /// Returns `(current_block, earliest_block)` when the backend can
    /// derive them directly (e.g. from file lengths).
    fn recover_head(&mut self) -> Result<Option<(u32, u32)>, LoggerError> {
        Ok(None)
    }

    fn read_header(&mut self, phys: u32) -> Result<BlockHeader, LoggerError>;
    fn write_block(
        &mut self,
        phys: u32,
        header: BlockHeader,
        payload: &[u8],
    ) -> Result<(), LoggerError>;
    /// Read raw block bytes starting at `offset` into physical block
    /// `phys`. The range may span blocks but never wraps the partition.
    fn read(&mut self, phys: u32, offset: usize, out: &mut [u8]) -> Result<(), LoggerError>;
    /// Erase `count` physical blocks starting at `phys`
    fn erase_range(&mut self, phys: u32, count: u32) -> Result<(), LoggerError>;
}

/// Which part of the medium a bulk erase covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseMode {
    /// Every physical block
    All,
    /// Only erase units that have been written to
    OnlyLogged,
}

type WriteFailureCallback = Box<dyn FnMut(&LoggerError) + Send>;

/// Block logger over a [`LoggerBackend`]
pub struct DataLogger<B: LoggerBackend> {
    backend: B,
    current_block: u32,
    earliest_block: u32,
    boot_block: u32,
    bytes_logged: u32,
    erasing: bool,
    write_failure: Vec<WriteFailureCallback>,
}

impl<B: LoggerBackend> DataLogger<B> {
    /// Wrap a backend, validating its geometry and recovering the write
    /// head from persistent media
    pub fn new(mut backend: B) -> Result<Self, LoggerError> {
        let (current, earliest) = if backend.persistent() {
            let physical = backend.physical_blocks();
            let erase = backend.erase_blocks();
            if physical == 0
                || erase == 0
                || physical % erase != 0
                || backend.block_size() <= backend.block_overhead()
            {
                return Err(LoggerError::Invalid);
            }
            scan(&mut backend)?
        } else {
            (0, 0)
        };
        log::info!(
            "data logger init: current={} earliest={} block_size={}",
            current,
            earliest,
            backend.block_size()
        );
        Ok(DataLogger {
            backend,
            current_block: current,
            earliest_block: earliest,
            boot_block: current,
            bytes_logged: 0,
            erasing: false,
            write_failure: Vec::new(),
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Tear down the logger, handing the backend back
    pub fn into_backend(self) -> B {
        self.backend
    }

    /// Next LBA to be written
    pub fn current_block(&self) -> u32 {
        self.current_block
    }

    /// Oldest LBA still readable
    pub fn earliest_block(&self) -> u32 {
        self.earliest_block
    }

    /// LBA the log was at when this logger was constructed
    pub fn boot_block(&self) -> u32 {
        self.boot_block
    }

    /// Total payload bytes written, wrapping at 32 bits
    pub fn bytes_logged(&self) -> u32 {
        self.bytes_logged
    }

    pub fn block_size(&self) -> usize {
        self.backend.block_size()
    }

    /// Payload bytes available per block
    pub fn payload_size(&self) -> usize {
        self.backend
            .block_size()
            .saturating_sub(self.backend.block_overhead())
    }

    pub fn erase_in_progress(&self) -> bool {
        self.erasing
    }

    /// Subscribe to write failures (media errors, media full)
    pub fn on_write_failure(&mut self, callback: WriteFailureCallback) {
        self.write_failure.push(callback);
    }

    /// Append one block. For persistent backends `payload` must be
    /// exactly the block payload size; transports accept any length up
    /// to it. Writes during an erase succeed without logging anything.
    pub fn write(&mut self, block_type: u8, payload: &[u8]) -> Result<(), LoggerError> {
        if self.erasing {
            return Ok(());
        }
        if !self.backend.connected() || self.backend.block_size() == 0 {
            return Err(LoggerError::NotConnected);
        }
        let persistent = self.backend.persistent();
        let expected = self.payload_size();
        if persistent && payload.len() != expected {
            return Err(LoggerError::Invalid);
        }
        if !persistent && payload.len() > expected {
            return Err(LoggerError::Invalid);
        }
        if self.current_block >= self.backend.logical_blocks() {
            return Err(LoggerError::NoMemory);
        }

        let physical = self.backend.physical_blocks();
        let phys = self.current_block % physical;
        let erase = self.backend.erase_blocks();
        let wraps = physical < self.backend.logical_blocks();
        if persistent && wraps && erase > 1 && phys % erase == 0 {
            // Keep the erase unit ahead of the write head erased at all
            // times, reclaiming the oldest blocks once wrapped
            let next = (phys + erase) % physical;
            self.backend.erase_range(next, erase)?;
            let reclaimed = (self.current_block + 2 * erase).saturating_sub(physical);
            if reclaimed > self.earliest_block {
                self.earliest_block = reclaimed;
            }
        }

        let header = BlockHeader {
            wrap_count: wrap_count(self.current_block, physical),
            block_type,
        };
        if let Err(err) = self.backend.write_block(phys, header, payload) {
            log::warn!("block write failed at lba {}: {err}", self.current_block);
            for callback in &mut self.write_failure {
                callback(&err);
            }
            return Err(err);
        }
        self.current_block += 1;
        self.bytes_logged = self.bytes_logged.wrapping_add(payload.len() as u32);
        Ok(())
    }

    /// Read raw bytes starting at `offset` into block `lba`. The range
    /// may span blocks; ranges crossing the physical end of the medium
    /// are split into two backend reads.
    pub fn read(&mut self, lba: u32, offset: usize, out: &mut [u8]) -> Result<(), LoggerError> {
        if self.erasing {
            return Err(LoggerError::Busy);
        }
        if !self.backend.persistent() {
            return Err(LoggerError::Invalid);
        }
        if lba < self.earliest_block || lba >= self.current_block {
            return Err(LoggerError::NotFound);
        }
        let block_size = self.backend.block_size() as u64;
        let start = lba as u64 * block_size + offset as u64;
        let end = start + out.len() as u64;
        if end > self.current_block as u64 * block_size {
            return Err(LoggerError::NotFound);
        }

        let physical = self.backend.physical_blocks() as u64;
        let partition = physical * block_size;
        let mut pos = start;
        let mut filled = 0usize;
        while filled < out.len() {
            let phys_byte = pos % partition;
            let until_wrap = (partition - phys_byte) as usize;
            let chunk = until_wrap.min(out.len() - filled);
            let phys = (phys_byte / block_size) as u32;
            let in_block = (phys_byte % block_size) as usize;
            self.backend
                .read(phys, in_block, &mut out[filled..filled + chunk])?;
            filled += chunk;
            pos += chunk as u64;
        }
        Ok(())
    }

    /// Round the write head up to the backend's alignment boundary,
    /// sealing the current file on filesystem backends
    pub fn file_next(&mut self) {
        let align = self.backend.block_align();
        if align > 1 && self.current_block % align != 0 {
            self.current_block = (self.current_block / align + 1) * align;
        }
    }

    /// Erase the medium in erase-unit strides. `progress` is invoked
    /// with the running erased-block count once per unit. Resets the
    /// block pointers; `bytes_logged` is preserved.
    pub fn erase(
        &mut self,
        mode: EraseMode,
        mut progress: Option<&mut dyn FnMut(u32)>,
    ) -> Result<(), LoggerError> {
        if !self.backend.persistent() {
            return Err(LoggerError::Invalid);
        }
        self.erasing = true;
        let result = self.erase_inner(mode, &mut progress);
        self.erasing = false;
        result
    }

    fn erase_inner(
        &mut self,
        mode: EraseMode,
        progress: &mut Option<&mut dyn FnMut(u32)>,
    ) -> Result<(), LoggerError> {
        let physical = self.backend.physical_blocks();
        let erase = self.backend.erase_blocks();
        let total = match mode {
            EraseMode::All => physical,
            EraseMode::OnlyLogged => {
                let used = self.current_block.min(physical);
                used.div_ceil(erase) * erase
            }
        };
        let mut erased = 0;
        while erased < total {
            self.backend.erase_range(erased, erase)?;
            erased += erase;
            if let Some(callback) = progress {
                callback(erased);
            }
        }
        log::info!("erased {erased} blocks");
        self.current_block = 0;
        self.earliest_block = 0;
        self.boot_block = 0;
        Ok(())
    }
}

/// Recover `(current_block, earliest_block)` from block headers
fn scan<B: LoggerBackend>(backend: &mut B) -> Result<(u32, u32), LoggerError> {
    if let Some(recovered) = backend.recover_head()? {
        return Ok(recovered);
    }
    let physical = backend.physical_blocks();
    let mut headers = Vec::with_capacity(physical as usize);
    for phys in 0..physical {
        headers.push(backend.read_header(phys)?);
    }

    // A zeroed header never occurs in a healthy store: an all-zero
    // medium counts as empty, anything else as corruption
    if headers.iter().any(|h| h.wrap_count == 0) {
        if headers.iter().all(|h| h.wrap_count == 0) {
            return Ok((0, 0));
        }
        return Err(LoggerError::Invalid);
    }
    let newest = headers
        .iter()
        .enumerate()
        .filter(|(_, h)| h.is_valid())
        .max_by_key(|(phys, h)| (h.wrap_count, *phys));
    let (phys, header) = match newest {
        Some(found) => found,
        None => return Ok((0, 0)),
    };

    let current = (header.wrap_count as u32 - 1) * physical + phys as u32 + 1;
    let earliest = headers
        .iter()
        .enumerate()
        .filter(|(_, h)| h.is_valid())
        .map(|(p, h)| (h.wrap_count as u32 - 1) * physical + p as u32)
        .min()
        .unwrap_or(current);
    Ok((current, earliest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::{FlashRingBackend, MemFlash};

    const BLOCK_SIZE: usize = 32;

    fn ring(blocks: u32, erase_blocks: u32) -> DataLogger<FlashRingBackend<MemFlash>> {
        let flash = MemFlash::new(
            blocks as usize * BLOCK_SIZE,
            erase_blocks as usize * BLOCK_SIZE,
        );
        let backend = FlashRingBackend::new(flash, BLOCK_SIZE).expect("backend");
        DataLogger::new(backend).expect("logger")
    }

    fn payload(fill: u8) -> Vec<u8> {
        vec![fill; BLOCK_SIZE - BlockHeader::SIZE]
    }

    #[test]
    fn test_fresh_ring_is_empty() {
        let logger = ring(16, 4);
        assert_eq!(logger.current_block(), 0);
        assert_eq!(logger.earliest_block(), 0);
        assert_eq!(logger.boot_block(), 0);
    }

    #[test]
    fn test_write_read_roundtrip() {
        let mut logger = ring(16, 4);
        for i in 0..8u8 {
            logger.write(5, &payload(i)).expect("write");
        }
        assert_eq!(logger.current_block(), 8);
        assert_eq!(logger.bytes_logged(), 8 * (BLOCK_SIZE as u32 - 2));

        let mut block = vec![0u8; BLOCK_SIZE];
        logger.read(3, 0, &mut block).expect("read");
        let header = BlockHeader::read_from(&block);
        assert_eq!(header.wrap_count, 1);
        assert_eq!(header.block_type, 5);
        assert!(block[2..].iter().all(|b| *b == 3));
    }

    #[test]
    fn test_ring_wrap_scenario() {
        // 16 physical blocks, 4-block erase unit, 48 writes
        let mut logger = ring(16, 4);
        for _ in 0..48 {
            logger.write(5, &payload(0xAA)).expect("write");
        }
        assert_eq!(logger.current_block(), 48);
        assert_eq!(logger.earliest_block(), 36);

        let mut block = vec![0u8; BLOCK_SIZE];
        logger.read(47, 0, &mut block).expect("read");
        assert_eq!(BlockHeader::read_from(&block).wrap_count, 3);

        // Reads below the reclaimed boundary fail
        assert_eq!(
            logger.read(35, 0, &mut block),
            Err(LoggerError::NotFound)
        );
    }

    #[test]
    fn test_reinit_recovers_head() {
        let flash = MemFlash::new(16 * BLOCK_SIZE, 4 * BLOCK_SIZE);
        let backend = FlashRingBackend::new(flash, BLOCK_SIZE).expect("backend");
        let mut logger = DataLogger::new(backend).expect("logger");
        for i in 0..48u8 {
            logger.write(5, &payload(i)).expect("write");
        }
        let backend = logger.into_backend();

        let mut logger = DataLogger::new(backend).expect("reinit");
        assert_eq!(logger.current_block(), 48);
        assert_eq!(logger.earliest_block(), 36);
        assert_eq!(logger.boot_block(), 48);

        // Head continues where the previous session stopped
        logger.write(5, &payload(0x55)).expect("write");
        let mut block = vec![0u8; BLOCK_SIZE];
        logger.read(48, 0, &mut block).expect("read");
        assert_eq!(BlockHeader::read_from(&block).wrap_count, 4);
    }

    #[test]
    fn test_erase_ahead_invariant() {
        // At all times the erase unit's worth of blocks past the head
        // is erased
        let mut logger = ring(16, 4);
        for step in 0..40u32 {
            logger.write(7, &payload(step as u8)).expect("write");
            let current = logger.current_block();
            for lba in current..current + 4 {
                let phys = lba % 16;
                let header = logger.backend_mut().read_header(phys).expect("header");
                assert!(header.is_erased(), "step {step} lba {lba} not erased");
            }
        }
    }

    #[test]
    fn test_wrap_crossing_read() {
        let mut logger = ring(8, 2);
        for i in 0..10u8 {
            logger.write(1, &payload(i)).expect("write");
        }
        // Blocks 6 and 7 map to physical 6 and 7; 8 maps to physical 0.
        // A read spanning LBAs 7..=8 crosses the partition end.
        let mut bytes = vec![0u8; 2 * BLOCK_SIZE];
        logger.read(7, 0, &mut bytes).expect("read");
        assert!(bytes[2..BLOCK_SIZE].iter().all(|b| *b == 7));
        assert!(bytes[BLOCK_SIZE + 2..].iter().all(|b| *b == 8));
    }

    #[test]
    fn test_erase_resets_pointers() {
        let mut logger = ring(16, 4);
        for _ in 0..10 {
            logger.write(5, &payload(1)).expect("write");
        }
        let before = logger.bytes_logged();
        let mut units = Vec::new();
        logger
            .erase(EraseMode::OnlyLogged, Some(&mut |count| units.push(count)))
            .expect("erase");
        // 10 blocks round up to 3 erase units
        assert_eq!(units, vec![4, 8, 12]);
        assert_eq!(logger.current_block(), 0);
        assert_eq!(logger.earliest_block(), 0);
        assert_eq!(logger.bytes_logged(), before);

        let mut block = vec![0u8; BLOCK_SIZE];
        assert_eq!(logger.read(0, 0, &mut block), Err(LoggerError::NotFound));
    }

    #[test]
    fn test_zeroed_head_block_is_corruption() {
        let mut flash = MemFlash::new(16 * BLOCK_SIZE, 4 * BLOCK_SIZE);
        {
            let backend = FlashRingBackend::new(flash.clone_contents(), BLOCK_SIZE)
                .expect("backend");
            let mut logger = DataLogger::new(backend).expect("logger");
            logger.write(5, &payload(1)).expect("write");
            flash = logger.into_backend().into_partition();
        }
        // Zero the written header
        flash.corrupt(0, &[0, 0]);
        let backend = FlashRingBackend::new(flash, BLOCK_SIZE).expect("backend");
        assert_eq!(
            DataLogger::new(backend).err(),
            Some(LoggerError::Invalid)
        );
    }

    #[test]
    fn test_bad_payload_length_rejected() {
        let mut logger = ring(16, 4);
        assert_eq!(
            logger.write(5, &[0u8; 4]),
            Err(LoggerError::Invalid)
        );
    }

    #[test]
    fn test_uneven_geometry_rejected() {
        // Erase unit does not divide the partition evenly
        let flash = MemFlash::new(10 * BLOCK_SIZE, 4 * BLOCK_SIZE);
        assert!(FlashRingBackend::new(flash, BLOCK_SIZE).is_err());
        // Block size does not divide the partition
        let flash = MemFlash::new(16 * BLOCK_SIZE + 7, 4 * BLOCK_SIZE);
        assert!(FlashRingBackend::new(flash, BLOCK_SIZE).is_err());
    }
}
