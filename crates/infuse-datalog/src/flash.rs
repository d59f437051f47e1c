// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Flash ring backend
//!
//! [`FlashRingBackend`] maps the block logger contract onto a raw flash
//! partition behind the [`FlashPartition`] trait. [`MemFlash`] simulates
//! a partition in RAM for tests and host tooling.

use crate::error::LoggerError;
use crate::logger::{BlockHeader, LoggerBackend};

/// Flash erase value
pub(crate) const ERASE_VALUE: u8 = 0xFF;

/// Raw flash partition access
pub trait FlashPartition: Send {
    /// Partition size in bytes
    fn size(&self) -> usize;
    /// Erase granularity in bytes
    fn erase_size(&self) -> usize;
    fn read(&self, offset: usize, out: &mut [u8]) -> Result<(), LoggerError>;
    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), LoggerError>;
    /// Erase `len` bytes at `offset`; both must be erase-size aligned
    fn erase(&mut self, offset: usize, len: usize) -> Result<(), LoggerError>;
}

/// RAM-backed flash partition
#[derive(Debug, Clone)]
pub struct MemFlash {
    data: Vec<u8>,
    erase_size: usize,
}

impl MemFlash {
    pub fn new(size: usize, erase_size: usize) -> Self {
        MemFlash {
            data: vec![ERASE_VALUE; size],
            erase_size,
        }
    }

    /// Snapshot for re-init tests
    pub fn clone_contents(&self) -> MemFlash {
        self.clone()
    }

    /// Overwrite raw bytes, bypassing the write path
    pub fn corrupt(&mut self, offset: usize, bytes: &[u8]) {
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}

impl FlashPartition for MemFlash {
    fn size(&self) -> usize {
        self.data.len()
    }

    fn erase_size(&self) -> usize {
        self.erase_size
    }

    fn read(&self, offset: usize, out: &mut [u8]) -> Result<(), LoggerError> {
        let end = offset + out.len();
        if end > self.data.len() {
            return Err(LoggerError::Invalid);
        }
        out.copy_from_slice(&self.data[offset..end]);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), LoggerError> {
        let end = offset + data.len();
        if end > self.data.len() {
            return Err(LoggerError::Invalid);
        }
        self.data[offset..end].copy_from_slice(data);
        Ok(())
    }

    fn erase(&mut self, offset: usize, len: usize) -> Result<(), LoggerError> {
        if offset % self.erase_size != 0
            || len % self.erase_size != 0
            || offset + len > self.data.len()
        {
            return Err(LoggerError::Invalid);
        }
        self.data[offset..offset + len].fill(ERASE_VALUE);
        Ok(())
    }
}

/// Block logger backend over a flash partition
pub struct FlashRingBackend<P: FlashPartition> {
    partition: P,
    block_size: usize,
    physical_blocks: u32,
    erase_blocks: u32,
}

impl<P: FlashPartition> FlashRingBackend<P> {
    /// Validate geometry: block size must divide the partition, and the
    /// erase unit and block size must divide each other
    pub fn new(partition: P, block_size: usize) -> Result<Self, LoggerError> {
        let size = partition.size();
        let erase_size = partition.erase_size();
        if block_size <= BlockHeader::SIZE
            || size == 0
            || size % block_size != 0
            || erase_size == 0
            || size % erase_size != 0
        {
            return Err(LoggerError::Invalid);
        }
        let erase_blocks = if erase_size >= block_size {
            if erase_size % block_size != 0 {
                return Err(LoggerError::Invalid);
            }
            (erase_size / block_size) as u32
        } else {
            if block_size % erase_size != 0 {
                return Err(LoggerError::Invalid);
            }
            1
        };
        Ok(FlashRingBackend {
            physical_blocks: (size / block_size) as u32,
            partition,
            block_size,
            erase_blocks,
        })
    }

    pub fn into_partition(self) -> P {
        self.partition
    }
}

impl<P: FlashPartition> LoggerBackend for FlashRingBackend<P> {
    fn logical_blocks(&self) -> u32 {
        u32::MAX
    }

    fn physical_blocks(&self) -> u32 {
        self.physical_blocks
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_overhead(&self) -> usize {
        BlockHeader::SIZE
    }

    fn erase_blocks(&self) -> u32 {
        self.erase_blocks
    }

    fn persistent(&self) -> bool {
        true
    }

    fn read_header(&mut self, phys: u32) -> Result<BlockHeader, LoggerError> {
        let mut bytes = [0u8; BlockHeader::SIZE];
        self.partition
            .read(phys as usize * self.block_size, &mut bytes)?;
        Ok(BlockHeader::read_from(&bytes))
    }

    fn write_block(
        &mut self,
        phys: u32,
        header: BlockHeader,
        payload: &[u8],
    ) -> Result<(), LoggerError> {
        let mut block = vec![ERASE_VALUE; self.block_size];
        header.write_to(&mut block);
        block[BlockHeader::SIZE..BlockHeader::SIZE + payload.len()].copy_from_slice(payload);
        self.partition.write(phys as usize * self.block_size, &block)
    }

    fn read(&mut self, phys: u32, offset: usize, out: &mut [u8]) -> Result<(), LoggerError> {
        self.partition
            .read(phys as usize * self.block_size + offset, out)
    }

    fn erase_range(&mut self, phys: u32, count: u32) -> Result<(), LoggerError> {
        self.partition.erase(
            phys as usize * self.block_size,
            count as usize * self.block_size,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_flash_erase_alignment() {
        let mut flash = MemFlash::new(256, 64);
        flash.write(0, &[0u8; 16]).expect("write");
        assert_eq!(flash.erase(16, 64), Err(LoggerError::Invalid));
        assert_eq!(flash.erase(0, 48), Err(LoggerError::Invalid));
        flash.erase(0, 64).expect("aligned erase");
        let mut bytes = [0u8; 16];
        flash.read(0, &mut bytes).expect("read");
        assert!(bytes.iter().all(|b| *b == ERASE_VALUE));
    }

    #[test]
    fn test_backend_pads_short_payload() {
        let flash = MemFlash::new(256, 64);
        let mut backend = FlashRingBackend::new(flash, 32).expect("backend");
        let header = BlockHeader {
            wrap_count: 1,
            block_type: 9,
        };
        backend.write_block(0, header, &[1, 2, 3]).expect("write");

        assert_eq!(backend.read_header(0).expect("header"), header);
        let mut bytes = [0u8; 32];
        backend.read(0, 0, &mut bytes).expect("read");
        assert_eq!(&bytes[2..5], &[1, 2, 3]);
        assert!(bytes[5..].iter().all(|b| *b == ERASE_VALUE));
    }

    #[test]
    fn test_sub_block_erase_unit() {
        // 16-byte erase pages under 32-byte blocks collapse to a single
        // block per erase unit
        let flash = MemFlash::new(256, 16);
        let backend = FlashRingBackend::new(flash, 32).expect("backend");
        assert_eq!(backend.erase_blocks(), 1);
    }
}
