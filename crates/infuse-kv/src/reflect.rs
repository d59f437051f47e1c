// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Store reflection
//!
//! A compact summary of store contents for cheap remote comparison: one
//! CRC-32 per reflected key, held in slot-declaration order, plus a
//! global CRC over the array. Two stores holding the same values report
//! the same CRCs no matter the order the values were written in.

use crate::backend::KvBackend;
use crate::store::KvError;

/// Per-key CRC array over the reflected subset of the store
#[derive(Debug)]
pub struct Reflection {
    keys: Vec<u16>,
    crcs: Vec<u32>,
}

fn value_crc(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

impl Reflection {
    /// Track `keys`, which must already be in slot-declaration order
    pub fn new(keys: Vec<u16>) -> Self {
        let crcs = vec![0; keys.len()];
        Reflection { keys, crcs }
    }

    /// Number of reflected keys
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Recompute every entry by reading the backend, for use at init and
    /// after a reset
    pub fn recompute(&mut self, backend: &dyn KvBackend) -> Result<(), KvError> {
        for (idx, key) in self.keys.iter().enumerate() {
            self.crcs[idx] = match backend.read(*key)? {
                Some(data) => value_crc(&data),
                None => 0,
            };
        }
        Ok(())
    }

    /// Fold a value change into the array. Ignored for untracked keys.
    pub fn update(&mut self, key: u16, data: &[u8]) {
        if let Some(idx) = self.keys.iter().position(|k| *k == key) {
            self.crcs[idx] = value_crc(data);
        }
    }

    /// Zero the entry for a deleted key. Ignored for untracked keys.
    pub fn zero(&mut self, key: u16) {
        if let Some(idx) = self.keys.iter().position(|k| *k == key) {
            self.crcs[idx] = 0;
        }
    }

    /// Per-key CRCs in slot-declaration order
    pub fn slot_crcs(&self) -> &[u32] {
        &self.crcs
    }

    /// CRC-32 over the little-endian bytes of the per-key array
    pub fn global_crc(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        for crc in &self.crcs {
            hasher.update(&crc.to_le_bytes());
        }
        hasher.finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    #[test]
    fn test_update_and_zero() {
        let mut reflect = Reflection::new(vec![10, 11, 12]);
        let empty = reflect.global_crc();

        reflect.update(11, &[1, 2, 3]);
        assert_ne!(reflect.global_crc(), empty);
        assert_ne!(reflect.slot_crcs()[1], 0);
        assert_eq!(reflect.slot_crcs()[0], 0);

        reflect.zero(11);
        assert_eq!(reflect.global_crc(), empty);

        // Untracked keys are ignored
        reflect.update(99, &[1]);
        assert_eq!(reflect.global_crc(), empty);
    }

    #[test]
    fn test_recompute_matches_incremental() {
        let mut backend = MemoryBackend::new();
        backend.write(10, &[5, 6]).expect("write");
        backend.write(12, &[7]).expect("write");

        let mut incremental = Reflection::new(vec![10, 11, 12]);
        incremental.update(12, &[7]);
        incremental.update(10, &[5, 6]);

        let mut recomputed = Reflection::new(vec![10, 11, 12]);
        recomputed.recompute(&backend).expect("recompute");

        assert_eq!(incremental.slot_crcs(), recomputed.slot_crcs());
        assert_eq!(incremental.global_crc(), recomputed.global_crc());
    }
}
