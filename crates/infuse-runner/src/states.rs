// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Application state registry
//!
//! A 512-bit shared bitmap of application states. Schedules reference
//! bits by index in their start and terminate predicates; the runner
//! samples the whole map once per tick so every predicate in the tick
//! sees the same snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

/// Number of addressable state bits
pub const STATE_BITS: u16 = 512;

/// Device is about to reboot; no task may start and every task must
/// terminate
pub const STATE_REBOOTING: u16 = 510;
/// Application-defined "active" mode consulted by schedule validity
pub const STATE_APPLICATION_ACTIVE: u16 = 511;

const WORDS: usize = STATE_BITS as usize / 64;

/// Shared atomic state bitmap
#[derive(Default)]
pub struct StateRegistry {
    words: [AtomicU64; WORDS],
}

impl StateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, bit: u16) {
        if bit < STATE_BITS {
            self.words[bit as usize / 64].fetch_or(1 << (bit % 64), Ordering::SeqCst);
        }
    }

    pub fn clear(&self, bit: u16) {
        if bit < STATE_BITS {
            self.words[bit as usize / 64].fetch_and(!(1 << (bit % 64)), Ordering::SeqCst);
        }
    }

    pub fn test(&self, bit: u16) -> bool {
        bit < STATE_BITS
            && self.words[bit as usize / 64].load(Ordering::SeqCst) & (1 << (bit % 64)) != 0
    }

    /// Consistent-enough copy for one scheduler tick
    pub fn snapshot(&self) -> StateSnapshot {
        let mut words = [0u64; WORDS];
        for (out, word) in words.iter_mut().zip(&self.words) {
            *out = word.load(Ordering::SeqCst);
        }
        StateSnapshot { words }
    }
}

/// Point-in-time copy of the state bitmap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateSnapshot {
    words: [u64; WORDS],
}

impl StateSnapshot {
    pub fn test(&self, bit: u16) -> bool {
        bit < STATE_BITS && self.words[bit as usize / 64] & (1 << (bit % 64)) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_clear_test() {
        let states = StateRegistry::new();
        assert!(!states.test(10));
        states.set(10);
        states.set(511);
        assert!(states.test(10));
        assert!(states.test(STATE_APPLICATION_ACTIVE));
        states.clear(10);
        assert!(!states.test(10));
        // Out-of-range bits read as clear and ignore writes
        states.set(512);
        assert!(!states.test(512));
    }

    #[test]
    fn test_snapshot_is_stable() {
        let states = StateRegistry::new();
        states.set(3);
        states.set(64);
        let snapshot = states.snapshot();
        states.clear(3);
        assert!(snapshot.test(3));
        assert!(snapshot.test(64));
        assert!(!snapshot.test(4));
        assert!(!states.test(3));
    }
}
