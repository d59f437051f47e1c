// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! KV-backed schedule tables
//!
//! Schedules live in a contiguous range of KV slots so they can be
//! overridden in the field. The base key holds a set identifier
//! combining a schema version with an application-chosen id; when the
//! stored identifier differs from the compiled one the compiled-in
//! defaults overwrite the KV copies, otherwise the KV copies override
//! the defaults. `Locked` schedules always use the compiled-in value.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use infuse_kv::{KvError, KvFlags, KvStore, SlotDefinition};

use crate::error::RunnerError;
use crate::schedule::{TaskSchedule, Validity};

/// Bumped whenever the serialized schedule layout changes
pub const SCHEDULE_SCHEMA_VERSION: u16 = 1;

/// Schedule storage over a declared KV slot range
pub struct ScheduleStore {
    kv: Arc<KvStore>,
    base_key: u16,
    capacity: u16,
}

impl ScheduleStore {
    /// `base_key` holds the set identifier; the following `capacity`
    /// keys hold one schedule each
    pub fn new(kv: Arc<KvStore>, base_key: u16, capacity: u16) -> Self {
        ScheduleStore {
            kv,
            base_key,
            capacity,
        }
    }

    /// Slot declaration covering the store's key range, for building the
    /// KV slot table
    pub fn slots(base_key: u16, capacity: u16) -> Vec<SlotDefinition> {
        vec![SlotDefinition::with_range(
            base_key,
            capacity,
            KvFlags::REFLECT,
        )]
    }

    fn slot_key(&self, idx: usize) -> u16 {
        self.base_key + 1 + idx as u16
    }

    /// Resolve the effective schedule table from compiled-in defaults
    /// and KV overrides
    pub fn load(
        &self,
        defaults: &[TaskSchedule],
        set_id: u16,
    ) -> Result<Vec<TaskSchedule>, RunnerError> {
        if defaults.len() > self.capacity as usize {
            return Err(RunnerError::Invalid);
        }
        let want = (u32::from(SCHEDULE_SCHEMA_VERSION) << 16) | u32::from(set_id);
        let stored = match self.kv.read(self.base_key) {
            Ok(bytes) if bytes.len() == 4 => {
                u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
            }
            Ok(_) => 0,
            Err(KvError::NotFound) => 0,
            Err(err) => return Err(err.into()),
        };
        if stored != want {
            log::info!("schedule set {stored:#010x} -> {want:#010x}, writing defaults");
            for (idx, schedule) in defaults.iter().enumerate() {
                self.save(idx, schedule)?;
            }
            for idx in defaults.len()..self.capacity as usize {
                match self.kv.delete(self.slot_key(idx)) {
                    Ok(()) | Err(KvError::NotFound) => {}
                    Err(err) => return Err(err.into()),
                }
            }
            self.kv.write(self.base_key, &want.to_le_bytes())?;
            return Ok(defaults.to_vec());
        }

        let mut resolved = Vec::with_capacity(defaults.len());
        for (idx, default) in defaults.iter().enumerate() {
            if default.validity == Validity::Locked {
                resolved.push(default.clone());
                continue;
            }
            match self.kv.read(self.slot_key(idx)) {
                Ok(bytes) => match serde_json::from_slice(&bytes) {
                    Ok(schedule) => resolved.push(schedule),
                    Err(err) => {
                        log::warn!("schedule slot {idx} unreadable ({err}), using default");
                        resolved.push(default.clone());
                    }
                },
                Err(KvError::NotFound) => resolved.push(default.clone()),
                Err(err) => return Err(err.into()),
            }
        }
        Ok(resolved)
    }

    /// Persist one schedule slot
    pub fn save(&self, idx: usize, schedule: &TaskSchedule) -> Result<(), RunnerError> {
        if idx >= self.capacity as usize {
            return Err(RunnerError::NotFound);
        }
        let bytes = serde_json::to_vec(schedule).map_err(|_| RunnerError::Invalid)?;
        self.kv.write(self.slot_key(idx), &bytes)?;
        Ok(())
    }

    /// Raise `flag` whenever any key in the store's range changes
    pub fn watch(&self, flag: Arc<AtomicBool>) {
        let lo = self.base_key;
        let hi = self.base_key + self.capacity;
        self.kv.register_callback(Box::new(move |key, _| {
            if (lo..=hi).contains(&key) {
                flag.store(true, Ordering::SeqCst);
            }
        }));
    }
}
