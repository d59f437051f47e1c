// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Store core: slot table, access control, change callbacks

use std::fmt;
use std::ops::BitOr;

use parking_lot::Mutex;
use thiserror::Error;

use crate::backend::KvBackend;
use crate::reflect::Reflection;

/// KV store errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KvError {
    /// Key is not covered by any declared slot
    #[error("key not declared")]
    NoAccess,
    /// Slot flags forbid the operation
    #[error("access denied by slot flags")]
    Denied,
    /// Key declared but holds no value
    #[error("value not found")]
    NotFound,
    /// Slot table is malformed
    #[error("invalid slot table")]
    Invalid,
    /// Backend failure
    #[error("storage error: {0}")]
    Storage(String),
}

/// Per-slot access flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KvFlags(u8);

impl KvFlags {
    pub const NONE: KvFlags = KvFlags(0);
    /// Slot participates in the reflection CRC array
    pub const REFLECT: KvFlags = KvFlags(1 << 0);
    /// Slot may be written but never read back
    pub const WRITE_ONLY: KvFlags = KvFlags(1 << 1);
    /// Slot may be read but never written or deleted
    pub const READ_ONLY: KvFlags = KvFlags(1 << 2);

    pub fn contains(self, other: KvFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for KvFlags {
    type Output = KvFlags;

    fn bitor(self, rhs: KvFlags) -> KvFlags {
        KvFlags(self.0 | rhs.0)
    }
}

/// One entry of the access-control table, covering keys
/// `key ..= key + range`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotDefinition {
    pub key: u16,
    /// Number of additional consecutive keys the slot covers
    pub range: u16,
    pub flags: KvFlags,
}

impl SlotDefinition {
    pub const fn new(key: u16, flags: KvFlags) -> Self {
        SlotDefinition {
            key,
            range: 0,
            flags,
        }
    }

    pub const fn with_range(key: u16, range: u16, flags: KvFlags) -> Self {
        SlotDefinition { key, range, flags }
    }

    fn covers(&self, key: u16) -> bool {
        key >= self.key && u32::from(key) <= u32::from(self.key) + u32::from(self.range)
    }
}

/// Value-changed subscriber, invoked with the key and new value (empty
/// on delete)
pub type ChangeCallback = Box<dyn FnMut(u16, &[u8]) + Send>;

struct Inner {
    backend: Box<dyn KvBackend>,
    slots: Vec<SlotDefinition>,
    callbacks: Vec<ChangeCallback>,
    reflect: Reflection,
}

/// Declared-slot key/value store
///
/// All operations take an internal lock; change callbacks run on the
/// writing thread while the lock is held, so they must not reenter the
/// store.
pub struct KvStore {
    inner: Mutex<Inner>,
}

impl fmt::Debug for KvStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KvStore").finish_non_exhaustive()
    }
}

impl KvStore {
    /// Build a store over `backend` with a fixed slot table.
    ///
    /// Reflection CRCs for values already present in the backend are
    /// computed here, so a freshly opened store reports the same CRCs as
    /// the store that wrote them.
    pub fn new(slots: Vec<SlotDefinition>, backend: Box<dyn KvBackend>) -> Result<Self, KvError> {
        let mut reflect_keys = Vec::new();
        for (idx, slot) in slots.iter().enumerate() {
            if slot
                .flags
                .contains(KvFlags::WRITE_ONLY | KvFlags::READ_ONLY)
            {
                return Err(KvError::Invalid);
            }
            if u32::from(slot.key) + u32::from(slot.range) > u32::from(u16::MAX) {
                return Err(KvError::Invalid);
            }
            for other in &slots[..idx] {
                if other.covers(slot.key) || slot.covers(other.key) {
                    return Err(KvError::Invalid);
                }
            }
            if slot.flags.contains(KvFlags::REFLECT) {
                reflect_keys.extend(slot.key..=slot.key + slot.range);
            }
        }
        let mut reflect = Reflection::new(reflect_keys);
        reflect.recompute(&*backend)?;
        log::info!(
            "kv store: {} slots, {} reflected keys",
            slots.len(),
            reflect.len()
        );
        Ok(KvStore {
            inner: Mutex::new(Inner {
                backend,
                slots,
                callbacks: Vec::new(),
                reflect,
            }),
        })
    }

    /// Register a value-changed callback. Deletes report an empty value.
    pub fn register_callback(&self, callback: ChangeCallback) {
        self.inner.lock().callbacks.push(callback);
    }

    /// Whether `key` is covered by a declared slot
    pub fn key_enabled(&self, key: u16) -> bool {
        self.inner.lock().slots.iter().any(|s| s.covers(key))
    }

    pub fn read(&self, key: u16) -> Result<Vec<u8>, KvError> {
        let inner = self.inner.lock();
        let slot = find_slot(&inner.slots, key)?;
        if slot.flags.contains(KvFlags::WRITE_ONLY) {
            return Err(KvError::Denied);
        }
        inner.backend.read(key)?.ok_or(KvError::NotFound)
    }

    /// Read `key`, storing and returning `fallback` when it holds no
    /// value yet
    pub fn read_fallback(&self, key: u16, fallback: &[u8]) -> Result<Vec<u8>, KvError> {
        let mut inner = self.inner.lock();
        let slot = find_slot(&inner.slots, key)?;
        if slot.flags.contains(KvFlags::WRITE_ONLY) {
            return Err(KvError::Denied);
        }
        match inner.backend.read(key)? {
            Some(value) => Ok(value),
            None => {
                inner.write_value(key, fallback)?;
                Ok(fallback.to_vec())
            }
        }
    }

    pub fn write(&self, key: u16, data: &[u8]) -> Result<(), KvError> {
        let mut inner = self.inner.lock();
        let slot = find_slot(&inner.slots, key)?;
        if slot.flags.contains(KvFlags::READ_ONLY) {
            return Err(KvError::Denied);
        }
        // Unchanged values skip the physical write and callbacks
        if inner.backend.read(key)?.as_deref() == Some(data) {
            return Ok(());
        }
        inner.write_value(key, data)
    }

    pub fn delete(&self, key: u16) -> Result<(), KvError> {
        let mut inner = self.inner.lock();
        let slot = find_slot(&inner.slots, key)?;
        if slot.flags.contains(KvFlags::READ_ONLY) {
            return Err(KvError::Denied);
        }
        if inner.backend.read(key)?.is_none() {
            return Err(KvError::NotFound);
        }
        inner.backend.delete(key)?;
        inner.reflect.zero(key);
        log::debug!("kv delete key {key}");
        inner.notify(key, &[]);
        Ok(())
    }

    /// Wipe the backend and rebuild reflection state
    pub fn reset(&self) -> Result<(), KvError> {
        let mut inner = self.inner.lock();
        inner.backend.clear()?;
        let Inner {
            backend, reflect, ..
        } = &mut *inner;
        reflect.recompute(&**backend)?;
        log::info!("kv store reset");
        Ok(())
    }

    /// Per-key reflection CRCs in slot-declaration order
    pub fn reflect_crcs(&self) -> Vec<u32> {
        self.inner.lock().reflect.slot_crcs().to_vec()
    }

    /// CRC-32 over the reflection array
    pub fn reflect_global_crc(&self) -> u32 {
        self.inner.lock().reflect.global_crc()
    }
}

impl Inner {
    fn write_value(&mut self, key: u16, data: &[u8]) -> Result<(), KvError> {
        self.backend.write(key, data)?;
        self.reflect.update(key, data);
        log::debug!("kv write key {key} ({} bytes)", data.len());
        self.notify(key, data);
        Ok(())
    }

    fn notify(&mut self, key: u16, data: &[u8]) {
        for callback in &mut self.callbacks {
            callback(key, data);
        }
    }
}

fn find_slot(slots: &[SlotDefinition], key: u16) -> Result<&SlotDefinition, KvError> {
    slots.iter().find(|s| s.covers(key)).ok_or(KvError::NoAccess)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FileBackend, MemoryBackend};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const KEY_CONFIG: u16 = 0x10;
    const KEY_SECRET: u16 = 0x20;
    const KEY_SERIAL: u16 = 0x30;
    const KEY_ARRAY: u16 = 0x40;

    fn test_slots() -> Vec<SlotDefinition> {
        vec![
            SlotDefinition::new(KEY_CONFIG, KvFlags::REFLECT),
            SlotDefinition::new(KEY_SECRET, KvFlags::WRITE_ONLY),
            SlotDefinition::new(KEY_SERIAL, KvFlags::READ_ONLY),
            SlotDefinition::with_range(KEY_ARRAY, 3, KvFlags::REFLECT),
        ]
    }

    fn test_store() -> KvStore {
        KvStore::new(test_slots(), Box::new(MemoryBackend::new())).expect("store")
    }

    #[test]
    fn test_undeclared_key_no_access() {
        let store = test_store();
        assert_eq!(store.read(0x99), Err(KvError::NoAccess));
        assert_eq!(store.write(0x99, &[1]), Err(KvError::NoAccess));
        assert_eq!(store.delete(0x99), Err(KvError::NoAccess));
        assert!(!store.key_enabled(0x99));
        assert!(store.key_enabled(KEY_CONFIG));
        // Range slots cover all their keys
        assert!(store.key_enabled(KEY_ARRAY + 3));
        assert!(!store.key_enabled(KEY_ARRAY + 4));
    }

    #[test]
    fn test_flag_enforcement() {
        let store = test_store();
        store.write(KEY_SECRET, &[1, 2]).expect("write-only write");
        assert_eq!(store.read(KEY_SECRET), Err(KvError::Denied));
        assert_eq!(store.write(KEY_SERIAL, &[1]), Err(KvError::Denied));
        assert_eq!(store.delete(KEY_SERIAL), Err(KvError::Denied));
    }

    #[test]
    fn test_unchanged_write_skips_callbacks() {
        let store = test_store();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        store.register_callback(Box::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        store.write(KEY_CONFIG, &[5, 6]).expect("write");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        store.write(KEY_CONFIG, &[5, 6]).expect("unchanged write");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        store.write(KEY_CONFIG, &[5, 7]).expect("changed write");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_delete_notifies_empty() {
        let store = test_store();
        let last: Arc<Mutex<Option<(u16, Vec<u8>)>>> = Arc::new(Mutex::new(None));
        let sink = last.clone();
        store.register_callback(Box::new(move |key, data| {
            *sink.lock() = Some((key, data.to_vec()));
        }));

        assert_eq!(store.delete(KEY_CONFIG), Err(KvError::NotFound));
        store.write(KEY_CONFIG, &[1]).expect("write");
        store.delete(KEY_CONFIG).expect("delete");
        assert_eq!(*last.lock(), Some((KEY_CONFIG, Vec::new())));
        assert_eq!(store.read(KEY_CONFIG), Err(KvError::NotFound));
    }

    #[test]
    fn test_read_fallback_writes_once() {
        let store = test_store();
        let value = store.read_fallback(KEY_CONFIG, &[9, 9]).expect("fallback");
        assert_eq!(value, vec![9, 9]);
        assert_eq!(store.read(KEY_CONFIG).expect("read"), vec![9, 9]);

        store.write(KEY_CONFIG, &[1]).expect("write");
        let value = store.read_fallback(KEY_CONFIG, &[9, 9]).expect("read");
        assert_eq!(value, vec![1]);
    }

    #[test]
    fn test_reflection_order_invariance() {
        let a = test_store();
        a.write(KEY_CONFIG, &[1, 2]).expect("write");
        a.write(KEY_ARRAY + 1, &[3]).expect("write");
        a.write(KEY_ARRAY, &[4]).expect("write");

        let b = test_store();
        b.write(KEY_ARRAY, &[4]).expect("write");
        b.write(KEY_CONFIG, &[7]).expect("write");
        b.write(KEY_ARRAY + 1, &[3]).expect("write");
        b.write(KEY_CONFIG, &[1, 2]).expect("rewrite");

        assert_eq!(a.reflect_crcs(), b.reflect_crcs());
        assert_eq!(a.reflect_global_crc(), b.reflect_global_crc());

        // Deleting a reflected key diverges the summary, rewriting the
        // same value restores it
        b.delete(KEY_ARRAY).expect("delete");
        assert_ne!(a.reflect_global_crc(), b.reflect_global_crc());
        b.write(KEY_ARRAY, &[4]).expect("rewrite");
        assert_eq!(a.reflect_global_crc(), b.reflect_global_crc());
    }

    #[test]
    fn test_non_reflected_writes_do_not_change_summary() {
        let store = test_store();
        let initial = store.reflect_global_crc();
        store.write(KEY_SECRET, &[1, 2, 3]).expect("write");
        assert_eq!(store.reflect_global_crc(), initial);
    }

    #[test]
    fn test_reflection_rebuilt_on_open() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("kv.json");

        let store = KvStore::new(
            test_slots(),
            Box::new(FileBackend::open(&path).expect("open")),
        )
        .expect("store");
        store.write(KEY_CONFIG, &[1, 2]).expect("write");
        store.write(KEY_ARRAY + 2, &[8]).expect("write");
        let crc = store.reflect_global_crc();
        drop(store);

        let store = KvStore::new(
            test_slots(),
            Box::new(FileBackend::open(&path).expect("reopen")),
        )
        .expect("store");
        assert_eq!(store.reflect_global_crc(), crc);
    }

    #[test]
    fn test_reset_wipes_values_and_summary() {
        let store = test_store();
        let empty = store.reflect_global_crc();
        store.write(KEY_CONFIG, &[1]).expect("write");
        assert_ne!(store.reflect_global_crc(), empty);

        store.reset().expect("reset");
        assert_eq!(store.read(KEY_CONFIG), Err(KvError::NotFound));
        assert_eq!(store.reflect_global_crc(), empty);
    }

    #[test]
    fn test_invalid_slot_tables_rejected() {
        // Overlapping slots
        let slots = vec![
            SlotDefinition::with_range(10, 4, KvFlags::NONE),
            SlotDefinition::new(12, KvFlags::NONE),
        ];
        assert!(KvStore::new(slots, Box::new(MemoryBackend::new())).is_err());

        // Contradictory flags
        let slots = vec![SlotDefinition::new(
            10,
            KvFlags::WRITE_ONLY | KvFlags::READ_ONLY,
        )];
        assert!(KvStore::new(slots, Box::new(MemoryBackend::new())).is_err());
    }
}
