// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Declared-slot key/value store
//!
//! Persistent configuration storage with an access-control table fixed
//! at construction: only declared key slots can be read or written, and
//! per-slot flags gate the direction of access. Value changes fan out to
//! registered callbacks, and slots marked for reflection feed a CRC
//! array that summarises the store state independently of write order.
//!
//! The physical medium sits behind the [`KvBackend`] trait;
//! [`MemoryBackend`] and the JSON snapshot [`FileBackend`] are provided.

mod backend;
mod reflect;
mod store;

pub use backend::{FileBackend, KvBackend, MemoryBackend};
pub use reflect::Reflection;
pub use store::{ChangeCallback, KvError, KvFlags, KvStore, SlotDefinition};
