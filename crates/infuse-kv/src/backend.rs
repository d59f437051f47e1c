// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Storage backends
//!
//! The store core is medium-agnostic: anything that can map u16 keys to
//! byte blobs works. [`MemoryBackend`] backs tests and volatile use,
//! [`FileBackend`] keeps a JSON snapshot on disk so store contents
//! survive a process restart.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::store::KvError;

/// Physical storage seam for the KV store
pub trait KvBackend: Send {
    /// Value for `key`, `None` when never written or deleted
    fn read(&self, key: u16) -> Result<Option<Vec<u8>>, KvError>;
    fn write(&mut self, key: u16, data: &[u8]) -> Result<(), KvError>;
    /// Remove `key`. Deleting an absent key is not an error.
    fn delete(&mut self, key: u16) -> Result<(), KvError>;
    /// Remove every stored key
    fn clear(&mut self) -> Result<(), KvError>;
}

/// Volatile in-process backend
#[derive(Debug, Default)]
pub struct MemoryBackend {
    values: BTreeMap<u16, Vec<u8>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvBackend for MemoryBackend {
    fn read(&self, key: u16) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self.values.get(&key).cloned())
    }

    fn write(&mut self, key: u16, data: &[u8]) -> Result<(), KvError> {
        self.values.insert(key, data.to_vec());
        Ok(())
    }

    fn delete(&mut self, key: u16) -> Result<(), KvError> {
        self.values.remove(&key);
        Ok(())
    }

    fn clear(&mut self) -> Result<(), KvError> {
        self.values.clear();
        Ok(())
    }
}

/// Backend persisting a JSON snapshot after every mutation
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    values: BTreeMap<u16, Vec<u8>>,
}

impl FileBackend {
    /// Open a snapshot file, loading existing contents when present
    pub fn open(path: impl AsRef<Path>) -> Result<Self, KvError> {
        let path = path.as_ref().to_path_buf();
        let values = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| KvError::Storage(format!("corrupt snapshot: {e}")))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(KvError::Storage(e.to_string())),
        };
        Ok(FileBackend { path, values })
    }

    fn persist(&self) -> Result<(), KvError> {
        let bytes = serde_json::to_vec(&self.values)
            .map_err(|e| KvError::Storage(e.to_string()))?;
        fs::write(&self.path, bytes).map_err(|e| KvError::Storage(e.to_string()))
    }
}

impl KvBackend for FileBackend {
    fn read(&self, key: u16) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self.values.get(&key).cloned())
    }

    fn write(&mut self, key: u16, data: &[u8]) -> Result<(), KvError> {
        self.values.insert(key, data.to_vec());
        self.persist()
    }

    fn delete(&mut self, key: u16) -> Result<(), KvError> {
        if self.values.remove(&key).is_some() {
            self.persist()?;
        }
        Ok(())
    }

    fn clear(&mut self) -> Result<(), KvError> {
        self.values.clear();
        self.persist()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_backend_basic() {
        let mut backend = MemoryBackend::new();
        assert_eq!(backend.read(1).expect("read"), None);
        backend.write(1, &[1, 2, 3]).expect("write");
        assert_eq!(backend.read(1).expect("read"), Some(vec![1, 2, 3]));
        backend.delete(1).expect("delete");
        assert_eq!(backend.read(1).expect("read"), None);
        // Deleting again is fine
        backend.delete(1).expect("delete absent");
    }

    #[test]
    fn test_file_backend_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("kv.json");

        let mut backend = FileBackend::open(&path).expect("open");
        backend.write(10, &[0xAA]).expect("write");
        backend.write(11, &[0xBB, 0xCC]).expect("write");
        backend.delete(10).expect("delete");
        drop(backend);

        let backend = FileBackend::open(&path).expect("reopen");
        assert_eq!(backend.read(10).expect("read"), None);
        assert_eq!(backend.read(11).expect("read"), Some(vec![0xBB, 0xCC]));
    }

    #[test]
    fn test_file_backend_rejects_corrupt_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("kv.json");
        fs::write(&path, b"not json").expect("write");
        assert!(FileBackend::open(&path).is_err());
    }
}
