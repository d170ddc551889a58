//! Key/value blob storage used to persist scheduler and store state across restarts.

use std::collections::HashMap;
use std::sync::Mutex;

/// Error reading or writing a persisted blob.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("invalid key: {0}")]
    InvalidKey(String),
}

/// Get/set of opaque serialized blobs under fixed keys.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;
}

/// In-memory store. Nothing survives the process.
#[derive(Default)]
pub struct MemoryKvStore {
    map: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self
            .map
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.map
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }
}

/// Load a bincode blob, falling back to `T::default()` when absent or unreadable.
pub fn load_or_default<T>(store: &dyn KvStore, key: &str) -> T
where
    T: serde::de::DeserializeOwned + Default,
{
    match store.get(key) {
        Ok(Some(bytes)) => match bincode::deserialize(&bytes) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(key, error = %e, "persisted blob unreadable; starting empty");
                T::default()
            }
        },
        Ok(None) => T::default(),
        Err(e) => {
            tracing::warn!(key, error = %e, "load failed; starting empty");
            T::default()
        }
    }
}

/// Serialize with bincode and write under `key`.
pub fn save<T: serde::Serialize>(store: &dyn KvStore, key: &str, value: &T) -> Result<(), StorageError> {
    let bytes = bincode::serialize(value)?;
    store.set(key, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_roundtrip() {
        let s = MemoryKvStore::new();
        assert!(s.get("k").unwrap().is_none());
        s.set("k", b"v").unwrap();
        assert_eq!(s.get("k").unwrap().as_deref(), Some(&b"v"[..]));
    }

    #[test]
    fn corrupt_blob_falls_back_to_default() {
        let s = MemoryKvStore::new();
        s.set("k", &[0xFF]).unwrap();
        let v: Vec<u64> = load_or_default(&s, "k");
        assert!(v.is_empty());
        save(&s, "k", &vec![1u64, 2]).unwrap();
        let v: Vec<u64> = load_or_default(&s, "k");
        assert_eq!(v, vec![1, 2]);
    }
}
