//! Envelope/blob cache (`kv`) — reader/writer store for replication
//! envelopes and ancillary byte blobs (`spec.md` §5), grounded in the
//! teacher's `StorageBackend` trait and `MemoryStorage` implementation.

use std::collections::HashMap;

use parking_lot::RwLock;

pub trait KvStore: Send + Sync {
    fn put(&self, key: &str, value: Vec<u8>);
    fn get(&self, key: &str) -> Option<Vec<u8>>;
    fn contains(&self, key: &str) -> bool;
    fn remove(&self, key: &str) -> Option<Vec<u8>>;
}

/// In-process cache. The spec does not require durability for this
/// store — durable state lives in the Chain Log, the chunks directory,
/// and the key-file directory; `Kv` is purely an acceleration cache for
/// envelopes and decrypted blobs (matching the teacher's in-memory
/// `MemoryStorage` default).
#[derive(Default)]
pub struct MemoryKv {
    inner: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKv {
    fn put(&self, key: &str, value: Vec<u8>) {
        self.inner.write().insert(key.to_string(), value);
    }

    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.read().get(key).cloned()
    }

    fn contains(&self, key: &str) -> bool {
        self.inner.read().contains_key(key)
    }

    fn remove(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.write().remove(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_roundtrips() {
        let kv = MemoryKv::new();
        kv.put("blob-1", vec![1, 2, 3]);
        assert_eq!(kv.get("blob-1"), Some(vec![1, 2, 3]));
    }

    #[test]
    fn missing_key_returns_none() {
        let kv = MemoryKv::new();
        assert_eq!(kv.get("missing"), None);
    }

    #[test]
    fn remove_clears_entry() {
        let kv = MemoryKv::new();
        kv.put("k", vec![9]);
        assert_eq!(kv.remove("k"), Some(vec![9]));
        assert!(!kv.contains("k"));
    }
}
