//! In-process key-value store

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::StorageError;
use crate::traits::KeyValueStore;

/// Key-value store held in memory. Each key lives in one shard, so single-key
/// operations are atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
    ) -> Result<bool, StorageError> {
        let swapped = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if expected == Some(entry.get().as_slice()) {
                    entry.insert(value);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(entry) => {
                if expected.is_none() {
                    entry.insert(value);
                    true
                } else {
                    false
                }
            }
        };
        Ok(swapped)
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryStore::new();
        store.put("users/bob", b"one".to_vec()).await.unwrap();

        assert_eq!(store.get("users/bob").await.unwrap(), Some(b"one".to_vec()));
        assert!(store.delete("users/bob").await.unwrap());
        assert!(!store.delete("users/bob").await.unwrap());
        assert_eq!(store.get("users/bob").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let store = MemoryStore::new();

        assert!(store.compare_and_swap("k", None, b"a".to_vec()).await.unwrap());
        assert!(!store.compare_and_swap("k", None, b"b".to_vec()).await.unwrap());
        assert!(!store.compare_and_swap("k", Some(b"x"), b"b".to_vec()).await.unwrap());
        assert!(store.compare_and_swap("k", Some(b"a"), b"b".to_vec()).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some(b"b".to_vec()));
    }

    #[tokio::test]
    async fn test_list_by_prefix_sorted() {
        let store = MemoryStore::new();
        store.put("users/carol", vec![]).await.unwrap();
        store.put("users/alice", vec![]).await.unwrap();
        store.put("tokens/x", vec![]).await.unwrap();

        assert_eq!(
            store.list("users/").await.unwrap(),
            vec!["users/alice".to_string(), "users/carol".to_string()]
        );
    }
}
