//! Key-value storage contract

use async_trait::async_trait;

use crate::error::StorageError;

/// Opaque key-value store
///
/// Keys are `/`-separated strings. Implementations must make every operation
/// on a single key linearizable; nothing is promised across keys.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;

    /// Replace the value at `key` only if it currently equals `expected`
    /// (`None` meaning absent). Returns whether the swap happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
    ) -> Result<bool, StorageError>;

    /// Remove `key`, returning whether it existed
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// Keys starting with `prefix`, sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}
