//! Directory-backed key-value store
//!
//! Each key is a file under the root directory; `/` in keys maps to
//! subdirectories. Writes go through a temp file and a rename so readers never
//! see partial values. One process owns a directory at a time.

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::error::StorageError;
use crate::traits::KeyValueStore;
use crate::types::is_valid_name;

pub struct DirStore {
    root: PathBuf,
    /// Serialises writers so compare-and-swap is atomic
    write_lock: Mutex<()>,
}

impl DirStore {
    /// Open (creating if needed) a store rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        let mut path = self.root.clone();
        for segment in key.split('/') {
            if !is_valid_name(segment) {
                return Err(StorageError::InvalidKey(key.to_string()));
            }
            path.push(segment);
        }
        Ok(path)
    }

    async fn read(path: &Path) -> Result<Option<Vec<u8>>, StorageError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(path: &Path, value: &[u8]) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp~");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, value).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

fn collect_keys(dir: &Path, prefix: &str, keys: &mut Vec<String>) -> io::Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(".tmp~") {
            continue;
        }
        let key = if prefix.is_empty() {
            name
        } else {
            format!("{}/{}", prefix, name)
        };
        if entry.file_type()?.is_dir() {
            collect_keys(&entry.path(), &key, keys)?;
        } else {
            keys.push(key);
        }
    }
    Ok(())
}

#[async_trait]
impl KeyValueStore for DirStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Self::read(&self.path_for(key)?).await
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        let _guard = self.write_lock.lock().await;
        Self::write(&path, &value).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
    ) -> Result<bool, StorageError> {
        let path = self.path_for(key)?;
        let _guard = self.write_lock.lock().await;

        let current = Self::read(&path).await?;
        if current.as_deref() != expected {
            return Ok(false);
        }
        Self::write(&path, &value).await?;
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.path_for(key)?;
        let _guard = self.write_lock.lock().await;

        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let root = self.root.clone();
        let mut keys = tokio::task::spawn_blocking(move || {
            let mut keys = Vec::new();
            collect_keys(&root, "", &mut keys).map(|_| keys)
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;

        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = DirStore::open(dir.path()).unwrap();
            store.put("authorities/example.com/user", b"ca".to_vec()).await.unwrap();
        }

        let store = DirStore::open(dir.path()).unwrap();
        assert_eq!(
            store.get("authorities/example.com/user").await.unwrap(),
            Some(b"ca".to_vec())
        );
        assert_eq!(
            store.list("authorities/").await.unwrap(),
            vec!["authorities/example.com/user".to_string()]
        );
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::open(dir.path()).unwrap();

        assert!(store.compare_and_swap("users/bob", None, b"1".to_vec()).await.unwrap());
        assert!(!store.compare_and_swap("users/bob", None, b"2".to_vec()).await.unwrap());
        assert!(store
            .compare_and_swap("users/bob", Some(b"1"), b"2".to_vec())
            .await
            .unwrap());
        assert_eq!(store.get("users/bob").await.unwrap(), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn test_rejects_traversal_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::open(dir.path()).unwrap();

        assert!(matches!(
            store.put("users/../../etc", vec![]).await,
            Err(StorageError::InvalidKey(_))
        ));
        assert!(matches!(store.get("a//b").await, Err(StorageError::InvalidKey(_))));
    }

    #[tokio::test]
    async fn test_delete_missing_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::open(dir.path()).unwrap();
        assert!(!store.delete("sessions/none").await.unwrap());
    }
}
