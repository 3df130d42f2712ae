//! Session recording sinks

use async_trait::async_trait;
use dashmap::DashMap;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

use crate::error::StorageError;
use crate::traits::Recorder;
use crate::types::{is_valid_name, SessionId};

#[derive(Debug, Default, Clone)]
struct Recording {
    data: Vec<u8>,
    finalized: bool,
}

/// Keeps recordings in memory
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    recordings: DashMap<SessionId, Recording>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes recorded so far for a session
    pub fn recording(&self, session_id: &SessionId) -> Option<Vec<u8>> {
        self.recordings.get(session_id).map(|r| r.data.clone())
    }

    pub fn is_finalized(&self, session_id: &SessionId) -> bool {
        self.recordings
            .get(session_id)
            .map(|r| r.finalized)
            .unwrap_or(false)
    }
}

#[async_trait]
impl Recorder for MemoryRecorder {
    async fn write(&self, session_id: &SessionId, chunk: &[u8]) -> Result<(), StorageError> {
        self.recordings
            .entry(session_id.clone())
            .or_default()
            .data
            .extend_from_slice(chunk);
        Ok(())
    }

    async fn finalize(&self, session_id: &SessionId) -> Result<(), StorageError> {
        self.recordings.entry(session_id.clone()).or_default().finalized = true;
        Ok(())
    }
}

/// Appends each session to `<dir>/<session_id>.part`, renamed to `.rec` on finalize
#[derive(Debug)]
pub struct FileRecorder {
    dir: PathBuf,
}

impl FileRecorder {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path(&self, session_id: &SessionId, ext: &str) -> Result<PathBuf, StorageError> {
        if !is_valid_name(session_id.as_str()) {
            return Err(StorageError::InvalidKey(session_id.to_string()));
        }
        Ok(self.dir.join(format!("{}.{}", session_id, ext)))
    }
}

#[async_trait]
impl Recorder for FileRecorder {
    async fn write(&self, session_id: &SessionId, chunk: &[u8]) -> Result<(), StorageError> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(session_id, "part")?)
            .await?;
        file.write_all(chunk).await?;
        file.flush().await?;
        Ok(())
    }

    async fn finalize(&self, session_id: &SessionId) -> Result<(), StorageError> {
        let part = self.path(session_id, "part")?;
        let done = self.path(session_id, "rec")?;
        match tokio::fs::rename(&part, &done).await {
            Ok(()) => Ok(()),
            // Nothing was ever written
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tokio::fs::write(&done, b"").await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_recorder_orders_chunks() {
        let recorder = MemoryRecorder::new();
        let id = SessionId::new("s1");

        recorder.write(&id, b"hello ").await.unwrap();
        recorder.write(&id, b"world").await.unwrap();
        assert!(!recorder.is_finalized(&id));
        recorder.finalize(&id).await.unwrap();

        assert_eq!(recorder.recording(&id).unwrap(), b"hello world");
        assert!(recorder.is_finalized(&id));
    }

    #[tokio::test]
    async fn test_file_recorder_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = FileRecorder::new(dir.path()).unwrap();
        let id = SessionId::new("s1");

        recorder.write(&id, b"abc").await.unwrap();
        recorder.write(&id, b"def").await.unwrap();
        recorder.finalize(&id).await.unwrap();

        assert_eq!(std::fs::read(dir.path().join("s1.rec")).unwrap(), b"abcdef");
        assert!(!dir.path().join("s1.part").exists());
    }

    #[tokio::test]
    async fn test_file_recorder_rejects_bad_ids() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = FileRecorder::new(dir.path()).unwrap();
        assert!(recorder.write(&SessionId::new("../x"), b"a").await.is_err());
    }
}
