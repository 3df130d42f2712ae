//! Session recording contract

use async_trait::async_trait;

use crate::error::StorageError;
use crate::types::SessionId;

/// Ordered byte stream per interactive session
///
/// Chunks for one session arrive from a single writer in production order.
/// `finalize` is called exactly once, when the session closes.
#[async_trait]
pub trait Recorder: Send + Sync {
    async fn write(&self, session_id: &SessionId, chunk: &[u8]) -> Result<(), StorageError>;

    async fn finalize(&self, session_id: &SessionId) -> Result<(), StorageError>;
}
