//! Presence publishing contract

use async_trait::async_trait;
use cf_protocol::PresenceUpdate;

use crate::error::TunnelError;

/// Destination for node and session heartbeats
#[async_trait]
pub trait PresenceSink: Send + Sync {
    async fn publish(&self, update: PresenceUpdate) -> Result<(), TunnelError>;
}
