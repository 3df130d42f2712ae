//! Audit event sinks

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::StorageError;
use crate::time::current_time_millis;
use crate::traits::{AuditEvent, EventLog};

/// Writes audit events as structured log lines under the `audit` target
#[derive(Debug, Default)]
pub struct TracingEventLog;

#[async_trait]
impl EventLog for TracingEventLog {
    async fn emit(&self, event: AuditEvent) -> Result<(), StorageError> {
        let body = serde_json::to_string(&event)?;
        tracing::info!(target: "audit", time_ms = current_time_millis(), record = %body);
        Ok(())
    }
}

/// Keeps audit events in memory, in emission order
#[derive(Debug, Default)]
pub struct MemoryEventLog {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything emitted so far
    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn emit(&self, event: AuditEvent) -> Result<(), StorageError> {
        self.events.lock().await.push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_log_keeps_order() {
        let log = MemoryEventLog::new();
        log.emit(AuditEvent::UserSignup { user: "bob".into() })
            .await
            .unwrap();
        log.emit(AuditEvent::UserLogin {
            user: "bob".into(),
            success: true,
        })
        .await
        .unwrap();

        let events = log.events().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], AuditEvent::UserSignup { user: "bob".into() });
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_string(&AuditEvent::TunnelEvicted {
            site: "edge".into(),
            reason: "missed heartbeats".into(),
        })
        .unwrap();
        assert_eq!(
            json,
            r#"{"event":"tunnel_evicted","site":"edge","reason":"missed heartbeats"}"#
        );
    }
}
