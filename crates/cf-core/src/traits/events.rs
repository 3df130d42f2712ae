//! Audit event log contract

use async_trait::async_trait;
use serde::Serialize;

use crate::error::StorageError;

/// Authentication and session lifecycle events
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    UserLogin {
        user: String,
        success: bool,
    },
    UserSignup {
        user: String,
    },
    SessionStart {
        host: String,
        session_id: String,
        user: String,
        login: String,
    },
    SessionJoin {
        host: String,
        session_id: String,
        user: String,
        party_id: String,
    },
    SessionLeave {
        host: String,
        session_id: String,
        party_id: String,
    },
    SessionEnd {
        host: String,
        session_id: String,
        exit_code: Option<i32>,
    },
    SessionSpawnFailed {
        host: String,
        session_id: String,
        reason: String,
    },
    TunnelRegistered {
        site: String,
        host: String,
    },
    TunnelEvicted {
        site: String,
        reason: String,
    },
}

/// Append-only audit sink. The core never reads it back.
#[async_trait]
pub trait EventLog: Send + Sync {
    async fn emit(&self, event: AuditEvent) -> Result<(), StorageError>;
}
