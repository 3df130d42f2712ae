//! Presence snapshots published by node agents
//!
//! Every snapshot is a complete description of its subject. Receivers keep
//! the newest snapshot per subject, ordered by `(sent_at, seq)`, and never
//! merge fields across snapshots.

use serde::{Deserialize, Serialize};

/// Lifecycle phase reported for an interactive session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionPhase {
    Open,
    Closed,
}

/// One participant as seen in a session snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartySnapshot {
    pub party_id: String,
    /// Authenticated user the party connected as
    pub user: String,
    /// Remote login the session runs under
    pub login: String,
    /// Join time, unix millis
    pub joined_at: u64,
}

/// Node liveness snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHeartbeat {
    pub domain: String,
    pub host: String,
    /// Address the node accepts direct connections on
    pub addr: String,
    /// Sender clock, unix millis
    pub sent_at: u64,
    /// Monotonic per-publisher sequence number
    pub seq: u64,
}

/// Interactive session snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHeartbeat {
    pub domain: String,
    pub host: String,
    pub session_id: String,
    pub phase: SessionPhase,
    pub parties: Vec<PartySnapshot>,
    /// Session creation time, unix millis
    pub created_at: u64,
    pub sent_at: u64,
    pub seq: u64,
}

/// Any presence snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceUpdate {
    Node(NodeHeartbeat),
    Session(SessionHeartbeat),
}

impl NodeHeartbeat {
    /// Ordering key for last-writer-wins replacement
    pub fn version(&self) -> (u64, u64) {
        (self.sent_at, self.seq)
    }
}

impl SessionHeartbeat {
    /// Ordering key for last-writer-wins replacement
    pub fn version(&self) -> (u64, u64) {
        (self.sent_at, self.seq)
    }
}
