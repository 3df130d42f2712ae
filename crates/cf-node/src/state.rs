//! Shared node state

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cf_core::time::current_time_millis;
use cf_core::traits::{AuditEvent, EventLog, PresenceSink, RateLimiter, Recorder};
use cf_protocol::{NodeHeartbeat, PresenceUpdate};

/// Collaborators a node hands its sessions
#[derive(Clone)]
pub struct NodeServices {
    pub events: Arc<dyn EventLog>,
    pub recorder: Arc<dyn Recorder>,
    pub presence: Arc<dyn PresenceSink>,
    pub limiter: Arc<dyn RateLimiter>,
}

/// Identity and collaborators shared by every task on a node
pub struct NodeState {
    pub domain: String,
    pub host: String,
    /// Address advertised in node heartbeats
    pub advertise_address: String,
    pub services: NodeServices,
    seq: AtomicU64,
}

impl NodeState {
    pub fn new(
        domain: impl Into<String>,
        host: impl Into<String>,
        advertise_address: impl Into<String>,
        services: NodeServices,
    ) -> Self {
        Self {
            domain: domain.into(),
            host: host.into(),
            advertise_address: advertise_address.into(),
            services,
            seq: AtomicU64::new(0),
        }
    }

    /// Next presence sequence number; strictly increasing per node
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn node_heartbeat(&self) -> NodeHeartbeat {
        NodeHeartbeat {
            domain: self.domain.clone(),
            host: self.host.clone(),
            addr: self.advertise_address.clone(),
            sent_at: current_time_millis(),
            seq: self.next_seq(),
        }
    }

    pub async fn audit(&self, event: AuditEvent) {
        if let Err(e) = self.services.events.emit(event).await {
            tracing::warn!(error = %e, "Failed to record audit event");
        }
    }

    /// Publish without waiting. Receivers order snapshots by sequence, so
    /// concurrent publishes may land in any order.
    pub fn publish(&self, update: PresenceUpdate) {
        let sink = self.services.presence.clone();
        tokio::spawn(async move {
            if let Err(e) = sink.publish(update).await {
                tracing::debug!(error = %e, "Presence update not delivered");
            }
        });
    }
}

impl std::fmt::Debug for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeState")
            .field("domain", &self.domain)
            .field("host", &self.host)
            .finish()
    }
}
