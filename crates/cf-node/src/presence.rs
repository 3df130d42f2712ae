//! Presence publishing
//!
//! Snapshots travel on the control channel of the node's proxy link. When the
//! link is down they are dropped; the periodic publisher sends a full snapshot
//! of the node and every live session once the link is back.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use cf_core::mux::Mux;
use cf_core::traits::PresenceSink;
use cf_core::TunnelError;
use cf_protocol::{Message, PresenceUpdate};

use crate::session::SessionTable;

/// Closed session ids are remembered this many presence intervals
const TOMBSTONE_INTERVALS: u32 = 60;

/// Publishes over whatever proxy link is currently up
#[derive(Default)]
pub struct LinkPresence {
    link: RwLock<Option<Mux>>,
}

impl LinkPresence {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn attach(&self, mux: Mux) {
        *self.link.write().await = Some(mux);
    }

    pub async fn detach(&self) {
        *self.link.write().await = None;
    }
}

#[async_trait]
impl PresenceSink for LinkPresence {
    async fn publish(&self, update: PresenceUpdate) -> Result<(), TunnelError> {
        let link = self.link.read().await.clone();
        match link {
            Some(mux) if !mux.is_closed() => mux.send_control(Message::Presence(update)).await,
            _ => Err(TunnelError::TunnelLost),
        }
    }
}

/// Used when the node has no proxy to report to
pub struct DiscardPresence;

#[async_trait]
impl PresenceSink for DiscardPresence {
    async fn publish(&self, update: PresenceUpdate) -> Result<(), TunnelError> {
        trace!(?update, "Presence discarded");
        Ok(())
    }
}

/// Publish the node heartbeat and one heartbeat per live session
pub async fn publish_snapshot(table: &SessionTable) -> Result<(), TunnelError> {
    let state = table.state();
    let sink = &state.services.presence;

    sink.publish(PresenceUpdate::Node(state.node_heartbeat()))
        .await?;
    for session in table.list() {
        if session.is_closed() {
            continue;
        }
        sink.publish(PresenceUpdate::Session(session.heartbeat()))
            .await?;
    }
    Ok(())
}

/// Periodic full snapshots until cancelled
pub async fn run_publisher(
    table: Arc<SessionTable>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if let Err(e) = publish_snapshot(&table).await {
            trace!(error = %e, "Presence snapshot not delivered");
        }

        let pruned = table.prune_tombstones(interval * TOMBSTONE_INTERVALS);
        if pruned > 0 {
            debug!(pruned, "Pruned session tombstones");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cf_core::mux::{MuxConfig, MuxRole};
    use cf_protocol::NodeHeartbeat;

    fn heartbeat() -> PresenceUpdate {
        PresenceUpdate::Node(NodeHeartbeat {
            domain: "example.com".to_string(),
            host: "node-1".to_string(),
            addr: "127.0.0.1:3022".to_string(),
            sent_at: 1,
            seq: 1,
        })
    }

    #[tokio::test]
    async fn test_publish_without_link_fails() {
        let presence = LinkPresence::new();
        assert!(matches!(
            presence.publish(heartbeat()).await,
            Err(TunnelError::TunnelLost)
        ));
    }

    #[tokio::test]
    async fn test_publish_reaches_control_channel() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (node_side, _node_events) = Mux::spawn(a, MuxRole::Acceptor, MuxConfig::default(), "node");
        let (_proxy_side, mut proxy_events) =
            Mux::spawn(b, MuxRole::Dialer, MuxConfig::default(), "proxy");

        let presence = LinkPresence::new();
        presence.attach(node_side).await;
        presence.publish(heartbeat()).await.unwrap();

        match proxy_events.control.recv().await {
            Some(Message::Presence(update)) => assert_eq!(update, heartbeat()),
            other => panic!("expected presence, got {:?}", other),
        }

        presence.detach().await;
        assert!(presence.publish(heartbeat()).await.is_err());
    }
}
