//! Dead link detection
//!
//! A background task that periodically evicts links whose last heartbeat is
//! older than `heartbeat_interval * max_missed_heartbeats`, and prunes
//! presence entries nobody has refreshed in a long time.
//!
//! Eviction closes the link's multiplexer, so every channel still riding on
//! it fails with `TunnelLost`. Nothing is surfaced to callers here; the next
//! attempt to open a channel to that site gets `SiteUnreachable`.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use cf_core::time::current_time_millis;
use cf_core::traits::AuditEvent;

use crate::state::ProxyState;

/// Run the sweeper until cancelled. Checks once per heartbeat interval.
pub async fn run_sweeper(state: Arc<ProxyState>, cancel: CancellationToken) {
    let check_interval = state.config.heartbeat_interval.max(Duration::from_millis(100));
    let mut interval = tokio::time::interval(check_interval);

    tracing::info!(
        "Starting link sweeper (stale after: {:?}, check interval: {:?})",
        state.tunnels.stale_after(),
        check_interval
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {
                sweep(&state).await;
            }
            _ = cancel.cancelled() => {
                tracing::info!("Link sweeper shutting down");
                break;
            }
        }
    }
}

/// One pass: evict stale links and prune forgotten presence.
/// Returns the number of links evicted.
pub async fn sweep(state: &ProxyState) -> usize {
    let stale_after = state.tunnels.stale_after();
    let now = current_time_millis();
    let mut evicted = 0;

    for link in state.tunnels.links() {
        if !link.is_stale(stale_after) {
            continue;
        }
        let channels = link.mux.channel_count();
        // Registration of a replacement may have raced us; only the link
        // we looked at is removed
        if state.tunnels.evict_if_stale(&link) {
            let silent_ms = now.saturating_sub(link.last_heartbeat());
            tracing::warn!(
                site = %link.domain,
                host = %link.host,
                silent_ms,
                channels,
                "Evicting stale link"
            );
            state
                .audit(AuditEvent::TunnelEvicted {
                    site: link.domain.clone(),
                    reason: format!("no heartbeat for {}ms", silent_ms),
                })
                .await;
            evicted += 1;
        }
    }

    let pruned = state.sessions.prune();
    if pruned > 0 {
        tracing::debug!(pruned, "Pruned forgotten presence entries");
    }
    if evicted > 0 {
        tracing::info!("Evicted {} stale links", evicted);
    }
    evicted
}
