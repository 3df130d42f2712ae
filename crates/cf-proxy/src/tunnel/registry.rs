//! Registered links
//!
//! Two tables. Site tunnels are keyed by remote domain; at most one is
//! authoritative per domain and it is the only route into that site. Node
//! links come from nodes of the proxy's own domain, are keyed by host and
//! only carry presence. Both tables are `DashMap`s, so replacing and
//! evicting the entry of one key serialize on that key's shard lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use cf_core::mux::{Mux, VirtualChannel};
use cf_core::time::current_time_millis;
use cf_core::TunnelError;

/// Whether a link is a route into a site or a presence feed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Site,
    Node,
}

/// One authenticated link
pub struct Link {
    id: u64,
    pub kind: LinkKind,
    pub domain: String,
    /// Host that dialed in
    pub host: String,
    pub mux: Mux,
    pub connected_at: u64,
    last_heartbeat: AtomicU64,
}

impl Link {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn record_heartbeat(&self) {
        self.last_heartbeat
            .store(current_time_millis(), Ordering::Relaxed);
    }

    /// Unix millis of the last heartbeat (or of registration)
    pub fn last_heartbeat(&self) -> u64 {
        self.last_heartbeat.load(Ordering::Relaxed)
    }

    pub fn is_stale(&self, stale_after: Duration) -> bool {
        current_time_millis().saturating_sub(self.last_heartbeat())
            > stale_after.as_millis() as u64
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("domain", &self.domain)
            .field("host", &self.host)
            .finish()
    }
}

pub struct TunnelRegistry {
    local_domain: String,
    sites: DashMap<String, Arc<Link>>,
    nodes: DashMap<String, Arc<Link>>,
    stale_after: Duration,
    next_id: AtomicU64,
}

impl TunnelRegistry {
    pub fn new(local_domain: impl Into<String>, stale_after: Duration) -> Self {
        Self {
            local_domain: local_domain.into(),
            sites: DashMap::new(),
            nodes: DashMap::new(),
            stale_after,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn local_domain(&self) -> &str {
        &self.local_domain
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Bind an authenticated connection. Whatever link held the same key
    /// before is closed, which fails every channel riding on it with
    /// `TunnelLost`.
    pub fn register(&self, domain: &str, host: &str, mux: Mux) -> Arc<Link> {
        let kind = if domain == self.local_domain {
            LinkKind::Node
        } else {
            LinkKind::Site
        };
        let now = current_time_millis();
        let link = Arc::new(Link {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            kind,
            domain: domain.to_string(),
            host: host.to_string(),
            mux,
            connected_at: now,
            last_heartbeat: AtomicU64::new(now),
        });

        let previous = match kind {
            LinkKind::Site => self.sites.insert(domain.to_string(), link.clone()),
            LinkKind::Node => self.nodes.insert(host.to_string(), link.clone()),
        };
        if let Some(previous) = previous {
            tracing::info!(
                site = %domain,
                host = %previous.host,
                link_id = previous.id,
                "Superseding previous link"
            );
            previous.mux.close();
        }
        link
    }

    /// Forget `link` if it is still the registered one for its key
    pub fn unregister(&self, link: &Link) -> bool {
        let removed = match link.kind {
            LinkKind::Site => self.sites.remove_if(&link.domain, |_, l| l.id == link.id),
            LinkKind::Node => self.nodes.remove_if(&link.host, |_, l| l.id == link.id),
        };
        removed.is_some()
    }

    /// Remove and close `link` if it is still registered and stale.
    /// Returns whether it was evicted.
    pub fn evict_if_stale(&self, link: &Link) -> bool {
        let stale_after = self.stale_after;
        let check = |_: &String, l: &Arc<Link>| l.id == link.id && l.is_stale(stale_after);
        let removed = match link.kind {
            LinkKind::Site => self.sites.remove_if(&link.domain, check),
            LinkKind::Node => self.nodes.remove_if(&link.host, check),
        };
        match removed {
            Some((_, evicted)) => {
                evicted.mux.close();
                true
            }
            None => false,
        }
    }

    /// The authoritative tunnel of a remote site, if live
    pub fn site(&self, domain: &str) -> Option<Arc<Link>> {
        self.sites
            .get(domain)
            .map(|l| l.value().clone())
            .filter(|l| !l.mux.is_closed() && !l.is_stale(self.stale_after))
    }

    /// Remote domains with a registered tunnel
    pub fn site_domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self.sites.iter().map(|e| e.key().clone()).collect();
        domains.sort();
        domains
    }

    /// Every registered link
    pub fn links(&self) -> Vec<Arc<Link>> {
        self.sites
            .iter()
            .chain(self.nodes.iter())
            .map(|e| e.value().clone())
            .collect()
    }

    /// Open a virtual channel into `domain` towards `target`.
    ///
    /// Fails with `SiteUnreachable` when no live tunnel is registered. A
    /// tunnel found stale here is evicted first.
    pub async fn open_channel(
        &self,
        domain: &str,
        target: &str,
    ) -> Result<VirtualChannel, TunnelError> {
        let link = self
            .sites
            .get(domain)
            .map(|l| l.value().clone())
            .ok_or_else(|| TunnelError::SiteUnreachable(domain.to_string()))?;

        if link.is_stale(self.stale_after) {
            if self.evict_if_stale(&link) {
                tracing::warn!(site = %domain, "Evicted stale tunnel on use");
            }
            return Err(TunnelError::SiteUnreachable(domain.to_string()));
        }
        if link.mux.is_closed() {
            self.unregister(&link);
            return Err(TunnelError::SiteUnreachable(domain.to_string()));
        }

        link.mux.open_channel(target).await
    }

    pub fn len(&self) -> usize {
        self.sites.len() + self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
