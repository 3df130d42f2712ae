//! Session registry
//!
//! The proxy's view of which nodes are up and which interactive sessions run
//! on them. Heartbeats are the only input: each one replaces the stored
//! snapshot of its subject when it is newer (`(sent_at, seq)`), and is
//! ignored otherwise. Entries that stop being refreshed drop out of listings
//! once they are older than the staleness window, so a crashed node's
//! sessions disappear on their own.

use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;

use cf_protocol::{NodeHeartbeat, PresenceUpdate, SessionHeartbeat, SessionPhase};

/// Closed sessions and silent nodes are forgotten after this many windows
const FORGET_AFTER_WINDOWS: u32 = 10;

type NodeKey = (String, String);
type SessionKey = (String, String, String);

struct Tracked<T> {
    snapshot: T,
    received_at: Instant,
}

impl<T> Tracked<T> {
    fn new(snapshot: T) -> Self {
        Self {
            snapshot,
            received_at: Instant::now(),
        }
    }

    fn is_fresh(&self, ttl: Duration) -> bool {
        self.received_at.elapsed() <= ttl
    }
}

/// Last-writer-wins store of presence snapshots
pub struct SessionRegistry {
    nodes: DashMap<NodeKey, Tracked<NodeHeartbeat>>,
    sessions: DashMap<SessionKey, Tracked<SessionHeartbeat>>,
    ttl: Duration,
}

impl SessionRegistry {
    /// `ttl` is the staleness window: one heartbeat interval plus one
    /// missed-heartbeat grace period
    pub fn new(ttl: Duration) -> Self {
        Self {
            nodes: DashMap::new(),
            sessions: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Apply one snapshot. Returns false when an equal or newer snapshot
    /// of the same subject is already stored.
    pub fn apply(&self, update: PresenceUpdate) -> bool {
        match update {
            PresenceUpdate::Node(heartbeat) => {
                let key = (heartbeat.domain.clone(), heartbeat.host.clone());
                replace_if_newer(&self.nodes, key, heartbeat, NodeHeartbeat::version)
            }
            PresenceUpdate::Session(heartbeat) => {
                let key = (
                    heartbeat.domain.clone(),
                    heartbeat.host.clone(),
                    heartbeat.session_id.clone(),
                );
                replace_if_newer(&self.sessions, key, heartbeat, SessionHeartbeat::version)
            }
        }
    }

    /// Live nodes of `domain`, sorted by host name
    pub fn list_nodes(&self, domain: &str) -> Vec<NodeHeartbeat> {
        let mut nodes: Vec<NodeHeartbeat> = self
            .nodes
            .iter()
            .filter(|entry| entry.key().0 == domain && entry.is_fresh(self.ttl))
            .map(|entry| entry.snapshot.clone())
            .collect();
        nodes.sort_by(|a, b| a.host.cmp(&b.host));
        nodes
    }

    /// A live node's latest heartbeat
    pub fn node(&self, domain: &str, host: &str) -> Option<NodeHeartbeat> {
        self.nodes
            .get(&(domain.to_string(), host.to_string()))
            .filter(|entry| entry.is_fresh(self.ttl))
            .map(|entry| entry.snapshot.clone())
    }

    /// Open, fresh sessions on one host, sorted by session id
    pub fn list_sessions(&self, domain: &str, host: &str) -> Vec<SessionHeartbeat> {
        let mut sessions: Vec<SessionHeartbeat> = self
            .sessions
            .iter()
            .filter(|entry| {
                let (d, h, _) = entry.key();
                d == domain
                    && h == host
                    && entry.snapshot.phase == SessionPhase::Open
                    && entry.is_fresh(self.ttl)
            })
            .map(|entry| entry.snapshot.clone())
            .collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        sessions
    }

    /// Drop entries nobody has refreshed for a long time. Closed sessions
    /// stay until then so late heartbeats cannot resurrect them.
    pub fn prune(&self) -> usize {
        let horizon = self.ttl * FORGET_AFTER_WINDOWS;
        let before = self.nodes.len() + self.sessions.len();
        self.nodes.retain(|_, entry| entry.is_fresh(horizon));
        self.sessions.retain(|_, entry| entry.is_fresh(horizon));
        before - (self.nodes.len() + self.sessions.len())
    }
}

fn replace_if_newer<K, T>(
    map: &DashMap<K, Tracked<T>>,
    key: K,
    snapshot: T,
    version: fn(&T) -> (u64, u64),
) -> bool
where
    K: std::hash::Hash + Eq,
{
    match map.entry(key) {
        Entry::Occupied(mut occupied) => {
            if version(&snapshot) <= version(&occupied.get().snapshot) {
                return false;
            }
            occupied.insert(Tracked::new(snapshot));
            true
        }
        Entry::Vacant(vacant) => {
            vacant.insert(Tracked::new(snapshot));
            true
        }
    }
}
