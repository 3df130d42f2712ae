//! Proxy configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::{duration_millis, duration_secs};

/// Configuration for the central proxy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Domain of the local site
    pub domain: String,

    /// Host name the proxy's own host certificate is issued for
    pub host: String,

    /// Address sites and nodes dial to open reverse tunnels
    pub tunnel_address: String,

    /// Address of the local API server
    pub api_address: String,

    /// SSH host key for the tunnel endpoint
    pub host_key_path: PathBuf,

    /// Directory backing the key-value store
    pub data_dir: PathBuf,

    /// Expected interval between tunnel heartbeats
    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,

    /// Consecutive missed heartbeats before a tunnel is evicted
    pub max_missed_heartbeats: u32,

    /// How long to wait for a site to acknowledge a new channel
    #[serde(with = "duration_millis")]
    pub channel_open_timeout: Duration,

    /// How long a freshly connected site has to complete the handshake
    #[serde(with = "duration_secs")]
    pub handshake_timeout: Duration,

    /// Interval at which nodes publish presence; listings expire after twice this
    #[serde(with = "duration_secs")]
    pub presence_interval: Duration,

    /// Lifetime of a bearer session
    #[serde(with = "duration_secs")]
    pub session_ttl: Duration,

    /// Lifetime of user certificates minted for node access
    #[serde(with = "duration_secs")]
    pub user_cert_ttl: Duration,

    /// Lifetime of signup tokens
    #[serde(with = "duration_secs")]
    pub signup_token_ttl: Duration,

    /// Require the session cookie alongside the bearer token
    pub require_cookie: bool,

    /// Admission limits for inbound connections and new sessions
    pub limiter: LimiterConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        let config_dir = super::default_config_dir();

        Self {
            domain: "localhost".to_string(),
            host: crate::types::local_hostname(),
            tunnel_address: "0.0.0.0:3024".to_string(),
            api_address: "127.0.0.1:3080".to_string(),
            host_key_path: config_dir.join("proxy_host_key"),
            data_dir: config_dir.join("data"),
            heartbeat_interval: Duration::from_secs(5),
            max_missed_heartbeats: 3,
            channel_open_timeout: Duration::from_millis(2000),
            handshake_timeout: Duration::from_secs(10),
            presence_interval: Duration::from_secs(5),
            session_ttl: Duration::from_secs(8 * 3600),
            user_cert_ttl: Duration::from_secs(300),
            signup_token_ttl: Duration::from_secs(3600),
            require_cookie: true,
            limiter: LimiterConfig::default(),
        }
    }
}

impl ProxyConfig {
    /// Silence after which a tunnel counts as dead
    pub fn tunnel_stale_after(&self) -> Duration {
        self.heartbeat_interval * self.max_missed_heartbeats.max(1)
    }

    /// Staleness window for presence: one interval plus one missed-heartbeat grace period
    pub fn presence_ttl(&self) -> Duration {
        self.presence_interval * 2
    }
}

/// Per-source admission limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    /// Concurrent connections or sessions held by one source
    pub max_connections: u32,

    /// Sustained admissions per second per source
    pub rate_per_second: f64,

    /// Admissions allowed in a burst above the sustained rate
    pub burst: u32,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            rate_per_second: 20.0,
            burst: 40,
        }
    }
}
