//! Node agent configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::{duration_millis, duration_secs};
use super::{BackoffConfig, LimiterConfig};

/// Which participants' keystrokes reach a shared session's process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputPolicy {
    /// Every participant's input, interleaved in arrival order
    #[default]
    Shared,
    /// Only the earliest participant still attached
    Owner,
}

/// Configuration for a node agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Site this node belongs to
    pub domain: String,

    /// Host name; defaults to the machine's hostname
    pub host: String,

    /// Address to accept direct connections on
    pub listen_address: String,

    /// Address other parties should use to reach `listen_address`
    pub advertise_address: String,

    /// Host key seed and host certificate
    pub identity_path: PathBuf,

    /// Trusted certificate authority public keys
    pub trust_bundle_path: PathBuf,

    /// Proxy tunnel endpoint; presence and (for site agents) channels flow over it
    pub proxy_address: Option<String>,

    /// Whether this node holds its site's reverse tunnel
    pub site_agent: bool,

    /// Interval between tunnel heartbeats
    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,

    /// Interval between presence snapshots
    #[serde(with = "duration_secs")]
    pub presence_interval: Duration,

    /// Timeout for dialing the proxy and for direct splices
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// How long a participant has to answer the session challenge
    #[serde(with = "duration_millis")]
    pub handshake_timeout: Duration,

    /// Remote logins sessions may run under
    pub logins: Vec<String>,

    /// Shell for sessions that do not name a command
    pub shell: Option<String>,

    pub input_policy: InputPolicy,

    /// Output chunks buffered per participant before the oldest are dropped
    pub output_buffer: usize,

    /// Where session recordings are written
    pub recordings_dir: PathBuf,

    /// Reconnect backoff for the proxy link
    pub backoff: BackoffConfig,

    /// Admission limits for direct connections and new sessions
    pub limiter: LimiterConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let config_dir = super::default_config_dir();

        Self {
            domain: "localhost".to_string(),
            host: crate::types::local_hostname(),
            listen_address: "0.0.0.0:3022".to_string(),
            advertise_address: "127.0.0.1:3022".to_string(),
            identity_path: config_dir.join("node_identity.json"),
            trust_bundle_path: config_dir.join("trust_bundle.json"),
            proxy_address: None,
            site_agent: false,
            heartbeat_interval: Duration::from_secs(5),
            presence_interval: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_millis(5000),
            logins: vec![whoami::username()],
            shell: None,
            input_policy: InputPolicy::default(),
            output_buffer: 1024,
            recordings_dir: config_dir.join("recordings"),
            backoff: BackoffConfig::default(),
            limiter: LimiterConfig::default(),
        }
    }
}
