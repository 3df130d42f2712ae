//! Outbound link to the proxy
//!
//! Every node with a proxy configured keeps one link up for presence. A site
//! agent's link doubles as its site's reverse tunnel.

mod agent;
mod connector;
mod reconnect;

pub use agent::{AgentConfig, TunnelAgent};
pub use connector::{ConnectionError, ConnectorConfig, ProxyLink, TunnelConnector};
pub use reconnect::ExponentialBackoff;
