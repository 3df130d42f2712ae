//! cf-proxy: Central proxy for the cluster fabric
//!
//! Accepts reverse tunnels from remote sites and presence links from local
//! nodes, tracks which sessions run where, and brokers authenticated
//! callers onto node sessions through the access gateway.

pub mod api;
pub mod gateway;
pub mod identity;
pub mod registry;
pub mod state;
pub mod tunnel;

pub use gateway::{Credentials, Gateway, GatewayError};
pub use state::{ProxyServices, ProxyState};
