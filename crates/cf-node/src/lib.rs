//! cf-node: Node agent for the cluster fabric
//!
//! A node hosts interactive sessions for authenticated participants. It
//! accepts them over direct connections and, when it is its site's agent,
//! over virtual channels of the reverse tunnel it keeps open to the central
//! proxy. Presence snapshots of the node and its sessions flow up the same
//! link.

pub mod identity;
pub mod listener;
pub mod presence;
pub mod pty;
pub mod server;
pub mod session;
pub mod state;
pub mod tunnel;

pub use identity::NodeIdentity;
pub use server::NodeServer;
pub use state::NodeState;
