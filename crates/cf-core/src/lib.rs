//! cf-core: Core abstractions for the cluster fabric
//!
//! Shared types, the error taxonomy, configuration, the contracts of the
//! external collaborators (storage, event log, recording, admission) with
//! default implementations, and the virtual channel multiplexer used by both
//! ends of a reverse tunnel.

pub mod config;
pub mod error;
pub mod mux;
pub mod services;
pub mod time;
pub mod token;
pub mod traits;
pub mod types;

pub use error::{ConduitError, FabricError, SessionError, StorageError, TunnelError};
pub use types::{HostId, PartyId, SessionId, CURRENT_SITE_SHORTCUT};
