//! Contracts between the core and its collaborators

mod conduit;
mod events;
mod limiter;
mod presence;
mod recorder;
mod storage;

pub use conduit::{splice, BoxConduit, Conduit, SessionConduit};
pub use events::{AuditEvent, EventLog};
pub use limiter::RateLimiter;
pub use presence::PresenceSink;
pub use recorder::Recorder;
pub use storage::KeyValueStore;
