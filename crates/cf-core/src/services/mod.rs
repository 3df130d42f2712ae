//! Default implementations of the collaborator contracts
//!
//! Production deployments may swap any of these for external services; the
//! core only depends on the traits in `crate::traits`.

mod dir_store;
mod event_log;
mod limiter;
mod memory_store;
mod recorder;

pub use dir_store::DirStore;
pub use event_log::{MemoryEventLog, TracingEventLog};
pub use limiter::{Permit, SourceLimiter, Unlimited};
pub use memory_store::MemoryStore;
pub use recorder::{FileRecorder, MemoryRecorder};
