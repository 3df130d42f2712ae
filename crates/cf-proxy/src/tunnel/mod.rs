//! Reverse tunnel endpoint
//!
//! Remote sites and local nodes dial in and keep one multiplexed link open.
//! The proxy opens virtual channels into remote sites over their link and
//! reads presence from every link.

mod link;
mod listener;
mod registry;
mod sweeper;

pub use link::{accept_registration, serve_link};
pub use listener::{load_or_generate_host_key, TunnelServer};
pub use registry::{Link, LinkKind, TunnelRegistry};
pub use sweeper::{run_sweeper, sweep};
