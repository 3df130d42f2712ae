//! Local API for the gateway
//!
//! Line-delimited JSON over loopback TCP, one request and one response per
//! line, with a raw byte stream following a successful `connect`.

mod protocol;
mod server;

pub use protocol::{ApiCall, ApiCookie, ApiRequest, ApiResponse, ApiSession};
pub use server::ApiServer;
