//! Time utilities
//!
//! Wall-clock timestamps travel between processes as unix milliseconds or
//! seconds. A clock set before the epoch reads as zero.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn since_epoch() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

/// Current Unix timestamp in milliseconds.
///
/// # Examples
/// ```
/// use cf_core::time::current_time_millis;
///
/// assert!(current_time_millis() > 0);
/// ```
pub fn current_time_millis() -> u64 {
    since_epoch().as_millis() as u64
}

/// Current Unix timestamp in seconds.
pub fn current_time_secs() -> u64 {
    since_epoch().as_secs()
}

/// Elapsed milliseconds since a given timestamp, 0 if it lies in the future.
pub fn elapsed_millis(since: u64) -> u64 {
    current_time_millis().saturating_sub(since)
}
