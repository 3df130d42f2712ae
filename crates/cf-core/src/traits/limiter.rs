//! Admission checkpoint contract

/// Admit-or-reject checkpoint consulted when accepting a connection and when
/// creating an interactive session
pub trait RateLimiter: Send + Sync {
    /// Whether `source` may proceed. An admitted source holds one slot until
    /// `release` is called.
    fn admit(&self, source: &str) -> bool;

    /// Return a slot taken by a successful `admit`
    fn release(&self, _source: &str) {}
}
