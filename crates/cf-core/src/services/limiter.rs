//! Admission limiters

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::config::LimiterConfig;
use crate::traits::RateLimiter;

/// Admits everything
#[derive(Debug, Default)]
pub struct Unlimited;

impl RateLimiter for Unlimited {
    fn admit(&self, _source: &str) -> bool {
        true
    }
}

#[derive(Debug)]
struct Bucket {
    active: u32,
    tokens: f64,
    refilled_at: Instant,
}

/// Per-source concurrency cap plus a token bucket on admission rate
#[derive(Debug)]
pub struct SourceLimiter {
    config: LimiterConfig,
    buckets: DashMap<String, Bucket>,
}

impl SourceLimiter {
    pub fn new(config: LimiterConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    /// Slots currently held by `source`
    pub fn active(&self, source: &str) -> u32 {
        self.buckets.get(source).map(|b| b.active).unwrap_or(0)
    }
}

impl RateLimiter for SourceLimiter {
    fn admit(&self, source: &str) -> bool {
        let burst = self.config.burst.max(1) as f64;
        let now = Instant::now();
        let mut bucket = self.buckets.entry(source.to_string()).or_insert(Bucket {
            active: 0,
            tokens: burst,
            refilled_at: now,
        });

        let elapsed = now.duration_since(bucket.refilled_at).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.config.rate_per_second).min(burst);
        bucket.refilled_at = now;

        if bucket.active >= self.config.max_connections || bucket.tokens < 1.0 {
            tracing::debug!(source, active = bucket.active, "Admission denied");
            return false;
        }

        bucket.tokens -= 1.0;
        bucket.active += 1;
        true
    }

    fn release(&self, source: &str) {
        if let Some(mut bucket) = self.buckets.get_mut(source) {
            bucket.active = bucket.active.saturating_sub(1);
        }
    }
}

/// One admitted slot, returned to the limiter on drop
pub struct Permit {
    limiter: Arc<dyn RateLimiter>,
    source: String,
}

impl Permit {
    /// Consult the checkpoint for `source`; `None` means rejected
    pub fn acquire(limiter: &Arc<dyn RateLimiter>, source: &str) -> Option<Self> {
        if limiter.admit(source) {
            Some(Self {
                limiter: limiter.clone(),
                source: source.to_string(),
            })
        } else {
            None
        }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.limiter.release(&self.source);
    }
}

impl std::fmt::Debug for Permit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit").field("source", &self.source).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_connections: u32, rate_per_second: f64, burst: u32) -> Arc<SourceLimiter> {
        Arc::new(SourceLimiter::new(LimiterConfig {
            max_connections,
            rate_per_second,
            burst,
        }))
    }

    #[test]
    fn test_concurrency_cap_and_release() {
        let limiter = limiter(2, 1000.0, 100);
        let shared: Arc<dyn RateLimiter> = limiter.clone();

        let a = Permit::acquire(&shared, "10.0.0.1").unwrap();
        let _b = Permit::acquire(&shared, "10.0.0.1").unwrap();
        assert!(Permit::acquire(&shared, "10.0.0.1").is_none());
        assert!(Permit::acquire(&shared, "10.0.0.2").is_some());

        drop(a);
        assert_eq!(limiter.active("10.0.0.1"), 1);
        assert!(Permit::acquire(&shared, "10.0.0.1").is_some());
    }

    #[test]
    fn test_burst_exhaustion() {
        let limiter = limiter(100, 0.0, 3);
        for _ in 0..3 {
            assert!(limiter.admit("src"));
            limiter.release("src");
        }
        assert!(!limiter.admit("src"));
    }

    #[test]
    fn test_unlimited() {
        assert!(Unlimited.admit("anyone"));
    }
}
