//! Per-principal rate limiting for inbound framework calls.
//!
//! Each configured principal gets its own token bucket; everyone else,
//! including unauthenticated connections, shares the default bucket. A
//! call that finds the bucket empty is deferred until the bucket refills,
//! up to the configured queue capacity; past capacity it is dropped with
//! an explicit error reply.
//!
//! Capacity bounds *outstanding* calls: a call counts from the moment it
//! is admitted or deferred until the master finishes processing it and
//! releases its slot. During a burst the head call therefore still
//! occupies a slot while its successors queue behind it.

// Layer 1: Standard library imports
use std::collections::HashMap;
use std::time::Duration;

// Layer 2: Third-party crate imports
use tokio::time::Instant;

// Layer 3: Internal module imports
use crate::config::{RateLimit, RateLimits};

/// Outcome of asking a bucket for a permit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitDecision {
    /// Process the call now.
    Admit,
    /// Hold the call for this long, then process it.
    Defer(Duration),
    /// Queue capacity exceeded; reply with an error.
    Drop,
}

/// A token bucket refilling at a fixed rate with a bounded deferral queue.
#[derive(Debug)]
pub struct TokenBucket {
    /// Time between two permits (1/qps).
    interval: Duration,
    capacity: Option<usize>,
    /// When the next permit becomes free; `None` until first use.
    next_free: Option<Instant>,
    /// Calls admitted or deferred and not yet released.
    outstanding: usize,
}

impl TokenBucket {
    /// Create a bucket from a configured limit.
    pub fn new(limit: RateLimit) -> Self {
        Self {
            interval: Duration::from_secs_f64(1.0 / limit.qps),
            capacity: limit.capacity,
            next_free: None,
            outstanding: 0,
        }
    }

    /// Ask for a permit at time `now`.
    pub fn acquire(&mut self, now: Instant) -> LimitDecision {
        if self
            .capacity
            .is_some_and(|capacity| self.outstanding >= capacity)
        {
            return LimitDecision::Drop;
        }
        match self.next_free {
            Some(next) if next > now => {
                self.outstanding += 1;
                let wait = next - now;
                self.next_free = Some(next + self.interval);
                LimitDecision::Defer(wait)
            }
            _ => {
                self.outstanding += 1;
                self.next_free = Some(now + self.interval);
                LimitDecision::Admit
            }
        }
    }

    /// Release the slot held by a processed call.
    pub fn release(&mut self) {
        self.outstanding = self.outstanding.saturating_sub(1);
    }

    /// Calls currently admitted or deferred and not yet released.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }
}

/// The full limiter table: one bucket per configured principal plus the
/// shared default bucket.
#[derive(Debug)]
pub struct RateLimiters {
    config: RateLimits,
    principals: HashMap<String, TokenBucket>,
    default: Option<TokenBucket>,
    dropped: u64,
}

impl RateLimiters {
    /// Build the limiter table from configuration.
    pub fn new(config: RateLimits) -> Self {
        let default = config.default.map(TokenBucket::new);
        Self {
            config,
            principals: HashMap::new(),
            default,
            dropped: 0,
        }
    }

    /// Ask for a permit for `principal` at time `now`.
    ///
    /// Principals without any applicable limit are always admitted and
    /// never counted.
    pub fn acquire(&mut self, principal: Option<&str>, now: Instant) -> LimitDecision {
        let decision = match self.bucket(principal) {
            Some(bucket) => bucket.acquire(now),
            None => LimitDecision::Admit,
        };
        if decision == LimitDecision::Drop {
            self.dropped += 1;
        }
        decision
    }

    /// Release the slot held by a processed call from `principal`.
    pub fn release(&mut self, principal: Option<&str>) {
        if let Some(bucket) = self.bucket(principal) {
            bucket.release();
        }
    }

    /// Total calls dropped for capacity since startup.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn bucket(&mut self, principal: Option<&str>) -> Option<&mut TokenBucket> {
        if let Some(principal) = principal {
            if let Some(limit) = self.config.principals.get(principal) {
                return Some(
                    self.principals
                        .entry(principal.to_owned())
                        .or_insert_with(|| TokenBucket::new(*limit)),
                );
            }
        }
        self.default.as_mut()
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    fn now() -> Instant {
        Instant::now()
    }

    #[test]
    fn test_first_call_admitted() {
        let mut bucket = TokenBucket::new(RateLimit::per_second(1.0));
        assert_eq!(bucket.acquire(now()), LimitDecision::Admit);
    }

    #[test]
    fn test_burst_defers_then_drops() {
        // qps=1, capacity=5: in a burst of ten, one is admitted, four are
        // queued behind it, five are dropped.
        let mut bucket = TokenBucket::new(RateLimit::per_second(1.0).with_capacity(5));
        let t0 = now();

        assert_eq!(bucket.acquire(t0), LimitDecision::Admit);
        let mut deferred = 0;
        let mut dropped = 0;
        for _ in 0..9 {
            match bucket.acquire(t0) {
                LimitDecision::Defer(_) => deferred += 1,
                LimitDecision::Drop => dropped += 1,
                LimitDecision::Admit => {}
            }
        }
        assert_eq!(deferred, 4);
        assert_eq!(dropped, 5);
    }

    #[test]
    fn test_deferral_delays_grow() {
        let mut bucket = TokenBucket::new(RateLimit::per_second(2.0).with_capacity(10));
        let t0 = now();

        assert_eq!(bucket.acquire(t0), LimitDecision::Admit);
        let first = match bucket.acquire(t0) {
            LimitDecision::Defer(wait) => wait,
            other => panic!("expected deferral, got {other:?}"),
        };
        let second = match bucket.acquire(t0) {
            LimitDecision::Defer(wait) => wait,
            other => panic!("expected deferral, got {other:?}"),
        };
        assert!(second > first);
    }

    #[test]
    fn test_release_frees_capacity() {
        let mut bucket = TokenBucket::new(RateLimit::per_second(1.0).with_capacity(1));
        let t0 = now();

        assert_eq!(bucket.acquire(t0), LimitDecision::Admit);
        assert_eq!(bucket.acquire(t0), LimitDecision::Drop);

        bucket.release();
        assert!(matches!(bucket.acquire(t0), LimitDecision::Defer(_)));
    }

    #[test]
    fn test_refill_admits_again() {
        let mut bucket = TokenBucket::new(RateLimit::per_second(10.0));
        let t0 = now();
        assert_eq!(bucket.acquire(t0), LimitDecision::Admit);
        bucket.release();
        // 100ms later the next permit is free.
        assert_eq!(
            bucket.acquire(t0 + Duration::from_millis(150)),
            LimitDecision::Admit
        );
    }

    #[test]
    fn test_unconfigured_principal_uses_default() {
        let config = RateLimits {
            principals: HashMap::new(),
            default: Some(RateLimit::per_second(1.0).with_capacity(0)),
        };
        let mut limiters = RateLimiters::new(config);

        assert_eq!(limiters.acquire(Some("anyone"), now()), LimitDecision::Admit);
        // Capacity zero: the outstanding head call blocks everyone sharing
        // the default bucket, authenticated or not.
        assert_eq!(limiters.acquire(None, now()), LimitDecision::Drop);
        assert_eq!(limiters.dropped(), 1);
    }

    #[test]
    fn test_no_limits_configured_admits_everything() {
        let mut limiters = RateLimiters::new(RateLimits::default());
        for _ in 0..100 {
            assert_eq!(limiters.acquire(Some("p"), now()), LimitDecision::Admit);
        }
    }

    #[test]
    fn test_configured_principals_are_isolated() {
        let mut principals = HashMap::new();
        principals.insert("slow".to_owned(), RateLimit::per_second(1.0).with_capacity(0));
        let config = RateLimits {
            principals,
            default: None,
        };
        let mut limiters = RateLimiters::new(config);
        let t0 = now();

        assert_eq!(limiters.acquire(Some("slow"), t0), LimitDecision::Admit);
        assert_eq!(limiters.acquire(Some("slow"), t0), LimitDecision::Drop);
        // Other principals have no default limit here.
        assert_eq!(limiters.acquire(Some("fast"), t0), LimitDecision::Admit);
    }
}
