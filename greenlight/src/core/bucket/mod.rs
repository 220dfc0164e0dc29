//! Token bucket arithmetic
//!
//! This module provides the [`TokenBucket`] type which admits a request when
//! at least one whole token is available. Tokens accrue continuously from
//! elapsed time and are computed lazily at each admission check.

use std::time::Instant;


/// A single token bucket
///
/// The bucket starts full. Each call to [`try_consume`](TokenBucket::try_consume)
/// first credits `elapsed * refill_per_second` tokens (capped at capacity),
/// then takes one token if it can.
///
/// # Examples
///
/// ```
/// use greenlight::TokenBucket;
/// use std::time::{Duration, Instant};
///
/// let start = Instant::now();
/// let mut bucket = TokenBucket::new(2, 1.0, start);
///
/// assert!(bucket.try_consume(start));
/// assert!(bucket.try_consume(start));
/// assert!(!bucket.try_consume(start));
///
/// // One second later one token has accrued
/// assert!(bucket.try_consume(start + Duration::from_secs(1)));
/// ```
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_second: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Creates a full bucket
    ///
    /// # Parameters
    ///
    /// - `capacity`: Maximum tokens held at once (the burst size)
    /// - `refill_per_second`: Tokens credited per second of elapsed time
    /// - `now`: Instant the bucket is created at
    pub fn new(capacity: u32, refill_per_second: f64, now: Instant) -> Self {
        TokenBucket {
            capacity: f64::from(capacity),
            refill_per_second,
            tokens: f64::from(capacity),
            last_refill: now,
        }
    }

    /// Refills for the time elapsed since the last call, then tries to take one token
    ///
    /// The refill is committed whether or not a token is taken, so a denied
    /// call does not lose the accrual it computed. An instant earlier than the
    /// last refill credits nothing.
    ///
    /// Never blocks.
    pub fn try_consume(&mut self, now: Instant) -> bool {
        self.refill(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_second).min(self.capacity);
        // Only move forward; an out-of-order instant must not rewind the clock
        if now > self.last_refill {
            self.last_refill = now;
        }
    }

    /// Tokens available as of the last refill
    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    /// Maximum tokens the bucket can hold
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Tokens credited per second
    pub fn refill_per_second(&self) -> f64 {
        self.refill_per_second
    }
}
