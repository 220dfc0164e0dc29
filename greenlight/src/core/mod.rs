//! Core components of the greenlight governance library
//!
//! This module contains the fundamental building blocks:
//! - [`bucket`]: Token bucket arithmetic
//! - [`throttle`]: Per-client admission control with idle eviction
//! - [`record`]: Versioned records and the conditional-update contract

pub mod bucket;
pub mod record;
pub mod throttle;
#[cfg(test)]
mod tests;

pub use bucket::TokenBucket;
pub use record::{InMemoryRepository, RecordError, Repository, VersionedRecord};
pub use throttle::{Admission, ClientThrottle, ThrottleConfig};

use std::error::Error;
use std::fmt;
use std::time::Duration;

/// Errors raised when a throttle is configured with unusable parameters
///
/// # Example
///
/// ```
/// use greenlight::{ClientThrottle, ThrottleConfig, ThrottleError};
///
/// match ClientThrottle::new(ThrottleConfig::new(0, 2.0)) {
///     Err(ThrottleError::ZeroCapacity) => {}
///     _ => panic!("a bucket without capacity can never admit"),
/// }
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum ThrottleError {
    /// Burst capacity was zero
    ZeroCapacity,
    /// Refill rate was zero, negative, or not finite
    InvalidRefillRate(f64),
    /// Sweep interval was zero
    ZeroSweepInterval,
    /// Eviction window was zero
    ZeroEvictionWindow,
}

impl fmt::Display for ThrottleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThrottleError::ZeroCapacity => write!(f, "bucket capacity must be at least 1"),
            ThrottleError::InvalidRefillRate(rate) => {
                write!(f, "refill rate must be a positive number, got {rate}")
            }
            ThrottleError::ZeroSweepInterval => write!(f, "sweep interval must be greater than 0"),
            ThrottleError::ZeroEvictionWindow => {
                write!(f, "eviction window must be greater than 0")
            }
        }
    }
}

impl Error for ThrottleError {}

pub(crate) fn ensure_positive(duration: Duration, err: ThrottleError) -> Result<(), ThrottleError> {
    if duration.is_zero() { Err(err) } else { Ok(()) }
}
