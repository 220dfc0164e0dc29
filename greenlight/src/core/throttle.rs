//! Per-client admission control
//!
//! [`ClientThrottle`] keys a [`TokenBucket`] by client identity and bounds
//! memory by evicting clients that have gone quiet. Eviction is driven from
//! outside (see [`ClientThrottle::evict_idle`]) so the library stays free of
//! any runtime.

use super::{ThrottleError, TokenBucket, ensure_positive};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[cfg(feature = "ahash")]
use ahash::AHashMap as HashMap;
#[cfg(not(feature = "ahash"))]
use std::collections::HashMap;

const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
const DEFAULT_EVICTION_WINDOW_SECS: u64 = 3 * DEFAULT_SWEEP_INTERVAL_SECS;

/// Outcome of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Denied,
}

impl Admission {
    pub fn is_allowed(self) -> bool {
        self == Admission::Allowed
    }
}

/// Throttle policy
///
/// The eviction window defaults to three sweep intervals (3 minutes against
/// a 1 minute sweep). Both are tunable.
///
/// # Example
///
/// ```
/// use greenlight::ThrottleConfig;
/// use std::time::Duration;
///
/// let config = ThrottleConfig::new(4, 2.0)
///     .sweep_interval(Duration::from_secs(30))
///     .eviction_window(Duration::from_secs(90));
/// assert!(config.enabled);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ThrottleConfig {
    /// When false every request is admitted and nothing is tracked
    pub enabled: bool,
    /// Burst size of each client's bucket
    pub capacity: u32,
    /// Tokens credited per second to each client's bucket
    pub refill_per_second: f64,
    /// How often idle clients should be swept
    pub sweep_interval: Duration,
    /// How long a client may stay silent before it is evicted
    pub eviction_window: Duration,
}

impl ThrottleConfig {
    /// Enabled policy with the default sweep cadence
    pub fn new(capacity: u32, refill_per_second: f64) -> Self {
        ThrottleConfig {
            enabled: true,
            capacity,
            refill_per_second,
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            eviction_window: Duration::from_secs(DEFAULT_EVICTION_WINDOW_SECS),
        }
    }

    /// Policy that admits everything
    pub fn disabled() -> Self {
        ThrottleConfig {
            enabled: false,
            ..ThrottleConfig::new(1, 1.0)
        }
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn eviction_window(mut self, window: Duration) -> Self {
        self.eviction_window = window;
        self
    }

    /// Check that the policy can admit anything at all
    pub fn validate(&self) -> Result<(), ThrottleError> {
        if self.capacity == 0 {
            return Err(ThrottleError::ZeroCapacity);
        }
        if !self.refill_per_second.is_finite() || self.refill_per_second <= 0.0 {
            return Err(ThrottleError::InvalidRefillRate(self.refill_per_second));
        }
        ensure_positive(self.sweep_interval, ThrottleError::ZeroSweepInterval)?;
        ensure_positive(self.eviction_window, ThrottleError::ZeroEvictionWindow)
    }
}

struct ClientRecord {
    bucket: Arc<Mutex<TokenBucket>>,
    last_seen: Instant,
}

/// Admission control keyed by client identity
///
/// All lookups, inserts and evictions go through one mutex over the client
/// map. The bucket arithmetic runs afterwards under the bucket's own lock, so
/// clients never wait on each other's refill math.
///
/// `last_seen` is bumped inside the map critical section. An eviction sweep
/// therefore observes an admission either entirely before or entirely after
/// it: a client cannot be dropped between its lookup and its refresh.
///
/// Client identities come from network addresses, so a caller cycling source
/// addresses can grow the map until the next sweep. The eviction window is the
/// only bound.
///
/// # Example
///
/// ```
/// use greenlight::{ClientThrottle, ThrottleConfig};
/// use std::time::{Duration, Instant};
///
/// let throttle = ClientThrottle::new(ThrottleConfig::new(1, 1.0)).unwrap();
/// let start = Instant::now();
///
/// assert!(throttle.admit("192.0.2.7", start).is_allowed());
/// assert_eq!(throttle.len(), 1);
///
/// // Silent for longer than the eviction window
/// let later = start + Duration::from_secs(181);
/// assert_eq!(throttle.evict_idle(later), 1);
/// assert!(throttle.is_empty());
/// ```
pub struct ClientThrottle {
    config: ThrottleConfig,
    clients: Mutex<HashMap<String, ClientRecord>>,
}

impl ClientThrottle {
    /// Create a throttle, rejecting unusable policies
    ///
    /// A disabled policy is accepted as-is.
    pub fn new(config: ThrottleConfig) -> Result<Self, ThrottleError> {
        if config.enabled {
            config.validate()?;
        }
        Ok(ClientThrottle {
            config,
            clients: Mutex::new(HashMap::new()),
        })
    }

    /// Decide whether `identity` may proceed at `now`
    ///
    /// Unknown identities get a fresh, full bucket. With limiting disabled this
    /// returns [`Admission::Allowed`] without touching the map.
    pub fn admit(&self, identity: &str, now: Instant) -> Admission {
        if !self.config.enabled {
            return Admission::Allowed;
        }

        let bucket = {
            let mut clients = self.clients.lock();
            let record = clients
                .entry(identity.to_owned())
                .or_insert_with(|| ClientRecord {
                    bucket: Arc::new(Mutex::new(TokenBucket::new(
                        self.config.capacity,
                        self.config.refill_per_second,
                        now,
                    ))),
                    last_seen: now,
                });
            if now > record.last_seen {
                record.last_seen = now;
            }
            Arc::clone(&record.bucket)
        };

        if bucket.lock().try_consume(now) {
            Admission::Allowed
        } else {
            Admission::Denied
        }
    }

    /// Drop every client whose last admission attempt is at least one eviction window old
    ///
    /// Returns the number of clients removed.
    pub fn evict_idle(&self, now: Instant) -> usize {
        let window = self.config.eviction_window;
        let mut clients = self.clients.lock();
        let before = clients.len();
        clients.retain(|_, record| now.saturating_duration_since(record.last_seen) < window);
        before - clients.len()
    }

    /// Whether `identity` currently has a bucket
    pub fn contains(&self, identity: &str) -> bool {
        self.clients.lock().contains_key(identity)
    }

    /// Number of tracked clients
    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }
}
