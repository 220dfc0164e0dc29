//! # Greenlight
//!
//! Request-governance primitives for a JSON API: per-client token buckets with
//! idle eviction, and optimistic versioning for mutable records.
//!
//! ## Overview
//!
//! - **[`TokenBucket`]**: lazy, time-based refill. No timers, no blocking.
//! - **[`ClientThrottle`]**: one bucket per client identity behind a single
//!   mutex, plus an eviction sweep that a runtime can call periodically.
//! - **[`Repository`]**: the contract a record store must honour so that a
//!   version check and a write happen as one indivisible operation.
//!
//! ## Quick Start
//!
//! ```
//! use greenlight::{Admission, ClientThrottle, ThrottleConfig};
//! use std::time::Instant;
//!
//! // Burst of 4, refilling 2 tokens per second
//! let throttle = ClientThrottle::new(ThrottleConfig::new(4, 2.0)).unwrap();
//!
//! let now = Instant::now();
//! for _ in 0..4 {
//!     assert_eq!(throttle.admit("10.0.0.1", now), Admission::Allowed);
//! }
//! assert_eq!(throttle.admit("10.0.0.1", now), Admission::Denied);
//!
//! // Other clients have their own bucket
//! assert!(throttle.admit("10.0.0.2", now).is_allowed());
//! ```
//!
//! ## Optimistic Updates
//!
//! ```
//! use greenlight::{InMemoryRepository, RecordError, Repository};
//!
//! let repo = InMemoryRepository::<String>::new();
//! let mut record = repo.insert("draft".to_string()).unwrap();
//! assert_eq!(record.version, 1);
//!
//! // Two writers read version 1
//! let mut stale = record.clone();
//!
//! record.payload = "first".to_string();
//! assert_eq!(repo.update_if_version(&record).unwrap(), 2);
//!
//! stale.payload = "second".to_string();
//! assert!(matches!(repo.update_if_version(&stale), Err(RecordError::Conflict)));
//! assert_eq!(repo.fetch(record.id).unwrap().payload, "first");
//! ```
//!
//! ## Thread Safety
//!
//! [`ClientThrottle`] and [`InMemoryRepository`] take `&self` and are safe to
//! share behind an `Arc`. [`TokenBucket`] is plain state and is not.
//!
//! ## Features
//!
//! - `ahash` (default): Use AHash for the client map

pub mod core;

pub use core::{
    Admission, ClientThrottle, InMemoryRepository, RecordError, Repository, ThrottleConfig,
    ThrottleError, TokenBucket, VersionedRecord,
};
