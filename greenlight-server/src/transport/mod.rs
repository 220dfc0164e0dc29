//! Network surface of the server
//!
//! Only an HTTP/JSON transport exists. Its routes are plain axum handlers;
//! admission control and panic recovery are layered on by
//! [`crate::governor::RequestGovernor`], and the serving loop belongs to
//! [`crate::shutdown::ShutdownCoordinator`].

pub mod http;
