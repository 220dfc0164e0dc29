//! Request governance: the middleware stack in front of every route
//!
//! Layers from the outside in:
//!
//! 1. request logging
//! 2. per-client rate limiting, keyed by peer IP
//! 3. panic recovery, answering 500 and closing the connection
//! 4. the routes themselves
//!
//! The governor also owns the reaper that keeps the client map bounded.

use crate::reaper;
use crate::shutdown::ShutdownState;
use crate::transport::http::ApiError;
use axum::Router;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderValue, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use greenlight::{ClientThrottle, ThrottleConfig, ThrottleError};
use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tower_http::catch_panic::CatchPanicLayer;

/// Composition root for admission control
#[derive(Clone)]
pub struct RequestGovernor {
    throttle: Arc<ClientThrottle>,
}

impl RequestGovernor {
    /// # Errors
    ///
    /// Returns an error if limiting is enabled and the policy is invalid.
    pub fn new(config: ThrottleConfig) -> Result<Self, ThrottleError> {
        Ok(RequestGovernor {
            throttle: Arc::new(ClientThrottle::new(config)?),
        })
    }

    pub fn throttle(&self) -> &Arc<ClientThrottle> {
        &self.throttle
    }

    /// Wrap `routes` in the governance middleware
    ///
    /// The result must be served with `ConnectInfo<SocketAddr>` available,
    /// since both logging and rate limiting key on the peer address.
    pub fn layer(&self, routes: Router) -> Router {
        routes
            .layer(CatchPanicLayer::custom(recover_panic))
            .layer(middleware::from_fn_with_state(
                Arc::clone(&self.throttle),
                rate_limit,
            ))
            .layer(middleware::from_fn(log_requests))
    }

    /// Start evicting idle clients until the session stops
    ///
    /// Returns `None` when limiting is disabled, as nothing is ever tracked.
    pub fn spawn_reaper(
        &self,
        shutdown: watch::Receiver<ShutdownState>,
    ) -> Option<JoinHandle<()>> {
        if !self.throttle.config().enabled {
            return None;
        }
        Some(reaper::spawn_reaper(Arc::clone(&self.throttle), shutdown))
    }
}

async fn log_requests(
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    // Skip trailing-slash paths so a redirected request is logged once
    if !request.uri().path().ends_with('/') {
        tracing::info!(
            ip = %peer.ip(),
            method = %request.method(),
            uri = %request.uri(),
            "request"
        );
    }
    next.run(request).await
}

async fn rate_limit(
    State(throttle): State<Arc<ClientThrottle>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let client = peer.ip().to_string();
    if !throttle.admit(&client, Instant::now().into_std()).is_allowed() {
        tracing::debug!(%client, "rate limit exceeded");
        return ApiError::RateLimited.into_response();
    }
    next.run(request).await
}

fn recover_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "unknown panic payload".to_string()
    };
    tracing::error!(%detail, "handler panicked");

    let mut response = ApiError::Internal.into_response();
    response
        .headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("close"));
    response
}
