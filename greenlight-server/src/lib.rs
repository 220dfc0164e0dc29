//! # Greenlight Server
//!
//! A JSON API for movie records that stays well-behaved under load and
//! under concurrent edits.
//!
//! ## What it guards against
//!
//! - **Noisy clients**: every peer IP gets its own token bucket; requests
//!   beyond the burst are answered with 429 until tokens refill
//! - **Lost updates**: each movie carries a version, and an update only
//!   lands if nobody else has written since it was read
//! - **Abrupt exits**: on SIGINT or SIGTERM the server stops accepting
//!   connections and lets in-flight requests finish, up to a deadline
//!
//! ## Quick Start
//!
//! ```bash
//! # Show all available options
//! greenlight --help
//!
//! # Serve on port 4000 with a file-backed store
//! greenlight --port 4000 --db-dsn ./greenlight.db
//!
//! # Stricter limiting
//! greenlight --limiter-rps 1 --limiter-burst 2
//!
//! # List all available environment variables
//! greenlight --list-env-vars
//! ```
//!
//! ## Architecture
//!
//! ```text
//!   request
//!      │
//! ┌────▼──────────────────────────┐
//! │ RequestGovernor               │
//! │  log → rate limit → recover   │◄── reaper (evicts idle clients)
//! └────┬──────────────────────────┘
//!      │
//! ┌────▼─────┐   ┌─────────────────┐   ┌────────┐
//! │  routes  ├──►│ OptimisticStore ├──►│ SQLite │
//! └──────────┘   └─────────────────┘   └────────┘
//!
//! ShutdownCoordinator: Running → Draining → Stopped
//! ```
//!
//! ## Usage
//!
//! ```bash
//! curl -i -X POST localhost:4000/v1/movies \
//!   -d '{"title":"Moana","year":2016,"runtime":"107 mins","genres":["animation"]}'
//!
//! # Second page of comedies, newest first
//! curl -i 'localhost:4000/v1/movies?genres=comedy&page=2&page_size=5&sort=-year'
//!
//! # Update only if nobody changed it since version 1
//! curl -i -X PATCH localhost:4000/v1/movies/1 \
//!   -H 'X-Expected-Version: 1' -d '{"year":2017}'
//! ```

pub mod config;
pub mod governor;
pub mod reaper;
pub mod shutdown;
pub mod store;
pub mod transport;
pub mod types;

use crate::config::Config;
use crate::governor::RequestGovernor;
use crate::shutdown::{ShutdownCoordinator, ShutdownError, termination_signal};
use crate::store::{CatalogStore, OptimisticStore};
use crate::store::sqlite::SqliteMovieRepository;
use crate::transport::http::{AppState, routes};
use crate::types::Movie;
use anyhow::{Context, Result};
use axum::Router;
use std::future::Future;
use std::io;
use std::sync::Arc;
use tokio::net::TcpListener;

/// A fully wired server, ready to run on a listener
pub struct Server {
    router: Router,
    governor: RequestGovernor,
    coordinator: ShutdownCoordinator,
}

impl Server {
    /// Open the store and assemble routes, middleware and lifecycle
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be opened or the limiter policy
    /// is invalid.
    pub fn build(config: &Config) -> Result<Self> {
        let repository = SqliteMovieRepository::open(&config.db.dsn, config.db.timeout())
            .with_context(|| format!("failed to open movie store at {}", config.db.dsn))?;
        let repository = Arc::new(repository);
        let movies = OptimisticStore::<Movie>::new(repository.clone(), config.db.timeout());
        let catalog = CatalogStore::new(repository, config.db.timeout());

        let governor = RequestGovernor::new(config.limiter.throttle_config())
            .context("invalid rate limiter configuration")?;
        let coordinator = ShutdownCoordinator::new(config.drain_timeout());

        let state = AppState {
            movies,
            catalog,
            env: config.env,
            fatal: coordinator.fatal_reporter(),
        };
        let router = governor.layer(routes(state));

        Ok(Server {
            router,
            governor,
            coordinator,
        })
    }

    pub fn coordinator(&self) -> &ShutdownCoordinator {
        &self.coordinator
    }

    pub fn governor(&self) -> &RequestGovernor {
        &self.governor
    }

    /// Serve until `signal` resolves or a fatal error is reported, then drain
    ///
    /// # Errors
    ///
    /// See [`ShutdownCoordinator::run`].
    pub async fn run<F>(self, listener: TcpListener, signal: F) -> Result<(), ShutdownError>
    where
        F: Future<Output = io::Result<&'static str>> + Send,
    {
        let Server {
            router,
            governor,
            coordinator,
        } = self;

        let reaper = governor.spawn_reaper(coordinator.subscribe());
        let result = coordinator.run(listener, router, signal).await;

        if let Some(reaper) = reaper {
            if let Err(e) = reaper.await {
                tracing::warn!(error = %e, "reaper task failed");
            }
        }
        result
    }
}

/// Bind the configured address and serve until a termination signal
///
/// # Errors
///
/// Returns an error if binding fails or the session ends unclean.
pub async fn serve(config: Config) -> Result<()> {
    let server = Server::build(&config)?;

    let addr = format!("{}:{}", config.http.host, config.http.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!(
        addr = %listener.local_addr()?,
        env = %config.env,
        limiter = config.limiter.enabled,
        "starting server"
    );

    server.run(listener, termination_signal()).await?;
    Ok(())
}
