//! Server lifecycle: start, wait for a trigger, drain, stop
//!
//! [`ShutdownCoordinator::run`] owns one serving session. It moves through
//! [`ShutdownState::Running`], [`ShutdownState::Draining`] and
//! [`ShutdownState::Stopped`] exactly once each, in that order, and publishes
//! every transition on a watch channel so background tasks can follow along.
//!
//! Draining is triggered by whichever comes first:
//!
//! - the termination signal future completing
//! - a [`FatalReporter`] reporting an invariant violation
//!
//! The coordinator runs its own accept loop and keeps every connection task
//! in a [`JoinSet`]. Once draining, the listener is closed, idle connections
//! are closed, and busy ones finish their current response before closing.
//! Connections still open at the drain deadline are aborted, which drops
//! their in-flight handlers, before `Stopped` is published.

use axum::Router;
use axum::extract::ConnectInfo;
use hyper::Request;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::{Service, service_fn};
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

const FATAL_BUFFER: usize = 8;

/// Pause after an accept error that is not about a single connection
const ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// Lifecycle phase of the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShutdownState {
    Running,
    Draining,
    Stopped,
}

/// Why a serving session did not end cleanly
#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("listener failed: {0}")]
    Listener(io::Error),
    #[error("in-flight requests did not drain within {0:?}")]
    DrainTimeout(Duration),
    #[error("failed to listen for termination signals: {0}")]
    Signal(io::Error),
    #[error("fatal error: {0}")]
    Fatal(String),
}

/// Handle for reporting an unrecoverable condition from anywhere in the server
///
/// A report starts the drain; the session then ends with
/// [`ShutdownError::Fatal`] so the process exits non-zero.
#[derive(Clone, Debug)]
pub struct FatalReporter {
    tx: mpsc::Sender<String>,
}

impl FatalReporter {
    /// Reporter not tied to a coordinator; reports land on the returned receiver
    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(FATAL_BUFFER);
        (FatalReporter { tx }, rx)
    }

    pub fn report(&self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::error!(%reason, "fatal condition reported");
        // The first report already triggers the drain; later ones are only logged
        let _ = self.tx.try_send(reason);
    }
}

/// Runs one server session from start to [`ShutdownState::Stopped`]
pub struct ShutdownCoordinator {
    drain_timeout: Duration,
    state: watch::Sender<ShutdownState>,
    fatal_tx: mpsc::Sender<String>,
    fatal_rx: mpsc::Receiver<String>,
}

impl ShutdownCoordinator {
    pub fn new(drain_timeout: Duration) -> Self {
        let (state, _) = watch::channel(ShutdownState::Running);
        let (fatal_tx, fatal_rx) = mpsc::channel(FATAL_BUFFER);
        ShutdownCoordinator {
            drain_timeout,
            state,
            fatal_tx,
            fatal_rx,
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    pub fn state(&self) -> ShutdownState {
        *self.state.borrow()
    }

    /// Follow state transitions; the receiver sees `Stopped` last
    pub fn subscribe(&self) -> watch::Receiver<ShutdownState> {
        self.state.subscribe()
    }

    pub fn fatal_reporter(&self) -> FatalReporter {
        FatalReporter {
            tx: self.fatal_tx.clone(),
        }
    }

    /// Serve `router` on `listener` until a trigger fires, then drain
    ///
    /// `signal` is awaited once. Its output names the signal for the log, or
    /// carries the error from installing the handler. Any later signal is
    /// ignored; the drain deadline alone bounds how long shutdown takes.
    ///
    /// # Errors
    ///
    /// Returns the first of: the fatal report or signal setup failure that
    /// caused the shutdown, the listener address being unreadable, or the
    /// drain timing out.
    pub async fn run<F>(
        self,
        listener: TcpListener,
        router: Router,
        signal: F,
    ) -> Result<(), ShutdownError>
    where
        F: Future<Output = io::Result<&'static str>> + Send,
    {
        let ShutdownCoordinator {
            drain_timeout,
            state,
            fatal_tx,
            mut fatal_rx,
        } = self;
        // Held so `recv` never reports a closed channel
        let _fatal_tx = fatal_tx;

        let addr = listener.local_addr().map_err(ShutdownError::Listener)?;
        let mut signal = std::pin::pin!(signal);
        let mut connections = JoinSet::new();

        tracing::info!(%addr, "server running");

        let cause = loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        connections.spawn(serve_connection(
                            stream,
                            remote,
                            router.clone(),
                            state.subscribe(),
                        ));
                    }
                    Err(e) if is_connection_error(&e) => {}
                    Err(e) => {
                        tracing::error!(%addr, error = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(joined) = connections.join_next() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "connection task failed");
                    }
                }
                received = &mut signal => match received {
                    Ok(name) => {
                        tracing::info!(signal = name, "shutting down server");
                        break None;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "signal handling failed, shutting down server");
                        break Some(ShutdownError::Signal(e));
                    }
                },
                Some(reason) = fatal_rx.recv() => {
                    tracing::error!(%reason, "shutting down server after fatal error");
                    break Some(ShutdownError::Fatal(reason));
                }
            }
        };

        // New connections are refused from here on
        drop(listener);
        advance(&state, ShutdownState::Draining);
        tracing::info!(open = connections.len(), "draining connections");

        let all_closed = tokio::time::timeout(drain_timeout, async {
            while connections.join_next().await.is_some() {}
        })
        .await
        .is_ok();

        let drained = if all_closed {
            Ok(())
        } else {
            tracing::warn!(open = connections.len(), "aborting connections after drain deadline");
            connections.abort_all();
            while connections.join_next().await.is_some() {}
            Err(ShutdownError::DrainTimeout(drain_timeout))
        };

        advance(&state, ShutdownState::Stopped);
        match &drained {
            Ok(()) => tracing::info!(%addr, "stopped server"),
            Err(e) => tracing::warn!(%addr, error = %e, "server stopped without a clean drain"),
        }

        match cause {
            Some(err) => Err(err),
            None => drained,
        }
    }
}

/// Serve HTTP/1 on one accepted socket until it closes
///
/// The handler runs inside this task, so aborting the task drops it. When the
/// session starts draining the connection finishes its current response and
/// closes instead of waiting for the next request.
async fn serve_connection(
    stream: TcpStream,
    remote: SocketAddr,
    router: Router,
    state: watch::Receiver<ShutdownState>,
) {
    let service = TowerToHyperService::new(router);
    let service = service_fn(move |mut request: Request<Incoming>| {
        request.extensions_mut().insert(ConnectInfo(remote));
        service.call(request)
    });

    let connection = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
    let mut connection = std::pin::pin!(connection);
    let mut draining = std::pin::pin!(draining(state));
    let mut closing = false;

    loop {
        tokio::select! {
            result = connection.as_mut() => {
                if let Err(e) = result {
                    tracing::debug!(%remote, error = %e, "connection closed with error");
                }
                return;
            }
            _ = &mut draining, if !closing => {
                connection.as_mut().graceful_shutdown();
                closing = true;
            }
        }
    }
}

/// Resolve once the session leaves `Running`
async fn draining(mut state: watch::Receiver<ShutdownState>) {
    let _ = state
        .wait_for(|current| *current >= ShutdownState::Draining)
        .await;
}

/// Errors that concern one peer rather than the listening socket
fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

/// Move forward to `next`; never revisits an earlier state
fn advance(state: &watch::Sender<ShutdownState>, next: ShutdownState) {
    state.send_if_modified(|current| {
        if next > *current {
            *current = next;
            true
        } else {
            false
        }
    });
}

/// Resolve on the first SIGINT or SIGTERM (ctrl-c elsewhere)
///
/// # Errors
///
/// Returns an error if a signal handler cannot be installed.
#[cfg(unix)]
pub async fn termination_signal() -> io::Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = interrupt.recv() => Ok("SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
pub async fn termination_signal() -> io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("ctrl-c")
}
