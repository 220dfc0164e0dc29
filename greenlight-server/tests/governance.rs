//! End-to-end tests against a real listener
//!
//! Each test binds 127.0.0.1:0, runs a server session in the background and
//! talks to it over TCP. The termination signal is a oneshot the test fires.

use axum::Router;
use axum::routing::get;
use greenlight::ThrottleConfig;
use greenlight_server::Server;
use greenlight_server::config::{Config, DbConfig, Environment, HttpConfig, LimiterConfig};
use greenlight_server::governor::RequestGovernor;
use greenlight_server::shutdown::{ShutdownCoordinator, ShutdownError, ShutdownState};
use reqwest::StatusCode;
use serde_json::{Value, json};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_test::assert_ok;

struct Session {
    addr: SocketAddr,
    stop: oneshot::Sender<()>,
    states: watch::Receiver<ShutdownState>,
    handle: JoinHandle<Result<(), ShutdownError>>,
}

impl Session {
    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn shutdown(self) -> Result<(), ShutdownError> {
        let _ = self.stop.send(());
        self.handle.await.unwrap()
    }
}

fn config(limiter_enabled: bool, burst: u32) -> Config {
    Config {
        http: HttpConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        },
        env: Environment::Development,
        limiter: LimiterConfig {
            enabled: limiter_enabled,
            rps: 0.01,
            burst,
            sweep_interval: 60,
            eviction_window: 180,
        },
        db: DbConfig {
            dsn: ":memory:".to_string(),
            timeout: 3,
        },
        drain_timeout: 5,
        log_level: "debug".to_string(),
    }
}

fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

fn test_signal(stopped: oneshot::Receiver<()>) -> impl Future<Output = io::Result<&'static str>> {
    async move {
        let _ = stopped.await;
        Ok("test")
    }
}

async fn start_server(config: &Config) -> Session {
    let server = Server::build(config).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let states = server.coordinator().subscribe();
    let (stop, stopped) = oneshot::channel();

    let handle = tokio::spawn(server.run(listener, test_signal(stopped)));
    Session {
        addr,
        stop,
        states,
        handle,
    }
}

/// Serve `routes` behind a disabled limiter with the given drain deadline
async fn start_routes(routes: Router, drain_timeout: Duration) -> Session {
    let governor = RequestGovernor::new(ThrottleConfig::disabled()).unwrap();
    let coordinator = ShutdownCoordinator::new(drain_timeout);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let states = coordinator.subscribe();
    let (stop, stopped) = oneshot::channel();

    let handle = tokio::spawn(coordinator.run(listener, governor.layer(routes), test_signal(stopped)));
    Session {
        addr,
        stop,
        states,
        handle,
    }
}

fn slow_routes(delay: Duration) -> Router {
    Router::new().route(
        "/slow",
        get(move || async move {
            tokio::time::sleep(delay).await;
            "done"
        }),
    )
}

#[tokio::test]
async fn test_burst_then_rate_limited() {
    let session = start_server(&config(true, 3)).await;
    let client = client();

    for _ in 0..3 {
        let response = client.get(session.url("/v1/healthcheck")).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = client.get(session.url("/v1/healthcheck")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "rate limit exceeded");

    assert_ok!(session.shutdown().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_edits_have_one_winner() {
    let session = start_server(&config(false, 1)).await;
    let client = client();

    let created: Value = client
        .post(session.url("/v1/movies"))
        .json(&json!({
            "title": "Arrival",
            "year": 2016,
            "runtime": "116 mins",
            "genres": ["sci-fi", "drama"]
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let uri = session.url(&format!("/v1/movies/{}", created["movie"]["id"]));

    let mut edits = tokio::task::JoinSet::new();
    for n in 0..6 {
        let client = client.clone();
        let uri = uri.clone();
        edits.spawn(async move {
            client
                .patch(&uri)
                .header("X-Expected-Version", "1")
                .json(&json!({ "title": format!("Arrival #{n}") }))
                .send()
                .await
                .unwrap()
                .status()
        });
    }

    let mut ok = 0;
    let mut conflicts = 0;
    while let Some(status) = edits.join_next().await {
        match status.unwrap() {
            StatusCode::OK => ok += 1,
            StatusCode::CONFLICT => conflicts += 1,
            other => panic!("unexpected status {other}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(conflicts, 5);

    let stored: Value = client.get(&uri).send().await.unwrap().json().await.unwrap();
    assert_eq!(stored["movie"]["version"], 2);

    assert_ok!(session.shutdown().await);
}

#[tokio::test]
async fn test_in_flight_request_finishes_during_drain() {
    let session = start_routes(slow_routes(Duration::from_millis(400)), Duration::from_secs(5)).await;
    let url = session.url("/slow");

    let request = tokio::spawn(async move { client().get(url).send().await?.text().await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut states = session.states.clone();
    assert_ok!(session.shutdown().await);

    assert_eq!(request.await.unwrap().unwrap(), "done");
    assert_eq!(*states.borrow_and_update(), ShutdownState::Stopped);
}

#[tokio::test]
async fn test_new_connections_refused_once_draining() {
    let session = start_routes(slow_routes(Duration::from_secs(1)), Duration::from_secs(5)).await;
    let url = session.url("/slow");
    let addr = session.addr;

    let request = tokio::spawn(async move { client().get(url).send().await?.text().await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut states = session.states.clone();
    let _ = session.stop.send(());
    states
        .wait_for(|state| *state >= ShutdownState::Draining)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(TcpStream::connect(addr).await.is_err());
    assert_eq!(request.await.unwrap().unwrap(), "done");
    session.handle.await.unwrap().unwrap();
}

/// Flags its drop so a test can see a handler future being torn down
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_drain_deadline_tears_down_stuck_connections() {
    let dropped = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));
    let routes = {
        let dropped = dropped.clone();
        let finished = finished.clone();
        Router::new().route(
            "/stuck",
            get(move || {
                let guard = DropFlag(dropped.clone());
                let finished = finished.clone();
                async move {
                    let _guard = guard;
                    tokio::time::sleep(Duration::from_millis(1500)).await;
                    finished.store(true, Ordering::SeqCst);
                    "done"
                }
            }),
        )
    };
    let session = start_routes(routes, Duration::from_millis(200)).await;
    let url = session.url("/stuck");

    let request = tokio::spawn(async move { client().get(url).send().await?.text().await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    match session.shutdown().await {
        Err(ShutdownError::DrainTimeout(timeout)) => assert_eq!(timeout, Duration::from_millis(200)),
        other => panic!("expected drain timeout, got {other:?}"),
    }
    assert!(started.elapsed() < Duration::from_secs(1));

    // The handler was dropped before Stopped was published
    assert!(dropped.load(Ordering::SeqCst));
    assert!(request.await.unwrap().is_err());

    tokio::time::sleep(Duration::from_millis(1600)).await;
    assert!(!finished.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_fatal_report_stops_server_with_error() {
    let config = config(true, 4);
    let server = Server::build(&config).unwrap();
    let reporter = server.coordinator().fatal_reporter();
    let mut states = server.coordinator().subscribe();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

    let handle = tokio::spawn(server.run(
        listener,
        std::future::pending::<io::Result<&'static str>>(),
    ));
    reporter.report("movie 12 has version -1");

    match handle.await.unwrap() {
        Err(ShutdownError::Fatal(reason)) => assert_eq!(reason, "movie 12 has version -1"),
        other => panic!("expected fatal error, got {other:?}"),
    }
    assert_eq!(*states.borrow_and_update(), ShutdownState::Stopped);
}
