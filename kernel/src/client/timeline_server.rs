// Embedded Timeline Server
//
// A small axum service exposing the table's active timeline as JSON. The
// server owns its tokio runtime so the synchronous write client can start
// and stop it without being async itself.
//
// Routes:
//   GET /timeline  active instants, oldest first
//   GET /health    liveness

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::config::TimelineServerConfig;
use crate::timeline::TimelineStore;

/// How long open connections may drain once shutdown is signalled.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

type SharedStore = Arc<dyn TimelineStore>;

pub struct EmbeddedTimelineServer {
    address: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    runtime: Option<Runtime>,
}

impl std::fmt::Debug for EmbeddedTimelineServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddedTimelineServer")
            .field("address", &self.address)
            .finish()
    }
}

impl EmbeddedTimelineServer {
    pub fn start(config: &TimelineServerConfig, store: SharedStore) -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("timeline-server")
            .enable_all()
            .build()?;

        let listener = runtime.block_on(TcpListener::bind((config.host.as_str(), config.port)))?;
        let address = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let app = router(store);
        runtime.spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = served {
                warn!(error = %e, "timeline server exited with error");
            }
        });

        info!(%address, "embedded timeline server listening");
        Ok(Self {
            address,
            shutdown: Some(shutdown_tx),
            runtime: Some(runtime),
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Stops accepting connections and tears the runtime down. Connections
    /// still open after the grace period are dropped.
    pub fn stop(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        runtime.shutdown_timeout(SHUTDOWN_GRACE);
        info!(address = %self.address, "embedded timeline server stopped");
    }
}

impl Drop for EmbeddedTimelineServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn router(store: SharedStore) -> Router {
    Router::new()
        .route("/timeline", get(timeline))
        .route("/health", get(health))
        .fallback(not_found)
        .with_state(store)
}

async fn timeline(State(store): State<SharedStore>) -> Response {
    let loaded = tokio::task::spawn_blocking(move || store.load())
        .await
        .map_err(|e| e.to_string())
        .and_then(|loaded| loaded.map_err(|e| e.to_string()));
    match loaded {
        Ok(mut instants) => {
            instants.sort();
            Json(json!({ "instants": instants })).into_response()
        }
        Err(error) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": error })),
        )
            .into_response(),
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn not_found() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "not found" })))
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::{TcpListener as StdTcpListener, TcpStream};
    use std::sync::mpsc;
    use std::thread;

    use super::*;
    use crate::timeline::{Action, InMemoryTimelineStore, Instant};

    fn get(address: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(address).unwrap();
        write!(
            stream,
            "GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n"
        )
        .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        response
    }

    fn config() -> TimelineServerConfig {
        TimelineServerConfig {
            enabled: true,
            host: "127.0.0.1".into(),
            port: 0,
        }
    }

    #[test]
    fn serves_active_timeline() {
        let store = Arc::new(InMemoryTimelineStore::default());
        store
            .save(&Instant::completed("001", Action::Commit), None)
            .unwrap();

        let mut server = EmbeddedTimelineServer::start(&config(), store).unwrap();
        let response = get(server.address(), "/timeline");
        server.stop();

        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("\"timestamp\":\"001\""));
    }

    #[test]
    fn health_reports_ok() {
        let store = Arc::new(InMemoryTimelineStore::default());
        let server = EmbeddedTimelineServer::start(&config(), store).unwrap();

        let response = get(server.address(), "/health");
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("\"status\":\"ok\""));
    }

    #[test]
    fn unknown_route_is_404() {
        let store = Arc::new(InMemoryTimelineStore::default());
        let server = EmbeddedTimelineServer::start(&config(), store).unwrap();

        let response = get(server.address(), "/nope");
        assert!(response.starts_with("HTTP/1.1 404"));
    }

    #[test]
    fn idle_connection_does_not_block_stop() {
        let store = Arc::new(InMemoryTimelineStore::default());
        let mut server = EmbeddedTimelineServer::start(&config(), store).unwrap();
        let _idle = TcpStream::connect(server.address()).unwrap();

        let (done_tx, done_rx) = mpsc::channel();
        thread::spawn(move || {
            server.stop();
            let _ = done_tx.send(());
        });
        assert!(done_rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn port_in_use_fails_to_start() {
        let taken = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = config();
        config.port = taken.local_addr().unwrap().port();

        let store = Arc::new(InMemoryTimelineStore::default());
        assert!(EmbeddedTimelineServer::start(&config, store).is_err());
    }
}
