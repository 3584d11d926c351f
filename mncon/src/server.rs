//! HTTP health endpoint aggregating liveness of the connector's clients.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use http_body_util::Full;
use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tower_http::catch_panic::CatchPanicLayer;
use tracing::{info, warn};

pub type MonitorError = Box<dyn std::error::Error + Send + Sync>;

/// A named liveness probe. Returns `Ok` when the component is healthy.
#[async_trait]
pub trait NamedMonitor: Send + Sync {
    fn name(&self) -> &str;
    async fn monitor(&self) -> Result<(), MonitorError>;
}

#[derive(Debug, Error)]
pub enum Error {
    /// Sentinel returned by [`Server::run`] once a graceful shutdown
    /// completes, so the supervisor can tell a clean close from a failure.
    #[error("server closed")]
    Closed,
    #[error("server error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
enum Status {
    #[serde(rename = "UP")]
    Up,
    #[serde(rename = "DOWN")]
    Down,
}

#[derive(Debug, Serialize)]
struct ComponentHealth {
    status: Status,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: Status,
    components: HashMap<String, ComponentHealth>,
}

#[derive(Clone)]
struct AppState {
    monitors: Arc<Vec<Arc<dyn NamedMonitor>>>,
}

pub struct Server {
    addr: String,
    monitors: Vec<Arc<dyn NamedMonitor>>,
    shutdown: Arc<Notify>,
}

impl Server {
    pub fn new(addr: impl Into<String>, monitors: Vec<Arc<dyn NamedMonitor>>) -> Self {
        Self {
            addr: addr.into(),
            monitors,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Serves `GET /healthz` until [`Server::close`] is called.
    ///
    /// A completed graceful shutdown surfaces as [`Error::Closed`] rather
    /// than `Ok`, mirroring the sentinel a supervisor waits for.
    pub async fn run(&self) -> Result<(), Error> {
        let listener = TcpListener::bind(&self.addr).await?;
        info!(addr = %self.addr, "server started");

        let shutdown = self.shutdown.clone();
        axum::serve(listener, router(self.monitors.clone()))
            .with_graceful_shutdown(async move { shutdown.notified().await })
            .await?;
        Err(Error::Closed)
    }

    /// Starts a graceful shutdown; in-flight health checks complete first.
    pub fn close(&self) {
        info!(addr = %self.addr, "server gracefully shutting down");
        self.shutdown.notify_one();
    }
}

fn router(monitors: Vec<Arc<dyn NamedMonitor>>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .with_state(AppState {
            monitors: Arc::new(monitors),
        })
        .layer(CatchPanicLayer::custom(handle_panic))
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    let mut status = Status::Up;
    let mut components = HashMap::with_capacity(state.monitors.len());
    for monitor in state.monitors.iter() {
        let component_status = match monitor.monitor().await {
            Ok(()) => Status::Up,
            Err(err) => {
                warn!(component = monitor.name(), error = %err, "component is down");
                status = Status::Down;
                Status::Down
            }
        };
        components.insert(
            monitor.name().to_string(),
            ComponentHealth {
                status: component_status,
            },
        );
    }
    Json(HealthResponse { status, components })
}

fn handle_panic(_err: Box<dyn std::any::Any + Send + 'static>) -> http::Response<Full<Bytes>> {
    let mut res = http::Response::new(Full::default());
    *res.status_mut() = http::StatusCode::INTERNAL_SERVER_ERROR;
    res
}
