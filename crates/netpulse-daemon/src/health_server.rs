//! HTTP health surface.
//!
//! Endpoints:
//!   GET /health        — JSON of the latest self-health snapshot
//!   GET /health/ready  — 200 while the last store health check passed, else 503
//!   GET /health/live   — 200 "ALIVE" whenever the process responds
//!
//! The self-health driver publishes each snapshot here; handlers only read
//! shared state and never block on collection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Json;
use tracing::{error, info};

use netpulse_core::health::{FleetCounters, HealthSnapshot};
use netpulse_core::tasktable::TaskTable;

/// Live read handles injected at startup so `/health` reports current
/// task counts rather than the last driver snapshot.
struct LiveSources {
    monitor_table: Arc<TaskTable>,
    snmp_table: Arc<TaskTable>,
    counters: Arc<FleetCounters>,
}

/// Shared state between the self-health driver and the HTTP handlers.
pub struct HealthState {
    latest: RwLock<Option<HealthSnapshot>>,
    ready: AtomicBool,
    live: RwLock<Option<LiveSources>>,
}

impl HealthState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            latest: RwLock::new(None),
            ready: AtomicBool::new(false),
            live: RwLock::new(None),
        })
    }

    /// Store a fresh snapshot and derive readiness from the store check.
    pub fn publish(&self, snapshot: HealthSnapshot) {
        self.ready.store(snapshot.store_ok, Ordering::Relaxed);
        *self.latest.write().unwrap() = Some(snapshot);
    }

    /// Mark readiness directly (used once after the startup health check,
    /// before the first driver cycle publishes).
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    /// Inject the live task tables and fleet counters.
    pub fn attach_live(
        &self,
        monitor_table: Arc<TaskTable>,
        snmp_table: Arc<TaskTable>,
        counters: Arc<FleetCounters>,
    ) {
        *self.live.write().unwrap() = Some(LiveSources {
            monitor_table,
            snmp_table,
            counters,
        });
    }

    /// Latest snapshot with the volatile fields re-read live.
    fn current(&self) -> Option<HealthSnapshot> {
        let mut snapshot = self.latest.read().unwrap().clone()?;
        if let Some(live) = self.live.read().unwrap().as_ref() {
            snapshot.monitor_tasks = live.monitor_table.len() as u64;
            snapshot.snmp_tasks = live.snmp_table.len() as u64;
            snapshot.pings_total = live.counters.pings_total();
            snapshot.pings_in_flight = live.counters.pings_in_flight();
            snapshot.uptime_secs = live.counters.start_time.elapsed().as_secs();
        }
        Some(snapshot)
    }
}

/// Start the health server. Should be spawned as a tokio task.
pub async fn run(state: Arc<HealthState>, port: u16) {
    let app = axum::Router::new()
        .route("/health", get(health_handler))
        .route("/health/ready", get(ready_handler))
        .route("/health/live", get(live_handler))
        .with_state(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!(port = port, "health server listening");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(port = port, error = %e, "failed to bind health server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "health server error");
    }
}

async fn health_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    match state.current() {
        Some(snapshot) => Json(snapshot).into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "starting" })),
        )
            .into_response(),
    }
}

async fn ready_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    if state.ready.load(Ordering::Relaxed) {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn live_handler() -> impl IntoResponse {
    (StatusCode::OK, "ALIVE")
}
