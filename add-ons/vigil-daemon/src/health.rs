//! `GET /health`: liveness of the daemon itself plus a summary of tracked users.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use vigil_core::{LivenessState, LivenessStore, Scheduler};

#[derive(Clone)]
pub struct HealthState {
    pub scheduler: Arc<Scheduler>,
    pub store: Arc<LivenessStore>,
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub scheduler_running: bool,
    pub tracked_users: usize,
    pub awaiting_response: usize,
    pub inactive: usize,
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(state)
}

async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthReport>) {
    let scheduler_running = !state.scheduler.is_stopped();
    let Ok(records) = state.store.records() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthReport {
                status: "unavailable",
                scheduler_running,
                tracked_users: 0,
                awaiting_response: 0,
                inactive: 0,
            }),
        );
    };
    let count = |wanted: LivenessState| records.iter().filter(|r| r.state() == wanted).count();
    let report = HealthReport {
        status: if scheduler_running { "ok" } else { "stopping" },
        scheduler_running,
        tracked_users: records.len(),
        awaiting_response: count(LivenessState::AwaitingResponse),
        inactive: count(LivenessState::Inactive),
    };
    let code = if scheduler_running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report))
}

/// Serves until `shutdown` flips to `true`.
pub async fn serve(port: u16, state: HealthState, mut shutdown: watch::Receiver<bool>) {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!(target: "vigil::health", %addr, error = %e, "health endpoint disabled: bind failed");
            return;
        }
    };
    info!(target: "vigil::health", %addr, "health endpoint listening");
    let result = axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await;
    if let Err(e) = result {
        warn!(target: "vigil::health", error = %e, "health endpoint failed");
    }
}
