use std::net::SocketAddr;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::broker::{BrokerHandle, BrokerStatus};

#[derive(Clone)]
pub struct DashboardState {
    pub broker: BrokerHandle,
}

#[derive(Serialize)]
struct PoolSummaryResponse {
    active: usize,
    reserve: usize,
    destroying: usize,
    abandoned: usize,
    pending_reservations: usize,
    oldest_pending_since: Option<DateTime<Utc>>,
    in_flight_creates: usize,
}

impl From<&BrokerStatus> for PoolSummaryResponse {
    fn from(status: &BrokerStatus) -> Self {
        Self {
            active: status.active.len(),
            reserve: status.reserve.len(),
            destroying: status.destroying.len(),
            abandoned: status.abandoned.len(),
            pending_reservations: status.pending_reservations,
            oldest_pending_since: status.oldest_pending_since,
            in_flight_creates: status.in_flight_creates,
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/status", get(status_handler))
        .route("/api/summary", get(summary_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

fn unavailable(e: crate::error::BuildfarmError) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
}

async fn status_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    match state.broker.status().await {
        Ok(status) => Json(status).into_response(),
        Err(e) => unavailable(e).into_response(),
    }
}

async fn summary_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    match state.broker.status().await {
        Ok(status) => Json(PoolSummaryResponse::from(&status)).into_response(),
        Err(e) => unavailable(e).into_response(),
    }
}
