//! HTTP API for health checks, status, and monitoring

use crate::chain::ChainClient;
use crate::config::ApiConfig;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::state::StateStore;
use crate::tx::{GasAdmissionGate, GasStatistics, NonceCoordinator, NonceStatus};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub nonces: Arc<NonceCoordinator>,
    pub gate: Arc<GasAdmissionGate>,
    pub chain_client: Arc<ChainClient>,
    pub store: StateStore,
    pub started_at: Instant,
}

/// Build the API router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/status", get(get_status))
        .route("/chains/:chain/gas", get(get_chain_gas))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any))
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> CoordinatorResult<()> {
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - state directory writable and RPC reachable
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let state_ok = state.store.health_check().is_ok();

    let chain_health = state.chain_client.health_check().await;
    let chains_ok = chain_health.iter().all(|(_, healthy)| *healthy);

    let status = if state_ok && chains_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready: state_ok && chains_ok,
            state_dir: state_ok,
            chains: chains_ok,
            details: chain_health
                .into_iter()
                .map(|(chain, healthy)| ChainHealth { chain, healthy })
                .collect(),
        }),
    )
}

/// Nonce and gas snapshot for every chain
async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        connected_chains: state.chain_client.connected_chains(),
        nonces: state.nonces.status().await,
        gas: state.gate.get_status_report().await,
    })
}

/// Gas statistics for a single chain
async fn get_chain_gas(
    State(state): State<AppState>,
    Path(chain): Path<String>,
) -> Result<Json<GasStatistics>, (StatusCode, Json<ErrorResponse>)> {
    state
        .gate
        .get_statistics(&chain)
        .await
        .map(Json)
        .map_err(error_response)
}

fn error_response(error: CoordinatorError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &error {
        CoordinatorError::UnknownChain { .. } => StatusCode::NOT_FOUND,
        e if e.is_validation() => StatusCode::BAD_REQUEST,
        e if e.is_retryable() => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    state_dir: bool,
    chains: bool,
    details: Vec<ChainHealth>,
}

#[derive(Serialize)]
struct ChainHealth {
    chain: String,
    healthy: bool,
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    uptime_seconds: u64,
    connected_chains: Vec<String>,
    nonces: Vec<NonceStatus>,
    gas: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    error: String,
}
