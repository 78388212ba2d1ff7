//! HTTP API for health checks, status, and monitoring

use crate::chain::{ChainConnectionManager, Connector};
use crate::config::ApiConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::state::{CacheStats, IdempotencyCache, ProposalRecord};

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
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared application state
pub struct AppState<C: Connector> {
    pub connections: Arc<ChainConnectionManager<C>>,
    pub cache: Arc<IdempotencyCache>,
    pub started_at: Instant,
}

impl<C: Connector> Clone for AppState<C> {
    fn clone(&self) -> Self {
        Self {
            connections: Arc::clone(&self.connections),
            cache: Arc::clone(&self.cache),
            started_at: self.started_at,
        }
    }
}

/// Build the API router
pub fn router<C: Connector>(state: AppState<C>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check::<C>))
        .route("/status", get(get_status::<C>))
        .route("/chains", get(get_chains::<C>))
        .route("/proposals/:id", get(get_proposal::<C>))
        .route("/metrics", get(crate::metrics::metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server<C: Connector>(config: ApiConfig, state: AppState<C>) -> RelayerResult<()> {
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| RelayerError::Config(format!("bind api {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| RelayerError::Internal(format!("api server: {}", e)))
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - every chain answers and none is degraded
async fn readiness_check<C: Connector>(State(state): State<AppState<C>>) -> impl IntoResponse {
    let chain_health = state.connections.health_check().await;
    let degraded = state.connections.degraded_chains();
    let ready = degraded.is_empty() && chain_health.iter().all(|(_, healthy)| *healthy);

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready,
            degraded_chains: degraded,
            details: to_chain_health(&state, chain_health),
        }),
    )
}

/// Get relayer status
async fn get_status<C: Connector>(State(state): State<AppState<C>>) -> impl IntoResponse {
    let chain_health = state.connections.health_check().await;

    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        connected_chains: state.connections.connected_chains(),
        degraded_chains: state.connections.degraded_chains(),
        chain_status: to_chain_health(&state, chain_health),
        cache: state.cache.stats().await,
    })
}

/// Get configured and connected chains
async fn get_chains<C: Connector>(State(state): State<AppState<C>>) -> impl IntoResponse {
    Json(ChainsResponse {
        configured: state.connections.chain_ids(),
        connected: state.connections.connected_chains(),
    })
}

/// Cached progress of one proposal
async fn get_proposal<C: Connector>(
    State(state): State<AppState<C>>,
    Path(id): Path<u64>,
) -> impl IntoResponse {
    match state.cache.get(id).await {
        Some(record) => (
            StatusCode::OK,
            Json(ProposalResponse {
                proposal_id: id,
                record: Some(record),
                settled: record.finalized && record.status_synced,
            }),
        ),
        None => (
            StatusCode::NOT_FOUND,
            Json(ProposalResponse {
                proposal_id: id,
                record: None,
                settled: false,
            }),
        ),
    }
}

fn to_chain_health<C: Connector>(state: &AppState<C>, results: Vec<(u64, bool)>) -> Vec<ChainHealth> {
    results
        .into_iter()
        .map(|(chain_id, healthy)| ChainHealth {
            chain_id,
            healthy,
            reconnect_attempts: state.connections.reconnect_attempts(chain_id),
        })
        .collect()
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
    degraded_chains: Vec<u64>,
    details: Vec<ChainHealth>,
}

#[derive(Serialize)]
struct ChainHealth {
    chain_id: u64,
    healthy: bool,
    reconnect_attempts: u32,
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    uptime_seconds: u64,
    connected_chains: Vec<u64>,
    degraded_chains: Vec<u64>,
    chain_status: Vec<ChainHealth>,
    cache: CacheStats,
}

#[derive(Serialize)]
struct ChainsResponse {
    configured: Vec<u64>,
    connected: Vec<u64>,
}

#[derive(Serialize)]
struct ProposalResponse {
    proposal_id: u64,
    record: Option<ProposalRecord>,
    settled: bool,
}
