//! HTTP API

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use ipfilter::{FilterMaps, IpStats, ReconcileReport, StatsReport};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::AppState;

const DEFAULT_TOP: usize = 10;

pub fn router<M>(state: Arc<AppState<M>>) -> Router
where
    M: FilterMaps + Send + 'static,
{
    Router::new()
        .route("/", get(index))
        .route("/stats", get(get_stats::<M>))
        .route("/stats/top", get(get_top::<M>))
        .route("/generation", get(get_generation::<M>))
        .route("/reload", post(reload::<M>))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve<M>(state: Arc<AppState<M>>, port: u16) -> Result<()>
where
    M: FilterMaps + Send + 'static,
{
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("API listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state)).await?;
    Ok(())
}

// === Handlers ===

async fn index() -> &'static str {
    r#"ipfilter

Endpoints:
  GET  /stats              - Global totals and per-source counters
  GET  /stats/top?limit=N  - Top N sources by dropped packets
  GET  /generation         - Current generation marker and interface
  POST /reload             - Reconcile against the config file now
"#
}

async fn get_stats<M: FilterMaps + Send>(
    State(state): State<Arc<AppState<M>>>,
) -> Result<Json<StatsReport>, StatusCode> {
    state.report().await.map(Json).map_err(|e| {
        error!("Failed to read statistics: {:#}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

#[derive(Deserialize)]
struct TopQuery {
    limit: Option<usize>,
}

async fn get_top<M: FilterMaps + Send>(
    State(state): State<Arc<AppState<M>>>,
    Query(query): Query<TopQuery>,
) -> Result<Json<Vec<IpStats>>, StatusCode> {
    let report = state.report().await.map_err(|e| {
        error!("Failed to read statistics: {:#}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    let limit = query.limit.unwrap_or(DEFAULT_TOP);
    Ok(Json(report.top(limit).to_vec()))
}

#[derive(Serialize)]
struct GenerationDto {
    generation: u64,
    interface: Option<String>,
}

async fn get_generation<M: FilterMaps + Send>(
    State(state): State<Arc<AppState<M>>>,
) -> Json<GenerationDto> {
    let reconciler = state.reconciler.lock().await;
    Json(GenerationDto {
        generation: reconciler.generation(),
        interface: reconciler.interface().map(str::to_string),
    })
}

async fn reload<M: FilterMaps + Send>(
    State(state): State<Arc<AppState<M>>>,
) -> Result<Json<ReconcileReport>, (StatusCode, String)> {
    state
        .reload()
        .await
        .map(Json)
        .map_err(|e| (StatusCode::UNPROCESSABLE_ENTITY, format!("{:#}", e)))
}
