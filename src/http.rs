//! Peer-facing HTTP endpoints.
//!
//! | Method | Path | Body / params | Response |
//! |--------|------|---------------|----------|
//! | `POST` | `/internal/sync` | [`SyncBatch`] | [`SyncAck`] |
//! | `GET` | `/internal/records` | [`RecordQuery`] | [`RecordsResponse`] |
//! | `GET` | `/internal/changes` | `since`, `until`, `limit` | [`ChangesResponse`] |
//! | `GET` | `/health` | | [`HealthResponse`] |
//! | `GET` | `/status` | | [`StatusReport`] |
//!
//! A body that does not parse as a batch is refused by the extractor
//! (4xx). A batch whose individual entries are malformed is still accepted;
//! those entries are counted in `rejected`. Store failures map to 500 so
//! the sending peer retries on its next tick.

use crate::coordinator::SyncEngine;
use crate::error::ReplicationError;
use crate::record::RecordQuery;
use crate::store::RegionStore;
use crate::wire::{ChangesResponse, HealthResponse, RecordsResponse, StatusReport, SyncAck, SyncBatch};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

impl IntoResponse for ReplicationError {
    fn into_response(self) -> Response {
        let status = match &self {
            ReplicationError::MalformedEntry(_) | ReplicationError::Config(_) => StatusCode::BAD_REQUEST,
            ReplicationError::StaleWrite { .. } | ReplicationError::InvalidState { .. } => StatusCode::CONFLICT,
            ReplicationError::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Parameters of `GET /internal/changes`.
#[derive(Debug, Deserialize)]
pub struct ChangesParams {
    #[serde(default)]
    pub since: i64,
    #[serde(default)]
    pub until: Option<i64>,
    #[serde(default = "default_changes_limit")]
    pub limit: usize,
}

fn default_changes_limit() -> usize {
    1000
}

/// Build the router for one region.
pub fn router<S: RegionStore>(engine: Arc<SyncEngine<S>>) -> Router {
    Router::new()
        .route("/internal/sync", post(receive_sync::<S>))
        .route("/internal/records", get(local_records::<S>))
        .route("/internal/changes", get(changes::<S>))
        .route("/health", get(health::<S>))
        .route("/status", get(status::<S>))
        .with_state(engine)
}

/// Serve the region's endpoints until `shutdown` resolves.
pub async fn serve<S, F>(engine: Arc<SyncEngine<S>>, listener: TcpListener, shutdown: F) -> std::io::Result<()>
where
    S: RegionStore,
    F: Future<Output = ()> + Send + 'static,
{
    let region = engine.local_region().to_string();
    if let Ok(addr) = listener.local_addr() {
        info!(region = %region, %addr, "Serving sync endpoints");
    }
    axum::serve(listener, router(engine))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn receive_sync<S: RegionStore>(
    State(engine): State<Arc<SyncEngine<S>>>,
    Json(batch): Json<SyncBatch>,
) -> Result<Json<SyncAck>, ReplicationError> {
    Ok(Json(engine.receive_batch(batch).await?))
}

async fn local_records<S: RegionStore>(
    State(engine): State<Arc<SyncEngine<S>>>,
    Query(query): Query<RecordQuery>,
) -> Result<Json<RecordsResponse>, ReplicationError> {
    let records = engine.local_records(&query).await?;
    Ok(Json(RecordsResponse {
        region: engine.local_region().to_string(),
        records,
    }))
}

async fn changes<S: RegionStore>(
    State(engine): State<Arc<SyncEngine<S>>>,
    Query(params): Query<ChangesParams>,
) -> Result<Json<ChangesResponse>, ReplicationError> {
    let operations = engine
        .changes_between(params.since, params.until, params.limit)
        .await?;
    Ok(Json(ChangesResponse {
        region: engine.local_region().to_string(),
        operations,
    }))
}

async fn health<S: RegionStore>(State(engine): State<Arc<SyncEngine<S>>>) -> Json<HealthResponse> {
    Json(engine.health())
}

async fn status<S: RegionStore>(
    State(engine): State<Arc<SyncEngine<S>>>,
) -> Result<Json<StatusReport>, ReplicationError> {
    Ok(Json(engine.status().await?))
}
