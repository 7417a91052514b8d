//! Operator endpoints: index invalidation and usage report.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::info;
use utoipa::ToSchema;

use crate::cluster::placement::{BackendUsage, PlacementStrategy};
use crate::errors::S3Error;
use crate::AppState;

/// Body of `GET /_cluster`.
#[derive(Debug, Serialize, ToSchema)]
pub struct ClusterReport {
    pub bucket: String,
    pub strategy: PlacementStrategy,
    pub backends: Vec<BackendUsage>,
}

/// `DELETE /_cache` -- drop the persisted index and the edge cache.
#[utoipa::path(
    delete,
    path = "/_cache",
    tag = "Admin",
    operation_id = "ClearCache",
    responses(
        (status = 204, description = "Index and edge cache cleared")
    )
)]
pub async fn clear_cache(state: Arc<AppState>) -> Result<Response, S3Error> {
    state.cluster.session().clear_index().await?;
    if let Some(cache) = &state.edge_cache {
        cache.purge_all();
    }
    info!("index and edge cache cleared on request");
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// `GET /_cluster` -- per-backend usage as JSON.
#[utoipa::path(
    get,
    path = "/_cluster",
    tag = "Admin",
    operation_id = "ClusterUsage",
    responses(
        (status = 200, description = "Per-backend usage", body = ClusterReport)
    )
)]
pub async fn cluster_usage(state: Arc<AppState>) -> Result<Response, S3Error> {
    let backends = state.cluster.session().usage_report().await?;
    let report = ClusterReport {
        bucket: state.config.server.bucket_name.clone(),
        strategy: state.config.placement.strategy,
        backends,
    };
    Ok(Json(report).into_response())
}
