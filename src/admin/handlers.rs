use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};

use crate::http::server::AppState;
use crate::store::{PruneStats, StoreError};

#[derive(Serialize, Deserialize)]
pub struct SystemStatus {
    pub version: String,
    pub status: String,
    pub origin: String,
    pub store_root: String,
    pub held_locks: usize,
    pub surrogates: Vec<String>,
    pub debug: bool,
}

#[derive(Serialize, Deserialize)]
pub struct PurgeRequest {
    pub url: String,
}

#[derive(Serialize, Deserialize)]
pub struct PurgeResult {
    pub url: String,
    pub purged: bool,
}

#[derive(Serialize, Deserialize)]
pub struct CleanupResult {
    pub released: usize,
}

#[derive(Serialize, Deserialize)]
pub struct ClearResult {
    pub removed: usize,
}

#[derive(Serialize, Deserialize)]
pub struct TagsRequest {
    pub tags: Vec<String>,
}

#[derive(Serialize, Deserialize)]
pub struct TagsResult {
    pub tags: Vec<String>,
    pub removed: usize,
}

fn store_failure(operation: &str, e: StoreError) -> (StatusCode, String) {
    tracing::error!(operation, error = %e, "Admin store operation failed");
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

pub async fn get_status(State(state): State<AppState>) -> Json<SystemStatus> {
    let inner = state.inner.load_full();
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION").to_string(),
        status: "operational".to_string(),
        origin: inner.config.origin.address.clone(),
        store_root: inner.config.store.root.clone(),
        held_locks: inner.cache.store().held_locks(),
        surrogates: inner
            .cache
            .surrogates()
            .iter()
            .map(|s| s.name().to_string())
            .collect(),
        debug: inner.cache.options().debug,
    })
}

pub async fn purge(
    State(state): State<AppState>,
    Json(body): Json<PurgeRequest>,
) -> Result<Json<PurgeResult>, (StatusCode, String)> {
    let inner = state.inner.load_full();
    match inner.cache.store().purge(&body.url) {
        Ok(purged) => {
            tracing::info!(url = %body.url, purged, "Admin purge");
            Ok(Json(PurgeResult { url: body.url, purged }))
        }
        Err(e) => {
            tracing::error!(url = %body.url, error = %e, "Admin purge failed");
            Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

pub async fn cleanup(State(state): State<AppState>) -> Json<CleanupResult> {
    let inner = state.inner.load_full();
    let store = inner.cache.store();
    let released = store.held_locks();
    store.cleanup();
    tracing::info!(released, "Admin lock cleanup");
    Json(CleanupResult { released })
}

pub async fn prune(State(state): State<AppState>) -> Result<Json<PruneStats>, (StatusCode, String)> {
    let inner = state.inner.load_full();
    let stats = inner.cache.store().prune().map_err(|e| store_failure("prune", e))?;
    tracing::info!(variants = stats.variants, bodies = stats.bodies, "Admin prune");
    Ok(Json(stats))
}

pub async fn clear(State(state): State<AppState>) -> Result<Json<ClearResult>, (StatusCode, String)> {
    let inner = state.inner.load_full();
    let removed = inner.cache.store().clear().map_err(|e| store_failure("clear", e))?;
    tracing::info!(removed, "Admin clear");
    Ok(Json(ClearResult { removed }))
}

pub async fn invalidate_tags(
    State(state): State<AppState>,
    Json(body): Json<TagsRequest>,
) -> Result<Json<TagsResult>, (StatusCode, String)> {
    let inner = state.inner.load_full();
    let removed = inner
        .cache
        .store()
        .invalidate_tags(&body.tags)
        .map_err(|e| store_failure("invalidate-tags", e))?;
    tracing::info!(tags = ?body.tags, removed, "Admin tag invalidation");
    Ok(Json(TagsResult { tags: body.tags, removed }))
}
