//! Snapshot and Diff API Routes

use crate::error::{validation_error, AppResult};
use crate::models::{
    ClearData, PruneData, PruneRequest, SuccessResponse, TakeSnapshotData, TakeSnapshotRequest,
    VersionListData,
};
use crate::snapshot::Diff;
use crate::state::SharedState;
use axum::{
    extract::{Path, State},
    Json,
};
use tracing::info;
use validator::Validate;

/// Capture the requested tables under one new version
pub async fn take_snapshot(
    State(state): State<SharedState>,
    Json(req): Json<TakeSnapshotRequest>,
) -> AppResult<Json<SuccessResponse<TakeSnapshotData>>> {
    req.validate().map_err(|e| validation_error(e.to_string()))?;

    let version_id = state.engine.take(&req.tables).await?;
    info!("Snapshot version {} taken over HTTP", version_id);

    Ok(Json(SuccessResponse::with_data(
        format!("Snapshot version {} created", version_id),
        TakeSnapshotData {
            version_id,
            tables: req.tables,
        },
    )))
}

/// Version ledger of one table, newest first
pub async fn list_versions(
    State(state): State<SharedState>,
    Path(table): Path<String>,
) -> AppResult<Json<SuccessResponse<VersionListData>>> {
    let versions = state.engine.versions(&table).await?;
    Ok(Json(SuccessResponse::with_data(
        format!("{} versions", versions.len()),
        VersionListData { versions },
    )))
}

/// Diff of the two newest snapshots of one table
pub async fn diff_from_previous(
    State(state): State<SharedState>,
    Path(table): Path<String>,
) -> AppResult<Json<Diff>> {
    Ok(Json(state.engine.diff_from_previous(&table).await?))
}

pub async fn prune(
    State(state): State<SharedState>,
    Path(table): Path<String>,
    Json(req): Json<PruneRequest>,
) -> AppResult<Json<SuccessResponse<PruneData>>> {
    req.validate().map_err(|e| validation_error(e.to_string()))?;

    let dropped = state.engine.prune(&table, req.keep).await?;
    Ok(Json(SuccessResponse::with_data(
        format!("Dropped {} snapshot tables", dropped.len()),
        PruneData { dropped },
    )))
}

pub async fn clear(State(state): State<SharedState>) -> AppResult<Json<SuccessResponse<ClearData>>> {
    let dropped = state.engine.clear().await?;
    Ok(Json(SuccessResponse::with_data(
        "All snapshots cleared",
        ClearData { dropped },
    )))
}
