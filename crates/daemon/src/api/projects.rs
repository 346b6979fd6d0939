use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use engine::ops::ScriptOperation;
use engine::reconcile::{Drift, Reconciliation};
use engine::{
    ContentKind, ContentStatus, GenerationState, ScriptDescriptor, SegmentId, StatusKey,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use super::error_status;
use crate::db::Database;

#[derive(Deserialize)]
pub struct ApplyRequest {
    operations: Vec<ScriptOperation>,
}

/// A generation collaborator reporting progress on one asset.
#[derive(Deserialize)]
pub struct StatusUpdate {
    segment_id: SegmentId,
    kind: ContentKind,
    state: GenerationState,
    asset_path: Option<PathBuf>,
    error: Option<String>,
}

#[derive(Deserialize)]
pub struct RegenerateRequest {
    kind: ContentKind,
    segment_ids: Vec<SegmentId>,
}

#[derive(Debug, Serialize)]
pub struct ReconcileResponse {
    version: u64,
    drifts: Vec<Drift>,
    status: Vec<ContentStatus>,
}

impl From<Reconciliation> for ReconcileResponse {
    fn from(r: Reconciliation) -> Self {
        ReconcileResponse {
            version: r.descriptor.version,
            drifts: r.drifts,
            status: r.status.into(),
        }
    }
}

pub fn router(db: Arc<Database>) -> Router {
    Router::new()
        .route("/:id/script", get(get_script).put(put_script))
        .route("/:id/script/apply", post(apply_operations))
        .route("/:id/reconcile", post(reconcile))
        .route("/:id/status", get(get_status).put(update_status))
        .route("/:id/status/regenerate", post(regenerate))
        .with_state(db)
}

pub(crate) async fn get_script(
    State(db): State<Arc<Database>>,
    Path(project_id): Path<i64>,
) -> Result<Json<ScriptDescriptor>, StatusCode> {
    let descriptor = db
        .load_script(project_id)
        .map_err(|e| error_status(&e))?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(descriptor))
}

pub(crate) async fn put_script(
    State(db): State<Arc<Database>>,
    Path(project_id): Path<i64>,
    Json(descriptor): Json<ScriptDescriptor>,
) -> Result<Json<ScriptDescriptor>, StatusCode> {
    descriptor
        .validate()
        .map_err(|e| error_status(&anyhow::Error::from(e)))?;
    let stored = db
        .put_script(project_id, &descriptor)
        .map_err(|e| error_status(&e))?;
    info!(project_id, version = stored.version, "script stored");
    Ok(Json(stored))
}

pub(crate) async fn apply_operations(
    State(db): State<Arc<Database>>,
    Path(project_id): Path<i64>,
    Json(req): Json<ApplyRequest>,
) -> Result<Json<ReconcileResponse>, StatusCode> {
    let count = req.operations.len();
    let reconciliation = db
        .edit_script(project_id, |descriptor| {
            for op in req.operations {
                descriptor.apply_operation(op)?;
            }
            Ok(())
        })
        .map_err(|e| error_status(&e))?
        .ok_or(StatusCode::NOT_FOUND)?;
    info!(
        project_id,
        operations = count,
        drifts = reconciliation.drifts.len(),
        "script edited"
    );
    Ok(Json(reconciliation.into()))
}

pub(crate) async fn reconcile(
    State(db): State<Arc<Database>>,
    Path(project_id): Path<i64>,
) -> Result<Json<ReconcileResponse>, StatusCode> {
    let reconciliation = db
        .reconcile_project(project_id)
        .map_err(|e| error_status(&e))?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(reconciliation.into()))
}

pub(crate) async fn get_status(
    State(db): State<Arc<Database>>,
    Path(project_id): Path<i64>,
) -> Result<Json<Vec<ContentStatus>>, StatusCode> {
    let status = db.load_status(project_id).map_err(|e| error_status(&e))?;
    Ok(Json(status.into()))
}

pub(crate) async fn update_status(
    State(db): State<Arc<Database>>,
    Path(project_id): Path<i64>,
    Json(update): Json<StatusUpdate>,
) -> Result<Json<Vec<ContentStatus>>, StatusCode> {
    let key = StatusKey {
        kind: update.kind,
        segment_id: update.segment_id,
    };
    if update.state == GenerationState::Ready && update.asset_path.is_none() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let status = db
        .update_status(project_id, |status| match update.state {
            GenerationState::Pending => status.request_regeneration(key),
            GenerationState::Generating => status.mark_generating(key),
            GenerationState::Ready => {
                status.mark_ready(key, update.asset_path.unwrap_or_default(), Utc::now())
            }
            GenerationState::Failed => status.mark_failed(
                key,
                update
                    .error
                    .unwrap_or_else(|| "generation failed".to_string()),
            ),
        })
        .map_err(|e| error_status(&e))?;
    info!(
        project_id,
        kind = %key.kind,
        segment = %key.segment_id,
        state = %update.state,
        "generation status updated"
    );
    Ok(Json(status.into()))
}

pub(crate) async fn regenerate(
    State(db): State<Arc<Database>>,
    Path(project_id): Path<i64>,
    Json(req): Json<RegenerateRequest>,
) -> Result<Json<Vec<ContentStatus>>, StatusCode> {
    let status = db
        .update_status(project_id, |status| {
            req.segment_ids.iter().try_fold(status.clone(), |cache, &segment_id| {
                cache.request_regeneration(StatusKey {
                    kind: req.kind,
                    segment_id,
                })
            })
        })
        .map_err(|e| error_status(&e))?;
    Ok(Json(status.into()))
}
