use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use super::error_status;
use crate::jobs::{JobManager, JobStatus, JobType};

#[derive(Debug, Serialize)]
pub struct JobResponse {
    id: i64,
    job_type: JobType,
    status: JobStatus,
    progress: f64,
    payload: Option<serde_json::Value>,
    result: Option<serde_json::Value>,
    created_at: String,
    updated_at: String,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    cancelled: bool,
}

pub fn router(job_manager: Arc<JobManager>) -> Router {
    Router::new()
        .route("/:id", get(get_job))
        .route("/:id/cancel", post(cancel_job))
        .with_state(job_manager)
}

pub(crate) async fn get_job(
    State(job_manager): State<Arc<JobManager>>,
    Path(id): Path<i64>,
) -> Result<Json<JobResponse>, StatusCode> {
    let job = job_manager
        .get_job(id)
        .map_err(|e| error_status(&e))?
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(JobResponse {
        id: job.id,
        job_type: job.job_type,
        status: job.status,
        progress: job.progress,
        payload: job.payload,
        result: job.result,
        created_at: job.created_at.to_rfc3339(),
        updated_at: job.updated_at.to_rfc3339(),
    }))
}

pub(crate) async fn cancel_job(
    State(job_manager): State<Arc<JobManager>>,
    Path(id): Path<i64>,
) -> Result<Json<CancelResponse>, StatusCode> {
    job_manager
        .get_job(id)
        .map_err(|e| error_status(&e))?
        .ok_or(StatusCode::NOT_FOUND)?;

    let cancelled = job_manager.cancel_job(id).map_err(|e| error_status(&e))?;
    if cancelled {
        info!(job_id = id, "job cancelled");
    }
    Ok(Json(CancelResponse { cancelled }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[tokio::test]
    async fn cancel_then_read_back() {
        let jobs = Arc::new(JobManager::new(Arc::new(Database::in_memory().unwrap())));
        let id = jobs.create_job(JobType::Assemble, None).unwrap();

        let Json(first) = cancel_job(State(jobs.clone()), Path(id)).await.unwrap();
        assert!(first.cancelled);
        let Json(second) = cancel_job(State(jobs.clone()), Path(id)).await.unwrap();
        assert!(!second.cancelled);

        let Json(job) = get_job(State(jobs.clone()), Path(id)).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);

        assert_eq!(
            get_job(State(jobs.clone()), Path(id + 1)).await.unwrap_err(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            cancel_job(State(jobs), Path(id + 1)).await.unwrap_err(),
            StatusCode::NOT_FOUND
        );
    }
}
