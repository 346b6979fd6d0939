use axum::{http::StatusCode, Router};
use engine::ops::EditError;
use engine::AssemblyError;
use std::sync::Arc;
use tracing::{error, warn};

use crate::assembly::Assembler;
use crate::db::Database;
use crate::jobs::JobManager;

pub mod assemble;
pub mod jobs;
pub mod projects;

pub fn router(db: Arc<Database>, job_manager: Arc<JobManager>, assembler: Arc<Assembler>) -> Router {
    Router::new()
        .nest("/projects", {
            Router::new()
                .merge(projects::router(db.clone()))
                .merge(assemble::router(db, job_manager.clone(), assembler))
        })
        .nest("/jobs", jobs::router(job_manager))
}

/// Map a handler error to a response status, logging it on the way.
pub(crate) fn error_status(e: &anyhow::Error) -> StatusCode {
    let status = if let Some(err) = e.downcast_ref::<AssemblyError>() {
        match err {
            AssemblyError::StaleState { .. } => StatusCode::CONFLICT,
            AssemblyError::IncompleteAssets { .. } | AssemblyError::DurationResolution { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            AssemblyError::AudioReuse { .. }
            | AssemblyError::AudioDropped { .. }
            | AssemblyError::InvalidPattern(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    } else if e.downcast_ref::<EditError>().is_some() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };

    if status.is_server_error() {
        error!("request failed: {:#}", e);
    } else {
        warn!("request rejected: {:#}", e);
    }
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine::SegmentId;

    #[test]
    fn errors_map_to_status_codes() {
        let stale: anyhow::Error = AssemblyError::StaleState {
            reason: "version".to_string(),
        }
        .into();
        assert_eq!(error_status(&stale), StatusCode::CONFLICT);

        let edit: anyhow::Error = EditError::InvalidBounds(SegmentId(1)).into();
        assert_eq!(error_status(&edit), StatusCode::BAD_REQUEST);

        let io = anyhow::anyhow!("disk full");
        assert_eq!(error_status(&io), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
