use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::post,
    Router,
};
use engine::planner::SequencePattern;
use engine::RenderSettings;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use super::error_status;
use crate::assembly::{Assembler, AssemblyFailure, AssemblyRequest, Preview};
use crate::db::Database;
use crate::jobs::{JobManager, JobType};

type AssembleState = (Arc<Database>, Arc<JobManager>, Arc<Assembler>);

#[derive(Deserialize)]
pub struct PlanRequest {
    pattern: SequencePattern,
    default_visual: Option<PathBuf>,
}

/// Dry-run outcome: the plan, or why none could be made.
#[derive(Debug, Serialize)]
pub struct PlanResponse {
    #[serde(flatten)]
    preview: Option<Preview>,
    error: Option<AssemblyFailure>,
}

#[derive(Deserialize)]
pub struct AssembleRequest {
    pattern: SequencePattern,
    out_path: PathBuf,
    default_visual: Option<PathBuf>,
    settings: Option<RenderSettings>,
}

#[derive(Debug, Serialize)]
pub struct AssembleResponse {
    job_id: i64,
}

pub fn router(db: Arc<Database>, job_manager: Arc<JobManager>, assembler: Arc<Assembler>) -> Router {
    Router::new()
        .route("/:id/plan", post(plan))
        .route("/:id/assemble", post(assemble))
        .with_state((db, job_manager, assembler))
}

pub(crate) async fn plan(
    State((_, _, assembler)): State<AssembleState>,
    Path(project_id): Path<i64>,
    Json(req): Json<PlanRequest>,
) -> Result<Json<PlanResponse>, StatusCode> {
    match assembler
        .preview(project_id, &req.pattern, req.default_visual.as_ref())
        .await
    {
        Ok(Some(preview)) => Ok(Json(PlanResponse {
            preview: Some(preview),
            error: None,
        })),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => match AssemblyFailure::from_error(&e) {
            // Pipeline errors are the answer to a dry run, not a failure of it
            failure if failure.stage.is_some() => Ok(Json(PlanResponse {
                preview: None,
                error: Some(failure),
            })),
            _ => Err(error_status(&e)),
        },
    }
}

pub(crate) async fn assemble(
    State((db, job_manager, _)): State<AssembleState>,
    Path(project_id): Path<i64>,
    Json(req): Json<AssembleRequest>,
) -> Result<Json<AssembleResponse>, StatusCode> {
    if req.out_path.as_os_str().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    db.load_script(project_id)
        .map_err(|e| error_status(&e))?
        .ok_or(StatusCode::NOT_FOUND)?;

    let request = AssemblyRequest {
        project_id,
        pattern: req.pattern,
        output_path: req.out_path,
        default_visual: req.default_visual,
        settings: req.settings,
    };
    let payload = serde_json::to_value(&request).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let job_id = job_manager
        .create_job(JobType::Assemble, Some(payload))
        .map_err(|e| error_status(&e))?;

    info!(job_id, project_id, output = %request.output_path.display(), "assembly queued");
    Ok(Json(AssembleResponse { job_id }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::AssemblerSettings;
    use crate::jobs::JobStatus;
    use crate::testing;
    use engine::Stage;

    fn state() -> AssembleState {
        let db = Arc::new(Database::in_memory().unwrap());
        let jobs = Arc::new(JobManager::new(db.clone()));
        let assembler = Assembler::new(
            db.clone(),
            Arc::new(testing::transcoder(4, 2.0, 3.0)),
            AssemblerSettings {
                work_dir: std::env::temp_dir(),
                max_parallel: 2,
                default_visual: None,
                render: RenderSettings::default(),
            },
        );
        (db, jobs, Arc::new(assembler))
    }

    fn plan_request(pattern: SequencePattern) -> PlanRequest {
        PlanRequest {
            pattern,
            default_visual: None,
        }
    }

    #[tokio::test]
    async fn plan_is_a_dry_run() {
        let state = state();
        testing::ready_project(&state.0, 1, 4, 2.0, 0.5);

        let Json(response) = plan(
            State(state.clone()),
            Path(1),
            Json(plan_request(SequencePattern::Standard)),
        )
        .await
        .unwrap();
        let preview = response.preview.unwrap();
        assert_eq!(preview.units.len(), 4);
        assert_eq!(preview.total_duration, 8.0);
        assert!(response.error.is_none());

        assert_eq!(
            plan(
                State(state),
                Path(2),
                Json(plan_request(SequencePattern::Standard))
            )
            .await
            .unwrap_err(),
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn plan_reports_pipeline_errors() {
        let state = state();
        testing::ready_project(&state.0, 1, 4, 2.0, 0.0);

        // Middle slots need a visual and there is no default
        let Json(response) = plan(
            State(state),
            Path(1),
            Json(plan_request(SequencePattern::Bookends)),
        )
        .await
        .unwrap();
        assert!(response.preview.is_none());
        let error = response.error.unwrap();
        assert_eq!(error.stage, Some(Stage::Plan));
        assert_eq!(error.segment_id, Some(engine::SegmentId(1)));
    }

    #[tokio::test]
    async fn assemble_queues_a_job() {
        let state = state();
        testing::ready_project(&state.0, 1, 4, 2.0, 0.0);
        let jobs = state.1.clone();

        let req = AssembleRequest {
            pattern: SequencePattern::Standard,
            out_path: PathBuf::from("/tmp/out/final.mp4"),
            default_visual: None,
            settings: None,
        };
        let Json(response) = assemble(State(state.clone()), Path(1), Json(req))
            .await
            .unwrap();

        let job = jobs.get_job(response.job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        let queued: AssemblyRequest = serde_json::from_value(job.payload.unwrap()).unwrap();
        assert_eq!(queued.project_id, 1);
        assert_eq!(queued.output_path, PathBuf::from("/tmp/out/final.mp4"));

        let missing = AssembleRequest {
            pattern: SequencePattern::Standard,
            out_path: PathBuf::from("/tmp/out/final.mp4"),
            default_visual: None,
            settings: None,
        };
        assert_eq!(
            assemble(State(state), Path(9), Json(missing))
                .await
                .unwrap_err(),
            StatusCode::NOT_FOUND
        );
    }
}
