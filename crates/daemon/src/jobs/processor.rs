use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info};

use crate::assembly::{Assembler, AssemblyRequest, AssemblyStatus};
use crate::jobs::{JobManager, JobStatus, JobType};

/// Polls for pending jobs and runs them one at a time. Each assembly bounds
/// its own internal parallelism.
pub struct JobProcessor {
    job_manager: Arc<JobManager>,
    assembler: Arc<Assembler>,
}

impl JobProcessor {
    pub fn new(job_manager: Arc<JobManager>, assembler: Arc<Assembler>) -> Self {
        JobProcessor {
            job_manager,
            assembler,
        }
    }

    pub async fn process_job(&self, job_id: i64) -> Result<()> {
        let job = self
            .job_manager
            .get_job(job_id)?
            .ok_or_else(|| anyhow::anyhow!("Job {} not found", job_id))?;

        match job.job_type {
            JobType::Assemble => {
                let payload = job.payload.context("Assemble job has no payload")?;
                let request: AssemblyRequest =
                    serde_json::from_value(payload).context("Invalid assemble payload")?;
                let cancel = self.job_manager.cancellation_token(job_id);

                self.job_manager
                    .update_job_status(job_id, JobStatus::Running, Some(0.0))?;
                info!(job_id, project_id = request.project_id, "assembly job started");

                let result = self.assembler.assemble(&request, cancel).await;
                let status = match result.status {
                    AssemblyStatus::Succeeded => JobStatus::Completed,
                    AssemblyStatus::Failed => JobStatus::Failed,
                    AssemblyStatus::Cancelled => JobStatus::Cancelled,
                };
                self.job_manager
                    .finish_job(job_id, status, &serde_json::to_value(&result)?)?;
                info!(job_id, ?status, "assembly job finished");
            }
        }

        Ok(())
    }

    /// Process one job, recording any error as the job's failure.
    pub async fn run_job(&self, job_id: i64) {
        let Err(e) = self.process_job(job_id).await else {
            return;
        };
        error!(job_id, "Error processing job: {:?}", e);
        if let Err(record_err) = self.job_manager.finish_job(
            job_id,
            JobStatus::Failed,
            &serde_json::json!({ "error": format!("{:#}", e) }),
        ) {
            error!(job_id, "Error recording job failure: {:?}", record_err);
        }
    }

    /// Main processing loop
    pub async fn run(&self) {
        loop {
            let ready_jobs = match self.job_manager.pending_jobs() {
                Ok(jobs) => jobs,
                Err(e) => {
                    error!("Error getting pending jobs: {:?}", e);
                    sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            for job_id in ready_jobs {
                self.run_job(job_id).await;
            }

            sleep(Duration::from_secs(1)).await;
        }
    }
}
