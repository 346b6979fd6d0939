use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::db::Database;

pub mod processor;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobType {
    Assemble,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: i64,
    pub job_type: JobType,
    pub status: JobStatus,
    pub progress: f64,
    pub payload: Option<Value>,
    pub result: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub struct JobManager {
    db: Arc<Database>,
    // Tokens for jobs that have not finished yet
    tokens: Mutex<HashMap<i64, CancellationToken>>,
}

impl JobManager {
    pub fn new(db: Arc<Database>) -> Self {
        JobManager {
            db,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    pub fn create_job(&self, job_type: JobType, payload: Option<Value>) -> Result<i64> {
        let now = Utc::now().to_rfc3339();
        let job_type_str = serde_json::to_string(&job_type)?;
        let status_str = serde_json::to_string(&JobStatus::Pending)?;
        let payload_str = payload.as_ref().map(serde_json::to_string).transpose()?;

        let id = {
            let conn = self.db.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO jobs (type, status, progress, payload_json, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![job_type_str, status_str, 0.0, payload_str, now, now],
            )?;
            conn.last_insert_rowid()
        };

        self.tokens
            .lock()
            .unwrap()
            .insert(id, CancellationToken::new());
        Ok(id)
    }

    pub fn get_job(&self, id: i64) -> Result<Option<Job>> {
        let conn = self.db.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, type, status, progress, payload_json, result_json, created_at, updated_at FROM jobs WHERE id = ?1"
        )?;

        let mut rows = stmt.query_map(params![id], |row| {
            let job_type_str: String = row.get(1)?;
            let status_str: String = row.get(2)?;
            let created_at_str: String = row.get(6)?;
            let updated_at_str: String = row.get(7)?;

            let job_type = serde_json::from_str(&job_type_str)
                .map_err(|_e| rusqlite::Error::InvalidColumnType(1, "TEXT".to_string(), rusqlite::types::Type::Text))?;
            let status = serde_json::from_str(&status_str)
                .map_err(|_e| rusqlite::Error::InvalidColumnType(2, "TEXT".to_string(), rusqlite::types::Type::Text))?;

            let json_column = |idx: usize| -> rusqlite::Result<Option<Value>> {
                let raw: Option<String> = row.get(idx)?;
                raw.map(|s| serde_json::from_str(&s))
                    .transpose()
                    .map_err(|_| rusqlite::Error::InvalidColumnType(idx, "TEXT".to_string(), rusqlite::types::Type::Text))
            };
            let payload = json_column(4)?;
            let result = json_column(5)?;

            let created_at = DateTime::parse_from_rfc3339(&created_at_str)
                .map_err(|_| rusqlite::Error::InvalidColumnType(6, "TEXT".to_string(), rusqlite::types::Type::Text))?
                .with_timezone(&Utc);
            let updated_at = DateTime::parse_from_rfc3339(&updated_at_str)
                .map_err(|_| rusqlite::Error::InvalidColumnType(7, "TEXT".to_string(), rusqlite::types::Type::Text))?
                .with_timezone(&Utc);

            Ok(Job {
                id: row.get(0)?,
                job_type,
                status,
                progress: row.get(3)?,
                payload,
                result,
                created_at,
                updated_at,
            })
        })?;

        match rows.next() {
            Some(Ok(job)) => Ok(Some(job)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    /// Pending jobs, oldest first.
    pub fn pending_jobs(&self) -> Result<Vec<i64>> {
        let status_str = serde_json::to_string(&JobStatus::Pending)?;
        let conn = self.db.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT id FROM jobs WHERE status = ?1 ORDER BY created_at ASC, id ASC")?;
        let ids = stmt
            .query_map(params![status_str], |row| row.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;
        Ok(ids)
    }

    pub fn update_job_status(
        &self,
        id: i64,
        status: JobStatus,
        progress: Option<f64>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let status_str = serde_json::to_string(&status)?;

        let conn = self.db.conn.lock().unwrap();
        if let Some(prog) = progress {
            conn.execute(
                "UPDATE jobs SET status = ?1, progress = ?2, updated_at = ?3 WHERE id = ?4",
                params![status_str, prog, now, id],
            )?;
        } else {
            let mut stmt = conn.prepare(
                "UPDATE jobs SET status = ?1, updated_at = ?2 WHERE id = ?3"
            )?;
            stmt.execute(params![status_str, now, id])?;
        }

        Ok(())
    }

    /// Record the final status and result, and forget the job's token.
    pub fn finish_job(&self, id: i64, status: JobStatus, result: &Value) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let status_str = serde_json::to_string(&status)?;
        let result_str = serde_json::to_string(result)?;
        {
            let conn = self.db.conn.lock().unwrap();
            conn.execute(
                "UPDATE jobs SET status = ?1, progress = 1.0, result_json = ?2, updated_at = ?3 WHERE id = ?4",
                params![status_str, result_str, now, id],
            )?;
        }
        self.tokens.lock().unwrap().remove(&id);
        Ok(())
    }

    /// Token the job's worker watches. Jobs created before a restart get a
    /// fresh one.
    pub fn cancellation_token(&self, id: i64) -> CancellationToken {
        self.tokens
            .lock()
            .unwrap()
            .entry(id)
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    /// Cancel a job that has not finished. Returns false when there was
    /// nothing left to cancel.
    pub fn cancel_job(&self, id: i64) -> Result<bool> {
        let Some(job) = self.get_job(id)? else {
            return Ok(false);
        };
        if job.status.is_finished() {
            return Ok(false);
        }

        self.update_job_status(id, JobStatus::Cancelled, None)?;
        if let Some(token) = self.tokens.lock().unwrap().get(&id) {
            token.cancel();
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager() -> JobManager {
        JobManager::new(Arc::new(Database::in_memory().unwrap()))
    }

    #[test]
    fn jobs_round_trip() {
        let jobs = manager();
        let id = jobs
            .create_job(JobType::Assemble, Some(json!({"project_id": 3})))
            .unwrap();

        let job = jobs.get_job(id).unwrap().unwrap();
        assert_eq!(job.job_type, JobType::Assemble);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.payload, Some(json!({"project_id": 3})));
        assert!(job.result.is_none());
        assert_eq!(jobs.pending_jobs().unwrap(), vec![id]);

        jobs.finish_job(id, JobStatus::Completed, &json!({"status": "succeeded"}))
            .unwrap();
        let job = jobs.get_job(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 1.0);
        assert_eq!(job.result, Some(json!({"status": "succeeded"})));
        assert!(jobs.pending_jobs().unwrap().is_empty());
        assert!(jobs.get_job(id + 1).unwrap().is_none());
    }

    #[test]
    fn cancel_fires_token_once() {
        let jobs = manager();
        let id = jobs.create_job(JobType::Assemble, None).unwrap();
        let token = jobs.cancellation_token(id);

        assert!(jobs.cancel_job(id).unwrap());
        assert!(token.is_cancelled());
        assert_eq!(
            jobs.get_job(id).unwrap().unwrap().status,
            JobStatus::Cancelled
        );
        assert!(!jobs.cancel_job(id).unwrap());
        assert!(!jobs.cancel_job(999).unwrap());
    }
}
