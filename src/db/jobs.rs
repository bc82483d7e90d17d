//! Background job tracking.

use rusqlite::{params, OptionalExtension, Row};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;

use super::{utc_now, Database};

/// Lifecycle state of a background job. `Failed` doubles as the
/// cooperative cancellation signal: flipping a running job to failed makes
/// the bulk coordinator stop after the game in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

/// One row of `background_jobs`.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub job_id: String,
    pub job_type: String,
    pub status: JobStatus,
    pub username: Option<String>,
    pub source: Option<String>,
    pub max_games: Option<u32>,
    pub progress_current: u32,
    pub progress_total: u32,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub error_message: Option<String>,
    pub result_json: Option<String>,
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<JobRecord> {
    Ok(JobRecord {
        job_id: row.get(0)?,
        job_type: row.get(1)?,
        status: JobStatus::from_str(&row.get::<_, String>(2)?).unwrap_or(JobStatus::Failed),
        username: row.get(3)?,
        source: row.get(4)?,
        max_games: row.get::<_, Option<i64>>(5)?.map(|v| v as u32),
        progress_current: row.get::<_, i64>(6)? as u32,
        progress_total: row.get::<_, i64>(7)? as u32,
        created_at: row.get(8)?,
        started_at: row.get(9)?,
        completed_at: row.get(10)?,
        error_message: row.get(11)?,
        result_json: row.get(12)?,
    })
}

const JOB_COLUMNS: &str = "job_id, job_type, status, username, source, max_games, \
     progress_current, progress_total, created_at, started_at, completed_at, \
     error_message, result_json";

/// Repository over the `background_jobs` table.
#[derive(Clone)]
pub struct JobStore {
    db: Database,
}

impl JobStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn create_job(
        &self,
        job_type: &str,
        username: Option<&str>,
        source: Option<&str>,
        max_games: Option<u32>,
    ) -> Result<String> {
        let job_id = Uuid::new_v4().to_string();
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO background_jobs (
                job_id, job_type, status, username, source, max_games, created_at
             ) VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?6)",
            params![job_id, job_type, username, source, max_games, utc_now()],
        )?;
        Ok(job_id)
    }

    pub fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>> {
        let conn = self.db.lock();
        let record = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM background_jobs WHERE job_id = ?1"),
                params![job_id],
                job_from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub fn update_status(
        &self,
        job_id: &str,
        status: JobStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        let conn = self.db.lock();
        match status {
            JobStatus::Running => conn.execute(
                "UPDATE background_jobs SET status = ?1, started_at = ?2, error_message = ?3
                 WHERE job_id = ?4",
                params![status.as_str(), utc_now(), error_message, job_id],
            )?,
            JobStatus::Completed | JobStatus::Failed => conn.execute(
                "UPDATE background_jobs SET status = ?1, completed_at = ?2, error_message = ?3
                 WHERE job_id = ?4",
                params![status.as_str(), utc_now(), error_message, job_id],
            )?,
            JobStatus::Pending => conn.execute(
                "UPDATE background_jobs SET status = ?1, error_message = ?2 WHERE job_id = ?3",
                params![status.as_str(), error_message, job_id],
            )?,
        };
        Ok(())
    }

    pub fn update_progress(&self, job_id: &str, current: u32, total: u32) -> Result<()> {
        let conn = self.db.lock();
        conn.execute(
            "UPDATE background_jobs SET progress_current = ?1, progress_total = ?2
             WHERE job_id = ?3",
            params![current, total, job_id],
        )?;
        Ok(())
    }

    pub fn complete_job(&self, job_id: &str, result: &Value) -> Result<()> {
        let conn = self.db.lock();
        conn.execute(
            "UPDATE background_jobs SET status = 'completed', completed_at = ?1,
                    result_json = ?2 WHERE job_id = ?3",
            params![utc_now(), result.to_string(), job_id],
        )?;
        Ok(())
    }
}
