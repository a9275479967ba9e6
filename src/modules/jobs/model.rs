use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

/// Upper bound on the stored `error_message`, in characters.
pub const ERROR_MESSAGE_MAX_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub media_id: Uuid,
    pub status: JobStatus,
    pub priority: i32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    pub error_message: Option<String>,
}

impl Job {
    pub fn pending(media_id: Uuid, priority: i32) -> Self {
        Self {
            id: Uuid::new_v4(),
            media_id,
            status: JobStatus::Pending,
            priority,
            created_at: OffsetDateTime::now_utc(),
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }
}

// Status is stored as TEXT, so rows go through this before becoming a `Job`.
#[derive(Debug, FromRow)]
pub struct JobRow {
    pub id: Uuid,
    pub media_id: Uuid,
    pub status: String,
    pub priority: i32,
    pub created_at: OffsetDateTime,
    pub started_at: Option<OffsetDateTime>,
    pub completed_at: Option<OffsetDateTime>,
    pub error_message: Option<String>,
}

impl TryFrom<JobRow> for Job {
    type Error = sqlx::Error;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<JobStatus>()
            .map_err(|e| sqlx::Error::Decode(e.into()))?;

        Ok(Job {
            id: row.id,
            media_id: row.media_id,
            status,
            priority: row.priority,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            error_message: row.error_message,
        })
    }
}

/// A job that has just been moved to `processing`, joined with the media
/// fields a worker needs to locate its source file.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct ClaimedJob {
    pub id: Uuid,
    pub media_id: Uuid,
    pub priority: i32,
    pub created_at: OffsetDateTime,
    pub started_at: OffsetDateTime,
    pub filename: String,
    pub title: String,
}

/// Measured results of a successful transcode, written to the media row.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeOutputs {
    pub encoded_filename: String,
    pub thumbnail: String,
    pub file_size: i64,
    pub encoding_duration: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

impl QueueStats {
    pub(crate) fn record(&mut self, status: JobStatus, count: i64) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Processing => self.processing += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
        }
    }
}

/// Cuts `message` to at most [`ERROR_MESSAGE_MAX_CHARS`] characters, never
/// splitting a UTF-8 code point.
pub fn truncate_error_message(message: &str) -> String {
    match message.char_indices().nth(ERROR_MESSAGE_MAX_CHARS) {
        Some((byte_idx, _)) => message[..byte_idx].to_string(),
        None => message.to_string(),
    }
}
