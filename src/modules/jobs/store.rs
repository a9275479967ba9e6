use super::model::{ClaimedJob, EncodeOutputs, Job, JobStatus, QueueStats};
use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Finalizing is only allowed from `processing`; the row was left untouched.
    #[error("job {job_id} is not processing (status: {status:?})")]
    NotProcessing {
        job_id: Uuid,
        status: Option<JobStatus>,
    },

    #[error("media {0} not found")]
    MediaNotFound(Uuid),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// The shared job queue.
///
/// Implementations must make `claim_next` exclusive per row without callers
/// holding any in-process lock, and must apply `mark_completed` to the job and
/// its media entity as a single all-or-nothing unit.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts a pending job for an existing media entity.
    async fn enqueue(&self, media_id: Uuid, priority: i32) -> StoreResult<Job>;

    /// Moves the highest-priority, oldest pending job to `processing`.
    ///
    /// Rows being claimed by a concurrent caller are skipped, never waited on.
    async fn claim_next(&self) -> StoreResult<Option<ClaimedJob>>;

    async fn mark_completed(
        &self,
        job_id: Uuid,
        media_id: Uuid,
        outputs: &EncodeOutputs,
    ) -> StoreResult<()>;

    /// Records a failure; the message is truncated to the column bound.
    async fn mark_failed(&self, job_id: Uuid, message: &str) -> StoreResult<()>;

    async fn get_job(&self, job_id: Uuid) -> StoreResult<Option<Job>>;

    async fn stats(&self) -> StoreResult<QueueStats>;

    /// Releases the store's connections. Called once, on pool shutdown.
    async fn close(&self) {}
}
