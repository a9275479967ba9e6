use super::model::{
    truncate_error_message, ClaimedJob, EncodeOutputs, Job, JobRow, JobStatus, QueueStats,
};
use super::store::{JobStore, StoreError, StoreResult};
use crate::infrastructure::db::pool::DbPool;
use crate::modules::media::model::Media;
use crate::modules::media::repository::MediaRepository;
use async_trait::async_trait;
use sqlx::PgExecutor;
use tracing::debug;
use uuid::Uuid;

/// Postgres-backed queue. Every call checks a connection out of the shared
/// pool for the duration of one statement or transaction.
#[derive(Clone)]
pub struct PgJobStore {
    pool: DbPool,
}

impl PgJobStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Registers an uploaded file and queues its job in one transaction. If
    /// either insert fails neither row exists, so the filename stays free.
    pub async fn enqueue_upload(
        &self,
        filename: &str,
        title: &str,
        priority: i32,
    ) -> StoreResult<(Media, Job)> {
        let mut tx = self.pool.begin().await?;

        let media = MediaRepository::create(&mut *tx, filename, title).await?;
        let job = insert_pending(&mut *tx, media.id, priority).await?;

        tx.commit().await?;
        Ok((media, job))
    }

    async fn current_status(&self, job_id: Uuid) -> StoreResult<Option<JobStatus>> {
        Ok(self.get_job(job_id).await?.map(|job| job.status))
    }

    async fn not_processing(&self, job_id: Uuid) -> StoreError {
        match self.current_status(job_id).await {
            Ok(status) => StoreError::NotProcessing { job_id, status },
            Err(e) => e,
        }
    }
}

async fn insert_pending<'e, E>(executor: E, media_id: Uuid, priority: i32) -> StoreResult<Job>
where
    E: PgExecutor<'e>,
{
    let job = Job::pending(media_id, priority);

    let row = sqlx::query_as::<_, JobRow>(
        r#"
        INSERT INTO transcode_jobs (id, media_id, status, priority, created_at)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING id, media_id, status, priority, created_at, started_at,
                  completed_at, error_message
        "#,
    )
    .bind(job.id)
    .bind(job.media_id)
    .bind(JobStatus::Pending.as_str())
    .bind(job.priority)
    .bind(job.created_at)
    .fetch_one(executor)
    .await?;

    Ok(Job::try_from(row)?)
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn enqueue(&self, media_id: Uuid, priority: i32) -> StoreResult<Job> {
        insert_pending(&self.pool, media_id, priority).await
    }

    async fn claim_next(&self) -> StoreResult<Option<ClaimedJob>> {
        // SKIP LOCKED: a row locked by another claimer is passed over, so
        // concurrent callers get a different row or nothing, never a wait.
        let claimed = sqlx::query_as::<_, ClaimedJob>(
            r#"
            WITH candidate AS (
                SELECT id FROM transcode_jobs
                WHERE status = 'pending'
                ORDER BY priority DESC, created_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            UPDATE transcode_jobs AS j
            SET status = 'processing',
                started_at = NOW()
            FROM candidate, media AS m
            WHERE j.id = candidate.id
              AND m.id = j.media_id
            RETURNING j.id, j.media_id, j.priority, j.created_at, j.started_at,
                      m.filename, m.title
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        if let Some(job) = &claimed {
            debug!(job_id = %job.id, media_id = %job.media_id, "Claimed job");
        }
        Ok(claimed)
    }

    async fn mark_completed(
        &self,
        job_id: Uuid,
        media_id: Uuid,
        outputs: &EncodeOutputs,
    ) -> StoreResult<()> {
        // Dropping `tx` on any early return rolls both writes back.
        let mut tx = self.pool.begin().await?;

        let job_update = sqlx::query(
            r#"
            UPDATE transcode_jobs
            SET status = 'completed', completed_at = NOW()
            WHERE id = $1 AND media_id = $2 AND status = 'processing'
            "#,
        )
        .bind(job_id)
        .bind(media_id)
        .execute(&mut *tx)
        .await?;

        if job_update.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(self.not_processing(job_id).await);
        }

        let media_update = sqlx::query(
            r#"
            UPDATE media
            SET encoded = TRUE,
                encoded_filename = $2,
                thumbnail = $3,
                file_size = $4,
                encoding_duration = $5,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(media_id)
        .bind(&outputs.encoded_filename)
        .bind(&outputs.thumbnail)
        .bind(outputs.file_size)
        .bind(outputs.encoding_duration)
        .execute(&mut *tx)
        .await?;

        if media_update.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(StoreError::MediaNotFound(media_id));
        }

        tx.commit().await?;
        Ok(())
    }

    async fn mark_failed(&self, job_id: Uuid, message: &str) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE transcode_jobs
            SET status = 'failed', completed_at = NOW(), error_message = $2
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(job_id)
        .bind(truncate_error_message(message))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.not_processing(job_id).await);
        }
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> StoreResult<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, media_id, status, priority, created_at, started_at,
                   completed_at, error_message
            FROM transcode_jobs
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Job::try_from).transpose()?)
    }

    async fn stats(&self) -> StoreResult<QueueStats> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM transcode_jobs GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            let status = status
                .parse::<JobStatus>()
                .map_err(|e| sqlx::Error::Decode(e.into()))?;
            stats.record(status, count);
        }
        Ok(stats)
    }

    async fn close(&self) {
        crate::infrastructure::db::pool::close(&self.pool).await;
    }
}
