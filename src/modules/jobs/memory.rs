use super::model::{
    truncate_error_message, ClaimedJob, EncodeOutputs, Job, JobStatus, QueueStats,
};
use super::store::{JobStore, StoreError, StoreResult};
use crate::modules::media::model::Media;
use async_trait::async_trait;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Default)]
struct MemoryState {
    media: HashMap<Uuid, Media>,
    // (insertion sequence, job); the sequence breaks created_at ties
    jobs: HashMap<Uuid, (u64, Job)>,
    next_seq: u64,
    fail_commits: bool,
}

/// Process-local [`JobStore`] with the same claim and finalize semantics as
/// the Postgres store. Each operation runs under one short critical section,
/// which makes claims exclusive and completion all-or-nothing.
#[derive(Default)]
pub struct MemoryJobStore {
    state: Mutex<MemoryState>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // Writes never span a panic point, so poisoned state is still consistent.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert_media(&self, filename: &str, title: &str) -> Media {
        let media = Media::new(filename, title);
        self.lock().media.insert(media.id, media.clone());
        media
    }

    pub fn media(&self, media_id: Uuid) -> Option<Media> {
        self.lock().media.get(&media_id).cloned()
    }

    /// Inserts a job with an explicit creation time.
    pub fn enqueue_at(
        &self,
        media_id: Uuid,
        priority: i32,
        created_at: OffsetDateTime,
    ) -> StoreResult<Job> {
        let mut state = self.lock();
        if !state.media.contains_key(&media_id) {
            return Err(StoreError::MediaNotFound(media_id));
        }

        let mut job = Job::pending(media_id, priority);
        job.created_at = created_at;

        let seq = state.next_seq;
        state.next_seq += 1;
        state.jobs.insert(job.id, (seq, job.clone()));
        Ok(job)
    }

    /// Makes every subsequent `mark_completed` fail before writing anything,
    /// as an unreachable database would.
    pub fn fail_commits(&self, fail: bool) {
        self.lock().fail_commits = fail;
    }

    fn not_processing(state: &MemoryState, job_id: Uuid) -> StoreError {
        StoreError::NotProcessing {
            job_id,
            status: state.jobs.get(&job_id).map(|(_, job)| job.status),
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn enqueue(&self, media_id: Uuid, priority: i32) -> StoreResult<Job> {
        self.enqueue_at(media_id, priority, OffsetDateTime::now_utc())
    }

    async fn claim_next(&self) -> StoreResult<Option<ClaimedJob>> {
        let mut state = self.lock();

        let next_id = state
            .jobs
            .values()
            .filter(|(_, job)| job.status == JobStatus::Pending)
            .max_by_key(|(seq, job)| (job.priority, Reverse(job.created_at), Reverse(*seq)))
            .map(|(_, job)| job.id);

        let Some(job_id) = next_id else {
            return Ok(None);
        };

        // Resolve the media first so a dangling job is never left in processing.
        let Some((_, job)) = state.jobs.get(&job_id) else {
            return Ok(None);
        };
        let media_id = job.media_id;
        let (filename, title) = match state.media.get(&media_id) {
            Some(media) => (media.filename.clone(), media.title.clone()),
            None => return Err(StoreError::MediaNotFound(media_id)),
        };

        let now = OffsetDateTime::now_utc();
        let Some((_, job)) = state.jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        job.status = JobStatus::Processing;
        job.started_at = Some(now);

        Ok(Some(ClaimedJob {
            id: job_id,
            media_id,
            priority: job.priority,
            created_at: job.created_at,
            started_at: now,
            filename,
            title,
        }))
    }

    async fn mark_completed(
        &self,
        job_id: Uuid,
        media_id: Uuid,
        outputs: &EncodeOutputs,
    ) -> StoreResult<()> {
        let mut state = self.lock();

        if state.fail_commits {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }

        let processing = matches!(
            state.jobs.get(&job_id),
            Some((_, job)) if job.status == JobStatus::Processing && job.media_id == media_id
        );
        if !processing {
            return Err(Self::not_processing(&state, job_id));
        }
        if !state.media.contains_key(&media_id) {
            return Err(StoreError::MediaNotFound(media_id));
        }

        // Both checks passed; apply the two writes together.
        let now = OffsetDateTime::now_utc();
        if let Some(media) = state.media.get_mut(&media_id) {
            media.encoded = true;
            media.encoded_filename = Some(outputs.encoded_filename.clone());
            media.thumbnail = Some(outputs.thumbnail.clone());
            media.file_size = Some(outputs.file_size);
            media.encoding_duration = Some(outputs.encoding_duration);
            media.updated_at = now;
        }
        if let Some((_, job)) = state.jobs.get_mut(&job_id) {
            job.status = JobStatus::Completed;
            job.completed_at = Some(now);
        }
        Ok(())
    }

    async fn mark_failed(&self, job_id: Uuid, message: &str) -> StoreResult<()> {
        let mut state = self.lock();

        if let Some((_, job)) = state.jobs.get_mut(&job_id) {
            if job.status == JobStatus::Processing {
                job.status = JobStatus::Failed;
                job.completed_at = Some(OffsetDateTime::now_utc());
                job.error_message = Some(truncate_error_message(message));
                return Ok(());
            }
        }
        Err(Self::not_processing(&state, job_id))
    }

    async fn get_job(&self, job_id: Uuid) -> StoreResult<Option<Job>> {
        Ok(self.lock().jobs.get(&job_id).map(|(_, job)| job.clone()))
    }

    async fn stats(&self) -> StoreResult<QueueStats> {
        let state = self.lock();
        let mut stats = QueueStats::default();
        for (_, job) in state.jobs.values() {
            stats.record(job.status, 1);
        }
        Ok(stats)
    }
}
