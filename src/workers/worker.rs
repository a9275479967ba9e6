use super::error::TranscodeError;
use super::pipeline::TranscodePipeline;
use crate::config::settings::StoragePaths;
use crate::modules::jobs::{ClaimedJob, EncodeOutputs, JobStatus, JobStore, StoreError};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Claiming,
    Encoding,
    Finalizing,
}

/// What one `run_once` call did.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// The queue had nothing claimable.
    NoJob,
    /// The worker was not idle, so the tick was ignored.
    Skipped,
    Completed { job_id: Uuid },
    Failed { job_id: Uuid, reason: String },
    /// Transcoding succeeded but the completion commit did not go through.
    CommitFailed { job_id: Uuid, reason: String },
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub paths: StoragePaths,
    pub delete_source_on_success: bool,
}

/// Outputs the current attempt may have written. Only these are removed
/// when the attempt fails.
#[derive(Debug, Default)]
struct Written {
    encoded: bool,
    thumbnail: bool,
}

impl Written {
    fn all() -> Self {
        Self {
            encoded: true,
            thumbnail: true,
        }
    }
}

struct JobPaths {
    source: PathBuf,
    encoded_filename: String,
    encoded: PathBuf,
    thumbnail_filename: String,
    thumbnail: PathBuf,
}

impl JobPaths {
    fn for_job(paths: &StoragePaths, job: &ClaimedJob) -> Self {
        let encoded_filename = StoragePaths::encoded_filename(&job.filename);
        let thumbnail_filename = StoragePaths::thumbnail_filename(&job.filename);
        Self {
            source: paths.source_path(&job.filename),
            encoded: paths.encoded.join(&encoded_filename),
            thumbnail: paths.thumbnails.join(&thumbnail_filename),
            encoded_filename,
            thumbnail_filename,
        }
    }
}

/// Processes at most one job at a time: claim, transcode, then commit or fail.
///
/// Every per-job error is turned into the job's terminal state here. Only a
/// failure to claim (the store itself being unusable) is returned to the caller.
pub struct Worker {
    id: usize,
    state: WorkerState,
    store: Arc<dyn JobStore>,
    pipeline: Arc<TranscodePipeline>,
    settings: Arc<WorkerSettings>,
}

impl Worker {
    pub fn new(
        id: usize,
        store: Arc<dyn JobStore>,
        pipeline: Arc<TranscodePipeline>,
        settings: Arc<WorkerSettings>,
    ) -> Self {
        Self {
            id,
            state: WorkerState::Idle,
            store,
            pipeline,
            settings,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub async fn run_once(&mut self) -> Result<JobOutcome, StoreError> {
        if self.state != WorkerState::Idle {
            debug!(worker = self.id, state = ?self.state, "Worker busy, skipping tick");
            return Ok(JobOutcome::Skipped);
        }

        self.state = WorkerState::Claiming;
        let job = match self.store.claim_next().await {
            Ok(Some(job)) => job,
            Ok(None) => {
                self.state = WorkerState::Idle;
                return Ok(JobOutcome::NoJob);
            }
            Err(e) => {
                self.state = WorkerState::Idle;
                return Err(e);
            }
        };

        info!(
            worker = self.id,
            job_id = %job.id,
            media_id = %job.media_id,
            filename = %job.filename,
            "📦 Claimed transcode job"
        );

        let paths = JobPaths::for_job(&self.settings.paths, &job);
        let mut written = Written::default();

        self.state = WorkerState::Encoding;
        let result = self.transcode(&paths, &mut written).await;

        self.state = WorkerState::Finalizing;
        let outcome = match result {
            Ok(outputs) => self.complete(&job, &paths, outputs).await,
            Err(e) => self.fail(&job, &paths, &written, &e.to_string()).await,
        };

        self.state = WorkerState::Idle;
        Ok(outcome)
    }

    async fn transcode(
        &self,
        paths: &JobPaths,
        written: &mut Written,
    ) -> Result<EncodeOutputs, TranscodeError> {
        let encode = self.pipeline.encode(&paths.source, &paths.encoded).await;
        written.encoded = match &encode {
            Ok(_) => true,
            Err(e) => e.transcoder_ran(),
        };
        let encoded = encode?;

        let thumbnail = self
            .pipeline
            .extract_thumbnail(
                &paths.encoded,
                &paths.thumbnail,
                self.pipeline.config().thumbnail_at_seconds,
            )
            .await;
        written.thumbnail = match &thumbnail {
            Ok(()) => true,
            Err(e) => e.transcoder_ran(),
        };
        thumbnail?;

        Ok(EncodeOutputs {
            encoded_filename: paths.encoded_filename.clone(),
            thumbnail: paths.thumbnail_filename.clone(),
            file_size: i64::try_from(encoded.file_size).unwrap_or(i64::MAX),
            encoding_duration: encoded.duration.as_secs_f64(),
        })
    }

    async fn complete(&self, job: &ClaimedJob, paths: &JobPaths, outputs: EncodeOutputs) -> JobOutcome {
        match self.store.mark_completed(job.id, job.media_id, &outputs).await {
            Ok(()) => self.completed(job, paths, &outputs).await,
            Err(e) => self.commit_failed(job, paths, &outputs, e).await,
        }
    }

    async fn completed(&self, job: &ClaimedJob, paths: &JobPaths, outputs: &EncodeOutputs) -> JobOutcome {
        info!(
            worker = self.id,
            job_id = %job.id,
            file_size = outputs.file_size,
            encoding_duration = outputs.encoding_duration,
            "✅ Job completed"
        );

        if self.settings.delete_source_on_success {
            remove_best_effort(&paths.source, "source file").await;
        }

        JobOutcome::Completed { job_id: job.id }
    }

    /// The completion commit returned an error. Outputs are only removed once
    /// the store has accepted the job as failed; until then the media row may
    /// already point at them.
    async fn commit_failed(
        &self,
        job: &ClaimedJob,
        paths: &JobPaths,
        outputs: &EncodeOutputs,
        commit_err: StoreError,
    ) -> JobOutcome {
        error!(
            worker = self.id,
            job_id = %job.id,
            "❌ Failed to commit completed job: {}", commit_err
        );
        let reason = format!("commit failed: {commit_err}");

        match self.store.mark_failed(job.id, &reason).await {
            Ok(()) => remove_artifacts(paths, &Written::all()).await,
            Err(StoreError::NotProcessing {
                status: Some(JobStatus::Completed),
                ..
            }) => {
                // The commit landed and only its acknowledgement was lost.
                warn!(
                    worker = self.id,
                    job_id = %job.id,
                    "Completion was committed despite the error, keeping outputs"
                );
                return self.completed(job, paths, outputs).await;
            }
            Err(e) => {
                error!(
                    job_id = %job.id,
                    "Failed to mark job as failed, leaving it in processing with outputs kept: {}", e
                );
            }
        }

        JobOutcome::CommitFailed {
            job_id: job.id,
            reason,
        }
    }

    async fn fail(
        &self,
        job: &ClaimedJob,
        paths: &JobPaths,
        written: &Written,
        reason: &str,
    ) -> JobOutcome {
        warn!(worker = self.id, job_id = %job.id, "❌ Job failed: {}", reason);

        if let Err(e) = self.store.mark_failed(job.id, reason).await {
            error!(job_id = %job.id, "Failed to mark job as failed: {}", e);
        }
        remove_artifacts(paths, written).await;

        JobOutcome::Failed {
            job_id: job.id,
            reason: reason.to_string(),
        }
    }
}

async fn remove_artifacts(paths: &JobPaths, written: &Written) {
    if written.encoded {
        remove_best_effort(&paths.encoded, "encoded output").await;
    }
    if written.thumbnail {
        remove_best_effort(&paths.thumbnail, "thumbnail").await;
    }
}

async fn remove_best_effort(path: &Path, what: &str) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed {}", what),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), "Failed to remove {}: {}", what, e),
    }
}
