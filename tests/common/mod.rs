#![allow(dead_code)]

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use transcode_worker::config::settings::{EncodeConfig, StoragePaths};
use transcode_worker::modules::jobs::{
    ClaimedJob, EncodeOutputs, Job, JobStore, MemoryJobStore, QueueStats, StoreError,
    StoreResult,
};
use transcode_worker::modules::media::model::Media;
use uuid::Uuid;
use transcode_worker::workers::{PoolConfig, TranscodePipeline, WorkerPool};

/// Writes whatever it is asked to produce (the last argument) and exits 0.
pub const OK_SCRIPT: &str = r#"
for last; do :; done
printf 'fake-media-bytes' > "$last"
"#;

/// Starts writing the output, then hangs well past any test timeout.
pub const SLOW_SCRIPT: &str = r#"
for last; do :; done
printf 'partial' > "$last"
sleep 5
"#;

pub const BROKEN_INPUT_SCRIPT: &str = r#"
echo "Invalid data found when processing input" >&2
exit 1
"#;

/// Encodes fine but fails on the single-frame thumbnail call.
pub const THUMBNAIL_FAILS_SCRIPT: &str = r#"
for arg; do
  if [ "$arg" = "-frames:v" ]; then
    echo "thumbnail filter failed" >&2
    exit 1
  fi
done
for last; do :; done
printf 'fake-media-bytes' > "$last"
"#;

pub struct Harness {
    pub dir: TempDir,
    pub paths: StoragePaths,
    pub store: Arc<MemoryJobStore>,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = StoragePaths {
            uploads: dir.path().join("uploads"),
            encoded: dir.path().join("encoded"),
            thumbnails: dir.path().join("thumbnails"),
        };
        std::fs::create_dir_all(&paths.uploads).expect("uploads dir");

        Self {
            dir,
            paths,
            store: Arc::new(MemoryJobStore::new()),
        }
    }

    pub fn write_source(&self, filename: &str) -> PathBuf {
        let path = self.paths.source_path(filename);
        std::fs::write(&path, b"raw-upload").expect("write source");
        path
    }

    /// Registers media for `filename` and queues a job for it.
    pub async fn enqueue(&self, filename: &str, priority: i32) -> (Media, Job) {
        let media = self.store.insert_media(filename, filename);
        let job = self
            .store
            .enqueue(media.id, priority)
            .await
            .expect("enqueue");
        (media, job)
    }

    pub fn pipeline(&self, script_body: &str, encode_timeout: Duration) -> TranscodePipeline {
        let script = self.dir.path().join(format!("ffmpeg-{}.sh", uuid::Uuid::new_v4()));
        std::fs::write(&script, script_body).expect("write script");

        TranscodePipeline::new(EncodeConfig {
            encode_timeout,
            thumbnail_timeout: Duration::from_secs(5),
            thumbnail_at_seconds: 0.0,
            ..EncodeConfig::default()
        })
        .with_launcher("/bin/sh", [script])
    }

    pub fn pool_config(&self, worker_count: usize, delete_source_on_success: bool) -> PoolConfig {
        PoolConfig {
            worker_count,
            poll_interval: Duration::from_millis(20),
            paths: self.paths.clone(),
            delete_source_on_success,
        }
    }

    pub async fn pool(&self, pipeline: TranscodePipeline, worker_count: usize) -> WorkerPool {
        self.pool_with_store(self.store.clone(), pipeline, worker_count)
            .await
    }

    pub async fn pool_with_store(
        &self,
        store: Arc<dyn JobStore>,
        pipeline: TranscodePipeline,
        worker_count: usize,
    ) -> WorkerPool {
        WorkerPool::start(self.pool_config(worker_count, false), store, pipeline)
            .await
            .expect("pool start")
    }

    pub fn encoded_path(&self, filename: &str) -> PathBuf {
        self.paths.encoded.join(StoragePaths::encoded_filename(filename))
    }

    pub fn thumbnail_path(&self, filename: &str) -> PathBuf {
        self.paths
            .thumbnails
            .join(StoragePaths::thumbnail_filename(filename))
    }
}

fn outage() -> StoreError {
    StoreError::Database(sqlx::Error::PoolTimedOut)
}

/// Wraps a [`MemoryJobStore`] and injects the failures a flaky database
/// connection produces.
#[derive(Default)]
pub struct FlakyStore {
    inner: Arc<MemoryJobStore>,
    lose_completion_ack: bool,
    reject_finalize: bool,
    claims_before_outage: Option<usize>,
    claims: AtomicUsize,
    closes: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: Arc<MemoryJobStore>) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }

    /// `mark_completed` commits, then reports an error anyway.
    pub fn losing_completion_ack(mut self) -> Self {
        self.lose_completion_ack = true;
        self
    }

    /// `mark_completed` and `mark_failed` both fail without writing.
    pub fn rejecting_finalize(mut self) -> Self {
        self.reject_finalize = true;
        self
    }

    /// Claims after the first `successful` ones fail.
    pub fn with_claim_outage_after(mut self, successful: usize) -> Self {
        self.claims_before_outage = Some(successful);
        self
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn enqueue(&self, media_id: Uuid, priority: i32) -> StoreResult<Job> {
        self.inner.enqueue(media_id, priority).await
    }

    async fn claim_next(&self) -> StoreResult<Option<ClaimedJob>> {
        let attempt = self.claims.fetch_add(1, Ordering::SeqCst);
        match self.claims_before_outage {
            Some(limit) if attempt >= limit => Err(outage()),
            _ => self.inner.claim_next().await,
        }
    }

    async fn mark_completed(
        &self,
        job_id: Uuid,
        media_id: Uuid,
        outputs: &EncodeOutputs,
    ) -> StoreResult<()> {
        if self.reject_finalize {
            return Err(outage());
        }
        self.inner.mark_completed(job_id, media_id, outputs).await?;
        if self.lose_completion_ack {
            return Err(outage());
        }
        Ok(())
    }

    async fn mark_failed(&self, job_id: Uuid, message: &str) -> StoreResult<()> {
        if self.reject_finalize {
            return Err(outage());
        }
        self.inner.mark_failed(job_id, message).await
    }

    async fn get_job(&self, job_id: Uuid) -> StoreResult<Option<Job>> {
        self.inner.get_job(job_id).await
    }

    async fn stats(&self) -> StoreResult<QueueStats> {
        self.inner.stats().await
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn exists(path: &Path) -> bool {
    path.try_exists().unwrap_or(false)
}
