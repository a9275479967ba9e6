#![cfg(unix)]

mod common;

use common::{
    exists, FlakyStore, Harness, BROKEN_INPUT_SCRIPT, OK_SCRIPT, SLOW_SCRIPT,
    THUMBNAIL_FAILS_SCRIPT,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use transcode_worker::modules::jobs::{JobStatus, JobStore};
use transcode_worker::workers::{
    JobOutcome, PoolError, Worker, WorkerPool, WorkerSettings, WorkerState,
};

const LONG_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::test]
async fn one_tick_completes_a_queued_job() {
    let h = Harness::new();
    h.write_source("clip.mov");
    let (media, job) = h.enqueue("clip.mov", 0).await;
    let mut pool = h.pool(h.pipeline(OK_SCRIPT, LONG_TIMEOUT), 1).await;

    let report = pool.tick().await.unwrap();
    assert_eq!(report.completed, 1);

    let job = h.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.started_at.is_some());
    assert!(job.completed_at.is_some());
    assert_eq!(job.error_message, None);

    let media = h.store.media(media.id).unwrap();
    assert!(media.encoded);
    assert_eq!(media.encoded_filename.as_deref(), Some("clip.mov.mp4"));
    assert_eq!(media.thumbnail.as_deref(), Some("clip.mov.jpg"));
    assert_eq!(media.file_size, Some("fake-media-bytes".len() as i64));
    assert!(media.encoding_duration.unwrap() > 0.0);

    assert!(exists(&h.encoded_path("clip.mov")));
    assert!(exists(&h.thumbnail_path("clip.mov")));
    assert!(exists(&h.paths.source_path("clip.mov")));
}

#[tokio::test]
async fn source_is_deleted_after_success_when_configured() {
    let h = Harness::new();
    let source = h.write_source("clip.mov");
    let (_, job) = h.enqueue("clip.mov", 0).await;

    let mut pool = WorkerPool::start(
        h.pool_config(1, true),
        h.store.clone() as Arc<dyn JobStore>,
        h.pipeline(OK_SCRIPT, LONG_TIMEOUT),
    )
    .await
    .unwrap();
    pool.tick().await.unwrap();

    let job = h.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(!exists(&source));
}

#[tokio::test]
async fn missing_source_fails_immediately() {
    let h = Harness::new();
    let (media, job) = h.enqueue("never-uploaded.mov", 0).await;
    let mut pool = h.pool(h.pipeline(SLOW_SCRIPT, LONG_TIMEOUT), 1).await;

    let started = Instant::now();
    let report = pool.tick().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(report.failed, 1);

    let job = h.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.completed_at.is_some());
    assert!(job.error_message.unwrap().contains("source file missing"));
    assert!(!h.store.media(media.id).unwrap().encoded);
}

#[tokio::test]
async fn encode_timeout_fails_job_and_removes_partial_output() {
    let h = Harness::new();
    h.write_source("slow.mov");
    let (media, job) = h.enqueue("slow.mov", 0).await;
    let mut pool = h
        .pool(h.pipeline(SLOW_SCRIPT, Duration::from_secs(1)), 1)
        .await;

    let started = Instant::now();
    pool.tick().await.unwrap();
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_secs(4), "took {elapsed:?}");

    let job = h.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_message.unwrap().contains("timed out"));
    assert!(!h.store.media(media.id).unwrap().encoded);
    assert!(!exists(&h.encoded_path("slow.mov")));
    assert!(!exists(&h.thumbnail_path("slow.mov")));
}

#[tokio::test]
async fn encoder_exit_code_and_stderr_are_recorded() {
    let h = Harness::new();
    h.write_source("corrupt.mov");
    let (_, job) = h.enqueue("corrupt.mov", 0).await;
    let mut pool = h.pool(h.pipeline(BROKEN_INPUT_SCRIPT, LONG_TIMEOUT), 1).await;

    pool.tick().await.unwrap();

    let job = h.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    let message = job.error_message.unwrap();
    assert!(message.contains("encode failed"));
    assert!(message.contains("Invalid data found"));
}

#[tokio::test]
async fn thumbnail_failure_fails_whole_job_and_discards_encode() {
    let h = Harness::new();
    h.write_source("clip.mov");
    let (media, job) = h.enqueue("clip.mov", 0).await;
    let mut pool = h
        .pool(h.pipeline(THUMBNAIL_FAILS_SCRIPT, LONG_TIMEOUT), 1)
        .await;

    let report = pool.tick().await.unwrap();
    assert_eq!(report.failed, 1);

    let job = h.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_message.unwrap().contains("thumbnail"));

    let media = h.store.media(media.id).unwrap();
    assert!(!media.encoded);
    assert_eq!(media.encoded_filename, None);
    assert!(!exists(&h.encoded_path("clip.mov")));
}

#[tokio::test]
async fn commit_failure_never_marks_media_encoded() {
    let h = Harness::new();
    h.write_source("clip.mov");
    let (media, job) = h.enqueue("clip.mov", 0).await;
    h.store.fail_commits(true);
    let mut pool = h.pool(h.pipeline(OK_SCRIPT, LONG_TIMEOUT), 1).await;

    let report = pool.tick().await.unwrap();
    assert_eq!(report.failed, 1);

    let job = h.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_message.unwrap().starts_with("commit failed"));
    assert!(!h.store.media(media.id).unwrap().encoded);
    assert!(!exists(&h.encoded_path("clip.mov")));
    assert!(!exists(&h.thumbnail_path("clip.mov")));
}

#[tokio::test]
async fn failure_leaves_outputs_of_a_same_stem_upload_alone() {
    let h = Harness::new();
    h.write_source("a.mov");
    let (done_media, _) = h.enqueue("a.mov", 0).await;
    let mut pool = h.pool(h.pipeline(OK_SCRIPT, LONG_TIMEOUT), 1).await;
    assert_eq!(pool.tick().await.unwrap().completed, 1);

    // Never uploaded, so the job fails before anything is written.
    let (_, job) = h.enqueue("a.mkv", 0).await;
    assert_eq!(pool.tick().await.unwrap().failed, 1);
    assert_eq!(
        h.store.get_job(job.id).await.unwrap().unwrap().status,
        JobStatus::Failed
    );

    let done_media = h.store.media(done_media.id).unwrap();
    assert!(done_media.encoded);
    assert!(exists(&h.encoded_path("a.mov")));
    assert!(exists(&h.thumbnail_path("a.mov")));
}

#[tokio::test]
async fn failed_retranscode_keeps_earlier_outputs() {
    let h = Harness::new();
    let source = h.write_source("clip.mov");
    let (media, _) = h.enqueue("clip.mov", 0).await;
    let mut pool = h.pool(h.pipeline(OK_SCRIPT, LONG_TIMEOUT), 1).await;
    pool.tick().await.unwrap();

    std::fs::remove_file(&source).unwrap();
    let again = h.store.enqueue(media.id, 0).await.unwrap();
    assert_eq!(pool.tick().await.unwrap().failed, 1);

    let again = h.store.get_job(again.id).await.unwrap().unwrap();
    assert!(again.error_message.unwrap().contains("source file missing"));
    assert!(h.store.media(media.id).unwrap().encoded);
    assert!(exists(&h.encoded_path("clip.mov")));
    assert!(exists(&h.thumbnail_path("clip.mov")));
}

#[tokio::test]
async fn lost_commit_acknowledgement_keeps_committed_outputs() {
    let h = Harness::new();
    h.write_source("clip.mov");
    let (media, job) = h.enqueue("clip.mov", 0).await;
    let store = Arc::new(FlakyStore::new(h.store.clone()).losing_completion_ack());
    let mut pool = h
        .pool_with_store(store.clone(), h.pipeline(OK_SCRIPT, LONG_TIMEOUT), 1)
        .await;

    let report = pool.tick().await.unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(report.failed, 0);

    let job = h.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.error_message, None);
    let media = h.store.media(media.id).unwrap();
    assert!(media.encoded);
    assert!(exists(&h.encoded_path("clip.mov")));
    assert!(exists(&h.thumbnail_path("clip.mov")));
}

#[tokio::test]
async fn unrecordable_commit_failure_leaves_job_processing_with_outputs() {
    let h = Harness::new();
    h.write_source("clip.mov");
    let (media, job) = h.enqueue("clip.mov", 0).await;
    let store = Arc::new(FlakyStore::new(h.store.clone()).rejecting_finalize());
    let mut pool = h
        .pool_with_store(store.clone(), h.pipeline(OK_SCRIPT, LONG_TIMEOUT), 1)
        .await;

    let report = pool.tick().await.unwrap();
    assert_eq!(report.failed, 1);

    let job = h.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Processing);
    assert!(!h.store.media(media.id).unwrap().encoded);
    assert!(exists(&h.encoded_path("clip.mov")));
}

#[tokio::test]
async fn claim_outage_stops_pool_after_siblings_finish() {
    let h = Harness::new();
    h.write_source("clip.mov");
    let (media, job) = h.enqueue("clip.mov", 0).await;
    let store = Arc::new(FlakyStore::new(h.store.clone()).with_claim_outage_after(1));
    let mut pool = h
        .pool_with_store(store.clone(), h.pipeline(OK_SCRIPT, LONG_TIMEOUT), 2)
        .await;

    let err = pool.tick().await.unwrap_err();
    assert!(matches!(err, PoolError::Store(_)));
    // The worker that did get a job still finished it.
    let job = h.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(h.store.media(media.id).unwrap().encoded);
    assert_eq!(pool.worker_count(), 2);

    let result = tokio::time::timeout(Duration::from_secs(5), pool.run(CancellationToken::new()))
        .await
        .expect("pool kept running after a claim outage");
    assert!(matches!(result, Err(PoolError::Store(_))));
    assert_eq!(store.close_count(), 1);
}

#[tokio::test]
async fn in_flight_jobs_never_exceed_worker_count() {
    let h = Harness::new();
    for i in 0..5 {
        let name = format!("clip-{i}.mov");
        h.write_source(&name);
        h.enqueue(&name, 0).await;
    }
    let mut pool = h.pool(h.pipeline(OK_SCRIPT, LONG_TIMEOUT), 2).await;
    assert_eq!(pool.worker_count(), 2);

    let report = pool.tick().await.unwrap();
    assert_eq!(report.completed, 2);
    let stats = h.store.stats().await.unwrap();
    assert_eq!((stats.pending, stats.processing, stats.completed), (3, 0, 2));

    pool.tick().await.unwrap();
    let last = pool.tick().await.unwrap();
    assert_eq!(last.completed, 1);
    assert_eq!(last.idle, 1);
    assert_eq!(h.store.stats().await.unwrap().completed, 5);
}

#[tokio::test]
async fn higher_priority_job_is_processed_first() {
    let h = Harness::new();
    h.write_source("routine.mov");
    h.write_source("urgent.mov");
    let (_, routine) = h.enqueue("routine.mov", 5).await;
    let (_, urgent) = h.enqueue("urgent.mov", 10).await;
    let mut pool = h.pool(h.pipeline(OK_SCRIPT, LONG_TIMEOUT), 1).await;

    pool.tick().await.unwrap();

    let urgent = h.store.get_job(urgent.id).await.unwrap().unwrap();
    let routine = h.store.get_job(routine.id).await.unwrap().unwrap();
    assert_eq!(urgent.status, JobStatus::Completed);
    assert_eq!(routine.status, JobStatus::Pending);
}

#[tokio::test]
async fn empty_queue_tick_leaves_every_worker_idle() {
    let h = Harness::new();
    let mut pool = h.pool(h.pipeline(OK_SCRIPT, LONG_TIMEOUT), 3).await;

    let report = pool.tick().await.unwrap();
    assert_eq!(report.idle, 3);
    assert_eq!(report.processed(), 0);
}

#[tokio::test]
async fn worker_returns_to_idle_after_each_job() {
    let h = Harness::new();
    h.write_source("clip.mov");
    let (_, job) = h.enqueue("clip.mov", 0).await;

    let mut worker = Worker::new(
        0,
        h.store.clone() as Arc<dyn JobStore>,
        Arc::new(h.pipeline(OK_SCRIPT, LONG_TIMEOUT)),
        Arc::new(WorkerSettings {
            paths: h.paths.clone(),
            delete_source_on_success: false,
        }),
    );
    std::fs::create_dir_all(&h.paths.encoded).unwrap();
    std::fs::create_dir_all(&h.paths.thumbnails).unwrap();

    assert_eq!(worker.state(), WorkerState::Idle);
    let outcome = worker.run_once().await.unwrap();
    assert_eq!(outcome, JobOutcome::Completed { job_id: job.id });
    assert_eq!(worker.state(), WorkerState::Idle);

    assert_eq!(worker.run_once().await.unwrap(), JobOutcome::NoJob);
}

#[tokio::test]
async fn run_loop_processes_jobs_until_shutdown() {
    let h = Harness::new();
    h.write_source("clip.mov");
    let (_, job) = h.enqueue("clip.mov", 0).await;
    let pool = h.pool(h.pipeline(OK_SCRIPT, LONG_TIMEOUT), 2).await;

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(pool.run(shutdown.clone()));

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let status = h.store.get_job(job.id).await.unwrap().unwrap().status;
        if status.is_terminal() {
            assert_eq!(status, JobStatus::Completed);
            break;
        }
        assert!(Instant::now() < deadline, "job never finished");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    shutdown.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("pool did not stop")
        .expect("pool task panicked");
    assert!(result.is_ok());
}
