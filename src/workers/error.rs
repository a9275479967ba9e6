use crate::modules::jobs::StoreError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Per-job failures. These never leave the worker that hit them; they end up
/// as the job's `error_message`.
#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("source file missing: {}", .0.display())]
    SourceMissing(PathBuf),

    #[error("encode timed out after {}ms", .0.as_millis())]
    EncodeTimeout(Duration),

    #[error("encode failed (exit code {code:?}): {stderr}")]
    EncodeFailure { code: Option<i32>, stderr: String },

    #[error("thumbnail extraction failed: {0}")]
    ThumbnailFailure(String),

    #[error("failed to run transcoder: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("output file unreadable: {0}")]
    Output(#[source] std::io::Error),
}

impl TranscodeError {
    /// Whether the transcoder got as far as running, and so may have left a
    /// (possibly partial) output file behind.
    pub fn transcoder_ran(&self) -> bool {
        !matches!(self, TranscodeError::SourceMissing(_) | TranscodeError::Spawn(_))
    }
}

/// Infrastructure failures that stop the whole pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to prepare output directory {}: {source}", path.display())]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("job store unavailable: {0}")]
    Store(#[from] StoreError),

    #[error("worker task panicked: {0}")]
    WorkerPanicked(#[from] tokio::task::JoinError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_spawned_runs_can_leave_output_behind() {
        assert!(!TranscodeError::SourceMissing(PathBuf::from("a.mov")).transcoder_ran());
        assert!(!TranscodeError::Spawn(std::io::ErrorKind::NotFound.into()).transcoder_ran());
        assert!(TranscodeError::EncodeTimeout(Duration::from_secs(1)).transcoder_ran());
        assert!(TranscodeError::ThumbnailFailure("no frame".to_string()).transcoder_ran());
    }
}
