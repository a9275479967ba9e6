use super::error::TranscodeError;
use crate::config::settings::EncodeConfig;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

const THUMBNAIL_WIDTH: u32 = 640;
const THUMBNAIL_HEIGHT: u32 = 360;
// Only the tail of ffmpeg's stderr is kept; the useful line is usually last.
const STDERR_TAIL_BYTES: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncodeOutput {
    pub file_size: u64,
    pub duration: Duration,
}

enum RunFailure {
    Spawn(std::io::Error),
    TimedOut,
    Exited { code: Option<i32>, stderr: String },
}

/// Runs the external transcoder. Arguments are passed as a vector, never
/// through a shell, and every invocation is bounded by a wall-clock timeout.
#[derive(Debug, Clone)]
pub struct TranscodePipeline {
    program: PathBuf,
    launcher_args: Vec<OsString>,
    config: EncodeConfig,
}

impl TranscodePipeline {
    pub fn new(config: EncodeConfig) -> Self {
        Self {
            program: config.ffmpeg_path.clone(),
            launcher_args: Vec::new(),
            config,
        }
    }

    /// Runs the transcoder through a launcher, e.g. `nice -n 10 ffmpeg ...`.
    /// The launcher arguments go before the ffmpeg arguments.
    pub fn with_launcher<I, S>(mut self, program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.program = program.into();
        self.launcher_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn config(&self) -> &EncodeConfig {
        &self.config
    }

    pub fn encode_args(&self, source: &Path, output: &Path) -> Vec<OsString> {
        let crf = self.config.video_crf.to_string();
        let mut args: Vec<OsString> = ["-y", "-hide_banner", "-loglevel", "error", "-i"]
            .into_iter()
            .map(OsString::from)
            .collect();
        args.push(source.as_os_str().to_owned());
        args.extend(
            [
                "-c:v",
                "libx264",
                "-preset",
                self.config.video_preset.as_str(),
                "-crf",
                crf.as_str(),
                "-c:a",
                "aac",
                "-b:a",
                self.config.audio_bitrate.as_str(),
                "-movflags",
                "+faststart",
            ]
            .into_iter()
            .map(OsString::from),
        );
        args.push(output.as_os_str().to_owned());
        args
    }

    pub fn thumbnail_args(&self, source: &Path, thumb: &Path, at_seconds: f64) -> Vec<OsString> {
        let filter = format!(
            "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2",
            w = THUMBNAIL_WIDTH,
            h = THUMBNAIL_HEIGHT,
        );

        let mut args: Vec<OsString> = vec![
            "-y".into(),
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-ss".into(),
            format!("{at_seconds:.3}").into(),
            "-i".into(),
        ];
        args.push(source.as_os_str().to_owned());
        args.extend(
            ["-frames:v", "1", "-vf", filter.as_str()]
                .into_iter()
                .map(OsString::from),
        );
        args.push(thumb.as_os_str().to_owned());
        args
    }

    /// Encodes `source` into `output`. Fails with `SourceMissing` before
    /// spawning anything when the source is absent.
    pub async fn encode(&self, source: &Path, output: &Path) -> Result<EncodeOutput, TranscodeError> {
        if !matches!(tokio::fs::try_exists(source).await, Ok(true)) {
            return Err(TranscodeError::SourceMissing(source.to_path_buf()));
        }

        let started = Instant::now();
        let args = self.encode_args(source, output);

        match self.run(args, self.config.encode_timeout).await {
            Ok(()) => {}
            Err(RunFailure::Spawn(e)) => return Err(TranscodeError::Spawn(e)),
            Err(RunFailure::TimedOut) => {
                return Err(TranscodeError::EncodeTimeout(self.config.encode_timeout));
            }
            Err(RunFailure::Exited { code, stderr }) => {
                return Err(TranscodeError::EncodeFailure { code, stderr });
            }
        }
        let duration = started.elapsed();

        let file_size = tokio::fs::metadata(output)
            .await
            .map_err(TranscodeError::Output)?
            .len();
        if file_size == 0 {
            return Err(TranscodeError::EncodeFailure {
                code: Some(0),
                stderr: "encoder produced an empty file".to_string(),
            });
        }

        Ok(EncodeOutput { file_size, duration })
    }

    /// Grabs one frame at `at_seconds`, scaled and padded to 16:9.
    pub async fn extract_thumbnail(
        &self,
        source: &Path,
        thumb: &Path,
        at_seconds: f64,
    ) -> Result<(), TranscodeError> {
        let args = self.thumbnail_args(source, thumb, at_seconds);

        match self.run(args, self.config.thumbnail_timeout).await {
            Ok(()) => {}
            Err(RunFailure::Spawn(e)) => return Err(TranscodeError::Spawn(e)),
            Err(RunFailure::TimedOut) => {
                return Err(TranscodeError::ThumbnailFailure(format!(
                    "timed out after {}ms",
                    self.config.thumbnail_timeout.as_millis()
                )));
            }
            Err(RunFailure::Exited { code, stderr }) => {
                return Err(TranscodeError::ThumbnailFailure(format!(
                    "exit code {code:?}: {stderr}"
                )));
            }
        }

        if !matches!(tokio::fs::try_exists(thumb).await, Ok(true)) {
            return Err(TranscodeError::ThumbnailFailure(
                "no thumbnail written".to_string(),
            ));
        }
        Ok(())
    }

    async fn run(&self, args: Vec<OsString>, timeout: Duration) -> Result<(), RunFailure> {
        debug!(
            program = %self.program.display(),
            args = ?self.launcher_args.iter().chain(args.iter()).collect::<Vec<_>>(),
            "Spawning transcoder"
        );

        let mut child = Command::new(&self.program)
            .args(&self.launcher_args)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(RunFailure::Spawn)?;

        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf).await;
                buf
            })
        });

        let status: ExitStatus = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                if let Some(task) = stderr_task {
                    task.abort();
                }
                return Err(RunFailure::Spawn(e));
            }
            Err(_) => {
                warn!(
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "Transcoder timed out, killing process"
                );
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill transcoder: {}", e);
                }
                // A grandchild may still hold the pipe open; don't wait for EOF.
                if let Some(task) = stderr_task {
                    task.abort();
                }
                return Err(RunFailure::TimedOut);
            }
        };

        if status.success() {
            if let Some(task) = stderr_task {
                task.abort();
            }
            return Ok(());
        }

        let stderr = match stderr_task {
            Some(task) => match tokio::time::timeout(Duration::from_secs(1), task).await {
                Ok(Ok(buf)) => stderr_tail(&buf),
                _ => String::new(),
            },
            None => String::new(),
        };

        Err(RunFailure::Exited {
            code: status.code(),
            stderr,
        })
    }
}

fn stderr_tail(buf: &[u8]) -> String {
    let text = String::from_utf8_lossy(buf);
    let text = text.trim();
    if text.len() <= STDERR_TAIL_BYTES {
        return text.to_string();
    }
    let mut start = text.len() - STDERR_TAIL_BYTES;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}
