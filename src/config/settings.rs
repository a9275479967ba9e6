use crate::config::env::{self, EnvKey};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;
const DEFAULT_ENCODE_TIMEOUT_MS: u64 = 60 * 60 * 1_000;
const DEFAULT_THUMBNAIL_TIMEOUT_MS: u64 = 30_000;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database_url: String,
    pub db_max_connections: u32,
    pub worker_count: usize,
    pub poll_interval: Duration,
    pub delete_source_on_success: bool,
    pub encode: EncodeConfig,
    pub paths: StoragePaths,
}

/// Parameters handed to the external transcoder.
#[derive(Clone, Debug)]
pub struct EncodeConfig {
    pub ffmpeg_path: PathBuf,
    pub video_preset: String,
    pub video_crf: u8,
    pub audio_bitrate: String,
    pub encode_timeout: Duration,
    pub thumbnail_timeout: Duration,
    pub thumbnail_at_seconds: f64,
}

impl Default for EncodeConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            video_preset: "medium".to_string(),
            video_crf: 23,
            audio_bitrate: "128k".to_string(),
            encode_timeout: Duration::from_millis(DEFAULT_ENCODE_TIMEOUT_MS),
            thumbnail_timeout: Duration::from_millis(DEFAULT_THUMBNAIL_TIMEOUT_MS),
            thumbnail_at_seconds: 1.0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct StoragePaths {
    pub uploads: PathBuf,
    pub encoded: PathBuf,
    pub thumbnails: PathBuf,
}

impl Default for StoragePaths {
    fn default() -> Self {
        Self {
            uploads: PathBuf::from("uploads"),
            encoded: PathBuf::from("encoded"),
            thumbnails: PathBuf::from("thumbnails"),
        }
    }
}

impl StoragePaths {
    pub fn source_path(&self, filename: &str) -> PathBuf {
        self.uploads.join(filename)
    }

    /// Output names keep the whole upload filename, which is unique per media
    /// entity, so `a.mov` and `a.mkv` never share an output path.
    pub fn encoded_filename(filename: &str) -> String {
        format!("{filename}.mp4")
    }

    pub fn thumbnail_filename(filename: &str) -> String {
        format!("{filename}.jpg")
    }
}

pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .max(1)
}

impl AppConfig {
    pub fn new() -> Result<Self, std::env::VarError> {
        let defaults = EncodeConfig::default();
        let worker_count = env::get_parsed(EnvKey::WorkerCount, default_worker_count()).max(1);

        Ok(Self {
            database_url: env::get(EnvKey::DatabaseUrl)?,
            db_max_connections: env::get_parsed(
                EnvKey::DbMaxConnections,
                u32::try_from(worker_count).unwrap_or(u32::MAX).saturating_add(2),
            ),
            worker_count,
            poll_interval: Duration::from_millis(env::get_parsed(
                EnvKey::PollIntervalMs,
                DEFAULT_POLL_INTERVAL_MS,
            )),
            delete_source_on_success: env::get_flag(EnvKey::DeleteSourceOnSuccess, false),
            encode: EncodeConfig {
                ffmpeg_path: PathBuf::from(env::get_or(EnvKey::FfmpegPath, "ffmpeg")),
                video_preset: env::get_or(EnvKey::VideoPreset, &defaults.video_preset),
                video_crf: env::get_parsed(EnvKey::VideoCrf, defaults.video_crf),
                audio_bitrate: env::get_or(EnvKey::AudioBitrate, &defaults.audio_bitrate),
                encode_timeout: Duration::from_millis(env::get_parsed(
                    EnvKey::EncodeTimeoutMs,
                    DEFAULT_ENCODE_TIMEOUT_MS,
                )),
                thumbnail_timeout: Duration::from_millis(env::get_parsed(
                    EnvKey::ThumbnailTimeoutMs,
                    DEFAULT_THUMBNAIL_TIMEOUT_MS,
                )),
                thumbnail_at_seconds: env::get_parsed(
                    EnvKey::ThumbnailAtSeconds,
                    defaults.thumbnail_at_seconds,
                ),
            },
            paths: StoragePaths {
                uploads: PathBuf::from(env::get_or(EnvKey::UploadsDir, "uploads")),
                encoded: PathBuf::from(env::get_or(EnvKey::EncodedDir, "encoded")),
                thumbnails: PathBuf::from(env::get_or(EnvKey::ThumbnailsDir, "thumbnails")),
            },
        })
    }
}
