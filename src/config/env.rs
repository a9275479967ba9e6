use std::env;
use std::str::FromStr;

#[derive(Debug, Clone, Copy)]
pub enum EnvKey {
    DatabaseUrl,
    DbMaxConnections,
    WorkerCount,
    PollIntervalMs,
    VideoPreset,
    VideoCrf,
    AudioBitrate,
    EncodeTimeoutMs,
    ThumbnailTimeoutMs,
    ThumbnailAtSeconds,
    DeleteSourceOnSuccess,
    VerboseLogging,
    FfmpegPath,
    UploadsDir,
    EncodedDir,
    ThumbnailsDir,
}

impl EnvKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvKey::DatabaseUrl => "DATABASE_URL",
            EnvKey::DbMaxConnections => "DB_MAX_CONNECTIONS",
            EnvKey::WorkerCount => "WORKER_COUNT",
            EnvKey::PollIntervalMs => "POLL_INTERVAL_MS",
            EnvKey::VideoPreset => "VIDEO_PRESET",
            EnvKey::VideoCrf => "VIDEO_CRF",
            EnvKey::AudioBitrate => "AUDIO_BITRATE",
            EnvKey::EncodeTimeoutMs => "ENCODE_TIMEOUT_MS",
            EnvKey::ThumbnailTimeoutMs => "THUMBNAIL_TIMEOUT_MS",
            EnvKey::ThumbnailAtSeconds => "THUMBNAIL_AT_SECONDS",
            EnvKey::DeleteSourceOnSuccess => "DELETE_SOURCE_ON_SUCCESS",
            EnvKey::VerboseLogging => "VERBOSE_LOGGING",
            EnvKey::FfmpegPath => "FFMPEG_PATH",
            EnvKey::UploadsDir => "UPLOADS_DIR",
            EnvKey::EncodedDir => "ENCODED_DIR",
            EnvKey::ThumbnailsDir => "THUMBNAILS_DIR",
        }
    }
}

pub fn get(key: EnvKey) -> Result<String, env::VarError> {
    env::var(key.as_str())
}

pub fn get_or(key: EnvKey, default: &str) -> String {
    env::var(key.as_str()).unwrap_or_else(|_| default.to_string())
}

pub fn get_parsed<T: FromStr>(key: EnvKey, default: T) -> T {
    match get(key) {
        Ok(val) => val.trim().parse::<T>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Accepts `1/0`, `true/false`, `yes/no` and `on/off`, case-insensitively.
pub fn get_flag(key: EnvKey, default: bool) -> bool {
    match get(key) {
        Ok(val) => parse_flag(&val).unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
