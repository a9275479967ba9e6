use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// An uploaded video and, once a job for it completes, its encoded outputs.
#[derive(Debug, Serialize, Deserialize, FromRow, Clone, PartialEq)]
pub struct Media {
    pub id: Uuid,
    pub filename: String,
    pub title: String,
    pub encoded: bool,
    pub encoded_filename: Option<String>,
    pub thumbnail: Option<String>,
    pub file_size: Option<i64>,
    pub encoding_duration: Option<f64>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Media {
    pub fn new(filename: impl Into<String>, title: impl Into<String>) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: Uuid::new_v4(),
            filename: filename.into(),
            title: title.into(),
            encoded: false,
            encoded_filename: None,
            thumbnail: None,
            file_size: None,
            encoding_duration: None,
            created_at: now,
            updated_at: now,
        }
    }
}
