use super::model::Media;
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

pub struct MediaRepository;

impl MediaRepository {
    /// Accepts a pool or an open transaction, so the row can be written
    /// together with its job.
    pub async fn create<'e, E>(executor: E, filename: &str, title: &str) -> Result<Media, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        let media = Media::new(filename, title);

        sqlx::query_as::<_, Media>(
            r#"
            INSERT INTO media (id, filename, title, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $4)
            RETURNING id, filename, title, encoded, encoded_filename, thumbnail,
                      file_size, encoding_duration, created_at, updated_at
            "#,
        )
        .bind(media.id)
        .bind(&media.filename)
        .bind(&media.title)
        .bind(media.created_at)
        .fetch_one(executor)
        .await
    }

    pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Media>, sqlx::Error> {
        sqlx::query_as::<_, Media>(
            r#"
            SELECT id, filename, title, encoded, encoded_filename, thumbnail,
                   file_size, encoding_duration, created_at, updated_at
            FROM media
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await
    }
}
