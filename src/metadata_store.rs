use crate::config::DatabaseConfig;
use crate::error::{PipelineError, Result};
use crate::face_index::FaceRecord;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// A published photo-shoot session
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Event {
    /// Unique event ID
    pub id: Uuid,
    /// Human name
    pub name: String,
    /// URL-safe slug, unique; doubles as the biometric collection id
    pub slug: String,
    /// Venue / city
    pub location: Option<String>,
    /// Date the shoot took place
    pub event_date: NaiveDate,
    /// Object key of the cover image, if set
    pub cover_key: Option<String>,
    /// When the record was created
    pub created_at: DateTime<Utc>,
    /// When the event becomes eligible for reaping
    pub expires_at: Option<DateTime<Utc>>,
}

/// One detected face persisted against the photo it came from
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct IndexedFace {
    /// Unique row ID
    pub id: Uuid,
    /// Owning event slug
    pub event_slug: String,
    /// Object key of the source photo
    pub photo_key: String,
    /// Face identifier issued by the biometric index
    pub face_id: String,
    /// Bounding box as JSON {width, height, left, top}
    pub bbox: serde_json::Value,
    /// When the record was created
    pub created_at: DateTime<Utc>,
}

/// Relational store for events, indexed faces, and per-photo indexing state
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get_event_by_slug(&self, slug: &str) -> Result<Option<Event>>;

    /// Expired events, oldest expiry first, bounded
    async fn expired_events(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Event>>;

    /// Whether indexing has already been recorded for (slug, photo)
    async fn is_photo_indexed(&self, slug: &str, photo_key: &str) -> Result<bool>;

    /// Record a completed indexing call for one photo: the state row plus one
    /// face row per persisted face, atomically. Returns face rows written.
    async fn record_photo_indexed(
        &self,
        slug: &str,
        photo_key: &str,
        faces: &[FaceRecord],
    ) -> Result<usize>;

    async fn faces_for_event(&self, slug: &str) -> Result<Vec<IndexedFace>>;

    async fn face_ids_for_event(&self, slug: &str) -> Result<Vec<String>>;

    /// Count-returning deletes for reaper observability
    async fn delete_faces_for_event(&self, slug: &str) -> Result<u64>;

    async fn delete_index_state_for_event(&self, slug: &str) -> Result<u64>;

    async fn delete_event(&self, slug: &str) -> Result<u64>;
}

/// PostgreSQL-backed metadata store
pub struct PgMetadataStore {
    pool: PgPool,
    timeout: Duration,
}

impl PgMetadataStore {
    /// Create a new metadata store with connection pool
    pub async fn new(config: &DatabaseConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await?;

        info!("Connected to PostgreSQL database");

        Ok(Self {
            pool,
            timeout: Duration::from_secs(config.statement_timeout_secs),
        })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations").run(&self.pool).await?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool (for health checks)
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn db_err(e: sqlx::Error) -> PipelineError {
    PipelineError::remote("postgres", e)
}

/// Bound a statement (or transaction) with the configured timeout. The pool
/// acquire timeout does not cover a statement that hangs mid-flight.
async fn bounded<T, F>(timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| PipelineError::transient("postgres", "statement timed out"))?
}

#[async_trait]
impl MetadataStore for PgMetadataStore {
    async fn get_event_by_slug(&self, slug: &str) -> Result<Option<Event>> {
        bounded(self.timeout, async {
            sqlx::query_as::<_, Event>(
                r#"
                SELECT id, name, slug, location, event_date, cover_key, created_at, expires_at
                FROM events
                WHERE slug = $1
                "#,
            )
            .bind(slug)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)
        })
        .await
    }

    #[instrument(skip(self))]
    async fn expired_events(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Event>> {
        bounded(self.timeout, async {
            sqlx::query_as::<_, Event>(
                r#"
                SELECT id, name, slug, location, event_date, cover_key, created_at, expires_at
                FROM events
                WHERE expires_at IS NOT NULL AND expires_at <= $1
                ORDER BY expires_at ASC
                LIMIT $2
                "#,
            )
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)
        })
        .await
    }

    async fn is_photo_indexed(&self, slug: &str, photo_key: &str) -> Result<bool> {
        let row: Option<(i32,)> = bounded(self.timeout, async {
            sqlx::query_as(
                r#"
                SELECT 1 FROM photo_index_state
                WHERE event_slug = $1 AND photo_key = $2
                "#,
            )
            .bind(slug)
            .bind(photo_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)
        })
        .await?;

        Ok(row.is_some())
    }

    #[instrument(skip(self, faces), fields(face_count = faces.len()))]
    async fn record_photo_indexed(
        &self,
        slug: &str,
        photo_key: &str,
        faces: &[FaceRecord],
    ) -> Result<usize> {
        // One bound around the whole transaction; a timeout drops the
        // connection and rolls it back.
        let written = bounded(self.timeout, async {
            let mut tx = self.pool.begin().await.map_err(db_err)?;

            sqlx::query(
                r#"
                INSERT INTO photo_index_state (event_slug, photo_key, indexed_at)
                VALUES ($1, $2, NOW())
                ON CONFLICT (event_slug, photo_key) DO NOTHING
                "#,
            )
            .bind(slug)
            .bind(photo_key)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

            let mut written = 0usize;

            for face in faces {
                let bbox = serde_json::to_value(&face.bbox)
                    .map_err(|e| PipelineError::remote("postgres", e))?;

                let result = sqlx::query(
                    r#"
                    INSERT INTO indexed_faces (id, event_slug, photo_key, face_id, bbox, created_at)
                    VALUES ($1, $2, $3, $4, $5, NOW())
                    ON CONFLICT (event_slug, photo_key, face_id) DO NOTHING
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(slug)
                .bind(photo_key)
                .bind(&face.face_id)
                .bind(&bbox)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;

                written += result.rows_affected() as usize;
            }

            tx.commit().await.map_err(db_err)?;

            Ok(written)
        })
        .await?;

        debug!(slug = %slug, photo_key = %photo_key, written, "Photo indexing recorded");

        Ok(written)
    }

    async fn faces_for_event(&self, slug: &str) -> Result<Vec<IndexedFace>> {
        bounded(self.timeout, async {
            sqlx::query_as::<_, IndexedFace>(
                r#"
                SELECT id, event_slug, photo_key, face_id, bbox, created_at
                FROM indexed_faces
                WHERE event_slug = $1
                ORDER BY created_at ASC
                "#,
            )
            .bind(slug)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)
        })
        .await
    }

    async fn face_ids_for_event(&self, slug: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = bounded(self.timeout, async {
            sqlx::query_as(
                r#"
                SELECT face_id FROM indexed_faces
                WHERE event_slug = $1
                "#,
            )
            .bind(slug)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)
        })
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    #[instrument(skip(self))]
    async fn delete_faces_for_event(&self, slug: &str) -> Result<u64> {
        let result = bounded(self.timeout, async {
            sqlx::query("DELETE FROM indexed_faces WHERE event_slug = $1")
                .bind(slug)
                .execute(&self.pool)
                .await
                .map_err(db_err)
        })
        .await?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn delete_index_state_for_event(&self, slug: &str) -> Result<u64> {
        let result = bounded(self.timeout, async {
            sqlx::query("DELETE FROM photo_index_state WHERE event_slug = $1")
                .bind(slug)
                .execute(&self.pool)
                .await
                .map_err(db_err)
        })
        .await?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn delete_event(&self, slug: &str) -> Result<u64> {
        let result = bounded(self.timeout, async {
            sqlx::query("DELETE FROM events WHERE slug = $1")
                .bind(slug)
                .execute(&self.pool)
                .await
                .map_err(db_err)
        })
        .await?;

        Ok(result.rows_affected())
    }
}
