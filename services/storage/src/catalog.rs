//! Video Catalog Resolver and catalog read accessors.
//!
//! Resolution is a fuzzy find-or-create: a candidate name matches a stored
//! video when either name contains the other, ignoring case. Matching itself
//! is the pure [`match_video`]; [`VideoCatalog`] wraps it with the store.

use crate::config::CatalogConfig;
use crate::database::{Backend, Database};
use serde::Serialize;
use sqlx::{AnyPool, FromRow};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Primary key of a row in `videos`
pub type VideoId = i64;

// The Any driver cannot decode NULL text, so optional columns come back as ''
const VIDEO_COLUMNS: &str = "id, name, description, category, difficulty, duration_seconds, \
     COALESCE(media_url, '') AS media_url, COALESCE(thumbnail_url, '') AS thumbnail_url, \
     CAST(created_at AS TEXT) AS created_at, CAST(updated_at AS TEXT) AS updated_at";

/// Catalog errors
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Video name candidate is empty")]
    EmptyCandidate,

    #[error("Table '{0}' not found")]
    UnknownTable(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// A row in `videos`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Video {
    pub id: VideoId,
    pub name: String,
    pub description: String,
    pub category: String,
    pub difficulty: String,
    pub duration_seconds: f64,
    pub media_url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(FromRow)]
struct VideoRow {
    id: VideoId,
    name: String,
    description: String,
    category: String,
    difficulty: String,
    duration_seconds: f64,
    media_url: String,
    thumbnail_url: String,
    created_at: String,
    updated_at: String,
}

impl From<VideoRow> for Video {
    fn from(row: VideoRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            description: row.description,
            category: row.category,
            difficulty: row.difficulty,
            duration_seconds: row.duration_seconds,
            media_url: non_empty(row.media_url),
            thumbnail_url: non_empty(row.thumbnail_url),
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Map a `COALESCE(.., '')` column back to an optional value
pub(crate) fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Catalog listing entry with pose coverage
#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct VideoSummary {
    pub id: VideoId,
    pub name: String,
    pub category: String,
    pub difficulty: String,
    pub duration_seconds: f64,
    pub sequence_count: i64,
    /// Highest persisted `timestamp_seconds`, 0 without data
    pub max_timestamp: f64,
}

/// One column of a catalog table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

/// Result of matching a candidate name against stored names
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameMatch {
    /// Chosen video: the lowest matching id
    pub id: VideoId,
    /// Other matching ids, ascending
    pub ambiguous_with: Vec<VideoId>,
}

/// Outcome of [`VideoCatalog::resolve`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub video_id: VideoId,
    /// Whether a new video row was inserted
    pub created: bool,
    pub ambiguous_with: Vec<VideoId>,
}

/// Match a candidate name against `(id, name)` pairs.
///
/// A stored name matches when it contains the candidate, or the candidate
/// contains it, case-insensitively. Empty stored names never match. With
/// several matches the lowest id wins.
pub fn match_video<'a, I>(existing: I, candidate: &str) -> Option<NameMatch>
where
    I: IntoIterator<Item = (VideoId, &'a str)>,
{
    let candidate = candidate.trim().to_lowercase();
    if candidate.is_empty() {
        return None;
    }

    let mut ids: Vec<VideoId> = existing
        .into_iter()
        .filter(|(_, name)| {
            let stored = name.trim().to_lowercase();
            !stored.is_empty() && (stored.contains(&candidate) || candidate.contains(&stored))
        })
        .map(|(id, _)| id)
        .collect();

    ids.sort_unstable();
    ids.dedup();

    let mut ids = ids.into_iter();
    let id = ids.next()?;
    Some(NameMatch {
        id,
        ambiguous_with: ids.collect(),
    })
}

/// Video catalog over the store
#[derive(Debug, Clone)]
pub struct VideoCatalog {
    pool: AnyPool,
    backend: Backend,
    config: CatalogConfig,
}

impl VideoCatalog {
    pub fn new(database: &Database, config: CatalogConfig) -> Self {
        Self {
            pool: database.pool().clone(),
            backend: database.backend(),
            config,
        }
    }

    /// Find the video a candidate name refers to, or create it.
    ///
    /// An existing video is returned untouched. `source` only feeds the
    /// description of a newly created row.
    #[instrument(skip(self))]
    pub async fn resolve(&self, candidate: &str, source: &str) -> Result<Resolution, CatalogError> {
        let candidate = candidate.trim();
        if candidate.is_empty() {
            return Err(CatalogError::EmptyCandidate);
        }

        let rows: Vec<(VideoId, String)> = sqlx::query_as("SELECT id, name FROM videos ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        if let Some(found) = match_video(rows.iter().map(|(id, name)| (*id, name.as_str())), candidate)
        {
            if !found.ambiguous_with.is_empty() {
                warn!(
                    candidate = %candidate,
                    video_id = found.id,
                    ambiguous_with = ?found.ambiguous_with,
                    "Candidate matches several videos, using lowest id"
                );
            }
            debug!(video_id = found.id, "Resolved existing video");
            return Ok(Resolution {
                video_id: found.id,
                created: false,
                ambiguous_with: found.ambiguous_with,
            });
        }

        let (video_id,): (VideoId,) = sqlx::query_as(
            r#"
            INSERT INTO videos (name, description, category, difficulty, duration_seconds)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(candidate)
        .bind(self.config.description_template.replace("{source}", source))
        .bind(&self.config.default_category)
        .bind(&self.config.default_difficulty)
        .bind(0.0_f64)
        .fetch_one(&self.pool)
        .await?;

        info!(video_id, name = %candidate, "Created video");
        metrics::counter!("kata.catalog.videos_created").increment(1);

        Ok(Resolution {
            video_id,
            created: true,
            ambiguous_with: Vec::new(),
        })
    }

    /// Get a video by id
    pub async fn get_video(&self, video_id: VideoId) -> Result<Option<Video>, CatalogError> {
        let video = sqlx::query_as::<_, VideoRow>(&format!(
            "SELECT {VIDEO_COLUMNS} FROM videos WHERE id = $1"
        ))
        .bind(video_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(video.map(Video::from))
    }

    /// Every video with its sequence count, by category, difficulty, name
    #[instrument(skip(self))]
    pub async fn list_videos(&self) -> Result<Vec<VideoSummary>, CatalogError> {
        let videos = sqlx::query_as::<_, VideoSummary>(
            r#"
            SELECT v.id, v.name, v.category, v.difficulty, v.duration_seconds,
                   CAST(COUNT(s.id) AS BIGINT) AS sequence_count,
                   CAST(COALESCE(MAX(s.timestamp_seconds), 0) AS DOUBLE PRECISION) AS max_timestamp
            FROM videos v
            LEFT JOIN pose_sequences s ON s.video_id = v.id
            GROUP BY v.id, v.name, v.category, v.difficulty, v.duration_seconds
            ORDER BY v.category, v.difficulty, v.name, v.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(videos)
    }

    /// Number of pose sequences stored for a video
    pub async fn sequence_count(&self, video_id: VideoId) -> Result<i64, CatalogError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT CAST(COUNT(*) AS BIGINT) FROM pose_sequences WHERE video_id = $1",
        )
        .bind(video_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    /// Number of keypoint rows stored for a video
    pub async fn keypoint_count(&self, video_id: VideoId) -> Result<i64, CatalogError> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT CAST(COUNT(*) AS BIGINT)
            FROM pose_keypoints k
            JOIN pose_sequences s ON s.id = k.sequence_id
            WHERE s.video_id = $1
            "#,
        )
        .bind(video_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    /// Column definitions of a table, in declaration order
    pub async fn table_columns(&self, table: &str) -> Result<Vec<ColumnInfo>, CatalogError> {
        let rows: Vec<(String, String, bool)> = match self.backend {
            Backend::Postgres => {
                let rows: Vec<(String, String, String)> = sqlx::query_as(
                    r#"
                    SELECT CAST(column_name AS TEXT), CAST(data_type AS TEXT), CAST(is_nullable AS TEXT)
                    FROM information_schema.columns
                    WHERE table_schema = current_schema() AND table_name = $1
                    ORDER BY ordinal_position
                    "#,
                )
                .bind(table)
                .fetch_all(&self.pool)
                .await?;

                rows.into_iter()
                    .map(|(name, data_type, nullable)| (name, data_type, nullable == "YES"))
                    .collect()
            }
            Backend::Sqlite => {
                let rows: Vec<(String, String, i64)> = sqlx::query_as(
                    r#"SELECT name, "type", CAST("notnull" AS BIGINT) FROM pragma_table_info($1) ORDER BY cid"#,
                )
                .bind(table)
                .fetch_all(&self.pool)
                .await?;

                rows.into_iter()
                    .map(|(name, data_type, not_null)| (name, data_type, not_null == 0))
                    .collect()
            }
        };

        if rows.is_empty() {
            return Err(CatalogError::UnknownTable(table.to_string()));
        }

        Ok(rows
            .into_iter()
            .map(|(name, data_type, nullable)| ColumnInfo {
                name,
                data_type,
                nullable,
            })
            .collect())
    }
}
