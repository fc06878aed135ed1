//! Ingestion Engine: replaces a video's persisted pose data with a new frame set.
//!
//! One run is one transaction. Inside it the engine checks the video exists,
//! applies the existing-data policy, deletes old keypoints and then old
//! sequences, streams the new frames through a [`SequenceWriter`] in bounded
//! batches, and updates the video row. Any error rolls the whole run back.
//!
//! ```text
//! Stream<FrameRecord> ──▶ buffer (batch_size) ──▶ SequenceWriter ──▶ pose_sequences
//!                                                   │ normalized ──▶ pose_keypoints
//!                                                   └ denormalized ─▶ keypoints_blob
//! ```

use crate::catalog::VideoId;
use crate::config::{ConfigValidationError, ExistingDataPolicy, IngestionConfig, Strategy};
use crate::database::Database;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use kata_pose::{DocumentError, FrameRecord, Keypoint, PoseDocument};
use sqlx::{AnyConnection, AnyPool};
use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt::Write as _;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Bind-parameter ceiling per statement (SQLite's limit; Postgres allows more)
pub const MAX_BIND_PARAMS: usize = 32_766;

const SEQUENCE_PARAMS: usize = 5;
const BLOB_SEQUENCE_PARAMS: usize = 6;
const KEYPOINT_PARAMS: usize = 7;

/// Ingestion errors
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Video {0} does not exist")]
    UnknownVideo(VideoId),

    #[error("Invalid frame rate: {0}")]
    InvalidFrameRate(f64),

    #[error("Frame {frame_number} is inconsistent: {source}")]
    InconsistentFrame {
        frame_number: u64,
        #[source]
        source: DocumentError,
    },

    #[error("Store returned no sequence id for frame {0}")]
    MissingSequenceId(u64),

    #[error("Invalid ingestion configuration: {0}")]
    Config(#[from] ConfigValidationError),

    #[error("Failed to serialize keypoints: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Frame source failed: {0}")]
    Source(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Rows written by one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub sequences: u64,
    pub keypoints: u64,
    pub statements: u64,
}

/// Writes buffered frames for one video into the store.
///
/// Frames arrive with `frame_number` already set to their position in the
/// run. Implementations must only use the given connection, which is the
/// run's open transaction.
#[async_trait]
pub trait SequenceWriter: Send + Sync {
    fn strategy(&self) -> Strategy;

    async fn write_batch(
        &self,
        conn: &mut AnyConnection,
        video_id: VideoId,
        fps: f64,
        frames: &[FrameRecord],
    ) -> Result<BatchStats, IngestError>;
}

/// Per-frame guard: the frame itself is consistent and, when detected,
/// carries as many keypoints as the first detected frame of the run.
fn check_frame(frame: &FrameRecord, cardinality: &mut Option<usize>) -> Result<(), DocumentError> {
    frame.check_consistency()?;

    if frame.pose_detected {
        let actual = frame.keypoints.len();
        match *cardinality {
            None => *cardinality = Some(actual),
            Some(expected) if expected != actual => {
                return Err(DocumentError::KeypointCardinality {
                    frame_number: frame.frame_number,
                    expected,
                    actual,
                });
            }
            Some(_) => {}
        }
    }

    Ok(())
}

/// Rows per multi-row INSERT given the batch size and parameters per row
pub fn rows_per_statement(batch_size: usize, params_per_row: usize) -> usize {
    batch_size.min(MAX_BIND_PARAMS / params_per_row).max(1)
}

/// `($1, $2), ($3, $4), …` for `rows` rows of `columns` placeholders
fn values_clause(rows: usize, columns: usize) -> String {
    let mut sql = String::with_capacity(rows * columns * 6);
    let mut param = 0;
    for row in 0..rows {
        if row > 0 {
            sql.push_str(", ");
        }
        sql.push('(');
        for column in 0..columns {
            if column > 0 {
                sql.push_str(", ");
            }
            param += 1;
            let _ = write!(sql, "${param}");
        }
        sql.push(')');
    }
    sql
}

/// Sequence rows plus one `pose_keypoints` row per landmark
#[derive(Debug, Clone)]
pub struct NormalizedWriter {
    sequence_rows: usize,
    keypoint_rows: usize,
}

impl NormalizedWriter {
    pub fn new(batch_size: usize) -> Self {
        Self {
            sequence_rows: rows_per_statement(batch_size, SEQUENCE_PARAMS),
            keypoint_rows: rows_per_statement(batch_size, KEYPOINT_PARAMS),
        }
    }

    async fn insert_keypoints(
        &self,
        conn: &mut AnyConnection,
        rows: &[(i64, &Keypoint)],
    ) -> Result<u64, IngestError> {
        let mut statements = 0;
        for chunk in rows.chunks(self.keypoint_rows) {
            let sql = format!(
                "INSERT INTO pose_keypoints \
                 (sequence_id, keypoint_id, keypoint_name, x, y, z, visibility) VALUES {}",
                values_clause(chunk.len(), KEYPOINT_PARAMS)
            );

            let mut query = sqlx::query(&sql);
            for (sequence_id, keypoint) in chunk {
                query = query
                    .bind(*sequence_id)
                    .bind(i64::from(keypoint.id))
                    .bind(keypoint.name.as_str())
                    .bind(keypoint.x)
                    .bind(keypoint.y)
                    .bind(keypoint.z)
                    .bind(keypoint.visibility);
            }
            query.execute(&mut *conn).await?;
            statements += 1;
        }
        Ok(statements)
    }
}

#[async_trait]
impl SequenceWriter for NormalizedWriter {
    fn strategy(&self) -> Strategy {
        Strategy::Normalized
    }

    async fn write_batch(
        &self,
        conn: &mut AnyConnection,
        video_id: VideoId,
        fps: f64,
        frames: &[FrameRecord],
    ) -> Result<BatchStats, IngestError> {
        let mut stats = BatchStats::default();

        for chunk in frames.chunks(self.sequence_rows) {
            let sql = format!(
                "INSERT INTO pose_sequences \
                 (video_id, frame_number, timestamp_seconds, pose_detected, fps) VALUES {} \
                 RETURNING id, frame_number",
                values_clause(chunk.len(), SEQUENCE_PARAMS)
            );

            let mut query = sqlx::query_as::<_, (i64, i64)>(&sql);
            for frame in chunk {
                query = query
                    .bind(video_id)
                    .bind(frame.frame_number as i64)
                    .bind(frame.timestamp)
                    .bind(frame.pose_detected)
                    .bind(fps);
            }

            // Sequence ids must exist before their keypoints can reference them
            let ids: HashMap<i64, i64> = query
                .fetch_all(&mut *conn)
                .await?
                .into_iter()
                .map(|(id, frame_number)| (frame_number, id))
                .collect();
            stats.sequences += chunk.len() as u64;
            stats.statements += 1;

            let mut rows: Vec<(i64, &Keypoint)> = Vec::new();
            for frame in chunk.iter().filter(|f| f.pose_detected) {
                let sequence_id = *ids
                    .get(&(frame.frame_number as i64))
                    .ok_or(IngestError::MissingSequenceId(frame.frame_number))?;
                rows.extend(frame.keypoints.iter().map(|k| (sequence_id, k)));
            }

            stats.keypoints += rows.len() as u64;
            stats.statements += self.insert_keypoints(conn, &rows).await?;
        }

        Ok(stats)
    }
}

/// Sequence rows carrying their keypoints as a JSON array
#[derive(Debug, Clone)]
pub struct DenormalizedWriter {
    sequence_rows: usize,
}

impl DenormalizedWriter {
    pub fn new(batch_size: usize) -> Self {
        Self {
            sequence_rows: rows_per_statement(batch_size, BLOB_SEQUENCE_PARAMS),
        }
    }
}

#[async_trait]
impl SequenceWriter for DenormalizedWriter {
    fn strategy(&self) -> Strategy {
        Strategy::Denormalized
    }

    async fn write_batch(
        &self,
        conn: &mut AnyConnection,
        video_id: VideoId,
        fps: f64,
        frames: &[FrameRecord],
    ) -> Result<BatchStats, IngestError> {
        let mut stats = BatchStats::default();

        for chunk in frames.chunks(self.sequence_rows) {
            let blobs = chunk
                .iter()
                .map(|frame| serde_json::to_string(&frame.keypoints))
                .collect::<Result<Vec<_>, _>>()?;

            let sql = format!(
                "INSERT INTO pose_sequences \
                 (video_id, frame_number, timestamp_seconds, pose_detected, fps, keypoints_blob) \
                 VALUES {}",
                values_clause(chunk.len(), BLOB_SEQUENCE_PARAMS)
            );

            let mut query = sqlx::query(&sql);
            for (frame, blob) in chunk.iter().zip(blobs) {
                query = query
                    .bind(video_id)
                    .bind(frame.frame_number as i64)
                    .bind(frame.timestamp)
                    .bind(frame.pose_detected)
                    .bind(fps)
                    .bind(blob);
            }
            query.execute(&mut *conn).await?;

            stats.sequences += chunk.len() as u64;
            stats.keypoints += chunk.iter().map(|f| f.keypoints.len() as u64).sum::<u64>();
            stats.statements += 1;
        }

        Ok(stats)
    }
}

/// Writer for a configured strategy
pub fn writer_for(strategy: Strategy, batch_size: usize) -> Box<dyn SequenceWriter> {
    match strategy {
        Strategy::Normalized => Box::new(NormalizedWriter::new(batch_size)),
        Strategy::Denormalized => Box::new(DenormalizedWriter::new(batch_size)),
    }
}

/// Target of one ingestion run
#[derive(Debug, Clone, PartialEq)]
pub struct IngestRequest {
    pub video_id: VideoId,
    /// Source frame rate, stored on every sequence row
    pub fps: f64,
    /// Stored on the video row when present
    pub media_url: Option<String>,
}

/// Summary of a committed run
#[derive(Debug, Clone, PartialEq)]
pub struct IngestReport {
    pub video_id: VideoId,
    pub strategy: Strategy,
    pub frames: u64,
    pub detected_frames: u64,
    pub keypoints: u64,
    pub replaced_sequences: u64,
    pub replaced_keypoints: u64,
    pub batches: u64,
    pub statements: u64,
    pub duration_seconds: f64,
    pub elapsed: Duration,
}

/// Result of an ingestion run
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// New data committed
    Written(IngestReport),
    /// `on_existing = skip` and the video already had data
    Skipped {
        video_id: VideoId,
        existing_sequences: u64,
    },
}

/// Transactional, replace-semantics bulk loader
pub struct IngestionEngine {
    pool: AnyPool,
    config: IngestionConfig,
    writer: Box<dyn SequenceWriter>,
}

impl IngestionEngine {
    /// Engine using the writer for `config.strategy`
    pub fn new(database: &Database, config: IngestionConfig) -> Result<Self, IngestError> {
        let writer = writer_for(config.strategy, config.batch_size);
        Self::with_writer(database, config, writer)
    }

    /// Engine with a caller-supplied writer
    pub fn with_writer(
        database: &Database,
        config: IngestionConfig,
        writer: Box<dyn SequenceWriter>,
    ) -> Result<Self, IngestError> {
        config.validate()?;
        Ok(Self {
            pool: database.pool().clone(),
            config,
            writer,
        })
    }

    pub fn strategy(&self) -> Strategy {
        self.writer.strategy()
    }

    /// Ingest a complete Pose Document.
    ///
    /// Frame numbers are the document's array indices.
    pub async fn ingest_document(
        &self,
        video_id: VideoId,
        document: &PoseDocument,
        media_url: Option<&str>,
    ) -> Result<IngestOutcome, IngestError> {
        if document.video_info.total_frames != document.frames.len() as u64 {
            warn!(
                video_id,
                declared = document.video_info.total_frames,
                actual = document.frames.len(),
                "Document frame count differs from header, using actual frames"
            );
        }

        let request = IngestRequest {
            video_id,
            fps: document.video_info.fps,
            media_url: media_url.map(str::to_string),
        };
        let frames = futures::stream::iter(document.frames.iter().cloned().map(Ok::<_, Infallible>));

        self.ingest_stream(request, frames).await
    }

    /// Ingest frames as they arrive.
    ///
    /// An `Err` item aborts the run and rolls back; the previous data stays.
    /// Dropping the returned future before it completes also rolls back.
    #[instrument(skip_all, fields(video_id = request.video_id, strategy = ?self.strategy()))]
    pub async fn ingest_stream<S, E>(
        &self,
        request: IngestRequest,
        frames: S,
    ) -> Result<IngestOutcome, IngestError>
    where
        S: Stream<Item = Result<FrameRecord, E>> + Send,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        if !request.fps.is_finite() || request.fps <= 0.0 {
            return Err(IngestError::InvalidFrameRate(request.fps));
        }

        let started = Instant::now();
        let mut tx = self.pool.begin().await?;

        match self.run(&mut *tx, &request, frames).await {
            Ok(mut outcome) => {
                tx.commit().await?;

                match &mut outcome {
                    IngestOutcome::Written(report) => {
                        report.elapsed = started.elapsed();
                        metrics::counter!("kata.ingest.runs").increment(1);
                        info!(
                            frames = report.frames,
                            detected = report.detected_frames,
                            keypoints = report.keypoints,
                            replaced = report.replaced_sequences,
                            batches = report.batches,
                            elapsed_ms = report.elapsed.as_millis() as u64,
                            "Ingestion committed"
                        );
                    }
                    IngestOutcome::Skipped {
                        existing_sequences, ..
                    } => {
                        info!(existing = *existing_sequences, "Video already has pose data, skipped");
                    }
                }

                Ok(outcome)
            }
            Err(e) => {
                metrics::counter!("kata.ingest.rollbacks").increment(1);
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "Rollback failed, connection will be discarded");
                }
                warn!(error = %e, "Ingestion rolled back");
                Err(e)
            }
        }
    }

    async fn run<S, E>(
        &self,
        conn: &mut AnyConnection,
        request: &IngestRequest,
        frames: S,
    ) -> Result<IngestOutcome, IngestError>
    where
        S: Stream<Item = Result<FrameRecord, E>> + Send,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let video_id = request.video_id;

        let exists: Option<(i64,)> = sqlx::query_as("SELECT id FROM videos WHERE id = $1")
            .bind(video_id)
            .fetch_optional(&mut *conn)
            .await?;
        if exists.is_none() {
            return Err(IngestError::UnknownVideo(video_id));
        }

        let (existing,): (i64,) = sqlx::query_as(
            "SELECT CAST(COUNT(*) AS BIGINT) FROM pose_sequences WHERE video_id = $1",
        )
        .bind(video_id)
        .fetch_one(&mut *conn)
        .await?;

        if existing > 0 && self.config.on_existing == ExistingDataPolicy::Skip {
            return Ok(IngestOutcome::Skipped {
                video_id,
                existing_sequences: existing as u64,
            });
        }

        // Children first, then parents, every run
        let replaced_keypoints = sqlx::query(
            "DELETE FROM pose_keypoints WHERE sequence_id IN \
             (SELECT id FROM pose_sequences WHERE video_id = $1)",
        )
        .bind(video_id)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        let replaced_sequences = sqlx::query("DELETE FROM pose_sequences WHERE video_id = $1")
            .bind(video_id)
            .execute(&mut *conn)
            .await?
            .rows_affected();

        if replaced_sequences > 0 {
            debug!(
                sequences = replaced_sequences,
                keypoints = replaced_keypoints,
                "Cleared existing pose data"
            );
        }

        let mut report = IngestReport {
            video_id,
            strategy: self.writer.strategy(),
            frames: 0,
            detected_frames: 0,
            keypoints: 0,
            replaced_sequences,
            replaced_keypoints,
            batches: 0,
            statements: 0,
            duration_seconds: 0.0,
            elapsed: Duration::ZERO,
        };

        let batch_size = self.config.batch_size;
        let mut buffer: Vec<FrameRecord> = Vec::with_capacity(batch_size);
        // Keypoint count of the first detected frame; every later one must match
        let mut cardinality: Option<usize> = None;

        futures::pin_mut!(frames);
        while let Some(item) = frames.next().await {
            let mut frame = item.map_err(|e| IngestError::Source(e.into()))?;

            let index = report.frames;
            if frame.frame_number != index {
                debug!(
                    declared = frame.frame_number,
                    index, "Frame number replaced by position"
                );
                frame.frame_number = index;
                frame.timestamp = index as f64 / request.fps;
            }

            check_frame(&frame, &mut cardinality).map_err(|source| {
                IngestError::InconsistentFrame {
                    frame_number: index,
                    source,
                }
            })?;

            if frame.pose_detected {
                report.detected_frames += 1;
            }
            report.frames += 1;
            buffer.push(frame);

            if buffer.len() >= batch_size {
                self.flush(conn, request, &mut buffer, &mut report).await?;
            }
        }

        if !buffer.is_empty() {
            self.flush(conn, request, &mut buffer, &mut report).await?;
        }

        report.duration_seconds = report.frames as f64 / request.fps;

        match &request.media_url {
            Some(media_url) => {
                sqlx::query(
                    "UPDATE videos SET duration_seconds = $1, media_url = $2, \
                     updated_at = CURRENT_TIMESTAMP WHERE id = $3",
                )
                .bind(report.duration_seconds)
                .bind(media_url.as_str())
                .bind(video_id)
                .execute(&mut *conn)
                .await?;
            }
            None => {
                sqlx::query(
                    "UPDATE videos SET duration_seconds = $1, \
                     updated_at = CURRENT_TIMESTAMP WHERE id = $2",
                )
                .bind(report.duration_seconds)
                .bind(video_id)
                .execute(&mut *conn)
                .await?;
            }
        }

        Ok(IngestOutcome::Written(report))
    }

    async fn flush(
        &self,
        conn: &mut AnyConnection,
        request: &IngestRequest,
        buffer: &mut Vec<FrameRecord>,
        report: &mut IngestReport,
    ) -> Result<(), IngestError> {
        let stats = self
            .writer
            .write_batch(conn, request.video_id, request.fps, buffer.as_slice())
            .await?;

        report.keypoints += stats.keypoints;
        report.statements += stats.statements;
        report.batches += 1;

        metrics::counter!("kata.ingest.frames").increment(stats.sequences);
        metrics::counter!("kata.ingest.keypoints").increment(stats.keypoints);

        debug!(
            batch = report.batches,
            sequences = stats.sequences,
            keypoints = stats.keypoints,
            "Batch written"
        );

        buffer.clear();
        Ok(())
    }
}
