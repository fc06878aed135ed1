//! Read accessors over persisted pose data.
//!
//! Keypoints come from `pose_keypoints` rows or from `keypoints_blob`,
//! whichever a sequence carries, so both strategies read back identically.

use crate::catalog::{non_empty, VideoId};
use crate::database::Database;
use kata_pose::{FrameRecord, Keypoint, PoseDocument, PoseDocumentBuilder};
use sqlx::AnyPool;
use std::collections::HashMap;
use std::ops::Range;
use thiserror::Error;
use tracing::{debug, instrument};

// NULL text does not decode through the Any driver; the blob carries a flag
const SEQUENCE_COLUMNS: &str = "id, frame_number, timestamp_seconds, \
     CAST(CASE WHEN pose_detected THEN 1 ELSE 0 END AS BIGINT) AS pose_detected, \
     fps, \
     CAST(CASE WHEN keypoints_blob IS NULL THEN 0 ELSE 1 END AS BIGINT) AS has_blob, \
     COALESCE(keypoints_blob, '') AS keypoints_blob";

/// (id, frame_number, timestamp_seconds, pose_detected, fps, has_blob, keypoints_blob)
type SequenceRow = (i64, i64, f64, i64, f64, i64, String);

/// (sequence_id, keypoint_id, keypoint_name, x, y, z, visibility)
type KeypointRow = (i64, i64, String, f64, f64, f64, f64);

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("Video {0} does not exist")]
    UnknownVideo(VideoId),

    #[error("Video {0} has no pose data")]
    NoPoseData(VideoId),

    #[error("Keypoint blob of frame {frame_number} is malformed: {source}")]
    Blob {
        frame_number: u64,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Reads frames back out of the store
#[derive(Debug, Clone)]
pub struct PoseReader {
    pool: AnyPool,
}

impl PoseReader {
    pub fn new(database: &Database) -> Self {
        Self {
            pool: database.pool().clone(),
        }
    }

    /// Persisted frames in frame order, optionally limited to a frame range
    #[instrument(skip(self))]
    pub async fn frames(
        &self,
        video_id: VideoId,
        range: Option<Range<u64>>,
    ) -> Result<Vec<FrameRecord>, ReadError> {
        let mut filter = String::from("video_id = $1");
        if range.is_some() {
            filter.push_str(" AND frame_number >= $2 AND frame_number < $3");
        }

        let sequence_sql = format!(
            "SELECT {SEQUENCE_COLUMNS} FROM pose_sequences WHERE {filter} ORDER BY frame_number"
        );
        let keypoint_sql = format!(
            "SELECT k.sequence_id, k.keypoint_id, k.keypoint_name, k.x, k.y, k.z, k.visibility \
             FROM pose_keypoints k \
             JOIN pose_sequences s ON s.id = k.sequence_id \
             WHERE s.{} \
             ORDER BY k.sequence_id, k.keypoint_id",
            filter.replace(" AND ", " AND s.")
        );

        let mut sequences = sqlx::query_as::<_, SequenceRow>(&sequence_sql).bind(video_id);
        let mut keypoints = sqlx::query_as::<_, KeypointRow>(&keypoint_sql).bind(video_id);
        if let Some(range) = &range {
            sequences = sequences.bind(range.start as i64).bind(range.end as i64);
            keypoints = keypoints.bind(range.start as i64).bind(range.end as i64);
        }

        let sequences = sequences.fetch_all(&self.pool).await?;
        let keypoints = keypoints.fetch_all(&self.pool).await?;

        let mut children: HashMap<i64, Vec<Keypoint>> = HashMap::new();
        for row in keypoints {
            let (sequence_id, keypoint) = keypoint_from_row(row);
            children.entry(sequence_id).or_default().push(keypoint);
        }

        let frames = sequences
            .into_iter()
            .map(|row| {
                let kps = children.remove(&row.0).unwrap_or_default();
                frame_from_row(row, kps)
            })
            .collect::<Result<Vec<_>, _>>()?;

        debug!(frames = frames.len(), "Frames loaded");
        Ok(frames)
    }

    /// Detected frame closest to `timestamp`, within `tolerance` seconds
    #[instrument(skip(self))]
    pub async fn pose_at(
        &self,
        video_id: VideoId,
        timestamp: f64,
        tolerance: f64,
    ) -> Result<Option<FrameRecord>, ReadError> {
        let tolerance = tolerance.max(0.0);

        let row = sqlx::query_as::<_, SequenceRow>(&format!(
            "SELECT {SEQUENCE_COLUMNS} FROM pose_sequences \
             WHERE video_id = $1 AND pose_detected \
               AND timestamp_seconds >= $2 AND timestamp_seconds <= $3 \
             ORDER BY ABS(timestamp_seconds - $4), frame_number \
             LIMIT 1"
        ))
        .bind(video_id)
        .bind(timestamp - tolerance)
        .bind(timestamp + tolerance)
        .bind(timestamp)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let keypoints = sqlx::query_as::<_, KeypointRow>(
            "SELECT sequence_id, keypoint_id, keypoint_name, x, y, z, visibility \
             FROM pose_keypoints WHERE sequence_id = $1 ORDER BY keypoint_id",
        )
        .bind(row.0)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| keypoint_from_row(row).1)
        .collect();

        frame_from_row(row, keypoints).map(Some)
    }

    /// Rebuild a Pose Document from the store
    #[instrument(skip(self))]
    pub async fn export_document(&self, video_id: VideoId) -> Result<PoseDocument, ReadError> {
        let video: Option<(String, String)> =
            sqlx::query_as("SELECT name, COALESCE(media_url, '') FROM videos WHERE id = $1")
                .bind(video_id)
                .fetch_optional(&self.pool)
                .await?;
        let (name, media_url) = video.ok_or(ReadError::UnknownVideo(video_id))?;
        let media_url = non_empty(media_url);

        let (fps,): (f64,) = sqlx::query_as(
            "SELECT fps FROM pose_sequences WHERE video_id = $1 ORDER BY frame_number LIMIT 1",
        )
        .bind(video_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(ReadError::NoPoseData(video_id))?;

        let filename = media_url
            .as_deref()
            .and_then(|url| url.rsplit('/').next())
            .filter(|segment| !segment.is_empty())
            .map(str::to_string)
            .unwrap_or(name);

        let frames = self.frames(video_id, None).await?;
        let mut builder = PoseDocumentBuilder::with_capacity(filename, fps, frames.len());
        builder.extend(frames);

        Ok(builder.finish())
    }
}

fn keypoint_from_row(row: KeypointRow) -> (i64, Keypoint) {
    let (sequence_id, id, name, x, y, z, visibility) = row;
    (
        sequence_id,
        Keypoint {
            id: id as u32,
            name,
            x,
            y,
            z,
            visibility,
        },
    )
}

fn frame_from_row(row: SequenceRow, children: Vec<Keypoint>) -> Result<FrameRecord, ReadError> {
    let (_, frame_number, timestamp, pose_detected, _, has_blob, blob) = row;
    let frame_number = frame_number as u64;

    let keypoints = if has_blob != 0 && children.is_empty() {
        serde_json::from_str(&blob)
            .map_err(|source| ReadError::Blob {
                frame_number,
                source,
            })?
    } else {
        children
    };

    Ok(FrameRecord {
        frame_number,
        timestamp,
        pose_detected: pose_detected != 0,
        keypoints,
    })
}
