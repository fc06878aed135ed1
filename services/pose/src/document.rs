//! Pose Document: the per-video unit of work passed from extraction to ingestion.
//!
//! A document is a `video_info` header plus the ordered per-frame records. It
//! round-trips through pretty-printed JSON for file snapshots; `f64` fields are
//! written with shortest round-trip formatting, so coordinates survive exactly.

use crate::keypoint::Keypoint;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// Errors raised while reading, writing or validating a Pose Document.
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed pose document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid frame rate: {0}")]
    InvalidFrameRate(f64),

    #[error("Declared total_frames {declared} does not match {actual} frame records")]
    FrameCountMismatch { declared: u64, actual: u64 },

    #[error("Frame at index {index} carries frame_number {frame_number}")]
    NonContiguousFrame { index: u64, frame_number: u64 },

    #[error("Timestamp of frame {frame_number} goes backwards")]
    TimestampRegression { frame_number: u64 },

    #[error("Frame {frame_number} has pose_detected={pose_detected} but {keypoints} keypoints")]
    InconsistentDetection {
        frame_number: u64,
        pose_detected: bool,
        keypoints: usize,
    },

    #[error("Frame {frame_number} repeats keypoint name '{name}'")]
    DuplicateKeypoint { frame_number: u64, name: String },

    #[error("Keypoint '{name}' of frame {frame_number} has a non-finite value")]
    NonFiniteKeypoint { frame_number: u64, name: String },

    #[error("Frame {frame_number} has {actual} keypoints, expected {expected}")]
    KeypointCardinality {
        frame_number: u64,
        expected: usize,
        actual: usize,
    },
}

/// Header metadata for one source video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoInfo {
    /// Source file name (no directory)
    pub filename: String,
    /// Frame rate read once from the source stream
    pub fps: f64,
    /// Number of frame records in the document
    pub total_frames: u64,
    /// `total_frames / fps`
    pub duration_seconds: f64,
}

/// Pose result for a single frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    /// 0-based frame index
    pub frame_number: u64,
    /// `frame_number / fps`
    pub timestamp: f64,
    /// Whether the estimator returned any landmarks
    pub pose_detected: bool,
    /// Empty when no pose was detected
    #[serde(default)]
    pub keypoints: Vec<Keypoint>,
}

impl FrameRecord {
    /// Record for a frame with the given keypoints; an empty list means no pose.
    pub fn new(frame_number: u64, timestamp: f64, keypoints: Vec<Keypoint>) -> Self {
        Self {
            frame_number,
            timestamp,
            pose_detected: !keypoints.is_empty(),
            keypoints,
        }
    }

    /// Record for a frame where no pose was detected.
    pub fn undetected(frame_number: u64, timestamp: f64) -> Self {
        Self::new(frame_number, timestamp, Vec::new())
    }

    /// Check the per-frame invariants: `pose_detected` agrees with the
    /// keypoint list, keypoint names are unique and every value is finite.
    pub fn check_consistency(&self) -> Result<(), DocumentError> {
        if self.pose_detected == self.keypoints.is_empty() {
            return Err(DocumentError::InconsistentDetection {
                frame_number: self.frame_number,
                pose_detected: self.pose_detected,
                keypoints: self.keypoints.len(),
            });
        }

        let mut seen = HashSet::with_capacity(self.keypoints.len());
        for keypoint in &self.keypoints {
            if !seen.insert(keypoint.name.as_str()) {
                return Err(DocumentError::DuplicateKeypoint {
                    frame_number: self.frame_number,
                    name: keypoint.name.clone(),
                });
            }
            if !keypoint.is_finite() {
                return Err(DocumentError::NonFiniteKeypoint {
                    frame_number: self.frame_number,
                    name: keypoint.name.clone(),
                });
            }
        }

        Ok(())
    }
}

/// Full extracted pose data for one video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseDocument {
    pub video_info: VideoInfo,
    pub frames: Vec<FrameRecord>,
}

impl PoseDocument {
    /// Number of frames with a detected pose.
    pub fn detected_frames(&self) -> usize {
        self.frames.iter().filter(|f| f.pose_detected).count()
    }

    /// Total keypoints across all frames.
    pub fn keypoint_count(&self) -> usize {
        self.frames.iter().map(|f| f.keypoints.len()).sum()
    }

    /// Validate the document invariants.
    ///
    /// Frame numbers must run contiguously from 0 to `total_frames - 1`,
    /// timestamps must not decrease, and every detected frame must carry the
    /// same number of keypoints.
    pub fn validate(&self) -> Result<(), DocumentError> {
        let fps = self.video_info.fps;
        if !fps.is_finite() || fps <= 0.0 {
            return Err(DocumentError::InvalidFrameRate(fps));
        }

        let actual = self.frames.len() as u64;
        if self.video_info.total_frames != actual {
            return Err(DocumentError::FrameCountMismatch {
                declared: self.video_info.total_frames,
                actual,
            });
        }

        let mut expected_keypoints: Option<usize> = None;
        let mut last_timestamp = f64::NEG_INFINITY;

        for (index, frame) in self.frames.iter().enumerate() {
            let index = index as u64;
            if frame.frame_number != index {
                return Err(DocumentError::NonContiguousFrame {
                    index,
                    frame_number: frame.frame_number,
                });
            }

            if frame.timestamp < last_timestamp {
                return Err(DocumentError::TimestampRegression {
                    frame_number: frame.frame_number,
                });
            }
            last_timestamp = frame.timestamp;

            frame.check_consistency()?;

            if frame.pose_detected {
                let count = frame.keypoints.len();
                match expected_keypoints {
                    None => expected_keypoints = Some(count),
                    Some(expected) if expected != count => {
                        return Err(DocumentError::KeypointCardinality {
                            frame_number: frame.frame_number,
                            expected,
                            actual: count,
                        });
                    }
                    Some(_) => {}
                }
            }
        }

        Ok(())
    }

    /// Parse a document from JSON text.
    pub fn from_json_str(json: &str) -> Result<Self, DocumentError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize to pretty-printed JSON text.
    pub fn to_json_string(&self) -> Result<String, DocumentError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Read a snapshot file.
    pub fn read_from(path: &Path) -> Result<Self, DocumentError> {
        let reader = BufReader::new(File::open(path)?);
        let document: Self = serde_json::from_reader(reader)?;

        debug!(
            path = %path.display(),
            frames = document.frames.len(),
            "Pose document loaded"
        );

        Ok(document)
    }

    /// Write a snapshot file, replacing any existing file.
    pub fn write_to(&self, path: &Path) -> Result<(), DocumentError> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;

        debug!(
            path = %path.display(),
            frames = self.frames.len(),
            "Pose document written"
        );

        Ok(())
    }
}

/// Accumulates frame records into a [`PoseDocument`].
///
/// The header is derived from what was actually pushed: `total_frames` is the
/// record count, not whatever the source advertised.
#[derive(Debug, Clone)]
pub struct PoseDocumentBuilder {
    filename: String,
    fps: f64,
    frames: Vec<FrameRecord>,
}

impl PoseDocumentBuilder {
    pub fn new(filename: impl Into<String>, fps: f64) -> Self {
        Self {
            filename: filename.into(),
            fps,
            frames: Vec::new(),
        }
    }

    /// Pre-size the frame buffer, e.g. from the advertised frame count.
    pub fn with_capacity(filename: impl Into<String>, fps: f64, capacity: usize) -> Self {
        Self {
            filename: filename.into(),
            fps,
            frames: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, frame: FrameRecord) {
        self.frames.push(frame);
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn finish(self) -> PoseDocument {
        let total_frames = self.frames.len() as u64;
        let duration_seconds = if self.fps > 0.0 {
            total_frames as f64 / self.fps
        } else {
            0.0
        };

        PoseDocument {
            video_info: VideoInfo {
                filename: self.filename,
                fps: self.fps,
                total_frames,
                duration_seconds,
            },
            frames: self.frames,
        }
    }
}

impl Extend<FrameRecord> for PoseDocumentBuilder {
    fn extend<T: IntoIterator<Item = FrameRecord>>(&mut self, iter: T) {
        self.frames.extend(iter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keypoint::BODY_LANDMARK_COUNT;

    fn body(seed: f64) -> Vec<Keypoint> {
        (0..BODY_LANDMARK_COUNT)
            .map(|i| Keypoint::from_index(i, seed + i as f64 * 0.01, 0.5, -0.25, 0.99))
            .collect()
    }

    fn sample_document() -> PoseDocument {
        let fps = 30.0;
        let mut builder = PoseDocumentBuilder::new("heian-shodan.mp4", fps);
        for n in 0..4u64 {
            let timestamp = n as f64 / fps;
            if n == 2 {
                builder.push(FrameRecord::undetected(n, timestamp));
            } else {
                builder.push(FrameRecord::new(n, timestamp, body(0.1 * n as f64)));
            }
        }
        builder.finish()
    }

    #[test]
    fn test_builder_header() {
        let doc = sample_document();
        assert_eq!(doc.video_info.filename, "heian-shodan.mp4");
        assert_eq!(doc.video_info.total_frames, 4);
        assert!((doc.video_info.duration_seconds - 4.0 / 30.0).abs() < 1e-12);
        assert_eq!(doc.detected_frames(), 3);
        assert_eq!(doc.keypoint_count(), 3 * BODY_LANDMARK_COUNT);
        assert!(doc.validate().is_ok());
    }

    #[test]
    fn test_builder_is_deterministic() {
        assert_eq!(sample_document(), sample_document());
    }

    #[test]
    fn test_record_constructor_sets_detection() {
        assert!(!FrameRecord::new(0, 0.0, Vec::new()).pose_detected);
        assert!(FrameRecord::new(0, 0.0, body(0.0)).pose_detected);
    }

    #[test]
    fn test_json_field_names() {
        let doc = sample_document();
        let value: serde_json::Value = serde_json::from_str(&doc.to_json_string().unwrap()).unwrap();

        assert_eq!(value["video_info"]["total_frames"], 4);
        assert_eq!(value["frames"][2]["pose_detected"], false);
        assert_eq!(value["frames"][2]["keypoints"].as_array().unwrap().len(), 0);
        assert_eq!(value["frames"][0]["keypoints"][0]["name"], "nose");
        assert_eq!(value["frames"][0]["keypoints"][0]["id"], 0);
    }

    #[test]
    fn test_missing_z_defaults_to_zero() {
        let json = r#"{
            "video_info": {"filename": "a.mp4", "fps": 25.0, "total_frames": 1, "duration_seconds": 0.04},
            "frames": [{"frame_number": 0, "timestamp": 0.0, "pose_detected": true,
                        "keypoints": [{"id": 0, "name": "nose", "x": 0.5, "y": 0.4, "visibility": 0.8}]}]
        }"#;
        let doc = PoseDocument::from_json_str(json).unwrap();
        assert_eq!(doc.frames[0].keypoints[0].z, 0.0);
    }

    #[test]
    fn test_validate_rejects_gap() {
        let mut doc = sample_document();
        doc.frames[3].frame_number = 7;
        assert!(matches!(
            doc.validate(),
            Err(DocumentError::NonContiguousFrame { index: 3, frame_number: 7 })
        ));
    }

    #[test]
    fn test_validate_rejects_count_mismatch() {
        let mut doc = sample_document();
        doc.video_info.total_frames = 10;
        assert!(matches!(
            doc.validate(),
            Err(DocumentError::FrameCountMismatch { declared: 10, actual: 4 })
        ));
    }

    #[test]
    fn test_validate_rejects_keypoints_on_undetected_frame() {
        let mut doc = sample_document();
        doc.frames[2].keypoints = body(0.0);
        assert!(matches!(
            doc.validate(),
            Err(DocumentError::InconsistentDetection { frame_number: 2, .. })
        ));
    }

    #[test]
    fn test_validate_rejects_uneven_cardinality() {
        let mut doc = sample_document();
        doc.frames[3].keypoints.truncate(17);
        assert!(matches!(
            doc.validate(),
            Err(DocumentError::KeypointCardinality { expected: 33, actual: 17, .. })
        ));
    }

    #[test]
    fn test_validate_rejects_duplicate_names() {
        let mut doc = sample_document();
        doc.frames[0].keypoints[1].name = "nose".to_string();
        assert!(matches!(
            doc.validate(),
            Err(DocumentError::DuplicateKeypoint { frame_number: 0, .. })
        ));
    }

    #[test]
    fn test_validate_rejects_non_finite_keypoint() {
        let mut doc = sample_document();
        doc.frames[1].keypoints[11].x = f64::NAN;
        assert!(matches!(
            doc.validate(),
            Err(DocumentError::NonFiniteKeypoint { frame_number: 1, ref name }) if name == "left_shoulder"
        ));
    }

    #[test]
    fn test_validate_rejects_bad_fps() {
        let mut doc = sample_document();
        doc.video_info.fps = 0.0;
        assert!(matches!(doc.validate(), Err(DocumentError::InvalidFrameRate(_))));
    }

    #[test]
    fn test_validate_rejects_timestamp_regression() {
        let mut doc = sample_document();
        doc.frames[1].timestamp = 1.0;
        assert!(matches!(
            doc.validate(),
            Err(DocumentError::TimestampRegression { frame_number: 2 })
        ));
    }
}
