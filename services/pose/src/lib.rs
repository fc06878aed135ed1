//! Kata Pose - keypoint schema and Pose Document format
//!
//! Shared types for the pose extraction and ingestion services:
//!
//! - The canonical 33-landmark body schema and its name table
//! - Per-frame records and the Pose Document that carries a whole video
//! - The document builder used by extraction
//! - File snapshots of Pose Documents (pretty-printed JSON)
//!
//! # Example
//!
//! ```rust
//! use kata_pose::{FrameRecord, PoseDocumentBuilder};
//!
//! let mut builder = PoseDocumentBuilder::new("taegeuk-1.mp4", 30.0);
//! builder.push(FrameRecord::undetected(0, 0.0));
//! let document = builder.finish();
//!
//! assert_eq!(document.video_info.total_frames, 1);
//! assert!(document.validate().is_ok());
//! ```

pub mod document;
pub mod keypoint;

pub use document::{
    DocumentError, FrameRecord, PoseDocument, PoseDocumentBuilder, VideoInfo,
};
pub use keypoint::{landmark_name, Keypoint, BODY_LANDMARK_COUNT, LANDMARK_NAMES};
