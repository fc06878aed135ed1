//! Kata Extract
//!
//! Turns a martial-arts video into a Pose Document: every frame is decoded in
//! order, run through a pose model, and recorded with its 33 named body
//! landmarks, or marked as having no pose. The document can be written to a
//! JSON file or streamed straight into the pose store.
//!
//! ## Architecture
//!
//! ```text
//! video file ──▶ FrameSource ──▶ FrameWalker ──▶ FrameRecord stream
//!               (gstreamer)          │                │
//!                             LandmarkAdapter         ├──▶ PoseDocument (JSON)
//!                                    │                └──▶ IngestionEngine
//!                              PoseEstimator
//!                                 (onnx)
//! ```
//!
//! Decoding and inference sit behind the `gstreamer` and `onnx` features.
//! Without them the traits stay usable with any other source or model.

pub mod config;
pub mod frame_source;
#[cfg(feature = "gstreamer")]
pub mod gst_source;
pub mod landmarks;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod walker;

pub use config::{DecodeFailurePolicy, ExtractConfig, ExtractionConfig, ModelConfig};
pub use frame_source::{open_video, Frame, FrameError, FrameSource, SourceError, StreamInfo};
pub use landmarks::{load_estimator, EstimatorError, LandmarkAdapter, PoseEstimator, RawLandmark};
pub use walker::{spawn_walker, FrameWalker, WalkError, WalkStats};
