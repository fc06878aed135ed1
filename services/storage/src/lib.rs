//! Kata Storage
//!
//! Video catalog and pose ingestion for the martial-arts pose pipeline. Pose
//! Documents produced by extraction are attached to a catalog video by fuzzy
//! name match and written into PostgreSQL (or SQLite) inside a single
//! transaction per run, replacing whatever that video held before.
//!
//! ## Features
//!
//! - **Fuzzy find-or-create**: a renamed source file still lands on the same
//!   logical video
//! - **Two storage strategies**: one row per keypoint, or one JSON blob per
//!   frame for write throughput
//! - **Replace semantics**: delete-then-insert in one transaction, so readers
//!   see either the old frame set or the new one
//! - **Streaming input**: frames can be ingested as they are extracted
//!
//! ## Architecture
//!
//! ```text
//! Pose Document / frame stream
//!        │
//!        ▼
//! ┌──────────────┐   video id   ┌──────────────┐        PostgreSQL / SQLite
//! │ Video        │─────────────▶│ Ingestion    │       ┌──────────────────┐
//! │ Catalog      │              │ Engine       │──────▶│ videos           │
//! └──────────────┘              └──────────────┘       │ pose_sequences   │
//!                                      │               │ pose_keypoints   │
//!                               SequenceWriter         └──────────────────┘
//!                           normalized | denormalized           │
//!                                                               ▼
//!                                                       ┌──────────────┐
//!                                                       │ Pose Reader  │
//!                                                       └──────────────┘
//! ```

pub mod catalog;
pub mod config;
pub mod database;
pub mod ingestion;
pub mod logging;
pub mod reader;

pub use catalog::{match_video, CatalogError, NameMatch, Resolution, Video, VideoCatalog, VideoId};
pub use config::{ExistingDataPolicy, StorageConfig, Strategy};
pub use database::{Backend, Database, DatabaseError};
pub use ingestion::{
    DenormalizedWriter, IngestError, IngestOutcome, IngestReport, IngestRequest, IngestionEngine,
    NormalizedWriter, SequenceWriter,
};
pub use reader::{PoseReader, ReadError};
