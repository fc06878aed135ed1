//! Frame Walker: drives the Landmark Adapter over a frame source in order.
//!
//! The walker is a lazy iterator of [`FrameRecord`]s. The frame index is its
//! own counter starting at 0, and `timestamp = index / fps` with fps read once
//! from the stream metadata. The walk ends when the source does; the
//! advertised frame count is only a capacity hint.

use crate::config::DecodeFailurePolicy;
use crate::frame_source::{FrameError, FrameSource};
use crate::landmarks::{EstimatorError, LandmarkAdapter, PoseEstimator};
use kata_pose::{FrameRecord, PoseDocument, PoseDocumentBuilder};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

/// Upper bound on pre-allocation from an advertised frame count
const MAX_PREALLOCATED_FRAMES: u64 = 1 << 16;

const PROGRESS_EVERY: u64 = 100;

#[derive(Debug, Error)]
pub enum WalkError {
    #[error("Invalid frame rate {0} in stream metadata")]
    InvalidFrameRate(f64),

    #[error("Frame {frame_number} could not be decoded: {source}")]
    Decode {
        frame_number: u64,
        #[source]
        source: FrameError,
    },

    #[error("Pose estimation failed on frame {frame_number}: {source}")]
    Estimator {
        frame_number: u64,
        #[source]
        source: EstimatorError,
    },
}

/// Counters for one walk
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalkStats {
    pub frames: u64,
    pub detected: u64,
    pub decode_failures: u64,
    pub estimator_failures: u64,
}

impl WalkStats {
    pub fn undetected(&self) -> u64 {
        self.frames - self.detected
    }
}

pub struct FrameWalker<S, E> {
    source: S,
    adapter: LandmarkAdapter<E>,
    policy: DecodeFailurePolicy,
    fps: f64,
    advertised_frames: Option<u64>,
    index: u64,
    stats: WalkStats,
    finished: bool,
}

impl<S: FrameSource, E: PoseEstimator> FrameWalker<S, E> {
    /// Create a walker. Fails before any frame if the fps is unusable.
    pub fn new(source: S, estimator: E, policy: DecodeFailurePolicy) -> Result<Self, WalkError> {
        let info = source.info();
        let fps = info.fps;
        if !fps.is_finite() || fps <= 0.0 {
            return Err(WalkError::InvalidFrameRate(fps));
        }

        debug!(
            fps,
            advertised_frames = ?info.advertised_frames,
            width = info.width,
            height = info.height,
            "Frame walker ready"
        );

        Ok(Self {
            advertised_frames: info.advertised_frames,
            source,
            adapter: LandmarkAdapter::new(estimator),
            policy,
            fps,
            index: 0,
            stats: WalkStats::default(),
            finished: false,
        })
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    pub fn advertised_frames(&self) -> Option<u64> {
        self.advertised_frames
    }

    pub fn stats(&self) -> &WalkStats {
        &self.stats
    }

    /// Walk to the end and build the Pose Document.
    pub fn collect_document(
        mut self,
        filename: impl Into<String>,
    ) -> Result<(PoseDocument, WalkStats), WalkError> {
        let capacity = self
            .advertised_frames
            .unwrap_or(0)
            .min(MAX_PREALLOCATED_FRAMES) as usize;
        let mut builder = PoseDocumentBuilder::with_capacity(filename, self.fps, capacity);

        for record in &mut self {
            builder.push(record?);
        }

        Ok((builder.finish(), self.stats))
    }
}

impl<S: FrameSource, E: PoseEstimator> Iterator for FrameWalker<S, E> {
    type Item = Result<FrameRecord, WalkError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        let Some(decoded) = self.source.next_frame() else {
            self.finished = true;
            info!(
                frames = self.stats.frames,
                detected = self.stats.detected,
                "Reached end of video"
            );
            return None;
        };

        let frame_number = self.index;
        let timestamp = frame_number as f64 / self.fps;

        let record = match decoded {
            Ok(frame) => match self.adapter.detect(&frame) {
                Ok(keypoints) => FrameRecord::new(frame_number, timestamp, keypoints),
                Err(source) => {
                    self.stats.estimator_failures += 1;
                    match self.policy {
                        DecodeFailurePolicy::MarkUndetected => {
                            warn!(frame_number, error = %source, "Pose estimation failed, marking frame undetected");
                            FrameRecord::undetected(frame_number, timestamp)
                        }
                        DecodeFailurePolicy::Abort => {
                            self.finished = true;
                            return Some(Err(WalkError::Estimator {
                                frame_number,
                                source,
                            }));
                        }
                    }
                }
            },
            Err(source) => {
                self.stats.decode_failures += 1;
                match self.policy {
                    DecodeFailurePolicy::MarkUndetected => {
                        warn!(frame_number, error = %source, "Frame decode failed, marking frame undetected");
                        FrameRecord::undetected(frame_number, timestamp)
                    }
                    DecodeFailurePolicy::Abort => {
                        self.finished = true;
                        return Some(Err(WalkError::Decode {
                            frame_number,
                            source,
                        }));
                    }
                }
            }
        };

        self.index += 1;
        self.stats.frames += 1;
        if record.pose_detected {
            self.stats.detected += 1;
        }
        metrics::counter!("kata.extract.frames").increment(1);

        if self.index % PROGRESS_EVERY == 0 {
            match self.advertised_frames {
                Some(total) => info!(frame = self.index, total, "Extraction progress"),
                None => info!(frame = self.index, "Extraction progress"),
            }
        }

        Some(Ok(record))
    }
}

/// Run a walker on the blocking pool and stream its records.
///
/// The channel is bounded, so decoding waits for the consumer. Dropping the
/// stream stops the walk after the frame in flight. The handle resolves to the
/// walk counters.
pub fn spawn_walker<S, E>(
    walker: FrameWalker<S, E>,
    capacity: usize,
) -> (
    ReceiverStream<Result<FrameRecord, WalkError>>,
    JoinHandle<WalkStats>,
)
where
    S: FrameSource + 'static,
    E: PoseEstimator + 'static,
{
    let (tx, rx) = mpsc::channel(capacity.max(1));

    let handle = tokio::task::spawn_blocking(move || {
        let mut walker = walker;
        for item in walker.by_ref() {
            let failed = item.is_err();
            if tx.blocking_send(item).is_err() {
                debug!("Frame consumer gone, stopping walk");
                break;
            }
            if failed {
                break;
            }
        }
        walker.stats
    });

    (ReceiverStream::new(rx), handle)
}
