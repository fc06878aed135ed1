//! Landmark Adapter: wraps a pose estimator and names its output.

use crate::config::ModelConfig;
use crate::frame_source::Frame;
use kata_pose::Keypoint;
use thiserror::Error;

/// Errors raised by a pose estimator.
#[derive(Debug, Error)]
pub enum EstimatorError {
    #[error("Failed to load pose model: {0}")]
    ModelLoad(String),

    #[error("Pose estimation requires the '{0}' feature")]
    FeatureDisabled(&'static str),

    #[error("Input frame rejected: {0}")]
    InvalidInput(String),

    #[error("Pose inference failed: {0}")]
    Inference(String),

    #[error("Estimator returned {actual} landmarks, expected 0 or {expected}")]
    Cardinality { expected: usize, actual: usize },

    #[error("Estimator returned a non-finite value for landmark {index}")]
    NonFinite { index: usize },
}

/// One landmark as the estimator reports it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawLandmark {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub visibility: f64,
}

/// Black-box pose model: image in, landmarks out.
///
/// `estimate` returns either no landmarks (no pose) or exactly
/// `landmark_count()` of them, in the model's canonical order.
#[cfg_attr(test, mockall::automock)]
pub trait PoseEstimator: Send {
    fn landmark_count(&self) -> usize;

    fn estimate(&mut self, frame: &Frame) -> Result<Vec<RawLandmark>, EstimatorError>;
}

impl<T: PoseEstimator + ?Sized> PoseEstimator for Box<T> {
    fn landmark_count(&self) -> usize {
        (**self).landmark_count()
    }

    fn estimate(&mut self, frame: &Frame) -> Result<Vec<RawLandmark>, EstimatorError> {
        (**self).estimate(frame)
    }
}

/// Converts estimator output into canonical keypoints.
#[derive(Debug)]
pub struct LandmarkAdapter<E> {
    estimator: E,
}

impl<E: PoseEstimator> LandmarkAdapter<E> {
    pub fn new(estimator: E) -> Self {
        Self { estimator }
    }

    pub fn landmark_count(&self) -> usize {
        self.estimator.landmark_count()
    }

    /// Run the estimator once on a frame.
    ///
    /// An empty result means no pose was detected. Landmarks past the name
    /// table get a synthetic `landmark_<index>` name. A NaN or infinite value
    /// anywhere rejects the whole estimate.
    pub fn detect(&mut self, frame: &Frame) -> Result<Vec<Keypoint>, EstimatorError> {
        let landmarks = self.estimator.estimate(frame)?;

        let expected = self.estimator.landmark_count();
        if !landmarks.is_empty() && landmarks.len() != expected {
            return Err(EstimatorError::Cardinality {
                expected,
                actual: landmarks.len(),
            });
        }

        landmarks
            .into_iter()
            .enumerate()
            .map(|(index, lm)| {
                let keypoint = Keypoint::from_index(index, lm.x, lm.y, lm.z, lm.visibility);
                if keypoint.is_finite() {
                    Ok(keypoint)
                } else {
                    Err(EstimatorError::NonFinite { index })
                }
            })
            .collect()
    }

    pub fn into_inner(self) -> E {
        self.estimator
    }
}

/// Load the configured pose model.
pub fn load_estimator(config: &ModelConfig) -> Result<Box<dyn PoseEstimator>, EstimatorError> {
    #[cfg(feature = "onnx")]
    {
        let estimator = crate::onnx::OnnxPoseEstimator::load(config)?;
        Ok(Box::new(estimator))
    }

    #[cfg(not(feature = "onnx"))]
    {
        let _ = config;
        Err(EstimatorError::FeatureDisabled("onnx"))
    }
}
