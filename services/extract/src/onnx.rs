//! ONNX Runtime pose estimator for BlazePose-style landmark models.
//!
//! The model takes one `[1, S, S, 3]` RGB tensor scaled to `0..1` and
//! returns a flat landmark tensor with five values per landmark
//! (`x, y, z, visibility, presence`, coordinates in input pixels) plus an
//! optional pose-presence score.

use crate::config::ModelConfig;
use crate::frame_source::Frame;
use crate::landmarks::{EstimatorError, PoseEstimator, RawLandmark};
use image::imageops::{self, FilterType};
use image::RgbImage;
use kata_pose::BODY_LANDMARK_COUNT;
use ndarray::Array4;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::TensorRef;
use tracing::info;

const VALUES_PER_LANDMARK: usize = 5;

pub struct OnnxPoseEstimator {
    session: Session,
    input_name: String,
    landmark_output: String,
    presence_output: Option<String>,
    input_size: u32,
    presence_threshold: f32,
}

impl OnnxPoseEstimator {
    pub fn load(config: &ModelConfig) -> Result<Self, EstimatorError> {
        let path = config
            .path
            .as_ref()
            .ok_or_else(|| EstimatorError::ModelLoad("no model path configured".to_string()))?;

        if !path.is_file() {
            return Err(EstimatorError::ModelLoad(format!(
                "Model file not found: {}",
                path.display()
            )));
        }

        let session = Session::builder()
            .map_err(|e| EstimatorError::ModelLoad(format!("Failed to create session builder: {e}")))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| EstimatorError::ModelLoad(format!("Failed to set optimization level: {e}")))?
            .with_intra_threads(config.num_threads)
            .map_err(|e| EstimatorError::ModelLoad(format!("Failed to set intra-thread count: {e}")))?
            .commit_from_file(path)
            .map_err(|e| EstimatorError::ModelLoad(format!("Failed to load model: {e}")))?;

        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .ok_or_else(|| EstimatorError::ModelLoad("model has no inputs".to_string()))?;

        let output_names: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();

        let landmark_output = match &config.landmark_output {
            Some(name) => name.clone(),
            None => output_names
                .first()
                .cloned()
                .ok_or_else(|| EstimatorError::ModelLoad("model has no outputs".to_string()))?,
        };
        let presence_output = config
            .presence_output
            .clone()
            .or_else(|| output_names.get(1).cloned());

        for name in std::iter::once(&landmark_output).chain(presence_output.as_ref()) {
            if !output_names.contains(name) {
                return Err(EstimatorError::ModelLoad(format!(
                    "Model has no output named '{name}'"
                )));
            }
        }

        info!(
            model = %path.display(),
            input = %input_name,
            landmarks = %landmark_output,
            presence = ?presence_output,
            input_size = config.input_size,
            "Pose model loaded"
        );

        Ok(Self {
            session,
            input_name,
            landmark_output,
            presence_output,
            input_size: config.input_size,
            presence_threshold: config.presence_threshold,
        })
    }

    fn preprocess(&self, frame: &Frame) -> Result<Array4<f32>, EstimatorError> {
        let image = RgbImage::from_raw(frame.width, frame.height, frame.data.to_vec())
            .ok_or_else(|| EstimatorError::InvalidInput("frame buffer size mismatch".to_string()))?;

        let size = self.input_size;
        let resized = imageops::resize(&image, size, size, FilterType::Triangle);

        let mut tensor = Array4::<f32>::zeros((1, size as usize, size as usize, 3));
        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, y as usize, x as usize, c]] = f32::from(pixel[c]) / 255.0;
            }
        }
        Ok(tensor)
    }
}

fn sigmoid(value: f32) -> f64 {
    1.0 / (1.0 + (-f64::from(value)).exp())
}

/// Decode the flat landmark tensor into normalized landmarks.
fn decode_landmarks(values: &[f32], input_size: u32) -> Result<Vec<RawLandmark>, EstimatorError> {
    let available = values.len() / VALUES_PER_LANDMARK;
    if available < BODY_LANDMARK_COUNT {
        return Err(EstimatorError::Cardinality {
            expected: BODY_LANDMARK_COUNT,
            actual: available,
        });
    }

    let scale = f64::from(input_size);
    Ok(values
        .chunks_exact(VALUES_PER_LANDMARK)
        .take(BODY_LANDMARK_COUNT)
        .map(|lm| RawLandmark {
            x: f64::from(lm[0]) / scale,
            y: f64::from(lm[1]) / scale,
            z: f64::from(lm[2]) / scale,
            visibility: sigmoid(lm[3]),
        })
        .collect())
}

impl PoseEstimator for OnnxPoseEstimator {
    fn landmark_count(&self) -> usize {
        BODY_LANDMARK_COUNT
    }

    fn estimate(&mut self, frame: &Frame) -> Result<Vec<RawLandmark>, EstimatorError> {
        let input = self.preprocess(frame)?;
        let input = input.as_standard_layout();
        let tensor = TensorRef::from_array_view(&input)
            .map_err(|e| EstimatorError::Inference(format!("Failed to create input tensor: {e}")))?;

        let outputs = self
            .session
            .run(ort::inputs![&self.input_name => tensor])
            .map_err(|e| EstimatorError::Inference(format!("Inference failed: {e}")))?;

        if let Some(name) = &self.presence_output {
            let (_, score) = outputs
                .get(name.as_str())
                .ok_or_else(|| EstimatorError::Inference(format!("Output '{name}' not found")))?
                .try_extract_tensor::<f32>()
                .map_err(|e| EstimatorError::Inference(format!("Failed to extract presence: {e}")))?;

            let present = score.first().copied().unwrap_or(0.0);
            if present < self.presence_threshold {
                return Ok(Vec::new());
            }
        }

        let name = &self.landmark_output;
        let (_, values) = outputs
            .get(name.as_str())
            .ok_or_else(|| EstimatorError::Inference(format!("Output '{name}' not found")))?
            .try_extract_tensor::<f32>()
            .map_err(|e| EstimatorError::Inference(format!("Failed to extract landmarks: {e}")))?;

        decode_landmarks(values, self.input_size)
    }
}
