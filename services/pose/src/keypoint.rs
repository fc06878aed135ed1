//! Canonical keypoint schema.
//!
//! Landmark indices follow the 33-point full-body layout. The index is the
//! stable `keypoint_id`; the name is looked up from [`LANDMARK_NAMES`].

use serde::{Deserialize, Serialize};

/// Number of landmarks produced by the reference body model.
pub const BODY_LANDMARK_COUNT: usize = 33;

/// Anatomical labels indexed by landmark position.
pub const LANDMARK_NAMES: [&str; BODY_LANDMARK_COUNT] = [
    "nose",
    "left_eye_inner",
    "left_eye",
    "left_eye_outer",
    "right_eye_inner",
    "right_eye",
    "right_eye_outer",
    "left_ear",
    "right_ear",
    "mouth_left",
    "mouth_right",
    "left_shoulder",
    "right_shoulder",
    "left_elbow",
    "right_elbow",
    "left_wrist",
    "right_wrist",
    "left_pinky",
    "right_pinky",
    "left_index",
    "right_index",
    "left_thumb",
    "right_thumb",
    "left_hip",
    "right_hip",
    "left_knee",
    "right_knee",
    "left_ankle",
    "right_ankle",
    "left_heel",
    "right_heel",
    "left_foot_index",
    "right_foot_index",
];

/// Canonical name for a landmark index.
///
/// Indices beyond the table get a synthetic `landmark_<index>` name.
pub fn landmark_name(index: usize) -> String {
    LANDMARK_NAMES
        .get(index)
        .map(|name| (*name).to_string())
        .unwrap_or_else(|| format!("landmark_{index}"))
}

/// One named landmark in one frame.
///
/// Field names match the Pose Document file format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    /// Landmark index (stable `keypoint_id`)
    pub id: u32,
    /// Anatomical label
    pub name: String,
    /// Normalized horizontal image coordinate (not clamped)
    pub x: f64,
    /// Normalized vertical image coordinate (not clamped)
    pub y: f64,
    /// Relative depth, estimator-defined; zero for 2-D estimators
    #[serde(default)]
    pub z: f64,
    /// Confidence-like score in 0..1
    pub visibility: f64,
}

impl Keypoint {
    /// Build a keypoint named from the canonical table.
    pub fn from_index(index: usize, x: f64, y: f64, z: f64, visibility: f64) -> Self {
        Self {
            id: index as u32,
            name: landmark_name(index),
            x,
            y,
            z,
            visibility,
        }
    }

    /// Whether every coordinate and the visibility are finite numbers
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite() && self.visibility.is_finite()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_names() {
        assert_eq!(landmark_name(0), "nose");
        assert_eq!(landmark_name(13), "left_elbow");
        assert_eq!(landmark_name(32), "right_foot_index");
    }

    #[test]
    fn test_unmapped_index_gets_synthetic_name() {
        assert_eq!(landmark_name(33), "landmark_33");
        assert_eq!(landmark_name(120), "landmark_120");
    }

    #[test]
    fn test_table_names_are_unique() {
        let mut names: Vec<&str> = LANDMARK_NAMES.to_vec();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), BODY_LANDMARK_COUNT);
    }

    #[test]
    fn test_is_finite() {
        assert!(Keypoint::from_index(0, 0.5, 0.5, 0.0, 0.9).is_finite());
        assert!(!Keypoint::from_index(0, f64::NAN, 0.5, 0.0, 0.9).is_finite());
        assert!(!Keypoint::from_index(0, 0.5, 0.5, f64::INFINITY, 0.9).is_finite());
    }

    #[test]
    fn test_from_index() {
        let kp = Keypoint::from_index(15, 0.25, 0.5, -0.1, 0.9);
        assert_eq!(kp.id, 15);
        assert_eq!(kp.name, "left_wrist");
        assert_eq!(kp.z, -0.1);
    }
}
