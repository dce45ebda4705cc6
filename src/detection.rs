//! Detection struct for input to the tracker.
//!
//! Coordinates are metric, in the vehicle-aligned world frame: `x` lateral,
//! `y` up, `z` forward along the track.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Axis-aligned 3D bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox3D {
    /// Box center.
    pub center: Vector3<f64>,
    /// Extent along `x`.
    pub width: f64,
    /// Extent along `y`.
    pub height: f64,
    /// Extent along `z`. Zero for boxes known only in the image plane.
    pub depth: f64,
}

impl BBox3D {
    pub fn new(center: Vector3<f64>, width: f64, height: f64, depth: f64) -> Self {
        Self {
            center,
            width,
            height,
            depth,
        }
    }

    /// Minimum corner.
    pub fn min(&self) -> Vector3<f64> {
        self.center - self.half_extent()
    }

    /// Maximum corner.
    pub fn max(&self) -> Vector3<f64> {
        self.center + self.half_extent()
    }

    fn half_extent(&self) -> Vector3<f64> {
        Vector3::new(self.width, self.height, self.depth) * 0.5
    }

    pub fn volume(&self) -> f64 {
        self.width * self.height * self.depth
    }

    /// Whether the box has a usable extent along `z`.
    pub fn has_depth(&self) -> bool {
        self.depth > 0.0
    }

    pub fn is_finite(&self) -> bool {
        self.center.iter().all(|v| v.is_finite())
            && self.width.is_finite()
            && self.height.is_finite()
            && self.depth.is_finite()
    }
}

/// Opaque handle to a representation owned by the fusion collaborator
/// (avatar for persons, wireframe template for known objects).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepresentationRef(pub u64);

/// Object category with an optional reference to its external representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Category {
    Person(Option<RepresentationRef>),
    KnownObject(Option<RepresentationRef>),
    UnknownObject,
}

impl Category {
    pub fn is_person(&self) -> bool {
        matches!(self, Category::Person(_))
    }

    /// Handle of the external representation, if one is attached.
    pub fn representation(&self) -> Option<RepresentationRef> {
        match self {
            Category::Person(r) | Category::KnownObject(r) => *r,
            Category::UnknownObject => None,
        }
    }

    /// Normalized criticality used as a risk factor.
    pub fn criticality(&self) -> f64 {
        match self {
            Category::Person(_) => 1.0,
            Category::KnownObject(_) => 0.7,
            Category::UnknownObject => 0.3,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Category::Person(_) => "PERSON",
            Category::KnownObject(_) => "KNOWN_OBJECT",
            Category::UnknownObject => "UNKNOWN_OBJECT",
        }
    }
}

/// Pose-derived features of a detected person.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoseSample {
    /// Body yaw in radians; 0 means facing the track.
    pub orientation: f64,

    /// Head pitch in radians; positive is looking down.
    pub head_pitch: f64,

    /// Probability a hand is raised to the head (phone call).
    pub hand_to_head: f64,

    /// Probability the person carries an object.
    pub carrying: f64,
}

impl PoseSample {
    pub fn new(orientation: f64) -> Self {
        Self {
            orientation,
            head_pitch: 0.0,
            hand_to_head: 0.0,
            carrying: 0.0,
        }
    }

    fn is_valid(&self) -> bool {
        self.orientation.is_finite()
            && self.head_pitch.is_finite()
            && (0.0..=1.0).contains(&self.hand_to_head)
            && (0.0..=1.0).contains(&self.carrying)
    }
}

/// A per-frame detection produced by the detection network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// 3D bounding geometry.
    pub bbox: BBox3D,

    pub category: Category,

    /// Detector confidence in [0, 1].
    pub confidence: f64,

    /// Optional appearance embedding for re-identification.
    pub embedding: Option<Vec<f64>>,

    /// Optional pose-derived features (persons only).
    pub pose: Option<PoseSample>,
}

impl Detection {
    /// Create a new detection.
    ///
    /// # Errors
    /// `InvalidDetection` if the geometry is not finite, an extent is negative,
    /// or the confidence is outside [0, 1].
    pub fn new(bbox: BBox3D, category: Category, confidence: f64) -> Result<Self> {
        Self::with_config(bbox, category, confidence, None, None)
    }

    /// Create a detection from a center point and extents.
    pub fn from_center(
        center: [f64; 3],
        size: [f64; 3],
        category: Category,
        confidence: f64,
    ) -> Result<Self> {
        let bbox = BBox3D::new(Vector3::from(center), size[0], size[1], size[2]);
        Self::new(bbox, category, confidence)
    }

    /// Create a detection with optional appearance and pose data.
    pub fn with_config(
        bbox: BBox3D,
        category: Category,
        confidence: f64,
        embedding: Option<Vec<f64>>,
        pose: Option<PoseSample>,
    ) -> Result<Self> {
        let detection = Self {
            bbox,
            category,
            confidence,
            embedding,
            pose,
        };
        detection.validate()?;
        Ok(detection)
    }

    /// Check geometry, confidence, embedding and pose.
    ///
    /// # Errors
    /// `InvalidDetection` describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        let bbox = &self.bbox;
        if !bbox.is_finite() {
            return Err(Error::InvalidDetection(
                "bounding box contains non-finite values".to_string(),
            ));
        }
        if bbox.width < 0.0 || bbox.height < 0.0 || bbox.depth < 0.0 {
            return Err(Error::InvalidDetection(format!(
                "negative extent {}x{}x{}",
                bbox.width, bbox.height, bbox.depth
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(Error::InvalidDetection(format!(
                "confidence {} outside [0, 1]",
                self.confidence
            )));
        }
        if let Some(ref e) = self.embedding {
            if e.is_empty() || e.iter().any(|v| !v.is_finite()) {
                return Err(Error::InvalidDetection(
                    "embedding must be non-empty and finite".to_string(),
                ));
            }
        }
        if let Some(ref p) = self.pose {
            if !p.is_valid() {
                return Err(Error::InvalidDetection("invalid pose features".to_string()));
            }
        }
        Ok(())
    }

    /// Attach an appearance embedding.
    pub fn with_embedding(self, embedding: Vec<f64>) -> Result<Self> {
        Self::with_config(self.bbox, self.category, self.confidence, Some(embedding), self.pose)
    }

    /// Attach pose features.
    pub fn with_pose(self, pose: PoseSample) -> Result<Self> {
        Self::with_config(self.bbox, self.category, self.confidence, self.embedding, Some(pose))
    }

    pub fn position(&self) -> Vector3<f64> {
        self.bbox.center
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detection_creation() {
        let det = Detection::from_center(
            [1.0, 0.9, 20.0],
            [0.6, 1.8, 0.4],
            Category::Person(None),
            0.9,
        )
        .unwrap();

        assert_eq!(det.position(), Vector3::new(1.0, 0.9, 20.0));
        assert!(det.embedding.is_none());
        assert!(det.category.is_person());
    }

    #[test]
    fn test_confidence_out_of_range_rejected() {
        let result = Detection::from_center([0.0; 3], [1.0; 3], Category::UnknownObject, 1.2);
        assert!(matches!(result, Err(Error::InvalidDetection(_))));
    }

    #[test]
    fn test_non_finite_geometry_rejected() {
        let result = Detection::from_center(
            [f64::NAN, 0.0, 1.0],
            [1.0; 3],
            Category::UnknownObject,
            0.5,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_negative_extent_rejected() {
        let result =
            Detection::from_center([0.0; 3], [1.0, -1.0, 1.0], Category::UnknownObject, 0.5);
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_embedding_rejected() {
        let det = Detection::from_center([0.0; 3], [1.0; 3], Category::UnknownObject, 0.5).unwrap();
        assert!(det.with_embedding(Vec::new()).is_err());
    }

    #[test]
    fn test_bbox_corners() {
        let bbox = BBox3D::new(Vector3::new(0.0, 1.0, 10.0), 2.0, 2.0, 4.0);
        assert_eq!(bbox.min(), Vector3::new(-1.0, 0.0, 8.0));
        assert_eq!(bbox.max(), Vector3::new(1.0, 2.0, 12.0));
        assert_eq!(bbox.volume(), 16.0);
    }

    #[test]
    fn test_category_representation() {
        let handle = RepresentationRef(7);
        assert_eq!(Category::Person(Some(handle)).representation(), Some(handle));
        assert_eq!(Category::KnownObject(None).representation(), None);
        assert_eq!(Category::UnknownObject.representation(), None);
        assert!(Category::Person(None).criticality() > Category::KnownObject(None).criticality());
    }
}
