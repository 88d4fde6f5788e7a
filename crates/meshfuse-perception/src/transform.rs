//! Keyframe → map frame transformation.
//!
//! Every keyframe cloud is expressed in the keyframe's own frame. Its pose
//! from the pose-graph log is a rigid transform (rotation then translation)
//! taking those local coordinates into the shared map frame.
//!
//! # Example
//!
//! ```rust
//! use meshfuse_perception::transform::FrameTransformer;
//! use meshfuse_types::{KeyframePose, RawPoint, Rgb};
//!
//! // Keyframe 1 m along +X from the map origin, no rotation.
//! let pose = KeyframePose::from_components(0, "K0", [1.0, 0.0, 0.0], [0.0, 0.0, 0.0, 1.0]);
//! let local = [RawPoint::new(0.5, 0.0, 0.0, Rgb::new(10, 20, 30))];
//!
//! let global: Vec<_> = FrameTransformer::new(&pose).apply(&local).collect();
//! assert!((global[0].0.x - 1.5).abs() < 1e-9);
//! ```

use meshfuse_types::{KeyframePose, RawPoint, Rgb};
use nalgebra::{Isometry3, Point3};

/// Applies one keyframe's pose to its cloud.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameTransformer {
    local_to_map: Isometry3<f64>,
}

impl FrameTransformer {
    pub fn new(pose: &KeyframePose) -> Self {
        Self {
            local_to_map: pose.transform,
        }
    }

    /// Map a single local point into the map frame.
    pub fn transform_point(&self, p: &Point3<f32>) -> Point3<f64> {
        self.local_to_map * p.cast::<f64>()
    }

    /// Map a whole cloud, skipping non-finite points. Positions come back in
    /// double precision.
    pub fn apply<'a>(&'a self, cloud: &'a [RawPoint]) -> impl Iterator<Item = (Point3<f64>, Rgb)> + 'a {
        cloud
            .iter()
            .filter(|p| p.is_finite())
            .map(move |p| (self.transform_point(&p.position), p.color))
    }
}
