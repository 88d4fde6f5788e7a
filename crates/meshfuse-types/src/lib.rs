//! `meshfuse-types` – shared data model and error taxonomy.
//!
//! Every other crate in the workspace speaks in these types: keyframe poses
//! read from the pose-graph log, raw colored points loaded from keyframe
//! clouds, the weighted cells of the fusion grid, and the final mesh.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use nalgebra::{Isometry3, Point3, Quaternion, Translation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Edges shorter than this are treated as zero-length.
pub const MIN_EDGE_LENGTH: f32 = 1e-6;

// ────────────────────────────────────────────────────────────────────────────
// Color
// ────────────────────────────────────────────────────────────────────────────

/// An 8-bit-per-channel RGB color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Unpack a `0x00RRGGBB` value.
    pub fn from_packed(packed: u32) -> Self {
        Self {
            r: ((packed >> 16) & 0xff) as u8,
            g: ((packed >> 8) & 0xff) as u8,
            b: (packed & 0xff) as u8,
        }
    }

    /// Pack into `0x00RRGGBB`.
    pub fn packed(self) -> u32 {
        (u32::from(self.r) << 16) | (u32::from(self.g) << 8) | u32::from(self.b)
    }

    /// Channels as floating point values in `[0, 255]`.
    pub fn to_f64(self) -> [f64; 3] {
        [f64::from(self.r), f64::from(self.g), f64::from(self.b)]
    }

    /// Round and clamp floating point channels back to 8 bits.
    pub fn from_f64(channels: [f64; 3]) -> Self {
        let q = |c: f64| c.round().clamp(0.0, 255.0) as u8;
        Self::new(q(channels[0]), q(channels[1]), q(channels[2]))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Points
// ────────────────────────────────────────────────────────────────────────────

/// A single colored point as produced by the upstream mapper.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawPoint {
    pub position: Point3<f32>,
    pub color: Rgb,
}

impl RawPoint {
    pub fn new(x: f32, y: f32, z: f32, color: Rgb) -> Self {
        Self {
            position: Point3::new(x, y, z),
            color,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.position.iter().all(|c| c.is_finite())
    }
}

/// The fused estimate held by one accumulator cell.
///
/// `position` and `color` are running weighted averages over every
/// observation that landed in the cell; `weight` counts those observations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightedPoint {
    pub position: Point3<f64>,
    /// Per-channel color in `[0, 255]`, kept unrounded between updates.
    pub color: [f64; 3],
    pub weight: f64,
}

impl WeightedPoint {
    /// Collapse to a [`RawPoint`] (single precision, 8-bit color).
    pub fn to_raw(&self) -> RawPoint {
        RawPoint {
            position: self.position.cast::<f32>(),
            color: Rgb::from_f64(self.color),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// KeyframePose
// ────────────────────────────────────────────────────────────────────────────

/// One keyframe record from the pose-graph log.
///
/// `transform` maps points from the keyframe's local frame into the global
/// map frame. The rotation is always a unit quaternion.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyframePose {
    /// Ordinal of the record among the accepted records of the log.
    pub id: usize,
    /// Unique keyframe name; also the stem of the keyframe's cloud file.
    pub name: String,
    pub transform: Isometry3<f64>,
}

impl KeyframePose {
    /// Build a pose from raw log components.
    ///
    /// `quaternion` is `[qx, qy, qz, qw]`. An all-zero quaternion is the
    /// upstream convention for "identity"; any other value is normalized.
    /// Callers must reject non-finite and near-zero (but not exactly zero)
    /// quaternions before calling this.
    pub fn from_components(
        id: usize,
        name: impl Into<String>,
        translation: [f64; 3],
        quaternion: [f64; 4],
    ) -> Self {
        let [qx, qy, qz, qw] = quaternion;
        let rotation = if quaternion.iter().all(|q| *q == 0.0) {
            UnitQuaternion::identity()
        } else {
            UnitQuaternion::from_quaternion(Quaternion::new(qw, qx, qy, qz))
        };
        let [tx, ty, tz] = translation;
        Self {
            id,
            name: name.into(),
            transform: Isometry3::from_parts(Translation3::new(tx, ty, tz), rotation),
        }
    }

    pub fn translation(&self) -> Vector3<f64> {
        self.transform.translation.vector
    }

    pub fn rotation(&self) -> UnitQuaternion<f64> {
        self.transform.rotation
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Mesh
// ────────────────────────────────────────────────────────────────────────────

/// A colored triangle mesh.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mesh {
    pub vertices: Vec<RawPoint>,
    /// Vertex index triples, counter-clockwise around the outward normal.
    pub triangles: Vec<[u32; 3]>,
}

impl Mesh {
    pub fn is_empty(&self) -> bool {
        self.triangles.is_empty()
    }

    /// True when every triangle references three distinct, existing vertices
    /// and none of its edges is zero-length.
    pub fn is_valid(&self) -> bool {
        self.triangles.iter().all(|tri| self.triangle_is_valid(tri))
    }

    fn triangle_is_valid(&self, tri: &[u32; 3]) -> bool {
        let n = self.vertices.len();
        if tri.iter().any(|&i| i as usize >= n) {
            return false;
        }
        (0..3).all(|k| {
            let a = self.vertices[tri[k] as usize].position;
            let b = self.vertices[tri[(k + 1) % 3] as usize].position;
            tri[k] != tri[(k + 1) % 3] && (b - a).norm() >= MIN_EDGE_LENGTH
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Warnings
// ────────────────────────────────────────────────────────────────────────────

/// Non-fatal geometric conditions recorded as annotations of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GeometryWarning {
    /// Triangulation growth stalled and left open regions in the surface.
    Holes { count: usize, stalled_edges: usize },
    /// The trimming contour consists of several disconnected loops.
    MultiLoopContour { loops: usize },
    /// Points whose neighbourhood was too sparse to estimate a normal.
    DegenerateNormals { points: usize },
}

impl fmt::Display for GeometryWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GeometryWarning::Holes {
                count,
                stalled_edges,
            } => write!(f, "{count} hole(s) left by {stalled_edges} stalled front edge(s)"),
            GeometryWarning::MultiLoopContour { loops } => {
                write!(f, "trimming contour has {loops} disconnected loops")
            }
            GeometryWarning::DegenerateNormals { points } => {
                write!(f, "{points} point(s) had too few neighbours for a normal")
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Fatal failures of a reconstruction run.
#[derive(Error, Debug)]
pub enum FusionError {
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed cloud file {}: {reason}", .path.display())]
    CloudFormat { path: PathBuf, reason: String },

    #[error("Pose log {} yielded no usable records ({skipped} skipped)", .path.display())]
    EmptyPoseLog { path: PathBuf, skipped: usize },

    #[error("Fused cloud is empty; nothing to reconstruct")]
    EmptyCloud,

    #[error("Timed out after {waited:?} waiting for lock marker {}", .path.display())]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl FusionError {
    /// Attach a path to an I/O error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        FusionError::Io {
            path: path.into(),
            source,
        }
    }
}
