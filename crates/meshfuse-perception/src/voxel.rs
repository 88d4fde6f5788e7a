//! Voxel quantization and voxel-grid downsampling.
//!
//! Space is partitioned into axis-aligned cubes of side `voxel_size`. A point
//! belongs to the cube `floor(coordinate / voxel_size)` on each axis.
//! [`VoxelFilter`] replaces the members of every occupied cube by their mean
//! position and mean color.
//!
//! Because the mean of a cube's members lies inside that cube, filtering an
//! already-filtered cloud with the same size returns it unchanged.

use std::collections::HashMap;

use meshfuse_types::{FusionError, RawPoint, Rgb};
use nalgebra::Point3;

/// Integer coordinates of a voxel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VoxelKey(pub i64, pub i64, pub i64);

impl VoxelKey {
    /// The voxel containing `p` for cubes of side `size`.
    pub fn of(p: &Point3<f64>, size: f64) -> Self {
        Self(
            (p.x / size).floor() as i64,
            (p.y / size).floor() as i64,
            (p.z / size).floor() as i64,
        )
    }
}

/// Reject sizes that cannot partition space.
pub(crate) fn check_cell_size(what: &str, size: f64) -> Result<(), FusionError> {
    if size.is_finite() && size > 0.0 {
        Ok(())
    } else {
        Err(FusionError::Config(format!("{what} must be positive and finite, got {size}")))
    }
}

/// Voxel-grid downsampling filter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoxelFilter {
    voxel_size: f64,
}

#[derive(Default)]
struct CubeSum {
    position: [f64; 3],
    color: [f64; 3],
    count: usize,
}

impl VoxelFilter {
    pub fn new(voxel_size: f64) -> Result<Self, FusionError> {
        check_cell_size("voxel size", voxel_size)?;
        Ok(Self { voxel_size })
    }

    pub fn voxel_size(&self) -> f64 {
        self.voxel_size
    }

    /// One point per occupied voxel, in ascending voxel order. Non-finite
    /// input points are dropped.
    pub fn filter(&self, cloud: &[RawPoint]) -> Vec<RawPoint> {
        let mut cubes: HashMap<VoxelKey, CubeSum> = HashMap::new();

        for p in cloud.iter().filter(|p| p.is_finite()) {
            let pos = p.position.cast::<f64>();
            let sum = cubes.entry(VoxelKey::of(&pos, self.voxel_size)).or_default();
            for axis in 0..3 {
                sum.position[axis] += pos[axis];
            }
            for (acc, c) in sum.color.iter_mut().zip(p.color.to_f64()) {
                *acc += c;
            }
            sum.count += 1;
        }

        let mut keyed: Vec<(VoxelKey, CubeSum)> = cubes.into_iter().collect();
        keyed.sort_unstable_by_key(|(k, _)| *k);

        keyed
            .into_iter()
            .map(|(_, sum)| {
                let n = sum.count as f64;
                RawPoint::new(
                    (sum.position[0] / n) as f32,
                    (sum.position[1] / n) as f32,
                    (sum.position[2] / n) as f32,
                    Rgb::from_f64(sum.color.map(|c| c / n)),
                )
            })
            .collect()
    }
}
