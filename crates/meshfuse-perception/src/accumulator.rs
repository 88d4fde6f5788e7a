//! Weighted voxel grid fusing keyframe observations.
//!
//! Every map-frame point lands in one cell of a fixed-size voxel grid. A cell
//! keeps a running weighted average of the positions and colors that landed
//! in it, so overlapping viewpoints converge on one estimate instead of the
//! last writer winning.
//!
//! # Example
//!
//! ```rust
//! use meshfuse_perception::Accumulator;
//! use meshfuse_types::Rgb;
//! use nalgebra::Point3;
//!
//! let mut acc = Accumulator::new(1.0).unwrap();
//! acc.integrate([
//!     (Point3::new(0.2, 0.2, 0.0), Rgb::new(200, 0, 0)),
//!     (Point3::new(0.4, 0.4, 0.0), Rgb::new(0, 0, 100)),
//! ]);
//!
//! let cells: Vec<_> = acc.cells().collect();
//! assert_eq!(cells.len(), 1);
//! assert_eq!(cells[0].weight, 2.0);
//! assert_eq!(cells[0].color, [100.0, 0.0, 50.0]);
//! ```

use std::collections::HashMap;

use meshfuse_types::{FusionError, RawPoint, Rgb, WeightedPoint};
use nalgebra::Point3;
use tracing::debug;

use crate::voxel::{VoxelKey, check_cell_size};

/// Per-channel linear blend: `a * alpha + b * (1 - alpha)`.
pub fn blend(a: [f64; 3], b: [f64; 3], alpha: f64) -> [f64; 3] {
    [0, 1, 2].map(|i| a[i] * alpha + b[i] * (1.0 - alpha))
}

/// Voxel-keyed map of fused [`WeightedPoint`]s.
#[derive(Debug, Clone)]
pub struct Accumulator {
    voxel_size: f64,
    cells: HashMap<VoxelKey, WeightedPoint>,
    rejected: usize,
}

impl Accumulator {
    pub fn new(voxel_size: f64) -> Result<Self, FusionError> {
        check_cell_size("voxel size", voxel_size)?;
        Ok(Self {
            voxel_size,
            cells: HashMap::new(),
            rejected: 0,
        })
    }

    pub fn voxel_size(&self) -> f64 {
        self.voxel_size
    }

    /// Number of occupied cells.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Non-finite points skipped so far.
    pub fn rejected(&self) -> usize {
        self.rejected
    }

    /// Fold map-frame points into the grid.
    pub fn integrate<I>(&mut self, points: I)
    where
        I: IntoIterator<Item = (Point3<f64>, Rgb)>,
    {
        for (position, color) in points {
            if !position.iter().all(|c| c.is_finite()) {
                self.rejected += 1;
                continue;
            }
            let observation = WeightedPoint {
                position,
                color: color.to_f64(),
                weight: 1.0,
            };
            let key = VoxelKey::of(&position, self.voxel_size);
            self.fold(key, observation);
        }
    }

    /// Fold every cell of `other` into this grid. Weights add.
    pub fn merge(&mut self, other: Accumulator) -> Result<(), FusionError> {
        if other.voxel_size != self.voxel_size {
            return Err(FusionError::Config(format!(
                "cannot merge accumulators with voxel sizes {} and {}",
                self.voxel_size, other.voxel_size
            )));
        }
        debug!(cells = other.cells.len(), "merging accumulator");
        self.rejected += other.rejected;
        for (key, cell) in other.cells {
            self.fold(key, cell);
        }
        Ok(())
    }

    /// Fused cells in ascending voxel order.
    pub fn cells(&self) -> impl Iterator<Item = &WeightedPoint> + '_ {
        let mut keys: Vec<&VoxelKey> = self.cells.keys().collect();
        keys.sort_unstable();
        keys.into_iter().filter_map(|k| self.cells.get(k))
    }

    /// One point per cell, in ascending voxel order.
    pub fn to_cloud(&self) -> Vec<RawPoint> {
        self.cells().map(WeightedPoint::to_raw).collect()
    }

    fn fold(&mut self, key: VoxelKey, obs: WeightedPoint) {
        match self.cells.get_mut(&key) {
            Some(cell) => {
                let weight = cell.weight + obs.weight;
                let alpha = cell.weight / weight;
                cell.position =
                    Point3::from(cell.position.coords * alpha + obs.position.coords * (1.0 - alpha));
                cell.color = blend(cell.color, obs.color, alpha);
                cell.weight = weight;
            }
            None => {
                self.cells.insert(key, obs);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cloud(offset: f64, seed: u8) -> Vec<(Point3<f64>, Rgb)> {
        (0..40)
            .map(|i| {
                let f = i as f64;
                (
                    Point3::new((f * 0.37).sin() + offset, (f * 0.11).cos(), f * 0.01),
                    Rgb::new(seed.wrapping_mul(i as u8), seed, 255 - i as u8),
                )
            })
            .collect()
    }

    #[test]
    fn blend_weights_endpoints() {
        assert_eq!(blend([10.0; 3], [20.0; 3], 1.0), [10.0; 3]);
        assert_eq!(blend([10.0; 3], [20.0; 3], 0.0), [20.0; 3]);
        assert_eq!(blend([10.0; 3], [20.0; 3], 0.25), [17.5; 3]);
    }

    #[test]
    fn running_blend_is_arithmetic_mean() {
        let colors = [12u8, 200, 37, 91, 150];
        let mut acc = Accumulator::new(10.0).expect("size");
        acc.integrate(
            colors
                .iter()
                .enumerate()
                .map(|(i, &c)| (Point3::new(i as f64 * 0.1, 0.0, 0.0), Rgb::new(c, 255 - c, 0))),
        );

        let cell = *acc.cells().next().expect("one cell");
        let mean = colors.iter().map(|&c| f64::from(c)).sum::<f64>() / colors.len() as f64;
        assert_eq!(cell.weight, colors.len() as f64);
        assert!((cell.color[0] - mean).abs() < 1e-9);
        assert!((cell.color[1] - (255.0 - mean)).abs() < 1e-9);
        assert!((cell.position.x - 0.2).abs() < 1e-12);
    }

    #[test]
    fn integration_order_does_not_matter() {
        let a = cloud(0.0, 3);
        let b = cloud(0.5, 7);

        let mut ab = Accumulator::new(0.2).expect("size");
        ab.integrate(a.iter().copied());
        ab.integrate(b.iter().copied());

        let mut ba = Accumulator::new(0.2).expect("size");
        ba.integrate(b.iter().rev().copied());
        ba.integrate(a.iter().rev().copied());

        let left: Vec<_> = ab.cells().copied().collect();
        let right: Vec<_> = ba.cells().copied().collect();
        assert_eq!(left.len(), right.len());
        for (l, r) in left.iter().zip(&right) {
            assert_eq!(l.weight, r.weight);
            assert!((l.position - r.position).norm() < 1e-9);
            for ch in 0..3 {
                assert!((l.color[ch] - r.color[ch]).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn merge_equals_sequential_integration() {
        let a = cloud(0.0, 5);
        let b = cloud(0.3, 9);

        let mut sequential = Accumulator::new(0.25).expect("size");
        sequential.integrate(a.iter().copied());
        sequential.integrate(b.iter().copied());

        let mut left = Accumulator::new(0.25).expect("size");
        left.integrate(a.iter().copied());
        let mut right = Accumulator::new(0.25).expect("size");
        right.integrate(b.iter().copied());
        left.merge(right).expect("merge");

        let s: Vec<_> = sequential.cells().copied().collect();
        let m: Vec<_> = left.cells().copied().collect();
        assert_eq!(s.len(), m.len());
        for (x, y) in s.iter().zip(&m) {
            assert_eq!(x.weight, y.weight);
            assert!((x.position - y.position).norm() < 1e-9);
            assert!((x.color[2] - y.color[2]).abs() < 1e-9);
        }
    }

    #[test]
    fn merge_rejects_mismatched_voxel_size() {
        let mut a = Accumulator::new(0.1).expect("size");
        let b = Accumulator::new(0.2).expect("size");
        assert!(matches!(a.merge(b), Err(FusionError::Config(_))));
    }

    #[test]
    fn non_finite_points_are_counted_not_stored() {
        let mut acc = Accumulator::new(1.0).expect("size");
        acc.integrate([
            (Point3::new(f64::NAN, 0.0, 0.0), Rgb::default()),
            (Point3::new(0.0, f64::INFINITY, 0.0), Rgb::default()),
            (Point3::new(0.0, 0.0, 0.0), Rgb::default()),
        ]);
        assert_eq!(acc.len(), 1);
        assert_eq!(acc.rejected(), 2);
    }

    #[test]
    fn to_cloud_is_sorted_by_cell() {
        let mut acc = Accumulator::new(1.0).expect("size");
        acc.integrate([
            (Point3::new(5.5, 0.0, 0.0), Rgb::new(1, 1, 1)),
            (Point3::new(-3.5, 0.0, 0.0), Rgb::new(2, 2, 2)),
            (Point3::new(0.5, 0.0, 0.0), Rgb::new(3, 3, 3)),
        ]);
        let xs: Vec<f32> = acc.to_cloud().iter().map(|p| p.position.x).collect();
        assert_eq!(xs, vec![-3.5, 0.5, 5.5]);
    }
}
