//! Planar footprint boundary of a point cloud.
//!
//! The cloud is projected onto a coordinate plane, quantized into a square
//! occupancy grid, and the outer boundary of every 8-connected group of
//! occupied cells is traced with Moore-neighbour following. The resulting
//! loops pass through the centres of the boundary cells. Together with the
//! occupied cells themselves they form the trimming mask for the surface
//! reconstructor.
//!
//! # Example
//!
//! ```rust
//! use meshfuse_perception::ContourExtractor;
//! use meshfuse_types::{RawPoint, Rgb};
//! use nalgebra::Point3;
//!
//! let cloud: Vec<RawPoint> = (0..100)
//!     .map(|i| RawPoint::new((i % 10) as f32 * 0.1 + 0.05, (i / 10) as f32 * 0.1 + 0.05, 0.0, Rgb::default()))
//!     .collect();
//!
//! let contour = ContourExtractor::new(0.1).unwrap().extract(&cloud);
//! assert_eq!(contour.loops().len(), 1);
//! assert!(contour.contains(&Point3::new(0.45, 0.45, 0.0)));
//! assert!(!contour.contains(&Point3::new(3.0, 3.0, 0.0)));
//! ```

use std::collections::{HashSet, VecDeque};

use meshfuse_types::{FusionError, GeometryWarning, RawPoint};
use nalgebra::{Point2, Point3};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::plane::fit_plane;
use crate::voxel::check_cell_size;

/// Coordinate plane the cloud is projected onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectionPlane {
    /// Drop the axis most aligned with the cloud's best-fit plane normal.
    #[default]
    Auto,
    Xy,
    Xz,
    Yz,
}

impl ProjectionPlane {
    /// The two kept axes, or `None` for [`ProjectionPlane::Auto`].
    pub fn axes(self) -> Option<(usize, usize)> {
        match self {
            ProjectionPlane::Auto => None,
            ProjectionPlane::Xy => Some((0, 1)),
            ProjectionPlane::Xz => Some((0, 2)),
            ProjectionPlane::Yz => Some((1, 2)),
        }
    }

    fn dropping(axis: usize) -> Self {
        match axis {
            0 => ProjectionPlane::Yz,
            1 => ProjectionPlane::Xz,
            _ => ProjectionPlane::Xy,
        }
    }
}

type Cell = (i64, i64);

/// Moore neighbourhood, clockwise starting north (rows grow "down").
const DIRS: [Cell; 8] = [(0, -1), (1, -1), (1, 0), (1, 1), (0, 1), (-1, 1), (-1, 0), (-1, -1)];
const WEST: usize = 6;

// ────────────────────────────────────────────────────────────────────────────
// ContourExtractor
// ────────────────────────────────────────────────────────────────────────────

/// Builds a [`BoundaryContour`] from a cloud.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContourExtractor {
    resolution: f64,
    plane: ProjectionPlane,
}

impl ContourExtractor {
    pub fn new(resolution: f64) -> Result<Self, FusionError> {
        check_cell_size("contour resolution", resolution)?;
        Ok(Self {
            resolution,
            plane: ProjectionPlane::Auto,
        })
    }

    pub fn with_plane(mut self, plane: ProjectionPlane) -> Self {
        self.plane = plane;
        self
    }

    pub fn resolution(&self) -> f64 {
        self.resolution
    }

    /// Resolve `Auto` against `cloud`. Falls back to the XY plane when no
    /// plane can be fitted.
    pub fn resolve_plane(&self, cloud: &[RawPoint]) -> ProjectionPlane {
        if self.plane != ProjectionPlane::Auto {
            return self.plane;
        }
        let finite = cloud.iter().filter(|p| p.is_finite()).map(|p| p.position.cast::<f64>());
        fit_plane(finite)
            .map(|fit| ProjectionPlane::dropping(fit.dominant_axis()))
            .unwrap_or(ProjectionPlane::Xy)
    }

    pub fn extract(&self, cloud: &[RawPoint]) -> BoundaryContour {
        let plane = self.resolve_plane(cloud);
        let axes = plane.axes().unwrap_or((0, 1));
        let res = self.resolution;

        let occupied: HashSet<Cell> = cloud
            .iter()
            .filter(|p| p.is_finite())
            .map(|p| cell_of(&p.position, axes, res))
            .collect();

        let loops: Vec<Vec<Point2<f64>>> = components(&occupied)
            .iter()
            .map(|component| {
                trace_outer_boundary(component)
                    .into_iter()
                    .map(|(i, j)| Point2::new((i as f64 + 0.5) * res, (j as f64 + 0.5) * res))
                    .collect()
            })
            .collect();

        debug!(?plane, cells = occupied.len(), loops = loops.len(), "contour extracted");
        BoundaryContour {
            plane,
            axes,
            resolution: res,
            loops,
            occupied,
        }
    }
}

fn project(p: &Point3<f32>, axes: (usize, usize)) -> (f64, f64) {
    (f64::from(p[axes.0]), f64::from(p[axes.1]))
}

fn cell_of(p: &Point3<f32>, axes: (usize, usize), res: f64) -> Cell {
    let (u, v) = project(p, axes);
    ((u / res).floor() as i64, (v / res).floor() as i64)
}

fn step(c: Cell, d: usize) -> Cell {
    (c.0 + DIRS[d].0, c.1 + DIRS[d].1)
}

/// 8-connected components, each sorted, ordered by their smallest cell.
fn components(occupied: &HashSet<Cell>) -> Vec<Vec<Cell>> {
    let mut cells: Vec<Cell> = occupied.iter().copied().collect();
    // Row-major: (row, column).
    cells.sort_unstable_by_key(|&(i, j)| (j, i));

    let mut seen: HashSet<Cell> = HashSet::with_capacity(cells.len());
    let mut out = Vec::new();
    for &seed in &cells {
        if !seen.insert(seed) {
            continue;
        }
        let mut component = vec![seed];
        let mut queue = VecDeque::from([seed]);
        while let Some(c) = queue.pop_front() {
            for d in 0..8 {
                let n = step(c, d);
                if occupied.contains(&n) && seen.insert(n) {
                    component.push(n);
                    queue.push_back(n);
                }
            }
        }
        component.sort_unstable_by_key(|&(i, j)| (j, i));
        out.push(component);
    }
    out
}

/// Moore-neighbour tracing of one component's outer boundary, stopping when
/// the start cell is re-entered in the same direction as the first step.
fn trace_outer_boundary(component: &[Cell]) -> Vec<Cell> {
    let Some(&start) = component.first() else {
        return Vec::new();
    };
    let member: HashSet<Cell> = component.iter().copied().collect();

    let mut boundary = vec![start];
    let mut cur = start;
    // Start is the top-most, then left-most cell, so its west neighbour is empty.
    let mut back = WEST;
    let mut first_next: Option<Cell> = None;
    let limit = 4 * component.len() + 8;

    for _ in 0..limit {
        let Some((d, next)) = (1..=8)
            .map(|k| (back + k) % 8)
            .map(|d| (d, step(cur, d)))
            .find(|(_, n)| member.contains(n))
        else {
            break; // isolated cell
        };

        match first_next {
            None => first_next = Some(next),
            Some(f) if cur == start && next == f => break,
            Some(_) => {}
        }

        let entered_from = step(cur, (d + 7) % 8);
        let offset = (entered_from.0 - next.0, entered_from.1 - next.1);
        back = DIRS.iter().position(|&o| o == offset).unwrap_or(WEST);
        cur = next;
        boundary.push(cur);
    }

    if boundary.len() > 1 && boundary.last() == Some(&start) {
        boundary.pop();
    }
    boundary
}

// ────────────────────────────────────────────────────────────────────────────
// BoundaryContour
// ────────────────────────────────────────────────────────────────────────────

/// Closed boundary loops of a cloud's planar footprint.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundaryContour {
    plane: ProjectionPlane,
    axes: (usize, usize),
    resolution: f64,
    loops: Vec<Vec<Point2<f64>>>,
    occupied: HashSet<Cell>,
}

impl BoundaryContour {
    /// The resolved projection plane (never `Auto`).
    pub fn plane(&self) -> ProjectionPlane {
        self.plane
    }

    /// Closed loops in plane coordinates; the last vertex connects back to
    /// the first.
    pub fn loops(&self) -> &[Vec<Point2<f64>>] {
        &self.loops
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    /// More than one loop means a disconnected footprint.
    pub fn warning(&self) -> Option<GeometryWarning> {
        (self.loops.len() > 1).then(|| GeometryWarning::MultiLoopContour {
            loops: self.loops.len(),
        })
    }

    /// True when `p` projects into an occupied cell, inside any loop, or
    /// within half a cell of a loop's outline.
    pub fn contains(&self, p: &Point3<f32>) -> bool {
        if self.occupied.contains(&cell_of(p, self.axes, self.resolution)) {
            return true;
        }
        let (u, v) = project(p, self.axes);
        let q = Point2::new(u, v);
        let tolerance_sq = (0.5 * self.resolution).powi(2);
        self.loops
            .iter()
            .any(|l| point_in_polygon(&q, l) || distance_sq_to_outline(&q, l) <= tolerance_sq)
    }

    /// Keep the points of `cloud` inside the contour, in order.
    pub fn trim(&self, cloud: &[RawPoint]) -> Vec<RawPoint> {
        cloud
            .iter()
            .filter(|p| p.is_finite() && self.contains(&p.position))
            .copied()
            .collect()
    }
}

/// Even-odd crossing test; loops with fewer than three vertices enclose nothing.
fn point_in_polygon(q: &Point2<f64>, poly: &[Point2<f64>]) -> bool {
    if poly.len() < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = poly.len() - 1;
    for i in 0..poly.len() {
        let (a, b) = (poly[i], poly[j]);
        if (a.y > q.y) != (b.y > q.y) {
            let x = a.x + (q.y - a.y) / (b.y - a.y) * (b.x - a.x);
            if q.x < x {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

fn distance_sq_to_outline(q: &Point2<f64>, poly: &[Point2<f64>]) -> f64 {
    match poly {
        [] => f64::INFINITY,
        [only] => (*q - *only).norm_squared(),
        _ => (0..poly.len())
            .map(|i| distance_sq_to_segment(q, &poly[i], &poly[(i + 1) % poly.len()]))
            .fold(f64::INFINITY, f64::min),
    }
}

fn distance_sq_to_segment(q: &Point2<f64>, a: &Point2<f64>, b: &Point2<f64>) -> f64 {
    let ab = *b - *a;
    let len_sq = ab.norm_squared();
    if len_sq == 0.0 {
        return (*q - *a).norm_squared();
    }
    let t = ((*q - *a).dot(&ab) / len_sq).clamp(0.0, 1.0);
    (*q - (*a + ab * t)).norm_squared()
}
