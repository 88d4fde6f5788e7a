//! Spatial index for neighbourhood queries.
//!
//! Partitions 3-D space using a recursive **Octree** so that the surface
//! reconstructor can ask "which points lie within `r` of this one?" without
//! scanning the whole cloud.
//!
//! # Key types
//!
//! | Type          | Role                                                   |
//! |---------------|--------------------------------------------------------|
//! | [`Aabb`]      | An axis-aligned bounding box.                          |
//! | [`Octree`]    | Spatial index over indexed points.                     |
//! | [`Neighbour`] | One radius-query hit: point index and squared distance. |
//!
//! # Example
//!
//! ```rust
//! use meshfuse_perception::octree::Octree;
//! use nalgebra::Point3;
//!
//! let points = [
//!     Point3::new(0.0, 0.0, 0.0),
//!     Point3::new(0.5, 0.0, 0.0),
//!     Point3::new(3.0, 0.0, 0.0),
//! ];
//! let tree = Octree::from_points(&points, 8);
//!
//! let hits = tree.within_radius(&Point3::new(0.1, 0.0, 0.0), 1.0);
//! let indices: Vec<u32> = hits.iter().map(|n| n.index).collect();
//! assert_eq!(indices, vec![0, 1]);
//! ```

use nalgebra::Point3;

// ────────────────────────────────────────────────────────────────────────────
// Aabb
// ────────────────────────────────────────────────────────────────────────────

/// An axis-aligned bounding box, defined by its minimum and maximum corners.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Point3<f32>,
    pub max: Point3<f32>,
}

impl Aabb {
    /// Create a bounding box from its two opposite corners.
    ///
    /// The constructor normalises the corners so that `min ≤ max` per axis.
    pub fn new(a: Point3<f32>, b: Point3<f32>) -> Self {
        Self {
            min: a.inf(&b),
            max: a.sup(&b),
        }
    }

    /// Smallest box enclosing every finite point, or `None` when there is none.
    pub fn from_points(points: &[Point3<f32>]) -> Option<Self> {
        let mut finite = points.iter().filter(|p| p.iter().all(|c| c.is_finite()));
        let first = *finite.next()?;
        Some(finite.fold(Self::new(first, first), |b, p| Self {
            min: b.min.inf(p),
            max: b.max.sup(p),
        }))
    }

    pub fn centre(&self) -> Point3<f32> {
        nalgebra::center(&self.min, &self.max)
    }

    /// True when the point lies inside or on the boundary of the box.
    pub fn contains_point(&self, p: &Point3<f32>) -> bool {
        (0..3).all(|i| p[i] >= self.min[i] && p[i] <= self.max[i])
    }

    /// Squared distance from `p` to the closest point of the box; zero inside.
    pub fn distance_sq(&self, p: &Point3<f32>) -> f32 {
        (0..3)
            .map(|i| {
                let d = (self.min[i] - p[i]).max(0.0).max(p[i] - self.max[i]);
                d * d
            })
            .sum()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Octree
// ────────────────────────────────────────────────────────────────────────────

/// One result of [`Octree::within_radius`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbour {
    pub index: u32,
    pub distance_sq: f32,
}

/// A recursive spatial index that subdivides 3-D space into eight octants.
///
/// Each entry is a point together with its index in the caller's array.
/// Subdividing stops when either
/// - the number of entries in a node is ≤ `capacity`, or
/// - `max_depth` levels have already been created.
///
/// The depth cap keeps clusters of coincident points from recursing forever.
#[derive(Debug)]
pub struct Octree {
    root: OctreeNode,
    max_depth: usize,
}

impl Octree {
    /// Empty octree covering `bounds`; `capacity` is the leaf size that
    /// triggers subdivision.
    fn new(bounds: Aabb, capacity: usize) -> Self {
        Self {
            root: OctreeNode::new(bounds, capacity.max(1)),
            max_depth: 8,
        }
    }

    /// Index every finite point of `points` under its position in the slice.
    pub fn from_points(points: &[Point3<f32>], capacity: usize) -> Self {
        let bounds = Aabb::from_points(points)
            .unwrap_or_else(|| Aabb::new(Point3::origin(), Point3::origin()));
        let mut tree = Self::new(bounds, capacity);
        for (i, p) in points.iter().enumerate() {
            tree.insert(i as u32, *p);
        }
        tree
    }

    /// Insert an indexed point.
    ///
    /// Points outside the root bounding box are silently ignored.
    fn insert(&mut self, index: u32, point: Point3<f32>) {
        self.root.insert(Entry { index, point }, self.max_depth, 0);
    }

    /// Every entry within `radius` of `centre` (inclusive), nearest first.
    /// Equal distances are ordered by index.
    pub fn within_radius(&self, centre: &Point3<f32>, radius: f32) -> Vec<Neighbour> {
        let mut out = Vec::new();
        if radius.is_finite() && radius >= 0.0 {
            self.root.within_radius(centre, radius * radius, &mut out);
        }
        out.sort_by(|a, b| {
            a.distance_sq
                .total_cmp(&b.distance_sq)
                .then(a.index.cmp(&b.index))
        });
        out
    }
}

// ────────────────────────────────────────────────────────────────────────────
// OctreeNode – internal implementation
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Entry {
    index: u32,
    point: Point3<f32>,
}

#[derive(Debug)]
struct OctreeNode {
    bounds: Aabb,
    capacity: usize,
    /// Entries stored at this node (only non-empty when the node is a leaf).
    entries: Vec<Entry>,
    /// Eight children; `None` while this node is a leaf.
    children: Option<Box<[OctreeNode; 8]>>,
}

impl OctreeNode {
    fn new(bounds: Aabb, capacity: usize) -> Self {
        Self {
            bounds,
            capacity,
            entries: Vec::new(),
            children: None,
        }
    }

    fn insert(&mut self, entry: Entry, max_depth: usize, depth: usize) {
        if !self.bounds.contains_point(&entry.point) {
            return;
        }

        if let Some(children) = self.children.as_mut() {
            if let Some(child) = children
                .iter_mut()
                .find(|c| c.bounds.contains_point(&entry.point))
            {
                child.insert(entry, max_depth, depth + 1);
            }
            return;
        }

        self.entries.push(entry);
        // Subdivide when over capacity and depth budget remains.
        if self.entries.len() > self.capacity && depth < max_depth {
            self.subdivide(max_depth, depth);
        }
    }

    fn within_radius(&self, centre: &Point3<f32>, radius_sq: f32, out: &mut Vec<Neighbour>) {
        if self.bounds.distance_sq(centre) > radius_sq {
            return;
        }
        match &self.children {
            None => out.extend(self.entries.iter().filter_map(|e| {
                let distance_sq = (e.point - *centre).norm_squared();
                (distance_sq <= radius_sq).then_some(Neighbour {
                    index: e.index,
                    distance_sq,
                })
            })),
            Some(children) => {
                for child in children.iter() {
                    child.within_radius(centre, radius_sq, out);
                }
            }
        }
    }

    /// Split this leaf into eight children and redistribute existing entries.
    fn subdivide(&mut self, max_depth: usize, depth: usize) {
        let c = self.bounds.centre();
        let min = self.bounds.min;
        let max = self.bounds.max;

        let octants = [
            Aabb::new(min, c),
            Aabb::new(Point3::new(c.x, min.y, min.z), Point3::new(max.x, c.y, c.z)),
            Aabb::new(Point3::new(min.x, c.y, min.z), Point3::new(c.x, max.y, c.z)),
            Aabb::new(Point3::new(c.x, c.y, min.z), Point3::new(max.x, max.y, c.z)),
            Aabb::new(Point3::new(min.x, min.y, c.z), Point3::new(c.x, c.y, max.z)),
            Aabb::new(Point3::new(c.x, min.y, c.z), Point3::new(max.x, c.y, max.z)),
            Aabb::new(Point3::new(min.x, c.y, c.z), Point3::new(c.x, max.y, max.z)),
            Aabb::new(c, max),
        ];

        let cap = self.capacity;
        let mut children = Box::new(octants.map(|b| OctreeNode::new(b, cap)));

        for e in std::mem::take(&mut self.entries) {
            if let Some(child) = children.iter_mut().find(|c| c.bounds.contains_point(&e.point)) {
                child.insert(e, max_depth, depth + 1);
            }
        }

        self.children = Some(children);
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn indexed(tree: &Octree) -> usize {
        tree.within_radius(&Point3::origin(), 1.0e6).len()
    }

    fn brute_force(points: &[Point3<f32>], centre: &Point3<f32>, r: f32) -> Vec<u32> {
        let mut hits: Vec<(f32, u32)> = points
            .iter()
            .enumerate()
            .filter_map(|(i, p)| {
                let d = (p - centre).norm_squared();
                (d <= r * r).then_some((d, i as u32))
            })
            .collect();
        hits.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        hits.into_iter().map(|(_, i)| i).collect()
    }

    // ── Aabb ────────────────────────────────────────────────────────────────

    #[test]
    fn aabb_normalises_min_max() {
        let b = Aabb::new(Point3::new(2.0, 2.0, 2.0), Point3::new(0.0, 0.0, 0.0));
        assert_eq!(b.min, Point3::new(0.0, 0.0, 0.0));
        assert_eq!(b.max, Point3::new(2.0, 2.0, 2.0));
    }

    #[test]
    fn aabb_contains_boundary_point() {
        let b = Aabb::new(Point3::new(0.0, 0.0, 0.0), Point3::new(1.0, 1.0, 1.0));
        assert!(b.contains_point(&Point3::new(0.0, 0.0, 0.0)));
        assert!(b.contains_point(&Point3::new(1.0, 1.0, 1.0)));
        assert!(!b.contains_point(&Point3::new(2.0, 0.0, 0.0)));
    }

    #[test]
    fn aabb_distance_is_zero_inside_and_euclidean_outside() {
        let b = Aabb::new(Point3::new(0.0, 0.0, 0.0), Point3::new(1.0, 1.0, 1.0));
        assert_eq!(b.distance_sq(&Point3::new(0.5, 0.5, 0.5)), 0.0);
        assert!((b.distance_sq(&Point3::new(2.0, 0.5, 2.0)) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn aabb_from_points_skips_non_finite() {
        let b = Aabb::from_points(&[
            Point3::new(f32::NAN, 0.0, 0.0),
            Point3::new(1.0, -1.0, 0.0),
            Point3::new(-2.0, 3.0, 0.5),
        ])
        .expect("bounds");
        assert_eq!(b.min, Point3::new(-2.0, -1.0, 0.0));
        assert_eq!(b.max, Point3::new(1.0, 3.0, 0.5));
        assert!(Aabb::from_points(&[]).is_none());
    }

    // ── Octree ──────────────────────────────────────────────────────────────

    #[test]
    fn insert_outside_bounds_is_ignored() {
        let mut tree = Octree::new(
            Aabb::new(Point3::new(0.0, 0.0, 0.0), Point3::new(1.0, 1.0, 1.0)),
            4,
        );
        tree.insert(0, Point3::new(5.0, 5.0, 5.0));
        assert_eq!(indexed(&tree), 0);
        tree.insert(1, Point3::new(0.5, 0.5, 0.5));
        assert_eq!(indexed(&tree), 1);
    }

    #[test]
    fn subdivision_preserves_all_points() {
        let points: Vec<Point3<f32>> = (0..125)
            .map(|i| Point3::new((i % 5) as f32, ((i / 5) % 5) as f32, (i / 25) as f32))
            .collect();
        let tree = Octree::from_points(&points, 2);
        assert_eq!(indexed(&tree), points.len());
    }

    #[test]
    fn radius_query_matches_brute_force() {
        let points: Vec<Point3<f32>> = (0..400)
            .map(|i| {
                let f = i as f32;
                Point3::new((f * 0.61).sin() * 5.0, (f * 0.27).cos() * 5.0, (f * 0.05).sin())
            })
            .collect();
        let tree = Octree::from_points(&points, 4);
        for centre in [Point3::new(0.0, 0.0, 0.0), Point3::new(3.0, -2.0, 0.5), points[17]] {
            let got: Vec<u32> = tree.within_radius(&centre, 1.3).iter().map(|n| n.index).collect();
            assert_eq!(got, brute_force(&points, &centre, 1.3));
        }
    }

    #[test]
    fn coplanar_and_coincident_points_do_not_break_the_tree() {
        let mut points: Vec<Point3<f32>> = (0..100)
            .map(|i| Point3::new((i % 10) as f32 * 0.1, (i / 10) as f32 * 0.1, 0.0))
            .collect();
        points.extend(std::iter::repeat_n(Point3::new(0.5, 0.5, 0.0), 50));
        let tree = Octree::from_points(&points, 4);
        assert_eq!(indexed(&tree), 150);
        let hits = tree.within_radius(&Point3::new(0.5, 0.5, 0.0), 0.0);
        assert_eq!(hits.len(), 51);
        assert!(hits.windows(2).all(|w| w[0].index < w[1].index));
    }

    #[test]
    fn negative_radius_finds_nothing() {
        let tree = Octree::from_points(&[Point3::origin()], 4);
        assert!(tree.within_radius(&Point3::origin(), -1.0).is_empty());
    }
}
