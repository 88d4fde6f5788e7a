//! Greedy surface triangulation.
//!
//! Builds a triangle mesh directly on the points of a (filtered, trimmed)
//! cloud:
//!
//! 1. Neighbourhoods come from [`Octree`] radius queries, capped at the
//!    `max_nearest_neighbors` closest points.
//! 2. Every point with enough neighbours gets a PCA normal, oriented towards
//!    the normal of the plane fitted to the whole cloud.
//! 3. A seed triangle is grown from the first free point; its edges go onto a
//!    FIFO front. Each front edge is expanded across to the side away from
//!    its triangle, picking the candidate whose smallest angle is largest.
//!    Projected onto the candidate's plane, a new triangle may neither cover
//!    another point nor cross an existing mesh edge.
//! 4. When the front empties the next free point seeds a new patch.
//!
//! Front edges with no acceptable candidate are left open. The resulting
//! holes are counted and reported rather than treated as failures.
//!
//! # Example
//!
//! ```rust
//! use meshfuse_perception::{SurfaceReconstructor, TriangulationParams};
//! use meshfuse_types::{RawPoint, Rgb};
//!
//! let square = [
//!     RawPoint::new(0.0, 0.0, 0.0, Rgb::default()),
//!     RawPoint::new(1.0, 0.0, 0.0, Rgb::default()),
//!     RawPoint::new(0.0, 1.0, 0.0, Rgb::default()),
//!     RawPoint::new(1.0, 1.0, 0.0, Rgb::default()),
//! ];
//! let params = TriangulationParams {
//!     search_radius: 2.0,
//!     max_edge_length: 2.0,
//!     ..TriangulationParams::default()
//! };
//!
//! let out = SurfaceReconstructor::new(params).unwrap().reconstruct(&square);
//! assert_eq!(out.mesh.triangles.len(), 2);
//! assert_eq!(out.stats.holes, 0);
//! ```

use std::collections::{HashMap, HashSet, VecDeque};

use meshfuse_types::{FusionError, GeometryWarning, MIN_EDGE_LENGTH, Mesh, RawPoint};
use nalgebra::{Point3, Vector3};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::octree::Octree;
use crate::plane::fit_plane;

const OCTREE_LEAF_CAPACITY: usize = 16;

// ────────────────────────────────────────────────────────────────────────────
// Parameters
// ────────────────────────────────────────────────────────────────────────────

/// Local constraints of the greedy triangulation. Angles are in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriangulationParams {
    /// Neighbourhood radius for candidate and normal search.
    pub search_radius: f64,
    /// Multiplier on a point's nearest-neighbour distance bounding its edges.
    pub mu: f64,
    /// Absolute upper bound on edge length.
    pub max_edge_length: f64,
    pub max_nearest_neighbors: usize,
    pub min_angle_deg: f64,
    pub max_angle_deg: f64,
    /// Largest angle allowed between adjacent triangle normals, and between a
    /// triangle and its vertices' normals.
    pub max_surface_angle_deg: f64,
}

impl Default for TriangulationParams {
    fn default() -> Self {
        Self {
            search_radius: 0.1,
            mu: 2.5,
            max_edge_length: 0.1,
            max_nearest_neighbors: 100,
            min_angle_deg: 10.0,
            max_angle_deg: 120.0,
            max_surface_angle_deg: 45.0,
        }
    }
}

impl TriangulationParams {
    pub fn validate(&self) -> Result<(), FusionError> {
        let positive = [
            ("search_radius", self.search_radius),
            ("mu", self.mu),
            ("max_edge_length", self.max_edge_length),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(FusionError::Config(format!(
                    "triangulation {name} must be positive and finite, got {value}"
                )));
            }
        }
        if self.max_nearest_neighbors < 2 {
            return Err(FusionError::Config(format!(
                "triangulation max_nearest_neighbors must be at least 2, got {}",
                self.max_nearest_neighbors
            )));
        }
        // Every triangle has an angle ≤ 60° and one ≥ 60°.
        if !(0.0..=60.0).contains(&self.min_angle_deg) || !(60.0..=180.0).contains(&self.max_angle_deg) {
            return Err(FusionError::Config(format!(
                "triangle angle bounds must satisfy 0 <= min <= 60 <= max <= 180, got [{}, {}]",
                self.min_angle_deg, self.max_angle_deg
            )));
        }
        if !(self.max_surface_angle_deg > 0.0 && self.max_surface_angle_deg <= 180.0) {
            return Err(FusionError::Config(format!(
                "max_surface_angle_deg must lie in (0, 180], got {}",
                self.max_surface_angle_deg
            )));
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Results
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriangulationStats {
    pub triangles: usize,
    /// Patches started from a fresh seed triangle.
    pub seeds: usize,
    /// Front edges that found no acceptable candidate.
    pub stalled_edges: usize,
    /// Edges with exactly one incident triangle.
    pub boundary_edges: usize,
    /// Boundary loops beyond one outer boundary per connected patch.
    pub holes: usize,
    /// Points whose neighbourhood was too sparse or degenerate for a normal.
    pub degenerate_normals: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reconstruction {
    pub mesh: Mesh,
    pub stats: TriangulationStats,
}

impl Reconstruction {
    pub fn warnings(&self) -> Vec<GeometryWarning> {
        let mut out = Vec::new();
        if self.stats.holes > 0 {
            out.push(GeometryWarning::Holes {
                count: self.stats.holes,
                stalled_edges: self.stats.stalled_edges,
            });
        }
        if self.stats.degenerate_normals > 0 {
            out.push(GeometryWarning::DegenerateNormals {
                points: self.stats.degenerate_normals,
            });
        }
        out
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SurfaceReconstructor
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SurfaceReconstructor {
    params: TriangulationParams,
}

impl SurfaceReconstructor {
    pub fn new(params: TriangulationParams) -> Result<Self, FusionError> {
        params.validate()?;
        Ok(Self { params })
    }

    pub fn params(&self) -> &TriangulationParams {
        &self.params
    }

    /// Triangulate `cloud`. The mesh keeps every input point as a vertex, in
    /// input order.
    pub fn reconstruct(&self, cloud: &[RawPoint]) -> Reconstruction {
        let mut builder = MeshBuilder::new(cloud, &self.params);
        let seeds = builder.run();
        let (boundary_edges, holes) = count_holes(&builder.triangles, cloud.len());

        let stats = TriangulationStats {
            triangles: builder.triangles.len(),
            seeds,
            stalled_edges: builder.stalled,
            boundary_edges,
            holes,
            degenerate_normals: builder.degenerate_normals,
        };
        debug!(
            points = cloud.len(),
            triangles = stats.triangles,
            seeds,
            stalled = stats.stalled_edges,
            holes,
            "triangulation finished"
        );

        Reconstruction {
            mesh: Mesh {
                vertices: cloud.to_vec(),
                triangles: builder.triangles,
            },
            stats,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// MeshBuilder – greedy front propagation
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct EdgeInfo {
    faces: u8,
    /// The triangle that created the edge.
    first_face: usize,
}

struct MeshBuilder<'a> {
    params: &'a TriangulationParams,
    cos_surface: f64,
    pos: Vec<Vector3<f64>>,
    positions: Vec<Point3<f32>>,
    tree: Octree,
    neighbours: Vec<Vec<u32>>,
    /// Distance to the closest non-coincident neighbour.
    nearest: Vec<Option<f64>>,
    normals: Vec<Option<Vector3<f64>>>,
    degenerate_normals: usize,

    triangles: Vec<[u32; 3]>,
    tri_normals: Vec<Vector3<f64>>,
    tri_set: HashSet<[u32; 3]>,
    edges: HashMap<(u32, u32), EdgeInfo>,
    /// Mesh edges per vertex.
    links: Vec<Vec<u32>>,
    has_face: Vec<bool>,
    /// Incident edges with a single triangle.
    boundary_degree: Vec<u32>,
    front: VecDeque<(u32, u32)>,
    stalled: usize,
}

fn edge_key(a: u32, b: u32) -> (u32, u32) {
    if a < b { (a, b) } else { (b, a) }
}

fn sorted(mut tri: [u32; 3]) -> [u32; 3] {
    tri.sort_unstable();
    tri
}

/// The vertex of `tri` that is neither `a` nor `b`.
fn opposite(tri: [u32; 3], a: u32, b: u32) -> u32 {
    tri.into_iter().find(|&v| v != a && v != b).unwrap_or(tri[0])
}

impl<'a> MeshBuilder<'a> {
    fn new(cloud: &[RawPoint], params: &'a TriangulationParams) -> Self {
        let n = cloud.len();
        let positions: Vec<Point3<f32>> = cloud.iter().map(|p| p.position).collect();
        let pos: Vec<Vector3<f64>> = positions.iter().map(|p| p.coords.cast::<f64>()).collect();
        let tree = Octree::from_points(&positions, OCTREE_LEAF_CAPACITY);
        let min_edge = f64::from(MIN_EDGE_LENGTH);

        let mut neighbours = Vec::with_capacity(n);
        let mut nearest = Vec::with_capacity(n);
        for (i, p) in positions.iter().enumerate() {
            let hits: Vec<_> = tree
                .within_radius(p, params.search_radius as f32)
                .into_iter()
                .filter(|h| h.index as usize != i)
                .take(params.max_nearest_neighbors)
                .collect();
            nearest.push(
                hits.iter()
                    .map(|h| f64::from(h.distance_sq).sqrt())
                    .find(|&d| d >= min_edge),
            );
            neighbours.push(hits.into_iter().map(|h| h.index).collect::<Vec<u32>>());
        }

        let global = global_normal(&pos);
        let mut degenerate_normals = 0;
        let normals: Vec<Option<Vector3<f64>>> = (0..n)
            .map(|i| {
                let patch = std::iter::once(i as u32)
                    .chain(neighbours[i].iter().copied())
                    .map(|j| Point3::from(pos[j as usize]));
                let normal = fit_plane(patch).map(|fit| {
                    let n = fit.normal.into_inner();
                    if n.dot(&global) < 0.0 { -n } else { n }
                });
                if normal.is_none() {
                    degenerate_normals += 1;
                }
                normal
            })
            .collect();

        Self {
            params,
            cos_surface: params.max_surface_angle_deg.to_radians().cos(),
            pos,
            positions,
            tree,
            neighbours,
            nearest,
            normals,
            degenerate_normals,
            triangles: Vec::new(),
            tri_normals: Vec::new(),
            tri_set: HashSet::new(),
            edges: HashMap::new(),
            links: vec![Vec::new(); n],
            has_face: vec![false; n],
            boundary_degree: vec![0; n],
            front: VecDeque::new(),
            stalled: 0,
        }
    }

    /// Seed and grow patches until every point has been tried. Returns the
    /// number of seeds.
    fn run(&mut self) -> usize {
        let mut seeds = 0;
        for s in 0..self.pos.len() as u32 {
            if self.has_face[s as usize] || !self.try_seed(s) {
                continue;
            }
            seeds += 1;
            while let Some((a, b)) = self.front.pop_front() {
                self.expand(a, b);
            }
        }
        seeds
    }

    // ── geometry helpers ────────────────────────────────────────────────────

    fn p(&self, i: u32) -> Vector3<f64> {
        self.pos[i as usize]
    }

    fn max_edge(&self, a: u32, b: u32) -> f64 {
        let nn = match (self.nearest[a as usize], self.nearest[b as usize]) {
            (Some(x), Some(y)) => Some(x.min(y)),
            (x, y) => x.or(y),
        };
        nn.map_or(self.params.max_edge_length, |d| {
            self.params.max_edge_length.min(self.params.mu * d)
        })
    }

    fn edge_ok(&self, a: u32, b: u32) -> bool {
        let len = (self.p(b) - self.p(a)).norm();
        len >= f64::from(MIN_EDGE_LENGTH) && len <= self.max_edge(a, b)
    }

    /// Smallest interior angle in degrees, or `None` when any angle falls
    /// outside the configured bounds.
    fn min_angle_within(&self, a: u32, b: u32, c: u32) -> Option<f64> {
        let (pa, pb, pc) = (self.p(a), self.p(b), self.p(c));
        let angle = |at: Vector3<f64>, u: Vector3<f64>, v: Vector3<f64>| (u - at).angle(&(v - at)).to_degrees();
        let angles = [angle(pa, pb, pc), angle(pb, pc, pa), angle(pc, pa, pb)];
        angles
            .iter()
            .all(|x| x.is_finite() && *x >= self.params.min_angle_deg && *x <= self.params.max_angle_deg)
            .then(|| angles.into_iter().fold(f64::INFINITY, f64::min))
    }

    fn raw_normal(&self, a: u32, b: u32, c: u32) -> Option<Vector3<f64>> {
        (self.p(b) - self.p(a))
            .cross(&(self.p(c) - self.p(a)))
            .try_normalize(1e-12)
    }

    /// Signed side of `q` relative to edge `a → b` within the plane of `n`.
    fn side(&self, n: &Vector3<f64>, a: u32, b: u32, q: u32) -> f64 {
        n.cross(&(self.p(b) - self.p(a))).dot(&(self.p(q) - self.p(a)))
    }

    fn completed(&self, v: u32) -> bool {
        self.has_face[v as usize] && self.boundary_degree[v as usize] == 0
    }

    fn vertex_normal_ok(&self, v: u32, tri_normal: &Vector3<f64>) -> bool {
        self.normals[v as usize].is_none_or(|n| n.dot(tri_normal).abs() >= self.cos_surface)
    }

    /// Twice the signed area of `p, q, r` projected along `n`.
    fn orient(&self, n: &Vector3<f64>, p: u32, q: u32, r: u32) -> f64 {
        n.dot(&(self.p(q) - self.p(p)).cross(&(self.p(r) - self.p(p))))
    }

    /// Points close enough to `a` to interfere with a triangle on it.
    fn local(&self, a: u32) -> Vec<u32> {
        let reach = 2.0 * self.params.max_edge_length;
        self.tree
            .within_radius(&self.positions[a as usize], reach as f32)
            .into_iter()
            .map(|h| h.index)
            .collect()
    }

    /// Whether `tri`, projected along `n`, covers a point of `local` or
    /// crosses a mesh edge leaving one.
    fn overlaps(&self, tri: [u32; 3], n: &Vector3<f64>, local: &[u32]) -> bool {
        let sides = [(tri[0], tri[1]), (tri[1], tri[2]), (tri[2], tri[0])];
        let scale = sides
            .iter()
            .map(|&(x, y)| (self.p(y) - self.p(x)).norm_squared())
            .fold(0.0, f64::max);
        let eps = 1e-9 * scale;
        let winding = self.orient(n, tri[0], tri[1], tri[2]).signum();
        let reach = 2.0 * self.params.max_edge_length;
        let min_edge = f64::from(MIN_EDGE_LENGTH);

        let nearby: Vec<u32> = local
            .iter()
            .copied()
            .filter(|&q| n.dot(&(self.p(q) - self.p(tri[0]))).abs() <= reach)
            .collect();

        let covers = nearby.iter().any(|&q| {
            let on_vertex = tri
                .iter()
                .any(|&v| q == v || (self.p(q) - self.p(v)).norm() < min_edge);
            !on_vertex
                && sides
                    .iter()
                    .all(|&(x, y)| winding * self.orient(n, x, y, q) >= -eps)
        });
        if covers {
            return true;
        }

        nearby.iter().any(|&q| {
            self.links[q as usize].iter().any(|&r| {
                sides.iter().any(|&(x, y)| {
                    if [x, y].contains(&q) || [x, y].contains(&r) {
                        return false;
                    }
                    let d = [
                        self.orient(n, x, y, q),
                        self.orient(n, x, y, r),
                        self.orient(n, q, r, x),
                        self.orient(n, q, r, y),
                    ];
                    d.iter().all(|v| v.abs() > eps)
                        && (d[0] > 0.0) != (d[1] > 0.0)
                        && (d[2] > 0.0) != (d[3] > 0.0)
                })
            })
        })
    }

    /// Candidate third vertices around edge `a, b`, ascending.
    fn candidates(&self, a: u32, b: u32) -> Vec<u32> {
        let mut c: Vec<u32> = self.neighbours[a as usize]
            .iter()
            .chain(&self.neighbours[b as usize])
            .copied()
            .filter(|&c| c != a && c != b)
            .collect();
        c.sort_unstable();
        c.dedup();
        c
    }

    /// Whether edge `x, c` may take a triangle whose third vertex is `y`.
    fn new_edge_ok(&self, x: u32, c: u32, y: u32) -> bool {
        match self.edges.get(&edge_key(x, c)) {
            None => true,
            Some(info) if info.faces >= 2 => false,
            Some(info) => {
                let o = opposite(self.triangles[info.first_face], x, c);
                let n = self.tri_normals[info.first_face];
                self.side(&n, x, c, o) * self.side(&n, x, c, y) < 0.0
            }
        }
    }

    // ── growth ──────────────────────────────────────────────────────────────

    fn try_seed(&mut self, s: u32) -> bool {
        let Some(seed_normal) = self.normals[s as usize] else {
            return false;
        };

        let mut local: Option<Vec<u32>> = None;
        let ring = self.neighbours[s as usize].clone();
        for b in ring {
            if self.has_face[b as usize] || !self.edge_ok(s, b) {
                continue;
            }
            let mut best: Option<(f64, u32)> = None;
            for c in self.candidates(s, b) {
                if self.has_face[c as usize] || !self.edge_ok(s, c) || !self.edge_ok(b, c) {
                    continue;
                }
                let Some(score) = self.min_angle_within(s, b, c) else {
                    continue;
                };
                let Some(n) = self.raw_normal(s, b, c) else {
                    continue;
                };
                if n.dot(&seed_normal).abs() < self.cos_surface || !self.vertex_normal_ok(c, &n) {
                    continue;
                }
                if best.is_none_or(|(best_score, _)| score > best_score) {
                    let local = local.get_or_insert_with(|| self.local(s));
                    if self.overlaps([s, b, c], &n, local) {
                        continue;
                    }
                    best = Some((score, c));
                }
            }
            if let Some((_, c)) = best {
                self.add_triangle(s, b, c, seed_normal);
                return true;
            }
        }
        false
    }

    fn expand(&mut self, a: u32, b: u32) {
        let Some(info) = self.edges.get(&edge_key(a, b)).copied() else {
            return;
        };
        if info.faces != 1 {
            return;
        }
        let o = opposite(self.triangles[info.first_face], a, b);
        let n_old = self.tri_normals[info.first_face];
        let side_o = self.side(&n_old, a, b, o);

        let mut local: Option<Vec<u32>> = None;
        let mut best: Option<(f64, u32)> = None;
        for c in self.candidates(a, b) {
            if c == o || self.completed(c) || !self.edge_ok(a, c) || !self.edge_ok(b, c) {
                continue;
            }
            if self.tri_set.contains(&sorted([a, b, c])) {
                continue;
            }
            if self.side(&n_old, a, b, c) * side_o >= 0.0 {
                continue;
            }
            if !self.new_edge_ok(a, c, b) || !self.new_edge_ok(b, c, a) {
                continue;
            }
            let Some(score) = self.min_angle_within(a, b, c) else {
                continue;
            };
            let Some(mut n) = self.raw_normal(a, b, c) else {
                continue;
            };
            if n.dot(&n_old) < 0.0 {
                n = -n;
            }
            if n.dot(&n_old) < self.cos_surface || !self.vertex_normal_ok(c, &n) {
                continue;
            }
            if best.is_none_or(|(best_score, _)| score > best_score) {
                let local = local.get_or_insert_with(|| self.local(a));
                if self.overlaps([a, b, c], &n, local) {
                    continue;
                }
                best = Some((score, c));
            }
        }

        match best {
            Some((_, c)) => self.add_triangle(a, b, c, n_old),
            None => self.stalled += 1,
        }
    }

    /// Record triangle `a, b, c`, wound so its normal agrees with `reference`.
    fn add_triangle(&mut self, a: u32, b: u32, c: u32, reference: Vector3<f64>) {
        let Some(n) = self.raw_normal(a, b, c) else {
            return;
        };
        let (tri, n) = if n.dot(&reference) < 0.0 {
            ([a, c, b], -n)
        } else {
            ([a, b, c], n)
        };

        let face = self.triangles.len();
        self.triangles.push(tri);
        self.tri_normals.push(n);
        self.tri_set.insert(sorted(tri));

        for (x, y) in [(tri[0], tri[1]), (tri[1], tri[2]), (tri[2], tri[0])] {
            let info = self.edges.entry(edge_key(x, y)).or_insert(EdgeInfo {
                faces: 0,
                first_face: face,
            });
            info.faces += 1;
            match info.faces {
                1 => {
                    self.boundary_degree[x as usize] += 1;
                    self.boundary_degree[y as usize] += 1;
                    self.links[x as usize].push(y);
                    self.links[y as usize].push(x);
                    self.front.push_back((x, y));
                }
                2 => {
                    self.boundary_degree[x as usize] -= 1;
                    self.boundary_degree[y as usize] -= 1;
                }
                _ => {}
            }
            self.has_face[x as usize] = true;
        }
    }
}

/// Normal of the plane through all points, flipped so its dominant component
/// is positive. Falls back to +Z.
fn global_normal(pos: &[Vector3<f64>]) -> Vector3<f64> {
    let finite = pos
        .iter()
        .filter(|p| p.iter().all(|c| c.is_finite()))
        .map(|p| Point3::from(*p));
    match fit_plane(finite) {
        Some(fit) => {
            let n = fit.normal.into_inner();
            if n[fit.dominant_axis()] < 0.0 { -n } else { n }
        }
        None => Vector3::z(),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Hole counting
// ────────────────────────────────────────────────────────────────────────────

struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent[ra] = rb;
        }
    }

    fn roots(&mut self, members: impl IntoIterator<Item = usize>) -> usize {
        let roots: HashSet<usize> = members.into_iter().map(|m| self.find(m)).collect();
        roots.len()
    }
}

/// `(boundary edge count, hole count)` of a triangle set.
///
/// Each connected patch has one outer boundary loop; any further loop is a
/// hole.
fn count_holes(triangles: &[[u32; 3]], vertex_count: usize) -> (usize, usize) {
    let mut faces: HashMap<(u32, u32), u32> = HashMap::new();
    let mut patches = DisjointSet::new(vertex_count);
    let mut used = HashSet::new();
    for tri in triangles {
        for k in 0..3 {
            let (x, y) = (tri[k], tri[(k + 1) % 3]);
            *faces.entry(edge_key(x, y)).or_default() += 1;
            patches.union(x as usize, y as usize);
            used.insert(x as usize);
        }
    }

    let mut loops = DisjointSet::new(vertex_count);
    let mut on_boundary = HashSet::new();
    let mut boundary_edges = 0;
    for (&(x, y), _) in faces.iter().filter(|(_, n)| **n == 1) {
        boundary_edges += 1;
        loops.union(x as usize, y as usize);
        on_boundary.insert(x as usize);
        on_boundary.insert(y as usize);
    }

    let loop_count = loops.roots(on_boundary);
    let patch_count = patches.roots(used);
    (boundary_edges, loop_count.saturating_sub(patch_count))
}
