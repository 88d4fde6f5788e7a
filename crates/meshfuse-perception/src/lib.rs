//! `meshfuse-perception` – geometry of the fusion pipeline.
//!
//! Turns many posed keyframe clouds into one fused cloud and then into a
//! trimmed triangle surface.
//!
//! # Modules
//!
//! - [`transform`] – [`FrameTransformer`][transform::FrameTransformer]:
//!   maps a keyframe's local cloud into the global map frame.
//! - [`accumulator`] – [`Accumulator`][accumulator::Accumulator]: weighted
//!   voxel grid that fuses coincident observations by running averages.
//! - [`voxel`] – [`VoxelFilter`][voxel::VoxelFilter]: one averaged point per
//!   occupied voxel.
//! - [`plane`] – least-squares plane fitting used for normals and for the
//!   contour's projection plane.
//! - [`contour`] – [`ContourExtractor`][contour::ContourExtractor]: planar
//!   boundary of the fused footprint, used as a trimming mask.
//! - [`octree`] – [`Octree`][octree::Octree]: spatial index answering the
//!   radius queries of the triangulation.
//! - [`surface`] – [`SurfaceReconstructor`][surface::SurfaceReconstructor]:
//!   greedy triangulation of the filtered cloud.

pub mod accumulator;
pub mod contour;
pub mod octree;
pub mod plane;
pub mod surface;
pub mod transform;
pub mod voxel;

pub use accumulator::Accumulator;
pub use contour::{BoundaryContour, ContourExtractor, ProjectionPlane};
pub use surface::{Reconstruction, SurfaceReconstructor, TriangulationParams, TriangulationStats};
pub use transform::FrameTransformer;
pub use voxel::{VoxelFilter, VoxelKey};
