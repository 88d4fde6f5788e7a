//! `meshfuse-runtime` – the reconstruction run.
//!
//! Wires the store, loaders and geometry stages into one run-to-completion
//! batch job.
//!
//! # Modules
//!
//! - [`pipeline`] – [`ReconstructionPipeline`][pipeline::ReconstructionPipeline]:
//!   load poses → fuse keyframe clouds → voxel filter → contour trim →
//!   triangulate → persist. Configured by
//!   [`PipelineConfig`][pipeline::PipelineConfig].
//! - [`report`] – [`RunReport`][report::RunReport]: counts, timestamps and
//!   geometry warnings of a run, persisted as `report.json`.
//!
//! Nothing is written to the output directory unless every stage succeeds.

pub mod pipeline;
pub mod report;

pub use pipeline::{FUSED_CLOUD_FILE, MESH_FILE, PipelineConfig, REPORT_FILE, ReconstructionPipeline, output_paths};
pub use report::RunReport;
