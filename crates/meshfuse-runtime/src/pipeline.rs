//! [`ReconstructionPipeline`] – fuse posed keyframe clouds into one mesh.
//!
//! A run is strictly sequential:
//!
//! 1. **Load poses** – every keyframe pose from the lock-protected log.
//! 2. **Fuse** – each keyframe's cloud is loaded, moved into the map frame and
//!    folded into the weighted voxel [`Accumulator`]. A missing cloud aborts
//!    the run.
//! 3. **Filter** – one averaged point per voxel.
//! 4. **Trim** – points outside the footprint contour are discarded.
//! 5. **Triangulate** – greedy surface reconstruction.
//! 6. **Persist** – mesh, fused cloud and report are staged as temporary
//!    files and only moved into place once all of them were written.
//!
//! # Example
//!
//! ```rust,no_run
//! use meshfuse_runtime::{PipelineConfig, ReconstructionPipeline};
//!
//! let config = PipelineConfig::new("/data/run");
//! let report = ReconstructionPipeline::new(config)?.run()?;
//! println!("{} triangles", report.triangles);
//! # Ok::<(), meshfuse_types::FusionError>(())
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use meshfuse_io::store::{DEFAULT_LOG_NAME, DEFAULT_MARKER_NAME};
use meshfuse_io::writer::{write_pcd, write_ply};
use meshfuse_io::{CloudSource, LockPolicy, MeshFormat, PcdDirectory, PoseGraphStore, PoseLogSchema, StagedFile};
use meshfuse_perception::{
    Accumulator, ContourExtractor, FrameTransformer, ProjectionPlane, SurfaceReconstructor, TriangulationParams,
    VoxelFilter,
};
use meshfuse_types::{FusionError, KeyframePose};
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

use crate::report::RunReport;

/// Mesh output file name.
pub const MESH_FILE: &str = "mesh.ply";
/// Fused cloud output file name.
pub const FUSED_CLOUD_FILE: &str = "fused_cloud.pcd";
/// Run report file name.
pub const REPORT_FILE: &str = "report.json";

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Configuration bundle for [`ReconstructionPipeline`].
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Directory holding the pose-graph log and its lock marker.
    pub work_dir: PathBuf,
    /// Directory holding `<keyframe>.pcd` clouds.
    pub clouds_dir: PathBuf,
    /// Directory the outputs are written to. Created on success if missing.
    pub output_dir: PathBuf,
    pub graph_file: String,
    pub lock_file: String,
    pub lock: LockPolicy,
    pub schema: PoseLogSchema,
    /// Edge of the fusion and filter voxels, in metres.
    pub voxel_size: f64,
    /// Edge of the contour occupancy cells, in metres.
    pub contour_resolution: f64,
    pub contour_projection: ProjectionPlane,
    pub triangulation: TriangulationParams,
    pub mesh_format: MeshFormat,
    pub write_fused_cloud: bool,
}

impl PipelineConfig {
    /// Defaults rooted at `work_dir`: clouds in `<work_dir>/clouds`, outputs
    /// in `<work_dir>/output`.
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        let work_dir = work_dir.into();
        Self {
            clouds_dir: work_dir.join("clouds"),
            output_dir: work_dir.join("output"),
            work_dir,
            graph_file: DEFAULT_LOG_NAME.to_string(),
            lock_file: DEFAULT_MARKER_NAME.to_string(),
            lock: LockPolicy::default(),
            schema: PoseLogSchema::default(),
            voxel_size: 0.02,
            contour_resolution: 0.1,
            contour_projection: ProjectionPlane::Auto,
            triangulation: TriangulationParams::default(),
            mesh_format: MeshFormat::Ascii,
            write_fused_cloud: true,
        }
    }

    /// Reject settings no run could succeed with.
    pub fn validate(&self) -> Result<(), FusionError> {
        VoxelFilter::new(self.voxel_size)?;
        ContourExtractor::new(self.contour_resolution)?;
        self.triangulation.validate()?;
        if self.graph_file.is_empty() || self.lock_file.is_empty() {
            return Err(FusionError::Config("graph_file and lock_file must be non-empty".into()));
        }
        if self.graph_file == self.lock_file {
            return Err(FusionError::Config(format!(
                "lock_file must differ from graph_file (both `{}`)",
                self.graph_file
            )));
        }
        Ok(())
    }

    fn store(&self) -> PoseGraphStore {
        PoseGraphStore::with_file_names(&self.work_dir, &self.graph_file, &self.lock_file)
            .with_schema(self.schema)
            .with_lock_policy(self.lock)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ReconstructionPipeline
// ─────────────────────────────────────────────────────────────────────────────

/// One configured reconstruction job over a [`CloudSource`].
pub struct ReconstructionPipeline<S> {
    config: PipelineConfig,
    store: PoseGraphStore,
    source: S,
}

impl ReconstructionPipeline<PcdDirectory> {
    /// Pipeline reading clouds from `config.clouds_dir`.
    pub fn new(config: PipelineConfig) -> Result<Self, FusionError> {
        let source = PcdDirectory::new(&config.clouds_dir);
        Self::with_source(config, source)
    }
}

impl<S: CloudSource> ReconstructionPipeline<S> {
    pub fn with_source(config: PipelineConfig, source: S) -> Result<Self, FusionError> {
        config.validate()?;
        Ok(Self {
            store: config.store(),
            config,
            source,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run every stage and persist the outputs.
    pub fn run(&self) -> Result<RunReport, FusionError> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let _run = info_span!("reconstruction", %run_id).entered();

        let log = {
            let _stage = info_span!("load_poses").entered();
            self.store.load_all()?
        };

        let accumulator = {
            let _stage = info_span!("fuse", keyframes = log.poses.len()).entered();
            self.fuse(&log.poses)?
        };
        if accumulator.is_empty() {
            return Err(FusionError::EmptyCloud);
        }

        let filtered = {
            let _stage = info_span!("filter", voxel_size = self.config.voxel_size).entered();
            let filtered = VoxelFilter::new(self.config.voxel_size)?.filter(&accumulator.to_cloud());
            info!(cells = accumulator.len(), points = filtered.len(), "voxel filter applied");
            filtered
        };

        let (contour, trimmed) = {
            let _stage = info_span!("trim", resolution = self.config.contour_resolution).entered();
            let contour = ContourExtractor::new(self.config.contour_resolution)?
                .with_plane(self.config.contour_projection)
                .extract(&filtered);
            let trimmed = contour.trim(&filtered);
            info!(
                plane = ?contour.plane(),
                loops = contour.loops().len(),
                kept = trimmed.len(),
                dropped = filtered.len() - trimmed.len(),
                "footprint trimmed"
            );
            (contour, trimmed)
        };
        if trimmed.is_empty() {
            return Err(FusionError::EmptyCloud);
        }

        let reconstruction = {
            let _stage = info_span!("triangulate", points = trimmed.len()).entered();
            let reconstruction = SurfaceReconstructor::new(self.config.triangulation)?.reconstruct(&trimmed);
            info!(
                triangles = reconstruction.mesh.triangles.len(),
                holes = reconstruction.stats.holes,
                "surface reconstructed"
            );
            reconstruction
        };

        let warnings: Vec<_> = contour.warning().into_iter().chain(reconstruction.warnings()).collect();
        for w in &warnings {
            warn!(warning = %w, "geometry warning");
        }

        let mut report = RunReport {
            run_id,
            started_at,
            finished_at: started_at,
            keyframes: log.poses.len(),
            skipped_records: log.skipped.iter().map(ToString::to_string).collect(),
            rejected_points: accumulator.rejected(),
            accumulated_cells: accumulator.len(),
            filtered_points: filtered.len(),
            trimmed_points: trimmed.len(),
            projection_plane: contour.plane(),
            contour_loops: contour.loops().len(),
            vertices: reconstruction.mesh.vertices.len(),
            triangles: reconstruction.mesh.triangles.len(),
            triangulation: reconstruction.stats,
            warnings,
            outputs: Vec::new(),
        };

        let _stage = info_span!("persist", dir = %self.config.output_dir.display()).entered();
        self.persist(&reconstruction.mesh, &trimmed, &mut report)?;
        info!(outputs = report.outputs.len(), "run complete");
        Ok(report)
    }

    /// Load, transform and integrate every keyframe cloud.
    pub fn fuse(&self, poses: &[KeyframePose]) -> Result<Accumulator, FusionError> {
        let mut accumulator = Accumulator::new(self.config.voxel_size)?;
        for pose in poses {
            let cloud = self.source.load(pose)?;
            accumulator.integrate(FrameTransformer::new(pose).apply(&cloud));
            debug!(keyframe = %pose.name, points = cloud.len(), cells = accumulator.len(), "keyframe integrated");
        }
        info!(
            keyframes = poses.len(),
            cells = accumulator.len(),
            rejected = accumulator.rejected(),
            "keyframes fused"
        );
        Ok(accumulator)
    }

    /// Stage every output, then commit them together. When a commit fails
    /// the outputs already moved into place are removed again.
    fn persist(
        &self,
        mesh: &meshfuse_types::Mesh,
        cloud: &[meshfuse_types::RawPoint],
        report: &mut RunReport,
    ) -> Result<(), FusionError> {
        let dir = &self.config.output_dir;
        fs::create_dir_all(dir).map_err(|e| FusionError::io(dir, e))?;

        let mut staged = vec![StagedFile::stage(dir.join(MESH_FILE), |w| {
            write_ply(mesh, self.config.mesh_format, w)
        })?];
        if self.config.write_fused_cloud {
            staged.push(StagedFile::stage(dir.join(FUSED_CLOUD_FILE), |w| write_pcd(cloud, w))?);
        }

        report.outputs = output_paths(&self.config);
        report.finished_at = Utc::now();
        staged.push(StagedFile::stage(dir.join(REPORT_FILE), |w| report.write_json(w))?);

        let mut committed: Vec<PathBuf> = Vec::with_capacity(staged.len());
        for file in staged {
            match file.commit() {
                Ok(path) => {
                    debug!(path = %path.display(), "output committed");
                    committed.push(path);
                }
                Err(e) => {
                    for path in &committed {
                        if let Err(cleanup) = fs::remove_file(path) {
                            warn!(path = %path.display(), error = %cleanup, "could not roll back output");
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

/// Output file paths a run with `config` produces.
pub fn output_paths(config: &PipelineConfig) -> Vec<PathBuf> {
    let dir: &Path = &config.output_dir;
    let mut out = vec![dir.join(MESH_FILE)];
    if config.write_fused_cloud {
        out.push(dir.join(FUSED_CLOUD_FILE));
    }
    out.push(dir.join(REPORT_FILE));
    out
}
