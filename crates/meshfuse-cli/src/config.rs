//! Run configuration – reads/writes `meshfuse.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use meshfuse_io::{LockPolicy, MeshFormat, PoseLogSchema};
use meshfuse_io::store::{DEFAULT_LOG_NAME, DEFAULT_MARKER_NAME};
use meshfuse_perception::{ProjectionPlane, TriangulationParams};
use meshfuse_runtime::PipelineConfig;

/// File looked up in the current directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "meshfuse.toml";

/// How the pose-log marker is polled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockSection {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Unset waits for the marker forever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Default for LockSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            timeout_ms: None,
        }
    }
}

/// Persisted run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the pose-graph log and lock marker.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Defaults to `<work_dir>/clouds`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clouds_dir: Option<PathBuf>,

    /// Defaults to `<work_dir>/output`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,

    #[serde(default = "default_graph_file")]
    pub graph_file: String,

    #[serde(default = "default_lock_file")]
    pub lock_file: String,

    /// Fusion and filter voxel edge, in metres.
    #[serde(default = "default_voxel_size")]
    pub voxel_size: f64,

    /// Footprint grid cell edge, in metres.
    #[serde(default = "default_contour_resolution")]
    pub contour_resolution: f64,

    #[serde(default)]
    pub contour_projection: ProjectionPlane,

    #[serde(default)]
    pub mesh_format: MeshFormat,

    #[serde(default = "default_write_fused_cloud")]
    pub write_fused_cloud: bool,

    #[serde(default)]
    pub lock: LockSection,

    #[serde(default)]
    pub triangulation: TriangulationParams,

    #[serde(default)]
    pub schema: PoseLogSchema,
}

fn default_work_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_graph_file() -> String {
    DEFAULT_LOG_NAME.to_string()
}
fn default_lock_file() -> String {
    DEFAULT_MARKER_NAME.to_string()
}
fn default_voxel_size() -> f64 {
    0.02
}
fn default_contour_resolution() -> f64 {
    0.1
}
fn default_write_fused_cloud() -> bool {
    true
}
fn default_poll_interval_ms() -> u64 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            clouds_dir: None,
            output_dir: None,
            graph_file: default_graph_file(),
            lock_file: default_lock_file(),
            voxel_size: default_voxel_size(),
            contour_resolution: default_contour_resolution(),
            contour_projection: ProjectionPlane::default(),
            mesh_format: MeshFormat::default(),
            write_fused_cloud: default_write_fused_cloud(),
            lock: LockSection::default(),
            triangulation: TriangulationParams::default(),
            schema: PoseLogSchema::default(),
        }
    }
}

impl Config {
    /// Resolve derived directories and build the runtime configuration.
    pub fn into_pipeline_config(self) -> PipelineConfig {
        let mut pipeline = PipelineConfig::new(&self.work_dir);
        if let Some(dir) = self.clouds_dir {
            pipeline.clouds_dir = dir;
        }
        if let Some(dir) = self.output_dir {
            pipeline.output_dir = dir;
        }
        pipeline.graph_file = self.graph_file;
        pipeline.lock_file = self.lock_file;
        pipeline.lock = LockPolicy {
            poll_interval: Duration::from_millis(self.lock.poll_interval_ms),
            timeout: self.lock.timeout_ms.map(Duration::from_millis),
        };
        pipeline.schema = self.schema;
        pipeline.voxel_size = self.voxel_size;
        pipeline.contour_resolution = self.contour_resolution;
        pipeline.contour_projection = self.contour_projection;
        pipeline.triangulation = self.triangulation;
        pipeline.mesh_format = self.mesh_format;
        pipeline.write_fused_cloud = self.write_fused_cloud;
        pipeline
    }
}

/// Load the config from `path` and apply environment overrides.
/// Returns `None` if the file does not exist.
pub fn load(path: &Path) -> Result<Option<Config>, String> {
    let mut cfg = load_from(path)?;
    if let Some(cfg) = cfg.as_mut() {
        apply_env_overrides(cfg);
    }
    Ok(cfg)
}

/// Parse the config at `path` without environment overrides.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: Config = toml::from_str(&raw)
        .map_err(|e| format!("Failed to parse config at {}: {}", path.display(), e))?;
    Ok(Some(cfg))
}

/// Apply `MESHFUSE_*` environment variable overrides to `cfg`.
///
/// Supported variables:
///
/// | Variable | Config field |
/// |---|---|
/// | `MESHFUSE_WORK_DIR` | `work_dir` |
/// | `MESHFUSE_CLOUDS_DIR` | `clouds_dir` |
/// | `MESHFUSE_OUTPUT_DIR` | `output_dir` |
/// | `MESHFUSE_VOXEL_SIZE` | `voxel_size` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("MESHFUSE_WORK_DIR") {
        cfg.work_dir = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("MESHFUSE_CLOUDS_DIR") {
        cfg.clouds_dir = Some(PathBuf::from(v));
    }
    if let Ok(v) = std::env::var("MESHFUSE_OUTPUT_DIR") {
        cfg.output_dir = Some(PathBuf::from(v));
    }
    if let Ok(v) = std::env::var("MESHFUSE_VOXEL_SIZE")
        && let Ok(size) = v.parse::<f64>()
    {
        cfg.voxel_size = size;
    }
}

/// Write `cfg` to `path`, creating parent directories as needed.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_default_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("nested").join(DEFAULT_CONFIG_FILE);

        let cfg = Config::default();
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let result = load_from(&dir.path().join(DEFAULT_CONFIG_FILE)).expect("no error");
        assert!(result.is_none());
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        fs::write(
            &path,
            r#"
work_dir = "/data/run"
contour_projection = "xz"

[lock]
timeout_ms = 500

[triangulation]
max_edge_length = 0.3
"#,
        )
        .expect("write");

        let cfg = load_from(&path).expect("load ok").expect("some");
        assert_eq!(cfg.work_dir, PathBuf::from("/data/run"));
        assert_eq!(cfg.contour_projection, ProjectionPlane::Xz);
        assert_eq!(cfg.voxel_size, 0.02);
        assert_eq!(cfg.lock.poll_interval_ms, 10);
        assert_eq!(cfg.lock.timeout_ms, Some(500));
        assert_eq!(cfg.triangulation.max_edge_length, 0.3);
        assert_eq!(cfg.triangulation.mu, 2.5);
        assert_eq!(cfg.schema, PoseLogSchema::default());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        fs::write(&path, "voxel_size = \"big\"\n").expect("write");
        let err = load_from(&path).expect_err("bad type");
        assert!(err.contains("Failed to parse config"), "{err}");
    }

    #[test]
    fn pipeline_config_derives_directories_from_work_dir() {
        let cfg = Config {
            work_dir: PathBuf::from("/data/run"),
            ..Config::default()
        };
        let pipeline = cfg.into_pipeline_config();
        assert_eq!(pipeline.clouds_dir, PathBuf::from("/data/run/clouds"));
        assert_eq!(pipeline.output_dir, PathBuf::from("/data/run/output"));
        assert_eq!(pipeline.lock.timeout, None);
        assert_eq!(pipeline.lock.poll_interval, Duration::from_millis(10));
        assert!(pipeline.validate().is_ok());
    }

    #[test]
    fn pipeline_config_keeps_explicit_settings() {
        let cfg = Config {
            work_dir: PathBuf::from("/data/run"),
            clouds_dir: Some(PathBuf::from("/mnt/clouds")),
            output_dir: Some(PathBuf::from("/mnt/out")),
            voxel_size: 0.05,
            mesh_format: MeshFormat::Binary,
            write_fused_cloud: false,
            lock: LockSection {
                poll_interval_ms: 1,
                timeout_ms: Some(2_000),
            },
            ..Config::default()
        };
        let pipeline = cfg.into_pipeline_config();
        assert_eq!(pipeline.clouds_dir, PathBuf::from("/mnt/clouds"));
        assert_eq!(pipeline.output_dir, PathBuf::from("/mnt/out"));
        assert_eq!(pipeline.voxel_size, 0.05);
        assert_eq!(pipeline.mesh_format, MeshFormat::Binary);
        assert!(!pipeline.write_fused_cloud);
        assert_eq!(pipeline.lock.timeout, Some(Duration::from_secs(2)));
    }

    #[test]
    fn apply_env_overrides_changes_work_dir() {
        // SAFETY: no other test touches this variable.
        unsafe { std::env::set_var("MESHFUSE_WORK_DIR", "/robot/session") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.work_dir, PathBuf::from("/robot/session"));
        unsafe { std::env::remove_var("MESHFUSE_WORK_DIR") };
    }

    #[test]
    fn apply_env_overrides_changes_output_dirs() {
        // SAFETY: no other test touches these variables.
        unsafe {
            std::env::set_var("MESHFUSE_CLOUDS_DIR", "/robot/clouds");
            std::env::set_var("MESHFUSE_OUTPUT_DIR", "/robot/out");
        }
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.clouds_dir, Some(PathBuf::from("/robot/clouds")));
        assert_eq!(cfg.output_dir, Some(PathBuf::from("/robot/out")));
        unsafe {
            std::env::remove_var("MESHFUSE_CLOUDS_DIR");
            std::env::remove_var("MESHFUSE_OUTPUT_DIR");
        }
    }

    #[test]
    fn apply_env_overrides_voxel_size_ignores_garbage() {
        // SAFETY: no other test touches this variable.
        unsafe { std::env::set_var("MESHFUSE_VOXEL_SIZE", "0.5") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.voxel_size, 0.5);

        unsafe { std::env::set_var("MESHFUSE_VOXEL_SIZE", "fine") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.voxel_size, 0.02);
        unsafe { std::env::remove_var("MESHFUSE_VOXEL_SIZE") };
    }
}
