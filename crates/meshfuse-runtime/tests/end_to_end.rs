//! Full runs over a temporary working directory.

use std::fs;
use std::path::Path;
use std::time::Duration;

use meshfuse_io::cloud::parse_pcd;
use meshfuse_io::writer::write_pcd;
use meshfuse_perception::TriangulationParams;
use meshfuse_runtime::{FUSED_CLOUD_FILE, MESH_FILE, PipelineConfig, REPORT_FILE, ReconstructionPipeline, RunReport};
use meshfuse_types::{FusionError, RawPoint, Rgb};

const LOCAL_SQUARE: [(f32, f32); 4] = [(0.5, 0.5), (1.5, 0.5), (0.5, 1.5), (1.5, 1.5)];

fn keyframe_cloud(colors: [Rgb; 4]) -> Vec<RawPoint> {
    LOCAL_SQUARE
        .iter()
        .zip(colors)
        .map(|(&(x, y), c)| RawPoint::new(x, y, 0.0, c))
        .collect()
}

fn k1() -> Vec<RawPoint> {
    keyframe_cloud([
        Rgb::new(200, 0, 0),
        Rgb::new(100, 0, 0),
        Rgb::new(0, 200, 0),
        Rgb::new(0, 100, 0),
    ])
}

fn k2() -> Vec<RawPoint> {
    keyframe_cloud([
        Rgb::new(0, 0, 200),
        Rgb::new(0, 0, 100),
        Rgb::new(50, 50, 50),
        Rgb::new(10, 10, 10),
    ])
}

const K1_RECORD: &str = "0,K1,0,0,0,0.0,0.0,0.0,0,0,0,1";
const K2_RECORD: &str = "1,K2,0,0,0,1.0,0.0,0.0,0,0,0,1";

fn write_cloud(dir: &Path, name: &str, points: &[RawPoint]) {
    let mut bytes = Vec::new();
    write_pcd(points, &mut bytes).expect("encode pcd");
    fs::write(dir.join(format!("{name}.pcd")), bytes).expect("write pcd");
}

/// Working directory with a pose log of `records` and clouds for `clouds`.
fn scene(records: &[&str], clouds: &[(&str, Vec<RawPoint>)]) -> (tempfile::TempDir, PipelineConfig) {
    let dir = tempfile::tempdir().expect("tmp dir");
    let mut log = records.join("\n");
    log.push('\n');
    fs::write(dir.path().join("graph_vertices.txt"), log).expect("write log");

    let clouds_dir = dir.path().join("clouds");
    fs::create_dir(&clouds_dir).expect("clouds dir");
    for (name, points) in clouds {
        write_cloud(&clouds_dir, name, points);
    }

    let config = PipelineConfig {
        voxel_size: 1.0,
        contour_resolution: 1.0,
        triangulation: TriangulationParams {
            search_radius: 1.5,
            max_edge_length: 1.5,
            ..TriangulationParams::default()
        },
        ..PipelineConfig::new(dir.path())
    };
    (dir, config)
}

fn read_fused(config: &PipelineConfig) -> Vec<RawPoint> {
    let path = config.output_dir.join(FUSED_CLOUD_FILE);
    let bytes = fs::read(&path).expect("fused cloud written");
    parse_pcd(&bytes, &path).expect("fused cloud parses")
}

#[test]
fn two_overlapping_keyframes_fuse_to_union_with_mean_colors() {
    let (_dir, config) = scene(&[K1_RECORD, K2_RECORD], &[("K1", k1()), ("K2", k2())]);

    let report = ReconstructionPipeline::new(config.clone())
        .expect("pipeline")
        .run()
        .expect("run succeeds");

    assert_eq!(report.keyframes, 2);
    assert_eq!(report.accumulated_cells, 6);
    assert_eq!(report.filtered_points, 6);
    assert_eq!(report.trimmed_points, 6);
    assert_eq!(report.contour_loops, 1);
    assert!(report.skipped_records.is_empty());

    let fused = read_fused(&config);
    assert_eq!(fused.len(), 6);

    // Cells in ascending (x, y, z) order: x=0 column, overlap column x=1, x=2 column.
    let expected = [
        ((0.5, 0.5), Rgb::new(200, 0, 0)),
        ((0.5, 1.5), Rgb::new(0, 200, 0)),
        ((1.5, 0.5), Rgb::new(50, 0, 100)),
        ((1.5, 1.5), Rgb::new(25, 75, 25)),
        ((2.5, 0.5), Rgb::new(0, 0, 100)),
        ((2.5, 1.5), Rgb::new(10, 10, 10)),
    ];
    for (point, ((x, y), color)) in fused.iter().zip(expected) {
        assert!((point.position.x - x).abs() < 1e-5, "{point:?}");
        assert!((point.position.y - y).abs() < 1e-5, "{point:?}");
        assert_eq!(point.color, color, "{point:?}");
    }
}

#[test]
fn successful_run_writes_mesh_cloud_and_report() {
    let (dir, config) = scene(&[K1_RECORD, K2_RECORD], &[("K1", k1()), ("K2", k2())]);
    let report = ReconstructionPipeline::new(config.clone())
        .expect("pipeline")
        .run()
        .expect("run succeeds");

    assert!(report.triangles > 0);
    assert_eq!(report.vertices, 6);
    assert_eq!(report.outputs.len(), 3);
    for path in &report.outputs {
        assert!(path.exists(), "{} missing", path.display());
    }

    let ply = fs::read_to_string(config.output_dir.join(MESH_FILE)).expect("mesh");
    assert!(ply.starts_with("ply\n"));
    assert!(ply.contains("element vertex 6\n"));
    assert!(ply.contains(&format!("element face {}\n", report.triangles)));

    let json = fs::read_to_string(config.output_dir.join(REPORT_FILE)).expect("report");
    let persisted: RunReport = serde_json::from_str(&json).expect("report parses");
    assert_eq!(persisted, report);

    // Marker released, no stray temporaries.
    assert!(!dir.path().join(".graph.lock").exists());
    assert_eq!(fs::read_dir(&config.output_dir).expect("ls").count(), 3);
}

#[test]
fn log_order_does_not_change_the_fused_cloud() {
    let (_a, forward) = scene(&[K1_RECORD, K2_RECORD], &[("K1", k1()), ("K2", k2())]);
    let (_b, reversed) = scene(&[K2_RECORD, K1_RECORD], &[("K1", k1()), ("K2", k2())]);

    ReconstructionPipeline::new(forward.clone()).expect("pipeline").run().expect("forward run");
    ReconstructionPipeline::new(reversed.clone()).expect("pipeline").run().expect("reversed run");

    assert_eq!(read_fused(&forward), read_fused(&reversed));
}

#[test]
fn missing_cloud_aborts_without_outputs() {
    let (dir, config) = scene(&[K1_RECORD, K2_RECORD], &[("K1", k1())]);

    let err = ReconstructionPipeline::new(config.clone())
        .expect("pipeline")
        .run()
        .expect_err("K2 has no cloud");
    assert!(matches!(err, FusionError::Io { ref path, .. } if path.ends_with("K2.pcd")), "{err}");

    assert!(!config.output_dir.exists());
    assert!(!dir.path().join(".graph.lock").exists());
}

#[test]
fn malformed_records_are_skipped_and_reported() {
    let (_dir, config) = scene(
        &["# header", K1_RECORD, "2,K9,0,0", "3,K8,0,0,0,x,0,0,0,0,0,1", K2_RECORD],
        &[("K1", k1()), ("K2", k2())],
    );
    let report = ReconstructionPipeline::new(config).expect("pipeline").run().expect("run");
    assert_eq!(report.keyframes, 2);
    assert_eq!(report.skipped_records.len(), 2);
}

#[test]
fn log_without_usable_records_is_fatal() {
    let (_dir, config) = scene(&["0,K1,0", "garbage"], &[("K1", k1())]);
    let err = ReconstructionPipeline::new(config.clone())
        .expect("pipeline")
        .run()
        .expect_err("nothing usable");
    assert!(matches!(err, FusionError::EmptyPoseLog { skipped: 2, .. }), "{err}");
    assert!(!config.output_dir.exists());
}

#[test]
fn empty_keyframe_clouds_are_fatal() {
    let (_dir, config) = scene(&[K1_RECORD], &[("K1", Vec::new())]);
    let err = ReconstructionPipeline::new(config)
        .expect("pipeline")
        .run()
        .expect_err("nothing to mesh");
    assert!(matches!(err, FusionError::EmptyCloud));
}

#[test]
fn held_marker_times_out_when_configured() {
    let (dir, mut config) = scene(&[K1_RECORD], &[("K1", k1())]);
    let marker = dir.path().join(".graph.lock");
    fs::write(&marker, b"").expect("foreign marker");
    config.lock.poll_interval = Duration::from_millis(5);
    config.lock.timeout = Some(Duration::from_millis(50));

    let err = ReconstructionPipeline::new(config.clone())
        .expect("pipeline")
        .run()
        .expect_err("marker never released");
    assert!(matches!(err, FusionError::LockTimeout { .. }), "{err}");
    // The foreign marker is not ours to delete.
    assert!(marker.exists());
    assert!(!config.output_dir.exists());
}

#[test]
fn fused_cloud_output_can_be_disabled() {
    let (_dir, mut config) = scene(&[K1_RECORD], &[("K1", k1())]);
    config.write_fused_cloud = false;
    let report = ReconstructionPipeline::new(config.clone()).expect("pipeline").run().expect("run");
    assert_eq!(report.outputs.len(), 2);
    assert!(!config.output_dir.join(FUSED_CLOUD_FILE).exists());
    assert!(config.output_dir.join(MESH_FILE).exists());
}
