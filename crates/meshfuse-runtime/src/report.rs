//! Machine-readable summary of one reconstruction run.

use std::io::{self, Write};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use meshfuse_perception::{ProjectionPlane, TriangulationStats};
use meshfuse_types::GeometryWarning;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Written next to the mesh as `report.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Keyframes integrated.
    pub keyframes: usize,
    /// One message per pose record skipped as malformed.
    pub skipped_records: Vec<String>,
    /// Non-finite points dropped during fusion.
    pub rejected_points: usize,
    pub accumulated_cells: usize,
    pub filtered_points: usize,
    pub trimmed_points: usize,
    pub projection_plane: ProjectionPlane,
    pub contour_loops: usize,
    pub vertices: usize,
    pub triangles: usize,
    pub triangulation: TriangulationStats,
    pub warnings: Vec<GeometryWarning>,
    /// Files written by the run, in commit order.
    pub outputs: Vec<PathBuf>,
}

impl RunReport {
    pub fn write_json<W: Write>(&self, out: &mut W) -> io::Result<()> {
        serde_json::to_writer_pretty(&mut *out, self)?;
        writeln!(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_json_round_trip_keeps_warnings() {
        let now = Utc::now();
        let report = RunReport {
            run_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            keyframes: 2,
            skipped_records: vec!["line 3: expected at least 12 fields, found 4".into()],
            rejected_points: 0,
            accumulated_cells: 6,
            filtered_points: 6,
            trimmed_points: 6,
            projection_plane: ProjectionPlane::Xy,
            contour_loops: 2,
            vertices: 6,
            triangles: 0,
            triangulation: TriangulationStats::default(),
            warnings: vec![GeometryWarning::MultiLoopContour { loops: 2 }],
            outputs: vec![PathBuf::from("out/mesh.ply")],
        };

        let mut buf = Vec::new();
        report.write_json(&mut buf).expect("write");
        let text = String::from_utf8(buf).expect("utf8");
        assert!(text.contains("\"projection_plane\": \"xy\""));
        assert!(text.contains("\"kind\": \"multi_loop_contour\""));

        let back: RunReport = serde_json::from_str(&text).expect("parse");
        assert_eq!(back, report);
    }
}
