//! Pose-graph log parsing.
//!
//! The upstream mapper appends one comma-separated record per keyframe. Only
//! eight columns matter here (keyframe name, translation, quaternion); all
//! other columns are carried along untouched and never validated.
//!
//! Columns are addressed through a [`PoseLogSchema`] that names each field,
//! so a record that no longer matches the expected layout is rejected with
//! the offending field named instead of being silently misread.
//!
//! # Example
//!
//! ```rust
//! use meshfuse_io::pose_log::PoseLogSchema;
//!
//! let log = PoseLogSchema::default().parse(",K1,,,,1.0,2.0,3.0,0,0,0,1\n");
//! assert_eq!(log.poses.len(), 1);
//! assert_eq!(log.poses[0].name, "K1");
//! assert!((log.poses[0].translation().z - 3.0).abs() < 1e-12);
//! ```

use std::collections::HashMap;

use meshfuse_types::KeyframePose;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Quaternions with a norm below this (but not exactly zero) are rejected.
const MIN_QUATERNION_NORM: f64 = 1e-9;

// ────────────────────────────────────────────────────────────────────────────
// Schema
// ────────────────────────────────────────────────────────────────────────────

/// Column index of every field the reconstruction reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoseLogSchema {
    pub name: usize,
    pub tx: usize,
    pub ty: usize,
    pub tz: usize,
    pub qx: usize,
    pub qy: usize,
    pub qz: usize,
    pub qw: usize,
}

impl Default for PoseLogSchema {
    /// The layout written by the upstream mapper.
    fn default() -> Self {
        Self {
            name: 1,
            tx: 5,
            ty: 6,
            tz: 7,
            qx: 8,
            qy: 9,
            qz: 10,
            qw: 11,
        }
    }
}

/// Result of parsing a whole log: accepted poses in log order plus the
/// records that had to be skipped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoseLog {
    pub poses: Vec<KeyframePose>,
    pub skipped: Vec<RecordError>,
}

/// Why a single record was skipped. Always recoverable.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecordError {
    #[error("line {line}: expected at least {expected} fields, found {found}")]
    TooFewFields {
        line: usize,
        expected: usize,
        found: usize,
    },

    #[error("line {line}: field `{field}` (column {column}) is empty")]
    EmptyField {
        line: usize,
        field: &'static str,
        column: usize,
    },

    #[error("line {line}: field `{field}` (column {column}) = {value:?} is not a finite number")]
    InvalidNumber {
        line: usize,
        field: &'static str,
        column: usize,
        value: String,
    },

    #[error("line {line}: quaternion norm {norm:e} is too small to normalize")]
    DegenerateQuaternion { line: usize, norm: f64 },
}

impl PoseLogSchema {
    /// Minimum number of comma-separated fields a record must have.
    pub fn required_fields(&self) -> usize {
        self.columns().iter().map(|(_, c)| *c).max().unwrap_or(0) + 1
    }

    fn columns(&self) -> [(&'static str, usize); 8] {
        [
            ("name", self.name),
            ("tx", self.tx),
            ("ty", self.ty),
            ("tz", self.tz),
            ("qx", self.qx),
            ("qy", self.qy),
            ("qz", self.qz),
            ("qw", self.qw),
        ]
    }

    /// Parse one record. `line` is 1-based and used only for diagnostics.
    pub fn parse_record(&self, id: usize, line: usize, record: &str) -> Result<KeyframePose, RecordError> {
        let fields: Vec<&str> = record.split(',').map(str::trim).collect();
        let expected = self.required_fields();
        if fields.len() < expected {
            return Err(RecordError::TooFewFields {
                line,
                expected,
                found: fields.len(),
            });
        }

        let name = fields[self.name];
        if name.is_empty() {
            return Err(RecordError::EmptyField {
                line,
                field: "name",
                column: self.name,
            });
        }

        let number = |field: &'static str, column: usize| -> Result<f64, RecordError> {
            let raw = fields[column];
            if raw.is_empty() {
                return Err(RecordError::EmptyField { line, field, column });
            }
            match raw.parse::<f64>() {
                Ok(v) if v.is_finite() => Ok(v),
                _ => Err(RecordError::InvalidNumber {
                    line,
                    field,
                    column,
                    value: raw.to_string(),
                }),
            }
        };

        let translation = [
            number("tx", self.tx)?,
            number("ty", self.ty)?,
            number("tz", self.tz)?,
        ];
        let quaternion = [
            number("qx", self.qx)?,
            number("qy", self.qy)?,
            number("qz", self.qz)?,
            number("qw", self.qw)?,
        ];

        let norm = quaternion.iter().map(|q| q * q).sum::<f64>().sqrt();
        if norm != 0.0 && norm < MIN_QUATERNION_NORM {
            return Err(RecordError::DegenerateQuaternion { line, norm });
        }

        Ok(KeyframePose::from_components(id, name, translation, quaternion))
    }

    /// Parse a complete log.
    ///
    /// Blank lines and lines starting with `#` or `%` are ignored. A final
    /// line without a trailing newline that fails to parse is assumed to be
    /// a record still being written and is dropped without counting as a
    /// skip. A keyframe name seen twice keeps its first position but takes
    /// the later pose.
    pub fn parse(&self, content: &str) -> PoseLog {
        let mut log = PoseLog::default();
        let mut by_name: HashMap<String, usize> = HashMap::new();
        let unterminated_tail = !content.is_empty() && !content.ends_with('\n');
        let total_lines = content.lines().count();

        for (idx, raw) in content.lines().enumerate() {
            let line = idx + 1;
            let record = raw.trim();
            if record.is_empty() || record.starts_with('#') || record.starts_with('%') {
                continue;
            }

            match self.parse_record(log.poses.len(), line, record) {
                Ok(pose) => match by_name.get(&pose.name) {
                    Some(&slot) => {
                        warn!(keyframe = %pose.name, line, "duplicate keyframe record; later pose replaces earlier");
                        let id = log.poses[slot].id;
                        log.poses[slot] = KeyframePose { id, ..pose };
                    }
                    None => {
                        by_name.insert(pose.name.clone(), log.poses.len());
                        log.poses.push(pose);
                    }
                },
                Err(e) if unterminated_tail && line == total_lines => {
                    debug!(line, error = %e, "dropping partially written trailing record");
                }
                Err(e) => log.skipped.push(e),
            }
        }

        log
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{UnitQuaternion, Vector3};

    #[test]
    fn parses_reference_record() {
        let pose = PoseLogSchema::default()
            .parse_record(0, 1, ",K1,,,,1.0,2.0,3.0,0,0,0,1")
            .expect("valid record");
        assert_eq!(pose.name, "K1");
        assert_eq!(pose.id, 0);
        assert!((pose.translation() - Vector3::new(1.0, 2.0, 3.0)).norm() < 1e-12);
        assert!(pose.rotation().angle_to(&UnitQuaternion::identity()) < 1e-12);
    }

    #[test]
    fn all_zero_quaternion_is_identity() {
        let pose = PoseLogSchema::default()
            .parse_record(0, 1, "7,K7,a,b,c,0,0,0,0,0,0,0")
            .expect("zero quaternion is a valid identity");
        assert_eq!(pose.rotation(), UnitQuaternion::identity());
    }

    #[test]
    fn unused_columns_are_not_validated() {
        let record = "garbage,K2,not-a-number,?,!!,0.5,0,0,0,0,0,1,extra,fields";
        let pose = PoseLogSchema::default().parse_record(0, 1, record).expect("valid");
        assert!((pose.translation().x - 0.5).abs() < 1e-12);
    }

    #[test]
    fn short_record_names_missing_width() {
        let err = PoseLogSchema::default()
            .parse_record(0, 4, ",K1,,,,1.0,2.0")
            .expect_err("too short");
        assert_eq!(
            err,
            RecordError::TooFewFields {
                line: 4,
                expected: 12,
                found: 7
            }
        );
    }

    #[test]
    fn non_numeric_field_is_named() {
        let err = PoseLogSchema::default()
            .parse_record(0, 2, ",K1,,,,1.0,oops,3.0,0,0,0,1")
            .expect_err("bad ty");
        match err {
            RecordError::InvalidNumber { field, column, .. } => {
                assert_eq!(field, "ty");
                assert_eq!(column, 6);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn nan_translation_is_rejected() {
        let err = PoseLogSchema::default()
            .parse_record(0, 1, ",K1,,,,NaN,0,0,0,0,0,1")
            .expect_err("nan");
        assert!(matches!(err, RecordError::InvalidNumber { field: "tx", .. }));
    }

    #[test]
    fn tiny_quaternion_is_rejected() {
        let err = PoseLogSchema::default()
            .parse_record(0, 1, ",K1,,,,0,0,0,1e-12,0,0,0")
            .expect_err("degenerate");
        assert!(matches!(err, RecordError::DegenerateQuaternion { .. }));
    }

    #[test]
    fn parse_skips_bad_records_and_keeps_order() {
        let content = "% header,name\n\
                       ,K1,,,,0,0,0,0,0,0,1\n\
                       ,K2,,,,1,0\n\
                       \n\
                       ,K3,,,,2,0,0,0,0,0,1\n";
        let log = PoseLogSchema::default().parse(content);
        let names: Vec<_> = log.poses.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["K1", "K3"]);
        assert_eq!(log.poses[1].id, 1);
        assert_eq!(log.skipped.len(), 1);
    }

    #[test]
    fn unterminated_partial_tail_is_dropped_silently() {
        let content = ",K1,,,,0,0,0,0,0,0,1\n,K2,,,,1.0,2";
        let log = PoseLogSchema::default().parse(content);
        assert_eq!(log.poses.len(), 1);
        assert!(log.skipped.is_empty());
    }

    #[test]
    fn unterminated_complete_tail_is_kept() {
        let content = ",K1,,,,0,0,0,0,0,0,1\n,K2,,,,1,0,0,0,0,0,1";
        let log = PoseLogSchema::default().parse(content);
        assert_eq!(log.poses.len(), 2);
    }

    #[test]
    fn duplicate_name_takes_latest_pose_in_first_slot() {
        let content = ",K1,,,,0,0,0,0,0,0,1\n,K2,,,,1,0,0,0,0,0,1\n,K1,,,,5,0,0,0,0,0,1\n";
        let log = PoseLogSchema::default().parse(content);
        assert_eq!(log.poses.len(), 2);
        assert_eq!(log.poses[0].name, "K1");
        assert_eq!(log.poses[0].id, 0);
        assert!((log.poses[0].translation().x - 5.0).abs() < 1e-12);
    }

    #[test]
    fn custom_schema_reads_other_columns() {
        let schema = PoseLogSchema {
            name: 0,
            tx: 1,
            ty: 2,
            tz: 3,
            qx: 4,
            qy: 5,
            qz: 6,
            qw: 7,
        };
        assert_eq!(schema.required_fields(), 8);
        let pose = schema.parse_record(0, 1, "A,1,2,3,0,0,0,1").expect("valid");
        assert_eq!(pose.name, "A");
        assert!((pose.translation().y - 2.0).abs() < 1e-12);
    }
}
