//! [`PoseGraphStore`] – lock-protected access to the pose-graph log.
//!
//! A read goes through three steps:
//!
//! 1. wait for the sibling lock marker to clear and claim it
//!    ([`LockMarker`]);
//! 2. open the log, take a shared advisory lock on it, and read it in full;
//! 3. release both locks and parse the snapshot with the store's
//!    [`PoseLogSchema`].
//!
//! Parsing happens after the marker is released so the upstream writer is
//! blocked only for the duration of the read itself.

use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};

use meshfuse_types::FusionError;
use tracing::{info, warn};

use crate::lock::{LockMarker, LockPolicy};
use crate::pose_log::{PoseLog, PoseLogSchema};

/// File name of the pose-graph log inside the working directory.
pub const DEFAULT_LOG_NAME: &str = "graph_vertices.txt";
/// File name of the lock marker inside the working directory.
pub const DEFAULT_MARKER_NAME: &str = ".graph.lock";

/// Reader for the shared pose-graph log.
#[derive(Debug, Clone)]
pub struct PoseGraphStore {
    log_path: PathBuf,
    marker_path: PathBuf,
    schema: PoseLogSchema,
    policy: LockPolicy,
}

impl PoseGraphStore {
    /// Store for `<work_dir>/graph_vertices.txt` guarded by
    /// `<work_dir>/.graph.lock`.
    pub fn new(work_dir: impl AsRef<Path>) -> Self {
        Self::with_file_names(work_dir, DEFAULT_LOG_NAME, DEFAULT_MARKER_NAME)
    }

    pub fn with_file_names(work_dir: impl AsRef<Path>, log_name: &str, marker_name: &str) -> Self {
        let dir = work_dir.as_ref();
        Self {
            log_path: dir.join(log_name),
            marker_path: dir.join(marker_name),
            schema: PoseLogSchema::default(),
            policy: LockPolicy::default(),
        }
    }

    pub fn with_schema(mut self, schema: PoseLogSchema) -> Self {
        self.schema = schema;
        self
    }

    pub fn with_lock_policy(mut self, policy: LockPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn marker_path(&self) -> &Path {
        &self.marker_path
    }

    /// Load every keyframe pose in log order.
    ///
    /// Malformed records are skipped with a warning and reported in
    /// [`PoseLog::skipped`]. Fails when the log cannot be read, the lock
    /// cannot be obtained, or no usable record remains.
    pub fn load_all(&self) -> Result<PoseLog, FusionError> {
        let content = self.read_snapshot()?;
        let log = self.schema.parse(&content);

        for skipped in &log.skipped {
            warn!(log = %self.log_path.display(), error = %skipped, "skipping malformed pose record");
        }

        if log.poses.is_empty() {
            return Err(FusionError::EmptyPoseLog {
                path: self.log_path.clone(),
                skipped: log.skipped.len(),
            });
        }

        info!(
            log = %self.log_path.display(),
            poses = log.poses.len(),
            skipped = log.skipped.len(),
            "pose graph loaded"
        );
        Ok(log)
    }

    /// Read the raw log contents while holding the marker and a shared
    /// advisory lock on the log.
    fn read_snapshot(&self) -> Result<String, FusionError> {
        let _marker = LockMarker::acquire(&self.marker_path, &self.policy)?;

        let mut file = File::open(&self.log_path).map_err(|e| FusionError::io(&self.log_path, e))?;
        match file.lock_shared() {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::Unsupported => {
                warn!(log = %self.log_path.display(), "advisory locking unsupported; relying on marker only");
            }
            Err(e) => return Err(FusionError::io(&self.log_path, e)),
        }

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)
            .map_err(|e| FusionError::io(&self.log_path, e))?;

        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}
