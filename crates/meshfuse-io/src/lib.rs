//! `meshfuse-io` – everything that touches the filesystem.
//!
//! # Modules
//!
//! - [`lock`] – [`LockMarker`][lock::LockMarker]: RAII ownership of the
//!   zero-byte marker file that cooperating processes use to say "the pose
//!   log is busy".
//! - [`pose_log`] – [`PoseLogSchema`][pose_log::PoseLogSchema]: named-column
//!   parser for the comma-separated pose-graph log.
//! - [`store`] – [`PoseGraphStore`][store::PoseGraphStore]: lock-protected
//!   loading of every keyframe pose from the log.
//! - [`cloud`] – [`CloudSource`][cloud::CloudSource] and the PCD-directory
//!   loader for per-keyframe point clouds.
//! - [`writer`] – PLY mesh and PCD cloud writers plus staged, atomic output
//!   files.

pub mod cloud;
pub mod lock;
pub mod pose_log;
pub mod store;
pub mod writer;

pub use cloud::{CloudSource, PcdDirectory};
pub use lock::{LockMarker, LockPolicy};
pub use pose_log::{PoseLog, PoseLogSchema, RecordError};
pub use store::PoseGraphStore;
pub use writer::{MeshFormat, StagedFile};
