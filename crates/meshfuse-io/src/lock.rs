//! Cooperative lock marker for the shared pose-graph log.
//!
//! The upstream mapper and every reader agree on one rule: while a zero-byte
//! marker file exists next to the log, nobody else touches the log. This
//! module owns the reader's half of that rule.
//!
//! Acquisition creates the marker with create-new semantics, so checking for
//! the marker and claiming it is a single filesystem operation; a reader that
//! loses the race simply keeps polling. The marker is removed when the
//! [`LockMarker`] guard is dropped, on every exit path.

use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use meshfuse_types::FusionError;
use tracing::{debug, error};

/// How a reader waits for a busy marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    /// Fixed delay between polls. Zero busy-spins.
    pub poll_interval: Duration,
    /// Give up after this long. `None` waits forever.
    pub timeout: Option<Duration>,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            timeout: None,
        }
    }
}

/// Ownership of the lock marker. Dropping the guard deletes the marker.
#[derive(Debug)]
pub struct LockMarker {
    path: PathBuf,
}

impl LockMarker {
    /// Poll until the marker at `path` is absent, then claim it.
    ///
    /// Fails with [`FusionError::LockTimeout`] when `policy.timeout` elapses,
    /// and with [`FusionError::Io`] when the marker cannot be created for any
    /// reason other than already existing (e.g. the directory is missing).
    pub fn acquire(path: &Path, policy: &LockPolicy) -> Result<Self, FusionError> {
        let started = Instant::now();
        let mut announced = false;

        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(_) => {
                    debug!(marker = %path.display(), waited = ?started.elapsed(), "lock marker acquired");
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if !announced {
                        debug!(marker = %path.display(), "pose log busy; waiting for marker to clear");
                        announced = true;
                    }
                }
                Err(e) => return Err(FusionError::io(path, e)),
            }

            if let Some(limit) = policy.timeout
                && started.elapsed() >= limit
            {
                return Err(FusionError::LockTimeout {
                    path: path.to_path_buf(),
                    waited: started.elapsed(),
                });
            }

            if policy.poll_interval.is_zero() {
                thread::yield_now();
            } else {
                thread::sleep(policy.poll_interval);
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockMarker {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            error!(marker = %self.path.display(), error = %e, "failed to delete lock marker");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_timeout(ms: u64) -> LockPolicy {
        LockPolicy {
            poll_interval: Duration::from_millis(1),
            timeout: Some(Duration::from_millis(ms)),
        }
    }

    #[test]
    fn acquire_creates_and_drop_removes_marker() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join(".graph.lock");

        let guard = LockMarker::acquire(&path, &LockPolicy::default()).expect("acquire");
        assert!(path.exists());
        assert_eq!(guard.path(), path.as_path());
        assert_eq!(fs::metadata(&path).expect("meta").len(), 0, "marker must be zero bytes");

        drop(guard);
        assert!(!path.exists());
    }

    #[test]
    fn existing_marker_times_out_when_timeout_set() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join(".graph.lock");
        fs::write(&path, b"").expect("foreign marker");

        let err = LockMarker::acquire(&path, &quick_timeout(30)).expect_err("must time out");
        assert!(matches!(err, FusionError::LockTimeout { .. }));
        // The foreign marker belongs to someone else and must survive.
        assert!(path.exists());
    }

    #[test]
    fn second_acquire_waits_for_first_guard() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join(".graph.lock");

        let first = LockMarker::acquire(&path, &LockPolicy::default()).expect("first");
        assert!(LockMarker::acquire(&path, &quick_timeout(20)).is_err());

        drop(first);
        let second = LockMarker::acquire(&path, &quick_timeout(1000));
        assert!(second.is_ok());
    }

    #[test]
    fn missing_directory_is_io_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("no-such-dir").join(".graph.lock");
        let err = LockMarker::acquire(&path, &LockPolicy::default()).expect_err("io error");
        assert!(matches!(err, FusionError::Io { .. }));
    }
}
