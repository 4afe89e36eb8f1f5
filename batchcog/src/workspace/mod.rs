//! Scratch workspaces.
//!
//! Every run gets its own directory for intermediate artifacts. The directory
//! is removed exactly once when the run ends: [`WorkspaceHandle::release`]
//! consumes the handle, and a handle that is dropped without being released
//! (a panic unwinding through the orchestrator) removes the directory in
//! `Drop` instead.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::WorkspaceError;

/// Prefix of every workspace directory name.
pub const WORKSPACE_PREFIX: &str = "batchcog-";

/// Creates per-run scratch directories.
#[derive(Debug, Clone, Default)]
pub struct ScratchWorkspace {
    root: Option<PathBuf>,
}

impl ScratchWorkspace {
    /// Creates a workspace factory. Directories go under `root`, or the
    /// system temp directory when `None`.
    #[must_use]
    pub fn new(root: Option<PathBuf>) -> Self {
        Self { root }
    }

    /// The configured parent directory, if any.
    #[must_use]
    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// Creates a fresh, uniquely named directory for one run.
    pub fn acquire(&self) -> Result<WorkspaceHandle, WorkspaceError> {
        let parent = self.root.clone().unwrap_or_else(std::env::temp_dir);
        std::fs::create_dir_all(&parent).map_err(|e| {
            WorkspaceError::new(&parent, "cannot create scratch root").with_source(e)
        })?;

        let dir = tempfile::Builder::new()
            .prefix(WORKSPACE_PREFIX)
            .tempdir_in(&parent)
            .map_err(|e| WorkspaceError::new(&parent, "cannot create workspace").with_source(e))?;

        let path = dir.path().to_path_buf();
        debug!(workspace = %path.display(), "workspace acquired");
        Ok(WorkspaceHandle {
            dir: Some(dir),
            path,
            artifacts: Mutex::new(HashSet::new()),
        })
    }
}

/// One run's scratch directory.
#[derive(Debug)]
pub struct WorkspaceHandle {
    dir: Option<TempDir>,
    path: PathBuf,
    artifacts: Mutex<HashSet<PathBuf>>,
}

impl WorkspaceHandle {
    /// The workspace directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns a new `<workspace>/<uuid>.<ext>` path. Nothing is created on
    /// disk; no path is handed out twice.
    #[must_use]
    pub fn new_artifact_path(&self, extension: &str) -> PathBuf {
        let extension = extension.trim_start_matches('.');
        let mut artifacts = self.artifacts.lock();
        loop {
            let candidate = self.path.join(format!("{}.{extension}", Uuid::new_v4()));
            if artifacts.insert(candidate.clone()) {
                return candidate;
            }
        }
    }

    /// Number of artifact paths handed out so far.
    #[must_use]
    pub fn artifact_count(&self) -> usize {
        self.artifacts.lock().len()
    }

    /// Recursively removes the workspace.
    pub fn release(mut self) -> Result<(), WorkspaceError> {
        let Some(dir) = self.dir.take() else {
            return Ok(());
        };
        dir.close()
            .map_err(|e| WorkspaceError::new(&self.path, "cannot remove workspace").with_source(e))?;
        debug!(workspace = %self.path.display(), "workspace released");
        Ok(())
    }

    /// Removes the workspace on the blocking pool, giving up after `timeout`.
    ///
    /// Never fails: problems are logged, since they must not mask the run's
    /// own outcome. Returns true when the directory is gone.
    pub async fn release_with_timeout(self, timeout: Duration) -> bool {
        let path = self.path.clone();
        match tokio::time::timeout(timeout, tokio::task::spawn_blocking(move || self.release())).await {
            Ok(Ok(Ok(()))) => true,
            Ok(Ok(Err(e))) => {
                warn!(workspace = %path.display(), error = %e, "workspace cleanup failed");
                false
            }
            Ok(Err(e)) => {
                warn!(workspace = %path.display(), error = %e, "workspace cleanup task panicked");
                false
            }
            Err(_) => {
                warn!(workspace = %path.display(), ?timeout, "workspace cleanup timed out");
                false
            }
        }
    }
}

impl Drop for WorkspaceHandle {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            if let Err(e) = dir.close() {
                warn!(workspace = %self.path.display(), error = %e, "workspace cleanup on drop failed");
            }
        }
    }
}
