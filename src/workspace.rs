//! Per-execution scratch directory lifecycle: create, write the source file,
//! destroy. `destroy` is idempotent against an already-missing directory so
//! it's always safe to call on every exit path.

use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("failed to create workspace: {0}")]
    Create(String),
    #[error("failed to write file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Owns the root under which per-job directories are created.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    sandbox_root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(sandbox_root: impl Into<PathBuf>) -> Self {
        Self {
            sandbox_root: sandbox_root.into(),
        }
    }

    /// Creates `<sandbox_root>/<job_id>` and returns its absolute path.
    ///
    /// The container runtime mounts this path directly, so it must be
    /// absolute regardless of the process's current directory.
    pub fn create(&self, job_id: &str) -> Result<PathBuf, WorkspaceError> {
        let dir = self.sandbox_root.join(job_id);
        log::info!("creating workspace {}", dir.display());

        std::fs::create_dir_all(&dir).map_err(|e| WorkspaceError::Create(e.to_string()))?;

        dir.canonicalize()
            .map_err(|e| WorkspaceError::Create(e.to_string()))
    }

    /// Writes `contents` to `<dir>/<filename>`.
    pub fn write_file(
        &self,
        dir: &Path,
        filename: &str,
        contents: &str,
    ) -> Result<PathBuf, WorkspaceError> {
        let path = dir.join(filename);
        std::fs::write(&path, contents).map_err(|source| WorkspaceError::Write {
            path: path.display().to_string(),
            source,
        })?;
        Ok(path)
    }

    /// Recursively removes `dir`, tolerating an already-missing path.
    ///
    /// Must be called on every exit path — success, launch failure, or
    /// timeout — so no workspace outlives its job.
    pub fn destroy(&self, dir: &Path) {
        log::info!("destroying workspace {}", dir.display());
        match std::fs::remove_dir_all(dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("failed to clean up workspace {}: {}", dir.display(), e),
        }
    }
}

/// Ties a workspace directory's lifetime to a scope: `destroy` runs from
/// `Drop`, so cleanup happens on every exit path out of that scope,
/// including a panic unwinding through it, not just the ones a caller
/// remembered to handle explicitly.
pub struct WorkspaceGuard<'a> {
    manager: &'a WorkspaceManager,
    dir: PathBuf,
}

impl<'a> WorkspaceGuard<'a> {
    pub fn new(manager: &'a WorkspaceManager, dir: PathBuf) -> Self {
        Self { manager, dir }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }
}

impl Drop for WorkspaceGuard<'_> {
    fn drop(&mut self) {
        self.manager.destroy(&self.dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_destroy_leaves_no_trace() {
        let root = std::env::temp_dir().join(format!("isobox-ws-test-{}", uuid::Uuid::new_v4()));
        let manager = WorkspaceManager::new(&root);

        let dir = manager.create("job-1").unwrap();
        assert!(dir.exists());
        assert!(dir.is_absolute());

        manager.destroy(&dir);
        assert!(!dir.exists());

        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn destroy_tolerates_missing_directory() {
        let manager = WorkspaceManager::new(std::env::temp_dir());
        let missing = std::env::temp_dir().join("isobox-does-not-exist-xyz");
        manager.destroy(&missing);
    }

    #[test]
    fn guard_destroys_on_drop_even_when_the_scope_panics() {
        let root = std::env::temp_dir().join(format!("isobox-ws-test-{}", uuid::Uuid::new_v4()));
        let manager = WorkspaceManager::new(&root);
        let dir = manager.create("job-3").unwrap();
        assert!(dir.exists());

        let result = std::panic::catch_unwind(|| {
            let _guard = WorkspaceGuard::new(&manager, dir.clone());
            panic!("simulated mid-job panic");
        });
        assert!(result.is_err());
        assert!(!dir.exists());

        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn write_file_round_trips_contents() {
        let root = std::env::temp_dir().join(format!("isobox-ws-test-{}", uuid::Uuid::new_v4()));
        let manager = WorkspaceManager::new(&root);
        let dir = manager.create("job-2").unwrap();

        let path = manager.write_file(&dir, "main.py", "print(1)").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "print(1)");

        manager.destroy(&dir);
        std::fs::remove_dir_all(&root).ok();
    }
}
