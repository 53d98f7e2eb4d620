//! File-backed artifact workspace.
//!
//! Every task gets its own directory under the workspace root, named by the
//! task id:
//! - `plan.md`, `research.md`, `output.md` (+ secondary formats)
//! - `review.md`, `review_final.md`

use std::path::{Path, PathBuf};

use tokio::fs;
use uuid::Uuid;

use crate::error::WorkspaceError;

/// Well-known artifact file names.
pub mod artifacts {
    pub const PLAN: &str = "plan.md";
    pub const RESEARCH: &str = "research.md";
    pub const OUTPUT_STEM: &str = "output";
    pub const REVIEW: &str = "review.md";
    pub const REVIEW_FINAL: &str = "review_final.md";
}

/// Filesystem sink for per-task artifacts.
#[derive(Debug, Clone)]
pub struct Workspace {
    base_path: PathBuf,
}

impl Workspace {
    /// Create a new workspace rooted at `base_path`.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Directory holding a task's artifacts.
    pub fn task_dir(&self, task_id: Uuid) -> PathBuf {
        self.base_path.join(task_id.to_string())
    }

    /// Ensure the workspace root exists.
    pub async fn ensure_dirs(&self) -> Result<(), WorkspaceError> {
        fs::create_dir_all(&self.base_path).await?;
        Ok(())
    }

    /// Write (overwrite) an artifact and return its path.
    pub async fn save_artifact(
        &self,
        task_id: Uuid,
        filename: &str,
        content: &str,
    ) -> Result<PathBuf, WorkspaceError> {
        validate_name(filename)?;
        let dir = self.task_dir(task_id);
        fs::create_dir_all(&dir).await?;
        let path = dir.join(filename);
        fs::write(&path, content).await?;
        tracing::debug!(task_id = %task_id, path = %path.display(), bytes = content.len(), "Artifact saved");
        Ok(path)
    }

    /// Read an artifact back.
    pub async fn read_artifact(
        &self,
        task_id: Uuid,
        filename: &str,
    ) -> Result<String, WorkspaceError> {
        validate_name(filename)?;
        let path = self.task_dir(task_id).join(filename);
        if !path.exists() {
            return Err(WorkspaceError::ArtifactNotFound(path.display().to_string()));
        }
        Ok(fs::read_to_string(&path).await?)
    }
}

/// Artifact names are single path components.
fn validate_name(filename: &str) -> Result<(), WorkspaceError> {
    if filename.is_empty()
        || filename == "."
        || filename.contains('/')
        || filename.contains('\\')
        || filename.contains("..")
    {
        return Err(WorkspaceError::InvalidArtifactName(filename.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_and_read_artifact() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = Workspace::new(tmp.path());
        let task_id = Uuid::new_v4();

        let path = ws.save_artifact(task_id, "plan.md", "# Plan").await.unwrap();
        assert_eq!(path, tmp.path().join(task_id.to_string()).join("plan.md"));
        assert_eq!(ws.read_artifact(task_id, "plan.md").await.unwrap(), "# Plan");
    }

    #[tokio::test]
    async fn save_overwrites() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = Workspace::new(tmp.path());
        let task_id = Uuid::new_v4();

        ws.save_artifact(task_id, "output.md", "v1").await.unwrap();
        ws.save_artifact(task_id, "output.md", "v2").await.unwrap();
        assert_eq!(ws.read_artifact(task_id, "output.md").await.unwrap(), "v2");
    }

    #[tokio::test]
    async fn rejects_path_traversal() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = Workspace::new(tmp.path());
        for name in ["../escape.md", "a/b.md", "a\\b.md", ""] {
            let err = ws.save_artifact(Uuid::new_v4(), name, "x").await.unwrap_err();
            assert!(matches!(err, WorkspaceError::InvalidArtifactName(_)), "{name}");
        }
    }

    #[tokio::test]
    async fn missing_artifact_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = Workspace::new(tmp.path());
        let err = ws.read_artifact(Uuid::new_v4(), "plan.md").await.unwrap_err();
        assert!(matches!(err, WorkspaceError::ArtifactNotFound(_)));
    }
}
