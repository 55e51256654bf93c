use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::git::GitRepo;

/// Creates and removes the isolated directory a workflow works in.
///
/// Called with the allocator's file lock held; implementations must not
/// touch the slot index.
pub trait WorkspaceProvisioner: Send + Sync {
    /// Create a fresh workspace at `path` on `branch`. A stale directory
    /// left by an interrupted run is replaced.
    fn create(&self, workflow_id: &str, path: &Path, branch: &str) -> Result<()>;

    /// Remove the workspace. A missing directory is not an error.
    fn remove(&self, workflow_id: &str, path: &Path) -> Result<()>;
}

/// A libgit2 worktree per workflow, branched from the project's HEAD.
pub struct GitWorktrees {
    repo_root: PathBuf,
}

impl GitWorktrees {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
        }
    }
}

impl WorkspaceProvisioner for GitWorktrees {
    fn create(&self, workflow_id: &str, path: &Path, branch: &str) -> Result<()> {
        GitRepo::open(&self.repo_root)?.add_worktree(workflow_id, path, branch)
    }

    fn remove(&self, workflow_id: &str, path: &Path) -> Result<()> {
        GitRepo::open(&self.repo_root)?.remove_worktree(workflow_id, path)
    }
}

/// An empty directory per workflow, for projects that are not repositories.
#[derive(Debug, Default)]
pub struct PlainDirectories;

impl WorkspaceProvisioner for PlainDirectories {
    fn create(&self, workflow_id: &str, path: &Path, _branch: &str) -> Result<()> {
        self.remove(workflow_id, path)?;
        std::fs::create_dir_all(path)
            .with_context(|| format!("Failed to create workspace {}", path.display()))
    }

    fn remove(&self, _workflow_id: &str, path: &Path) -> Result<()> {
        match std::fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::test_support::init_repo_with_commit;
    use tempfile::tempdir;

    #[test]
    fn test_plain_directories_create_and_remove() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ws").join("wf-1");
        let provisioner = PlainDirectories;

        provisioner.create("wf-1", &path, "unused").unwrap();
        std::fs::write(path.join("junk"), "x").unwrap();
        provisioner.create("wf-1", &path, "unused").unwrap();
        assert!(path.exists());
        assert!(!path.join("junk").exists());

        provisioner.remove("wf-1", &path).unwrap();
        assert!(!path.exists());
        provisioner.remove("wf-1", &path).unwrap();
    }

    #[test]
    fn test_git_worktrees_provisioner() {
        let dir = tempdir().unwrap();
        let repo_dir = dir.path().join("repo");
        std::fs::create_dir_all(&repo_dir).unwrap();
        init_repo_with_commit(&repo_dir);

        let provisioner = GitWorktrees::new(&repo_dir);
        let path = dir.path().join("ws").join("wf-9");
        provisioner.create("wf-9", &path, "conveyor/wf-9").unwrap();
        assert!(path.join("README.md").exists());

        provisioner.remove("wf-9", &path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_git_worktrees_outside_repository_fails() {
        let dir = tempdir().unwrap();
        let provisioner = GitWorktrees::new(dir.path());
        assert!(
            provisioner
                .create("wf-1", &dir.path().join("ws"), "b")
                .is_err()
        );
    }
}
