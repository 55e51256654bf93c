//! Local git operations through libgit2: per-workflow worktrees, the diff
//! handed to review, and the Ship commit. Pushing shells out to `git`, which
//! owns credential handling.

use anyhow::{Context, Result, bail};
use git2::{
    BranchType, DiffFormat, DiffOptions, IndexAddOption, Repository, Signature,
    WorktreeAddOptions, WorktreePruneOptions,
};
use std::path::Path;
use std::process::Stdio;
use tracing::debug;

const SIGNATURE_NAME: &str = "conveyor";
const SIGNATURE_EMAIL: &str = "conveyor@localhost";

pub struct GitRepo {
    repo: Repository,
}

impl GitRepo {
    pub fn open(path: &Path) -> Result<Self> {
        let repo = Repository::open(path)
            .with_context(|| format!("Failed to open git repository at {}", path.display()))?;
        Ok(Self { repo })
    }

    pub fn is_repository(path: &Path) -> bool {
        Repository::open(path).is_ok()
    }

    fn head_commit(&self) -> Option<git2::Commit<'_>> {
        self.repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok())
    }

    /// Short name of the checked-out branch, if HEAD is on one.
    pub fn current_branch(&self) -> Option<String> {
        let head = self.repo.head().ok()?;
        if head.is_branch() {
            head.shorthand().map(|s| s.to_string())
        } else {
            None
        }
    }

    /// Add a worktree named `name` at `path`, checked out on `branch`.
    ///
    /// The branch is created from HEAD unless it already exists. Leftovers
    /// from an interrupted run (stale worktree metadata or directory) are
    /// cleared first.
    pub fn add_worktree(&self, name: &str, path: &Path, branch: &str) -> Result<()> {
        let head = self
            .head_commit()
            .context("Repository has no commits; worktree isolation needs an initial commit")?;

        if self.repo.find_worktree(name).is_ok() || path.exists() {
            debug!(worktree = name, path = %path.display(), "clearing stale worktree");
            self.remove_worktree(name, path)?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let branch_ref = match self.repo.find_branch(branch, BranchType::Local) {
            Ok(existing) => existing,
            Err(_) => self
                .repo
                .branch(branch, &head, false)
                .with_context(|| format!("Failed to create branch {}", branch))?,
        };
        let reference = branch_ref.into_reference();

        let mut opts = WorktreeAddOptions::new();
        opts.reference(Some(&reference));
        self.repo
            .worktree(name, path, Some(&opts))
            .with_context(|| format!("Failed to add worktree {} at {}", name, path.display()))?;
        debug!(worktree = name, branch, path = %path.display(), "worktree added");
        Ok(())
    }

    /// Prune the worktree metadata and delete its directory. Missing pieces
    /// are tolerated.
    pub fn remove_worktree(&self, name: &str, path: &Path) -> Result<()> {
        if let Ok(worktree) = self.repo.find_worktree(name) {
            let mut opts = WorktreePruneOptions::new();
            opts.valid(true).locked(false).working_tree(true);
            worktree
                .prune(Some(&mut opts))
                .with_context(|| format!("Failed to prune worktree {}", name))?;
        }
        match std::fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
        }
    }

    /// Unified diff of the working tree (untracked files included) against HEAD.
    pub fn diff_against_head(&self) -> Result<String> {
        let head_tree = match self.head_commit() {
            Some(commit) => Some(commit.tree()?),
            None => None,
        };

        let mut opts = DiffOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .show_untracked_content(true);

        let diff = self
            .repo
            .diff_tree_to_workdir_with_index(head_tree.as_ref(), Some(&mut opts))?;

        let mut out = String::new();
        diff.print(DiffFormat::Patch, |_delta, _hunk, line| {
            if matches!(line.origin(), '+' | '-' | ' ') {
                out.push(line.origin());
            }
            out.push_str(&String::from_utf8_lossy(line.content()));
            true
        })?;
        Ok(out)
    }

    /// Stage everything (additions, modifications, deletions) and commit on
    /// HEAD. Returns the new commit id, or `None` when there is nothing to commit.
    pub fn commit_all(&self, message: &str) -> Result<Option<String>> {
        let mut index = self.repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let parent = self.head_commit();
        if let Some(parent) = &parent
            && parent.tree_id() == tree_id
        {
            return Ok(None);
        }

        let tree = self.repo.find_tree(tree_id)?;
        let sig = Signature::now(SIGNATURE_NAME, SIGNATURE_EMAIL)?;
        let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
        let oid = self
            .repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        Ok(Some(oid.to_string()))
    }
}

/// `git push -u <remote> <branch>` from the workspace.
pub async fn push_branch(workspace: &Path, remote: &str, branch: &str) -> Result<()> {
    let output = tokio::process::Command::new("git")
        .args(["push", "-u", remote, branch])
        .current_dir(workspace)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .context("Failed to run git push")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("git push {} {} failed: {}", remote, branch, stderr.trim());
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use git2::{Repository, Signature};
    use std::path::Path;

    /// Initialize a repository with one commit containing README.md.
    pub fn init_repo_with_commit(path: &Path) -> Repository {
        let repo = Repository::init(path).unwrap();
        std::fs::write(path.join("README.md"), "# test\n").unwrap();
        {
            let mut index = repo.index().unwrap();
            index
                .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
                .unwrap();
            index.write().unwrap();
            let tree_id = index.write_tree().unwrap();
            let tree = repo.find_tree(tree_id).unwrap();
            let sig = Signature::now("test", "test@localhost").unwrap();
            repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
                .unwrap();
        }
        repo
    }
}
