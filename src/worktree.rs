//! Git worktree management.
//!
//! Each agent runs in an isolated worktree so concurrent drones never touch
//! each other's working copy. Worktrees are rooted under a configurable base
//! directory and branch off a named base branch in the host repository.
//!
//! Git is driven through the `git` binary rather than libgit2: worktree
//! add/remove semantics around existing branches and stale registry entries
//! are exactly what the porcelain commands already handle.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};

use crate::error::{HiveError, Result};

/// A live worktree owned by the manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Worktree {
    /// Name of the worktree (directory name under the base dir).
    pub name: String,
    /// Absolute path of the working copy.
    pub path: PathBuf,
    /// Branch checked out in the worktree.
    pub branch: String,
    /// Branch the worktree's branch was created from.
    pub base_branch: String,
}

/// Manages git worktrees for agent sessions.
#[derive(Debug)]
pub struct WorktreeManager {
    /// Host repository worktrees are created from.
    repo_path: PathBuf,
    /// Base directory for worktree storage.
    base_dir: PathBuf,
}

impl WorktreeManager {
    /// Creates a manager for `repo_path` storing worktrees under `base_dir`.
    pub fn new(repo_path: PathBuf, base_dir: PathBuf) -> Self {
        Self { repo_path, base_dir }
    }

    /// Base directory worktrees live under.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Creates a worktree named `name` on a new branch off `base_branch`.
    ///
    /// The branch is named after the worktree. Fails with `AlreadyExists`
    /// when the name collides with a live worktree or an existing directory,
    /// and `NotFound` when the base branch does not resolve.
    pub fn create(&self, name: &str, base_branch: &str) -> Result<Worktree> {
        self.create_with_branch(name, name, base_branch)
    }

    /// Creates a worktree named `name` with `branch` checked out, creating
    /// the branch off `base_branch` if it does not already exist.
    pub fn create_with_branch(
        &self,
        name: &str,
        branch: &str,
        base_branch: &str,
    ) -> Result<Worktree> {
        if self.exists(name)? {
            return Err(HiveError::AlreadyExists(format!("worktree {name}")));
        }

        if !branch_exists(&self.repo_path, base_branch) {
            return Err(HiveError::not_found(format!("branch {base_branch}")));
        }

        fs::create_dir_all(&self.base_dir)?;
        let path = self.base_dir.join(name);
        if path.exists() {
            return Err(HiveError::AlreadyExists(format!(
                "worktree directory {}",
                path.display()
            )));
        }

        log::info!(
            "[worktree] creating {} ({} from {}) at {}",
            name,
            branch,
            base_branch,
            path.display()
        );

        // Reuse the branch if a previous worktree left it behind; otherwise
        // create it off the base branch.
        let output = if branch_exists(&self.repo_path, branch) {
            git(&self.repo_path, &["worktree", "add", &path_str(&path)?, branch])?
        } else {
            git(
                &self.repo_path,
                &[
                    "worktree",
                    "add",
                    "-b",
                    branch,
                    &path_str(&path)?,
                    base_branch,
                ],
            )?
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(HiveError::ChildFailed(format!("git worktree add: {stderr}")));
        }

        Ok(Worktree {
            name: name.to_string(),
            path,
            branch: branch.to_string(),
            base_branch: base_branch.to_string(),
        })
    }

    /// Lists worktrees under the managed base directory.
    ///
    /// Parses `git worktree list --porcelain` and keeps only entries rooted
    /// under our base dir, so the host repo's own checkout and unrelated
    /// worktrees never show up.
    pub fn list(&self) -> Result<Vec<Worktree>> {
        let output = git(&self.repo_path, &["worktree", "list", "--porcelain"])?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(HiveError::ChildFailed(format!("git worktree list: {stderr}")));
        }

        let text = String::from_utf8_lossy(&output.stdout);
        let mut result = Vec::new();
        let mut current_path: Option<PathBuf> = None;

        for line in text.lines() {
            if let Some(path) = line.strip_prefix("worktree ") {
                current_path = Some(PathBuf::from(path));
            } else if let Some(branch_ref) = line.strip_prefix("branch ") {
                if let Some(path) = current_path.take() {
                    if !path.starts_with(&self.base_dir) {
                        continue;
                    }
                    let name = path
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_default();
                    let branch = branch_ref
                        .strip_prefix("refs/heads/")
                        .unwrap_or(branch_ref)
                        .to_string();
                    result.push(Worktree {
                        name,
                        path,
                        branch,
                        // The porcelain listing does not record lineage.
                        base_branch: String::new(),
                    });
                }
            }
        }

        Ok(result)
    }

    /// Whether a live worktree named `name` exists under the base dir.
    pub fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.list()?.iter().any(|w| w.name == name))
    }

    /// Deletes the worktree named `name`.
    ///
    /// Idempotent: a missing directory or unregistered worktree is not an
    /// error. Always prunes git's worktree registry afterwards so dangling
    /// entries never accumulate.
    pub fn delete(&self, name: &str) -> Result<()> {
        let path = self.base_dir.join(name);

        // Refuse to touch anything outside the managed base directory.
        if let Ok(canonical) = path.canonicalize() {
            let base = self
                .base_dir
                .canonicalize()
                .unwrap_or_else(|_| self.base_dir.clone());
            if !canonical.starts_with(&base) {
                return Err(HiveError::Conflict(format!(
                    "{} is outside the managed worktree directory",
                    path.display()
                )));
            }
            // A worktree has a .git *file* pointing back at the host repo; a
            // .git *directory* means this is a real repository.
            if canonical.join(".git").is_dir() {
                return Err(HiveError::Conflict(format!(
                    "{} is a repository, not a worktree",
                    path.display()
                )));
            }
        }

        if path.exists() {
            log::info!("[worktree] removing {}", path.display());
            let output = git(
                &self.repo_path,
                &["worktree", "remove", &path_str(&path)?, "--force"],
            )?;
            if !output.status.success() {
                log::warn!(
                    "[worktree] git worktree remove failed for {}: {}",
                    name,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                // Fall back to removing the directory; prune below cleans the
                // registry entry.
                fs::remove_dir_all(&path)?;
            }
        } else {
            log::debug!("[worktree] {} already gone", path.display());
        }

        let _ = git(&self.repo_path, &["worktree", "prune"]);
        Ok(())
    }
}

/// Runs a git subcommand in `repo` and captures its output.
fn git(repo: &Path, args: &[&str]) -> Result<std::process::Output> {
    Command::new("git")
        .args(args)
        .current_dir(repo)
        .output()
        .map_err(|e| HiveError::ChildFailed(format!("failed to run git: {e}")))
}

/// Whether a local branch exists in the repo at `path`.
fn branch_exists(path: &Path, branch: &str) -> bool {
    Command::new("git")
        .args([
            "show-ref",
            "--verify",
            "--quiet",
            &format!("refs/heads/{branch}"),
        ])
        .current_dir(path)
        .output()
        .is_ok_and(|o| o.status.success())
}

fn path_str(path: &Path) -> Result<String> {
    path.to_str()
        .map(str::to_string)
        .ok_or_else(|| HiveError::Conflict(format!("non-UTF-8 path: {}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Creates a throwaway git repo with one commit on `main`.
    fn init_repo(dir: &Path) {
        let run = |args: &[&str]| {
            let status = Command::new("git")
                .args(args)
                .current_dir(dir)
                .env("GIT_AUTHOR_NAME", "test")
                .env("GIT_AUTHOR_EMAIL", "test@test")
                .env("GIT_COMMITTER_NAME", "test")
                .env("GIT_COMMITTER_EMAIL", "test@test")
                .status()
                .unwrap();
            assert!(status.success(), "git {args:?} failed");
        };
        run(&["init", "-b", "main"]);
        std::fs::write(dir.join("README.md"), "hive test repo\n").unwrap();
        run(&["add", "."]);
        run(&["commit", "-m", "init"]);
    }

    #[test]
    fn create_list_delete_roundtrip() {
        let repo = TempDir::new().unwrap();
        let trees = TempDir::new().unwrap();
        init_repo(repo.path());

        let manager =
            WorktreeManager::new(repo.path().to_path_buf(), trees.path().to_path_buf());

        let wt = manager.create("agent-alpha", "main").unwrap();
        assert!(wt.path.exists());
        assert_eq!(wt.branch, "agent-alpha");
        assert!(manager.exists("agent-alpha").unwrap());

        let listed = manager.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "agent-alpha");

        manager.delete("agent-alpha").unwrap();
        assert!(!manager.exists("agent-alpha").unwrap());
        assert!(!wt.path.exists());
    }

    #[test]
    fn create_duplicate_name_fails() {
        let repo = TempDir::new().unwrap();
        let trees = TempDir::new().unwrap();
        init_repo(repo.path());

        let manager =
            WorktreeManager::new(repo.path().to_path_buf(), trees.path().to_path_buf());
        manager.create("agent-beta", "main").unwrap();

        let err = manager.create("agent-beta", "main").unwrap_err();
        assert!(matches!(err, HiveError::AlreadyExists(_)), "got {err:?}");
    }

    #[test]
    fn create_from_missing_base_branch_fails() {
        let repo = TempDir::new().unwrap();
        let trees = TempDir::new().unwrap();
        init_repo(repo.path());

        let manager =
            WorktreeManager::new(repo.path().to_path_buf(), trees.path().to_path_buf());
        let err = manager.create("agent-gamma", "no-such-branch").unwrap_err();
        assert!(matches!(err, HiveError::NotFound(_)), "got {err:?}");
    }

    #[test]
    fn delete_missing_worktree_is_ok() {
        let repo = TempDir::new().unwrap();
        let trees = TempDir::new().unwrap();
        init_repo(repo.path());

        let manager =
            WorktreeManager::new(repo.path().to_path_buf(), trees.path().to_path_buf());
        manager.delete("never-created").unwrap();
    }

    #[test]
    fn delete_prunes_stale_registry_entries() {
        let repo = TempDir::new().unwrap();
        let trees = TempDir::new().unwrap();
        init_repo(repo.path());

        let manager =
            WorktreeManager::new(repo.path().to_path_buf(), trees.path().to_path_buf());
        let wt = manager.create("agent-delta", "main").unwrap();

        // Simulate a crash that removed the directory behind git's back.
        std::fs::remove_dir_all(&wt.path).unwrap();
        manager.delete("agent-delta").unwrap();

        // The registry entry is pruned, so the name is reusable.
        assert!(!manager.exists("agent-delta").unwrap());
        manager.create("agent-delta", "main").unwrap();
    }
}
