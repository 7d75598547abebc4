//! Worktree management for GitManager

use git2::{BranchType, Error as GitError, Repository, Worktree, WorktreeAddOptions, WorktreePruneOptions};
use std::path::Path;

use crate::git::types::WorktreeInfo;
use crate::git::GitManager;

impl GitManager {
    /// Check `branch` out into a new linked worktree at `path`.
    ///
    /// The branch is created from HEAD if it does not exist yet. `path` must
    /// not exist; its parent must.
    pub fn add_worktree(&self, branch: &str, path: &Path) -> Result<WorktreeInfo, GitError> {
        if !self.branch_exists(branch) {
            self.create_branch(branch, false)?;
        }

        let branch_ref = self.repo.find_branch(branch, BranchType::Local)?;
        let mut opts = WorktreeAddOptions::new();
        opts.reference(Some(branch_ref.get()));

        // Slashes would nest the admin dir under .git/worktrees/
        let worktree_name = branch.replace('/', "-");

        let worktree = self.repo.worktree(&worktree_name, path, Some(&opts))?;
        self.worktree_to_info(&worktree)
    }

    /// List all worktrees
    pub fn list_worktrees(&self) -> Result<Vec<WorktreeInfo>, GitError> {
        let worktrees = self.repo.worktrees()?;

        let mut result = Vec::new();
        for name in worktrees.iter().flatten() {
            if let Ok(worktree) = self.repo.find_worktree(name) {
                result.push(self.worktree_to_info(&worktree)?);
            }
        }

        Ok(result)
    }

    /// Remove the worktree checked out at `path`, deleting its directory
    /// and its administrative files. The branch is left alone.
    pub fn remove_worktree(&self, path: &Path) -> Result<(), GitError> {
        let worktrees = self.repo.worktrees()?;

        for name in worktrees.iter().flatten() {
            let Ok(worktree) = self.repo.find_worktree(name) else {
                continue;
            };
            if same_path(worktree.path(), path) {
                let mut opts = WorktreePruneOptions::new();
                opts.valid(true).locked(true).working_tree(true);
                worktree.prune(Some(&mut opts))?;
                return Ok(());
            }
        }

        Err(GitError::from_str(&format!(
            "Worktree not found: {}",
            path.display()
        )))
    }

    /// Prune orphaned worktrees (where the physical directory no longer exists)
    pub fn prune_orphaned_worktrees(&self) -> Result<u32, GitError> {
        let worktrees = self.repo.worktrees()?;
        let mut pruned_count = 0;

        for name in worktrees.iter().flatten() {
            if let Ok(worktree) = self.repo.find_worktree(name) {
                if !worktree.path().exists() {
                    log::info!(
                        "[GitManager] Pruning orphaned worktree '{}' (path {:?} no longer exists)",
                        name,
                        worktree.path()
                    );
                    if let Err(e) = worktree.prune(None) {
                        log::warn!("[GitManager] Failed to prune worktree '{}': {}", name, e);
                    } else {
                        pruned_count += 1;
                    }
                }
            }
        }

        Ok(pruned_count)
    }

    /// Convert a Worktree to WorktreeInfo
    pub(crate) fn worktree_to_info(&self, worktree: &Worktree) -> Result<WorktreeInfo, GitError> {
        let name = worktree.name().unwrap_or("").to_string();
        let path = worktree.path().to_string_lossy().to_string();
        let is_locked = worktree
            .is_locked()
            .map(|status| !matches!(status, git2::WorktreeLockStatus::Unlocked))
            .unwrap_or(false);

        let branch = Repository::open(worktree.path()).ok().and_then(|wt_repo| {
            let head = wt_repo.head().ok()?;
            if head.is_branch() {
                head.shorthand().map(|s| s.to_string())
            } else {
                None
            }
        });

        Ok(WorktreeInfo {
            name,
            path,
            branch,
            is_locked,
        })
    }
}

/// Compare paths, resolving symlinks when both exist
fn same_path(a: &Path, b: &Path) -> bool {
    if let (Ok(a), Ok(b)) = (a.canonicalize(), b.canonicalize()) {
        return a == b;
    }
    let a = a.to_string_lossy();
    let b = b.to_string_lossy();
    a.trim_end_matches('/') == b.trim_end_matches('/')
}
