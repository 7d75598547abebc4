//! Workspace Pool for Parallel Execution
//!
//! Each parallel worker gets a private git worktree on its own branch,
//! forked from the tip of the plan's work branch. Paths and branch names
//! carry the run id, so workspaces a crashed run left behind are never
//! reused or deleted by a later run.

use crate::git::GitManager;
use crate::plan::StepId;
use crate::utils::{ensure_dir, sanitize_branch_name, sanitize_path_component, worktrees_dir};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// An isolated workspace handed to one worker invocation
#[derive(Debug, Clone)]
pub struct WorkspaceAllocation {
    /// Pool key, unique within the run
    pub key: String,
    /// Steps the workspace was allocated for
    pub step_ids: Vec<StepId>,
    /// Path to the worktree directory
    pub path: PathBuf,
    /// Private branch checked out in the worktree
    pub branch_name: String,
    /// Work branch commit the private branch was forked from
    pub base_commit: String,
}

/// Pool of isolated workspaces for one plan run
pub struct WorkspacePool {
    repo_path: PathBuf,
    plan_id: String,
    run_id: String,
    work_branch: String,
    active: HashMap<String, WorkspaceAllocation>,
}

impl WorkspacePool {
    pub fn new(repo_path: &Path, plan_id: &str, run_id: &str, work_branch: &str) -> Self {
        Self {
            repo_path: repo_path.to_path_buf(),
            plan_id: plan_id.to_string(),
            run_id: run_id.to_string(),
            work_branch: work_branch.to_string(),
            active: HashMap::new(),
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Directory holding every workspace of this plan
    pub fn plan_root(&self) -> PathBuf {
        worktrees_dir(&self.repo_path).join(sanitize_path_component(&self.plan_id))
    }

    /// Allocate a workspace for `step_ids` from the current work branch tip
    pub fn acquire(&mut self, step_ids: &[StepId]) -> Result<WorkspaceAllocation, String> {
        let key = workspace_key(&self.run_id, step_ids);
        if let Some(existing) = self.active.get(&key) {
            return Ok(existing.clone());
        }

        let branch_name = workspace_branch(&self.plan_id, &key);
        let path = self.plan_root().join(sanitize_path_component(&key));
        ensure_dir(&self.plan_root())?;

        let git_manager = GitManager::new(&self.repo_path)
            .map_err(|e| format!("Failed to open git repository: {}", e))?;

        if let Err(e) = git_manager.prune_orphaned_worktrees() {
            log::warn!("[WorkspacePool] Failed to prune orphaned worktrees: {}", e);
        }

        let base = git_manager
            .branch_tip(&self.work_branch)
            .map_err(|e| format!("Failed to resolve work branch {}: {}", self.work_branch, e))?;

        git_manager
            .create_branch_from_commit(&branch_name, base, false)
            .map_err(|e| format!("Failed to create branch {}: {}", branch_name, e))?;

        if let Err(e) = git_manager.add_worktree(&branch_name, &path) {
            if let Err(del) = git_manager.delete_branch(&branch_name) {
                log::debug!("[WorkspacePool] Cleanup of {} failed: {}", branch_name, del);
            }
            return Err(format!("Failed to create worktree at {:?}: {}", path, e));
        }

        log::info!(
            "[WorkspacePool] Created workspace for steps {} at {:?} on branch {}",
            crate::plan::join_ids(step_ids),
            path,
            branch_name
        );

        let allocation = WorkspaceAllocation {
            key: key.clone(),
            step_ids: step_ids.to_vec(),
            path,
            branch_name,
            base_commit: base.to_string(),
        };
        self.active.insert(key, allocation.clone());
        Ok(allocation)
    }

    /// Remove the workspace and delete its private branch
    pub fn release(&mut self, key: &str) -> Result<(), String> {
        self.retire(key, false)
    }

    /// Remove the workspace but keep its branch for manual recovery
    pub fn release_keep_branch(&mut self, key: &str) -> Result<(), String> {
        self.retire(key, true)
    }

    /// Forget allocations without touching disk; used on interrupt so
    /// in-flight workspaces stay inspectable.
    pub fn abandon_all(&mut self) -> Vec<WorkspaceAllocation> {
        let left: Vec<WorkspaceAllocation> = self.active.drain().map(|(_, a)| a).collect();
        for allocation in &left {
            log::warn!(
                "[WorkspacePool] Leaving workspace {:?} (branch {}) for inspection",
                allocation.path,
                allocation.branch_name
            );
        }
        left
    }

    fn retire(&mut self, key: &str, keep_branch: bool) -> Result<(), String> {
        let allocation = match self.active.remove(key) {
            Some(a) => a,
            None => return Ok(()),
        };

        let git_manager = GitManager::new(&self.repo_path)
            .map_err(|e| format!("Failed to open git repository: {}", e))?;

        if let Err(e) = git_manager.remove_worktree(&allocation.path) {
            log::warn!("[WorkspacePool] Failed to remove worktree from git: {}", e);
        }
        if allocation.path.exists() {
            std::fs::remove_dir_all(&allocation.path)
                .map_err(|e| format!("Failed to remove workspace directory: {}", e))?;
        }

        // The worktree must be gone before its branch can be deleted
        if !keep_branch {
            git_manager
                .delete_branch(&allocation.branch_name)
                .map_err(|e| format!("Failed to delete branch {}: {}", allocation.branch_name, e))?;
        }

        log::info!(
            "[WorkspacePool] Released workspace {:?}{}",
            allocation.path,
            if keep_branch { " (branch kept)" } else { "" }
        );
        Ok(())
    }
}

/// Dedicated checkout of the work branch used in plan lock scope
pub fn plan_worktree_path(repo_path: &Path, plan_id: &str) -> PathBuf {
    worktrees_dir(repo_path)
        .join(sanitize_path_component(plan_id))
        .join("work")
}

/// Make sure the work branch is checked out at the plan worktree.
///
/// An existing worktree from an earlier run is reused.
pub fn ensure_plan_worktree(
    repo_path: &Path,
    plan_id: &str,
    work_branch: &str,
) -> Result<PathBuf, String> {
    let path = plan_worktree_path(repo_path, plan_id);
    let git_manager = GitManager::new(repo_path)
        .map_err(|e| format!("Failed to open git repository: {}", e))?;

    if path.join(".git").exists() {
        let existing = GitManager::new(&path)
            .map_err(|e| format!("Failed to open plan worktree {:?}: {}", path, e))?;
        if existing.current_branch_name().as_deref() == Some(work_branch) {
            log::info!("[WorkspacePool] Reusing plan worktree at {:?}", path);
            return Ok(path);
        }
        return Err(format!(
            "Plan worktree {:?} is not on branch {}",
            path, work_branch
        ));
    }

    if let Err(e) = git_manager.prune_orphaned_worktrees() {
        log::warn!("[WorkspacePool] Failed to prune orphaned worktrees: {}", e);
    }
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    git_manager
        .add_worktree(work_branch, &path)
        .map_err(|e| format!("Failed to create plan worktree at {:?}: {}", path, e))?;

    log::info!(
        "[WorkspacePool] Checked out {} at plan worktree {:?}",
        work_branch,
        path
    );
    Ok(path)
}

/// Remove the plan worktree; the work branch stays
pub fn remove_plan_worktree(repo_path: &Path, plan_id: &str) -> Result<(), String> {
    let path = plan_worktree_path(repo_path, plan_id);
    if !path.exists() {
        return Ok(());
    }
    let git_manager = GitManager::new(repo_path)
        .map_err(|e| format!("Failed to open git repository: {}", e))?;
    git_manager
        .remove_worktree(&path)
        .map_err(|e| format!("Failed to remove plan worktree: {}", e))?;
    if path.exists() {
        std::fs::remove_dir_all(&path)
            .map_err(|e| format!("Failed to remove plan worktree directory: {}", e))?;
    }
    Ok(())
}

/// Private branch for a workspace.
///
/// Lives under `baton-ws/` so it never nests below a `baton/<plan>` work
/// branch; git cannot hold a ref and a ref directory with the same name.
pub fn workspace_branch(plan_id: &str, key: &str) -> String {
    format!(
        "baton-ws/{}/{}",
        sanitize_branch_name(plan_id),
        sanitize_branch_name(key)
    )
}

fn workspace_key(run_id: &str, step_ids: &[StepId]) -> String {
    let ids: Vec<String> = step_ids
        .iter()
        .map(|id| sanitize_path_component(id.as_str()))
        .collect();
    format!("{}-{}", run_id, ids.join("_"))
}
