//! Reintegration of finished parallel work
//!
//! Replays the commits a worker made in its isolated workspace onto the
//! shared work branch. Runs on the scheduler loop only, so replays are
//! serialized even though the workers ran concurrently.

use super::workspace_pool::{WorkspaceAllocation, WorkspacePool};
use crate::git::{GitManager, ReplayOutcome};
use crate::plan::join_ids;
use crate::worker::{ResultStatus, WorkerResult};
use git2::Oid;
use std::path::{Path, PathBuf};

/// Result of reintegrating one workspace
#[derive(Debug, Clone)]
pub enum ReintegrationResult {
    /// Work branch now contains the workspace's changes
    Success {
        applied: usize,
        skipped: usize,
        head: String,
    },
    /// Replay stopped on a conflict; the work branch is unchanged
    Conflict(ConflictInfo),
    /// Reintegration failed for another reason
    Error(String),
}

/// Information about a reintegration conflict
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictInfo {
    pub step_ids: String,
    /// Private branch kept for manual recovery
    pub branch_name: String,
    pub commit: String,
    pub conflicting_files: Vec<String>,
    pub detected_at: String,
}

impl ConflictInfo {
    pub fn reason(&self) -> String {
        format!(
            "Reintegration conflict replaying {} onto the work branch in {}; work kept on branch {}",
            short(&self.commit),
            self.conflicting_files.join(", "),
            self.branch_name
        )
    }
}

/// Replays workspace commits onto the work branch checked out at `work_dir`
pub struct Reintegrator {
    work_dir: PathBuf,
    work_branch: String,
}

impl Reintegrator {
    pub fn new(work_dir: &Path, work_branch: &str) -> Self {
        Self {
            work_dir: work_dir.to_path_buf(),
            work_branch: work_branch.to_string(),
        }
    }

    /// Commit leftovers in the workspace and replay its range onto the work branch
    pub fn reintegrate(&self, allocation: &WorkspaceAllocation) -> ReintegrationResult {
        match self.try_reintegrate(allocation) {
            Ok(result) => result,
            Err(e) => {
                log::error!(
                    "[Reintegrator] Reintegration of steps {} failed: {}",
                    join_ids(&allocation.step_ids),
                    e
                );
                ReintegrationResult::Error(e)
            }
        }
    }

    fn try_reintegrate(&self, allocation: &WorkspaceAllocation) -> Result<ReintegrationResult, String> {
        let ids = join_ids(&allocation.step_ids);
        log::info!(
            "[Reintegrator] Reintegrating steps {} from branch {}",
            ids,
            allocation.branch_name
        );

        let workspace = GitManager::new(&allocation.path)
            .map_err(|e| format!("Failed to open workspace {:?}: {}", allocation.path, e))?;
        workspace
            .commit_all_if_dirty(&format!("baton: steps {}", ids))
            .map_err(|e| format!("Failed to commit workspace changes: {}", e))?;

        let base = Oid::from_str(&allocation.base_commit)
            .map_err(|e| format!("Invalid base commit {}: {}", allocation.base_commit, e))?;
        let tip = workspace
            .head_oid()
            .map_err(|e| format!("Failed to resolve workspace HEAD: {}", e))?;
        let range = workspace
            .commit_range(base, tip)
            .map_err(|e| format!("Failed to list workspace commits: {}", e))?;

        let target = GitManager::new(&self.work_dir)
            .map_err(|e| format!("Failed to open work directory {:?}: {}", self.work_dir, e))?;
        if target.current_branch_name().as_deref() != Some(self.work_branch.as_str()) {
            return Err(format!(
                "{:?} is not on work branch {}",
                self.work_dir, self.work_branch
            ));
        }

        if range.is_empty() {
            log::info!("[Reintegrator] Steps {} produced no commits", ids);
            let head = target
                .head_oid()
                .map_err(|e| format!("Failed to resolve work branch: {}", e))?;
            return Ok(ReintegrationResult::Success {
                applied: 0,
                skipped: 0,
                head: head.to_string(),
            });
        }

        let outcome = target
            .replay_commits(&range)
            .map_err(|e| format!("Failed to replay commits: {}", e))?;

        Ok(match outcome {
            ReplayOutcome::Applied {
                applied,
                skipped,
                head,
            } => {
                log::info!(
                    "[Reintegrator] Steps {}: {} commit(s) applied, {} skipped, work branch at {}",
                    ids,
                    applied,
                    skipped,
                    short(&head)
                );
                ReintegrationResult::Success {
                    applied,
                    skipped,
                    head,
                }
            }
            ReplayOutcome::Conflict {
                commit,
                summary,
                paths,
            } => {
                log::warn!(
                    "[Reintegrator] Conflict for steps {} at {} ({}): {:?}",
                    ids,
                    short(&commit),
                    summary,
                    paths
                );
                ReintegrationResult::Conflict(ConflictInfo {
                    step_ids: ids,
                    branch_name: allocation.branch_name.clone(),
                    commit,
                    conflicting_files: paths,
                    detected_at: chrono::Utc::now().to_rfc3339(),
                })
            }
        })
    }
}

/// Reintegrate a finished workspace if the worker completed anything,
/// dispose of the workspace, and return the results to record.
///
/// Completed results turn into blocked ones when their work could not be
/// reintegrated. A workspace with nothing completed is discarded.
pub fn settle_workspace(
    pool: &mut WorkspacePool,
    reintegrator: &Reintegrator,
    allocation: &WorkspaceAllocation,
    mut results: Vec<WorkerResult>,
) -> Vec<WorkerResult> {
    let any_complete = results.iter().any(|r| r.status == ResultStatus::Complete);

    let (failure, keep_branch) = if any_complete {
        match reintegrator.reintegrate(allocation) {
            ReintegrationResult::Success { .. } => (None, false),
            ReintegrationResult::Conflict(info) => (Some(info.reason()), true),
            ReintegrationResult::Error(e) => (
                Some(format!(
                    "Reintegration failed: {}; work kept on branch {}",
                    e, allocation.branch_name
                )),
                true,
            ),
        }
    } else {
        (None, false)
    };

    let released = if keep_branch {
        pool.release_keep_branch(&allocation.key)
    } else {
        pool.release(&allocation.key)
    };
    if let Err(e) = released {
        log::warn!(
            "[Reintegrator] Failed to clean up workspace {:?}: {}",
            allocation.path,
            e
        );
    }

    if let Some(reason) = failure {
        for result in results.iter_mut() {
            if result.status == ResultStatus::Complete {
                result.status = ResultStatus::Blocked;
                result.blocked_reason = Some(reason.clone());
            }
        }
    }
    results
}

fn short(oid: &str) -> &str {
    oid.get(..7).unwrap_or(oid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::StepId;
    use git2::{Repository, Signature};
    use std::fs;
    use tempfile::TempDir;

    /// Repo on work branch `baton/demo` with one committed file
    fn setup_repo() -> TempDir {
        let temp_dir = TempDir::new().unwrap();
        let repo = Repository::init(temp_dir.path()).unwrap();
        let sig = Signature::now("Test User", "test@example.com").unwrap();
        let tree_id = {
            let mut index = repo.index().unwrap();
            fs::write(temp_dir.path().join("test.txt"), "Hello, World!").unwrap();
            index.add_path(Path::new("test.txt")).unwrap();
            index.write().unwrap();
            index.write_tree().unwrap()
        };
        let tree = repo.find_tree(tree_id).unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "Initial commit", &tree, &[])
            .unwrap();
        crate::utils::ensure_layout(temp_dir.path()).unwrap();

        let git = GitManager::new(temp_dir.path()).unwrap();
        git.create_branch("baton/demo", false).unwrap();
        git.checkout_branch("baton/demo").unwrap();
        temp_dir
    }

    #[test]
    fn test_reintegrate_uncommitted_work() {
        let repo = setup_repo();
        let mut pool = WorkspacePool::new(repo.path(), "demo", "r1", "baton/demo");
        let reintegrator = Reintegrator::new(repo.path(), "baton/demo");

        let allocation = pool.acquire(&[StepId::new("a")]).unwrap();
        fs::write(allocation.path.join("a.txt"), "from a").unwrap();

        let results = settle_workspace(
            &mut pool,
            &reintegrator,
            &allocation,
            vec![WorkerResult::complete(StepId::new("a"), "done")],
        );

        assert_eq!(results[0].status, ResultStatus::Complete);
        assert_eq!(fs::read_to_string(repo.path().join("a.txt")).unwrap(), "from a");
        assert!(!allocation.path.exists());
        let git = GitManager::new(repo.path()).unwrap();
        assert!(!git.branch_exists(&allocation.branch_name));
        assert!(!git.is_dirty().unwrap());
    }

    #[test]
    fn test_two_disjoint_workspaces_both_land() {
        let repo = setup_repo();
        let mut pool = WorkspacePool::new(repo.path(), "demo", "r1", "baton/demo");
        let reintegrator = Reintegrator::new(repo.path(), "baton/demo");

        let first = pool.acquire(&[StepId::new("a")]).unwrap();
        let second = pool.acquire(&[StepId::new("b")]).unwrap();
        fs::write(first.path.join("a.txt"), "a").unwrap();
        fs::write(second.path.join("b.txt"), "b").unwrap();

        assert!(matches!(
            reintegrator.reintegrate(&first),
            ReintegrationResult::Success { applied: 1, .. }
        ));
        assert!(matches!(
            reintegrator.reintegrate(&second),
            ReintegrationResult::Success { applied: 1, .. }
        ));
        assert!(repo.path().join("a.txt").exists());
        assert!(repo.path().join("b.txt").exists());
    }

    #[test]
    fn test_conflict_blocks_and_keeps_branch() {
        let repo = setup_repo();
        let mut pool = WorkspacePool::new(repo.path(), "demo", "r1", "baton/demo");
        let reintegrator = Reintegrator::new(repo.path(), "baton/demo");

        let first = pool.acquire(&[StepId::new("a")]).unwrap();
        let second = pool.acquire(&[StepId::new("b")]).unwrap();
        fs::write(first.path.join("test.txt"), "version a").unwrap();
        fs::write(second.path.join("test.txt"), "version b").unwrap();

        let ok = settle_workspace(
            &mut pool,
            &reintegrator,
            &first,
            vec![WorkerResult::complete(StepId::new("a"), "done")],
        );
        assert_eq!(ok[0].status, ResultStatus::Complete);

        let blocked = settle_workspace(
            &mut pool,
            &reintegrator,
            &second,
            vec![WorkerResult::complete(StepId::new("b"), "done")],
        );
        assert_eq!(blocked[0].status, ResultStatus::Blocked);
        let reason = blocked[0].reason();
        assert!(reason.contains("test.txt"), "{}", reason);
        assert!(reason.contains(&second.branch_name), "{}", reason);

        assert!(!second.path.exists());
        let git = GitManager::new(repo.path()).unwrap();
        assert!(git.branch_exists(&second.branch_name));
        assert_eq!(
            fs::read_to_string(repo.path().join("test.txt")).unwrap(),
            "version a"
        );
    }

    #[test]
    fn test_failed_worker_discards_workspace() {
        let repo = setup_repo();
        let mut pool = WorkspacePool::new(repo.path(), "demo", "r1", "baton/demo");
        let reintegrator = Reintegrator::new(repo.path(), "baton/demo");
        let git = GitManager::new(repo.path()).unwrap();
        let before = git.head_oid().unwrap();

        let allocation = pool.acquire(&[StepId::new("a")]).unwrap();
        fs::write(allocation.path.join("junk.txt"), "half done").unwrap();

        let results = settle_workspace(
            &mut pool,
            &reintegrator,
            &allocation,
            vec![WorkerResult::blocked(StepId::new("a"), "tests fail")],
        );

        assert_eq!(results[0].reason(), "tests fail");
        assert!(!allocation.path.exists());
        assert!(!git.branch_exists(&allocation.branch_name));
        assert_eq!(git.head_oid().unwrap(), before);
        assert!(!repo.path().join("junk.txt").exists());
    }

    #[test]
    fn test_wrong_work_branch_is_an_error() {
        let repo = setup_repo();
        let mut pool = WorkspacePool::new(repo.path(), "demo", "r1", "baton/demo");
        let allocation = pool.acquire(&[StepId::new("a")]).unwrap();

        let reintegrator = Reintegrator::new(repo.path(), "baton/other");
        assert!(matches!(
            reintegrator.reintegrate(&allocation),
            ReintegrationResult::Error(_)
        ));
    }
}
