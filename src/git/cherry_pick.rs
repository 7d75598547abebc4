//! Replaying commits onto the checked-out branch
//!
//! Every commit is cherry-picked in memory against the previous result, so
//! nothing touches the branch or the working tree until the whole range has
//! replayed cleanly. A conflict anywhere leaves the branch exactly where it
//! was; the dangling intermediate commits are unreachable and get collected
//! by git's own gc.

use git2::build::CheckoutBuilder;
use git2::{Error as GitError, Index, Oid};

use crate::git::types::ReplayOutcome;
use crate::git::GitManager;

impl GitManager {
    /// Cherry-pick `commits` (oldest first) onto the branch HEAD points at.
    ///
    /// Commits whose changes are already present are skipped. On success the
    /// working tree is updated with a safe checkout before the branch moves.
    pub fn replay_commits(&self, commits: &[Oid]) -> Result<ReplayOutcome, GitError> {
        let head = self.repo.head()?;
        if !head.is_branch() {
            return Err(GitError::from_str("HEAD is not a branch"));
        }
        let start = head.peel_to_commit()?;
        let mut current = start.clone();
        let mut applied = 0;
        let mut skipped = 0;

        for oid in commits {
            let commit = self.repo.find_commit(*oid)?;
            let mainline = if commit.parent_count() > 1 { 1 } else { 0 };
            let mut index = self
                .repo
                .cherrypick_commit(&commit, &current, mainline, None)?;

            if index.has_conflicts() {
                let paths = conflict_paths(&index)?;
                log::warn!(
                    "[GitManager] Replay of {} conflicts on {:?}",
                    oid,
                    paths
                );
                return Ok(ReplayOutcome::Conflict {
                    commit: oid.to_string(),
                    summary: commit.summary().unwrap_or("").to_string(),
                    paths,
                });
            }

            let tree_id = index.write_tree_to(&self.repo)?;
            if tree_id == current.tree_id() {
                log::debug!("[GitManager] Skipping {} (no changes left to apply)", oid);
                skipped += 1;
                continue;
            }

            let tree = self.repo.find_tree(tree_id)?;
            let committer = self.signature()?;
            let new_oid = self.repo.commit(
                None,
                &commit.author(),
                &committer,
                commit.message().unwrap_or(""),
                &tree,
                &[&current],
            )?;
            current = self.repo.find_commit(new_oid)?;
            applied += 1;
        }

        if current.id() != start.id() {
            let mut checkout = CheckoutBuilder::new();
            checkout.safe();
            self.repo
                .checkout_tree(current.as_object(), Some(&mut checkout))?;
            self.repo
                .head()?
                .resolve()?
                .set_target(current.id(), "baton: reintegrate")?;
        }

        Ok(ReplayOutcome::Applied {
            applied,
            skipped,
            head: current.id().to_string(),
        })
    }
}

fn conflict_paths(index: &Index) -> Result<Vec<String>, GitError> {
    let mut paths = Vec::new();
    for conflict in index.conflicts()? {
        let conflict = conflict?;
        let entry = conflict.our.or(conflict.their).or(conflict.ancestor);
        if let Some(entry) = entry {
            let path = String::from_utf8_lossy(&entry.path).to_string();
            if !paths.contains(&path) {
                paths.push(path);
            }
        }
    }
    Ok(paths)
}
