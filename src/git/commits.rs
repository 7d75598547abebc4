//! Commit operations for GitManager

use git2::{Error as GitError, IndexAddOption, Oid, Sort};

use crate::git::GitManager;

impl GitManager {
    pub fn head_oid(&self) -> Result<Oid, GitError> {
        Ok(self.repo.head()?.peel_to_commit()?.id())
    }

    /// Stage every change in the working directory, deletions included
    pub fn stage_all(&self) -> Result<(), GitError> {
        let mut index = self.repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;
        Ok(())
    }

    /// Stage everything and commit it on HEAD.
    ///
    /// Returns `None` when there was nothing to commit.
    pub fn commit_all_if_dirty(&self, message: &str) -> Result<Option<Oid>, GitError> {
        if !self.is_dirty()? {
            return Ok(None);
        }
        self.stage_all()?;

        let mut index = self.repo.index()?;
        let tree_id = index.write_tree()?;
        let parent = self.repo.head()?.peel_to_commit()?;
        if parent.tree_id() == tree_id {
            return Ok(None);
        }

        let tree = self.repo.find_tree(tree_id)?;
        let signature = self.signature()?;
        let oid = self.repo.commit(
            Some("HEAD"),
            &signature,
            &signature,
            message,
            &tree,
            &[&parent],
        )?;

        log::info!("[GitManager] Committed {} ({})", oid, message);
        Ok(Some(oid))
    }

    /// Commits reachable from `tip` but not from `base`, oldest first
    pub fn commit_range(&self, base: Oid, tip: Oid) -> Result<Vec<Oid>, GitError> {
        let mut revwalk = self.repo.revwalk()?;
        revwalk.set_sorting(Sort::TOPOLOGICAL | Sort::REVERSE)?;
        revwalk.push(tip)?;
        revwalk.hide(base)?;
        revwalk.collect()
    }
}
