//! Status and file tracking operations for GitManager

use git2::{Error as GitError, Status, StatusOptions};

use crate::git::types::FileStatus;
use crate::git::GitManager;

impl GitManager {
    /// Changed, staged and untracked (not ignored) files
    pub fn get_status(&self) -> Result<Vec<FileStatus>, GitError> {
        let mut opts = StatusOptions::new();
        opts.include_untracked(true);
        opts.recurse_untracked_dirs(true);

        let statuses = self.repo.statuses(Some(&mut opts))?;

        let mut result = Vec::new();
        for entry in statuses.iter() {
            if let Some(path) = entry.path() {
                result.push(FileStatus {
                    path: path.to_string(),
                    status: status_to_string(entry.status()),
                });
            }
        }

        Ok(result)
    }

    /// Whether the working directory has anything an auto-commit would pick up
    pub fn is_dirty(&self) -> Result<bool, GitError> {
        Ok(!self.get_status()?.is_empty())
    }
}

fn status_to_string(status: Status) -> String {
    let mut result = Vec::new();

    if status.intersects(Status::INDEX_NEW | Status::WT_NEW) {
        result.push("new");
    }
    if status.intersects(Status::INDEX_MODIFIED | Status::WT_MODIFIED) {
        result.push("modified");
    }
    if status.intersects(Status::INDEX_DELETED | Status::WT_DELETED) {
        result.push("deleted");
    }
    if status.intersects(Status::INDEX_RENAMED | Status::WT_RENAMED) {
        result.push("renamed");
    }
    if status.intersects(Status::INDEX_TYPECHANGE | Status::WT_TYPECHANGE) {
        result.push("typechange");
    }
    if status.contains(Status::CONFLICTED) {
        result.push("conflicted");
    }

    if result.is_empty() {
        "unknown".to_string()
    } else {
        result.join(", ")
    }
}
