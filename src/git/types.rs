//! Git data types and structures

use serde::{Deserialize, Serialize};

/// Represents a git branch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchInfo {
    pub name: String,
    pub is_head: bool,
    pub commit_id: String,
}

/// Represents a git worktree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeInfo {
    pub name: String,
    pub path: String,
    pub branch: Option<String>,
    pub is_locked: bool,
}

/// Represents a file status in git
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileStatus {
    pub path: String,
    pub status: String,
}

/// Outcome of replaying a commit range onto HEAD
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// Every commit replayed (or was already present); HEAD is at `head`
    Applied {
        applied: usize,
        skipped: usize,
        head: String,
    },
    /// `commit` could not be replayed cleanly. HEAD and the working tree
    /// are exactly as they were before the replay started.
    Conflict {
        commit: String,
        summary: String,
        paths: Vec<String>,
    },
}
