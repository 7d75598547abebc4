//! Git operations using git2-rs
//!
//! The primitives the isolation layer is built on:
//! - `manager` - Core GitManager struct
//! - `branches` - Branch creation, lookup, checkout and deletion
//! - `worktrees` - Worktree add, list, remove and pruning
//! - `commits` - Staging, auto-commit and commit ranges
//! - `cherry_pick` - Atomic replay of a commit range onto HEAD
//! - `status` - Working tree status
//! - `types` - Shared data structures

mod branches;
mod cherry_pick;
mod commits;
mod manager;
mod status;
#[cfg(test)]
mod tests;
mod types;
mod worktrees;

pub use manager::GitManager;
pub use types::{BranchInfo, FileStatus, ReplayOutcome, WorktreeInfo};
