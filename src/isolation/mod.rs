//! Isolation manager: private worktrees for parallel workers and
//! conflict-aware reintegration of their commits

pub mod reintegration;
pub mod workspace_pool;

pub use reintegration::{settle_workspace, ConflictInfo, ReintegrationResult, Reintegrator};
pub use workspace_pool::{
    ensure_plan_worktree, plan_worktree_path, remove_plan_worktree, workspace_branch,
    WorkspaceAllocation, WorkspacePool,
};
