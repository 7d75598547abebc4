//! Core GitManager implementation

use git2::{Error as GitError, Repository, Signature};
use std::path::{Path, PathBuf};

/// Identity used for engine commits when the repository has none configured
const FALLBACK_NAME: &str = "Baton";
const FALLBACK_EMAIL: &str = "baton@localhost";

/// Git manager for repository operations.
///
/// Opening a linked worktree path gives a manager whose HEAD, index and
/// working directory are that worktree's.
pub struct GitManager {
    pub(crate) repo: Repository,
}

impl GitManager {
    /// Create a new GitManager for the given repository or worktree path
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, GitError> {
        let repo = Repository::open(path)?;
        Ok(Self { repo })
    }

    /// Path to the `.git` directory (or the worktree's gitdir)
    pub fn repo_path(&self) -> PathBuf {
        self.repo.path().to_path_buf()
    }

    /// Working directory of this repository or worktree
    pub fn workdir(&self) -> Option<PathBuf> {
        self.repo.workdir().map(|p| p.to_path_buf())
    }

    /// Configured signature, or the engine's own identity
    pub(crate) fn signature(&self) -> Result<Signature<'static>, GitError> {
        self.repo
            .signature()
            .or_else(|_| Signature::now(FALLBACK_NAME, FALLBACK_EMAIL))
    }
}
