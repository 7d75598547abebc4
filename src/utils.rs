// Utility functions

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

// =============================================================================
// State directory helpers
// =============================================================================

/// Get the .baton directory path for a repository.
#[inline]
pub fn baton_dir(repo_path: &Path) -> PathBuf {
    repo_path.join(".baton")
}

/// Get the .baton/plans directory path for a repository.
#[inline]
pub fn plans_dir(repo_path: &Path) -> PathBuf {
    baton_dir(repo_path).join("plans")
}

/// Get the .baton/plans/archive directory path for a repository.
#[inline]
pub(crate) fn archive_dir(repo_path: &Path) -> PathBuf {
    plans_dir(repo_path).join("archive")
}

/// Get the .baton/reports directory path for a repository.
#[inline]
pub(crate) fn reports_dir(repo_path: &Path) -> PathBuf {
    baton_dir(repo_path).join("reports")
}

/// Get the .baton/locks directory path for a repository.
#[inline]
pub(crate) fn locks_dir(repo_path: &Path) -> PathBuf {
    baton_dir(repo_path).join("locks")
}

/// Get the .baton/worktrees directory path for a repository.
#[inline]
pub(crate) fn worktrees_dir(repo_path: &Path) -> PathBuf {
    baton_dir(repo_path).join("worktrees")
}

/// Create the .baton directory tree.
///
/// The `.gitignore` inside `.baton` ignores everything, so auto-commits made on
/// behalf of workers never pick up plans, reports, locks or nested worktrees.
pub fn ensure_layout(repo_path: &Path) -> Result<(), String> {
    for dir in [
        plans_dir(repo_path),
        archive_dir(repo_path),
        reports_dir(repo_path),
        locks_dir(repo_path),
        worktrees_dir(repo_path),
    ] {
        ensure_dir(&dir)?;
    }

    let gitignore = baton_dir(repo_path).join(".gitignore");
    if !gitignore.exists() {
        fs::write(&gitignore, "*\n")
            .map_err(|e| format!("Failed to write {:?}: {}", gitignore, e))?;
    }
    Ok(())
}

// =============================================================================
// File helpers
// =============================================================================

/// Create a directory and all of its parents
pub(crate) fn ensure_dir(path: &Path) -> Result<(), String> {
    fs::create_dir_all(path).map_err(|e| format!("Failed to create directory {:?}: {}", path, e))
}

/// Write content to a file atomically (write to temp file, then rename)
pub(crate) fn atomic_write(path: &Path, content: &str) -> Result<(), String> {
    let temp_path = path.with_extension("tmp");

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }

    fs::write(&temp_path, content)
        .map_err(|e| format!("Failed to write temp file {:?}: {}", temp_path, e))?;

    fs::rename(&temp_path, path)
        .map_err(|e| format!("Failed to rename {:?} to {:?}: {}", temp_path, path, e))?;

    Ok(())
}

// =============================================================================
// Naming helpers
// =============================================================================

/// Sanitize a string for use in a branch name
pub(crate) fn sanitize_branch_name(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect::<String>()
        .to_lowercase()
}

/// Sanitize a string for use as a path component
pub(crate) fn sanitize_path_component(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect::<String>()
}

/// Safely acquire a mutex lock, recovering from poisoning by returning the guard.
/// Worker output buffers are append-only, so a poisoned guard is still usable.
pub(crate) fn lock_mutex_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            log::warn!("Mutex was poisoned, recovering: {}", poisoned);
            poisoned.into_inner()
        }
    }
}
