// Execution lock files guarding orchestration runs

use crate::error::RunError;
use crate::utils::locks_dir;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// File name of the repository-wide lock
const GLOBAL_LOCK_FILE: &str = "global.lock";

/// Lock file contents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    /// Process ID that holds the lock
    pub pid: u32,
    /// When the lock was acquired
    pub started_at: DateTime<Utc>,
    /// Command line of the owning process
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    /// Plan worktree used by the run, when it does not work in the repo root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<String>,
}

impl LockInfo {
    /// Create lock info for the current process
    pub fn new(plan_id: Option<&str>, worktree_path: Option<&Path>) -> Self {
        Self {
            pid: std::process::id(),
            started_at: Utc::now(),
            command: std::env::args().collect::<Vec<_>>().join(" "),
            plan_id: plan_id.map(String::from),
            worktree_path: worktree_path.map(|p| p.display().to_string()),
        }
    }

    fn describe(&self) -> String {
        let mut s = format!(
            "pid {} ({}) since {}",
            self.pid,
            self.command,
            self.started_at.to_rfc3339()
        );
        if let Some(plan_id) = &self.plan_id {
            s.push_str(&format!(", plan '{}'", plan_id));
        }
        s
    }
}

/// Outcome of a lock acquisition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acquisition {
    pub acquired: bool,
    /// Why the lock could not be taken
    pub reason: Option<String>,
}

impl Acquisition {
    fn granted() -> Self {
        Self {
            acquired: true,
            reason: None,
        }
    }

    fn refused(reason: String) -> Self {
        Self {
            acquired: false,
            reason: Some(reason),
        }
    }
}

/// Lock manager for one repository.
///
/// `plan_id = None` addresses the global lock; `Some(id)` addresses the
/// per-plan lock for that plan.
#[derive(Debug, Clone)]
pub struct ConcurrencyGuard {
    lock_dir: PathBuf,
}

impl ConcurrencyGuard {
    pub fn new(repo_path: &Path) -> Self {
        Self {
            lock_dir: locks_dir(repo_path),
        }
    }

    /// Path of the lock file for a scope
    pub fn lock_path(&self, plan_id: Option<&str>) -> PathBuf {
        match plan_id {
            Some(id) => self.lock_dir.join(format!("plan-{}.lock", id)),
            None => self.lock_dir.join(GLOBAL_LOCK_FILE),
        }
    }

    /// Try to acquire the lock
    pub fn acquire(&self, plan_id: Option<&str>) -> Result<Acquisition> {
        self.acquire_with_info(&LockInfo::new(plan_id, None))
            .map(|(acquisition, _)| acquisition)
    }

    /// Try to acquire the lock with a prepared token.
    ///
    /// The token is written to a private temp file and hard-linked into
    /// place, so other processes only ever see complete tokens and two racing
    /// processes can never both succeed. A stale token is removed and
    /// creation retried once.
    ///
    /// The global lock and per-plan locks exclude each other: a global run
    /// refuses while any live plan lock exists and vice versa.
    pub fn acquire_with_info(&self, info: &LockInfo) -> Result<(Acquisition, LockInfo)> {
        fs::create_dir_all(&self.lock_dir)
            .map_err(|e| anyhow!("Failed to create lock directory: {}", e))?;

        let (acquisition, holder) = self.acquire_own(info)?;
        if !acquisition.acquired {
            return Ok((acquisition, holder));
        }

        // Checked after our token is visible, so two runs in different
        // scopes can at worst both back off, never both proceed
        if let Some((path, other)) = self.live_cross_scope(info.plan_id.as_deref())? {
            self.release_token(info)?;
            return Ok((
                Acquisition::refused(format!(
                    "Lock {:?} is held by {}",
                    path,
                    other.describe()
                )),
                other,
            ));
        }

        log::debug!(
            "[ExecutionLock] Acquired {:?}",
            self.lock_path(info.plan_id.as_deref())
        );
        Ok((acquisition, holder))
    }

    fn acquire_own(&self, info: &LockInfo) -> Result<(Acquisition, LockInfo)> {
        let path = self.lock_path(info.plan_id.as_deref());

        if self.try_create(&path, info)? {
            return Ok((Acquisition::granted(), info.clone()));
        }

        let existing = match read_lock_info(&path) {
            Ok(existing) => existing,
            Err(e) => {
                if !is_abandoned(&path) {
                    return Ok((
                        Acquisition::refused(format!(
                            "Lock {:?} exists but could not be read ({}); retry shortly",
                            path, e
                        )),
                        info.clone(),
                    ));
                }
                log::warn!(
                    "[ExecutionLock] Unreadable lock {:?} ({}), treating as stale",
                    path,
                    e
                );
                remove_if_exists(&path)?;
                return self.retry_after_displace(&path, info);
            }
        };

        if !is_lock_stale(&existing) {
            return Ok((
                Acquisition::refused(format!(
                    "Lock {:?} is held by {}",
                    path,
                    existing.describe()
                )),
                existing,
            ));
        }

        log::info!(
            "[ExecutionLock] Displacing stale lock held by {}",
            existing.describe()
        );
        remove_if_unchanged(&path, &existing)?;
        self.retry_after_displace(&path, info)
    }

    /// A live lock in the other scope, if any
    fn live_cross_scope(&self, plan_id: Option<&str>) -> Result<Option<(PathBuf, LockInfo)>> {
        if plan_id.is_some() {
            let path = self.lock_path(None);
            return Ok(match self.read(None) {
                Ok(Some(other)) if !is_lock_stale(&other) => Some((path, other)),
                _ => None,
            });
        }

        for entry in fs::read_dir(&self.lock_dir)? {
            let path = entry?.path();
            let is_plan_lock = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("plan-") && n.ends_with(".lock"))
                .unwrap_or(false);
            if !is_plan_lock {
                continue;
            }
            if let Ok(other) = read_lock_info(&path) {
                if !is_lock_stale(&other) {
                    return Ok(Some((path, other)));
                }
            }
        }
        Ok(None)
    }

    fn retry_after_displace(&self, path: &Path, info: &LockInfo) -> Result<(Acquisition, LockInfo)> {
        if self.try_create(path, info)? {
            return Ok((Acquisition::granted(), info.clone()));
        }
        // Another process took the lock between removal and creation
        let winner = read_lock_info(path)?;
        Ok((
            Acquisition::refused(format!(
                "Lock {:?} was taken by {}",
                path,
                winner.describe()
            )),
            winner,
        ))
    }

    /// Publish a complete token at `path` unless one already exists
    fn try_create(&self, path: &Path, info: &LockInfo) -> Result<bool> {
        let contents = serde_json::to_string_pretty(info)
            .map_err(|e| anyhow!("Failed to serialize lock info: {}", e))?;

        let tmp = self.lock_dir.join(format!(
            ".{}.{}.tmp",
            uuid::Uuid::new_v4().simple(),
            std::process::id()
        ));
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&tmp)
                .map_err(|e| anyhow!("Failed to create lock temp file {:?}: {}", tmp, e))?;
            file.write_all(contents.as_bytes())
                .and_then(|_| file.sync_all())
                .map_err(|e| anyhow!("Failed to write lock file: {}", e))?;
        }

        let linked = fs::hard_link(&tmp, path);
        remove_if_exists(&tmp)?;
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(anyhow!("Failed to create lock file {:?}: {}", path, e)),
        }
    }

    /// Release the lock if the current process owns it.
    ///
    /// Returns whether a lock file was removed.
    pub fn release(&self, plan_id: Option<&str>) -> Result<bool> {
        let path = self.lock_path(plan_id);
        match self.read(plan_id)? {
            Some(info) if info.pid == std::process::id() => {
                remove_if_exists(&path)?;
                log::debug!("[ExecutionLock] Released {:?}", path);
                Ok(true)
            }
            Some(info) => {
                log::warn!(
                    "[ExecutionLock] Not releasing {:?}: owned by pid {}",
                    path,
                    info.pid
                );
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// Release only if the file still holds exactly this token
    fn release_token(&self, token: &LockInfo) -> Result<bool> {
        let path = self.lock_path(token.plan_id.as_deref());
        match self.read(token.plan_id.as_deref())? {
            Some(info) if info.pid == token.pid && info.started_at == token.started_at => {
                remove_if_exists(&path)?;
                log::debug!("[ExecutionLock] Released {:?}", path);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Read the token for a scope, if any
    pub fn read(&self, plan_id: Option<&str>) -> Result<Option<LockInfo>> {
        let path = self.lock_path(plan_id);
        if !path.exists() {
            return Ok(None);
        }
        read_lock_info(&path).map(Some)
    }

    /// Acquire the lock and wrap it in a guard that releases on drop
    pub fn lock(
        &self,
        plan_id: Option<&str>,
        worktree_path: Option<&Path>,
    ) -> std::result::Result<LockGuard, RunError> {
        let info = LockInfo::new(plan_id, worktree_path);
        let (acquisition, _) = self
            .acquire_with_info(&info)
            .map_err(|e| RunError::Lock(e.to_string()))?;

        if !acquisition.acquired {
            return Err(RunError::LockContention(
                acquisition.reason.unwrap_or_else(|| "lock is held".to_string()),
            ));
        }

        Ok(LockGuard {
            guard: self.clone(),
            token: info,
            released: false,
        })
    }

    /// All lock files in the repository whose owner is gone
    pub fn find_stale(&self) -> Result<Vec<(PathBuf, LockInfo)>> {
        let mut stale = Vec::new();
        if !self.lock_dir.exists() {
            return Ok(stale);
        }

        for entry in fs::read_dir(&self.lock_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("lock") {
                continue;
            }
            if let Ok(info) = read_lock_info(&path) {
                if is_lock_stale(&info) {
                    stale.push((path, info));
                }
            }
        }
        Ok(stale)
    }

    /// Remove the token for a scope only if it is stale
    pub fn remove_if_stale(&self, plan_id: Option<&str>) -> Result<bool> {
        match self.read(plan_id)? {
            Some(info) if is_lock_stale(&info) => {
                remove_if_unchanged(&self.lock_path(plan_id), &info)?;
                log::info!(
                    "[ExecutionLock] Removed stale lock held by {}",
                    info.describe()
                );
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Scoped ownership of an execution lock
#[derive(Debug)]
pub struct LockGuard {
    guard: ConcurrencyGuard,
    token: LockInfo,
    released: bool,
}

impl LockGuard {
    pub fn info(&self) -> &LockInfo {
        &self.token
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.guard.release_token(&self.token).map(|_| ())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.guard.release_token(&self.token) {
                log::warn!("[ExecutionLock] Failed to release lock: {}", e);
            }
        }
    }
}

fn read_lock_info(path: &Path) -> Result<LockInfo> {
    let contents =
        fs::read_to_string(path).map_err(|e| anyhow!("Failed to read lock file: {}", e))?;
    serde_json::from_str(&contents).map_err(|e| anyhow!("Failed to parse lock file: {}", e))
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(anyhow!("Failed to remove lock file {:?}: {}", path, e)),
    }
}

/// Remove a stale token only if it still is the one that was judged stale
fn remove_if_unchanged(path: &Path, expected: &LockInfo) -> Result<()> {
    match read_lock_info(path) {
        Ok(current) if current.pid == expected.pid && current.started_at == expected.started_at => {
            remove_if_exists(path)
        }
        Ok(current) => {
            log::debug!(
                "[ExecutionLock] {:?} changed hands to {}; leaving it",
                path,
                current.describe()
            );
            Ok(())
        }
        // Already removed by another process
        Err(_) => Ok(()),
    }
}

/// Unreadable tokens younger than this may belong to an older writer still
/// filling the file
const UNREADABLE_GRACE: Duration = Duration::from_secs(10);

fn is_abandoned(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .map(|age| age >= UNREADABLE_GRACE)
        .unwrap_or(true)
}

/// A lock is stale when its owner is dead, a zombie, or not this tool
pub fn is_lock_stale(info: &LockInfo) -> bool {
    use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};

    if info.pid == std::process::id() {
        return false;
    }

    let pid = Pid::from_u32(info.pid);
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::everything(),
    );

    let Some(process) = system.process(pid) else {
        return true;
    };
    if process.status() == ProcessStatus::Zombie {
        return true;
    }

    !is_recognized(
        &process.name().to_string_lossy(),
        process.exe().and_then(|p| p.file_name()),
    )
}

/// Whether a process looks like an instance of this tool
fn is_recognized(name: &str, exe_name: Option<&std::ffi::OsStr>) -> bool {
    if name.to_lowercase().contains("baton") {
        return true;
    }
    let own_exe = std::env::current_exe().ok();
    let own_name = own_exe.as_deref().and_then(|p| p.file_name());
    match (exe_name, own_name) {
        (Some(theirs), Some(ours)) => theirs == ours,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn dead_info(plan_id: Option<&str>) -> LockInfo {
        LockInfo {
            pid: 999999, // Very unlikely to be a real PID
            started_at: Utc::now(),
            command: "baton run old".to_string(),
            plan_id: plan_id.map(String::from),
            worktree_path: None,
        }
    }

    fn write_token(guard: &ConcurrencyGuard, info: &LockInfo) {
        let path = guard.lock_path(info.plan_id.as_deref());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, serde_json::to_string(info).unwrap()).unwrap();
    }

    #[test]
    fn test_acquire_then_release_leaves_no_file() {
        let temp_dir = TempDir::new().unwrap();
        let guard = ConcurrencyGuard::new(temp_dir.path());

        let acquisition = guard.acquire(None).unwrap();
        assert!(acquisition.acquired);
        let info = guard.read(None).unwrap().unwrap();
        assert_eq!(info.pid, std::process::id());

        assert!(guard.release(None).unwrap());
        assert!(!guard.lock_path(None).exists());
    }

    #[test]
    fn test_live_owner_blocks_acquisition() {
        let temp_dir = TempDir::new().unwrap();
        let guard = ConcurrencyGuard::new(temp_dir.path());
        assert!(guard.acquire(Some("p1")).unwrap().acquired);

        let second = guard.acquire(Some("p1")).unwrap();
        assert!(!second.acquired);
        assert!(second
            .reason
            .unwrap()
            .contains(&std::process::id().to_string()));
    }

    #[test]
    fn test_plan_locks_are_independent() {
        let temp_dir = TempDir::new().unwrap();
        let guard = ConcurrencyGuard::new(temp_dir.path());
        assert!(guard.acquire(Some("p1")).unwrap().acquired);
        assert!(guard.acquire(Some("p2")).unwrap().acquired);
    }

    #[test]
    fn test_global_lock_refused_while_plan_lock_is_live() {
        let temp_dir = TempDir::new().unwrap();
        let guard = ConcurrencyGuard::new(temp_dir.path());
        assert!(guard.acquire(Some("p1")).unwrap().acquired);

        let global = guard.acquire(None).unwrap();
        assert!(!global.acquired);
        assert!(global.reason.unwrap().contains("plan-p1.lock"));
        // The refused attempt leaves nothing behind
        assert!(!guard.lock_path(None).exists());

        assert!(guard.release(Some("p1")).unwrap());
        assert!(guard.acquire(None).unwrap().acquired);
    }

    #[test]
    fn test_plan_lock_refused_while_global_lock_is_live() {
        let temp_dir = TempDir::new().unwrap();
        let guard = ConcurrencyGuard::new(temp_dir.path());
        let held = guard.lock(None, None).unwrap();

        assert!(matches!(
            guard.lock(Some("p1"), None),
            Err(RunError::LockContention(_))
        ));
        assert!(!guard.lock_path(Some("p1")).exists());

        held.release().unwrap();
        assert!(guard.lock(Some("p1"), None).is_ok());
    }

    #[test]
    fn test_stale_plan_lock_does_not_block_global() {
        let temp_dir = TempDir::new().unwrap();
        let guard = ConcurrencyGuard::new(temp_dir.path());
        write_token(&guard, &dead_info(Some("old")));

        assert!(guard.acquire(None).unwrap().acquired);
    }

    #[test]
    fn test_dead_pid_is_displaced() {
        let temp_dir = TempDir::new().unwrap();
        let guard = ConcurrencyGuard::new(temp_dir.path());
        write_token(&guard, &dead_info(None));

        assert!(is_lock_stale(&dead_info(None)));
        assert!(guard.acquire(None).unwrap().acquired);
        assert_eq!(guard.read(None).unwrap().unwrap().pid, std::process::id());
    }

    #[test]
    fn test_release_ignores_foreign_token() {
        let temp_dir = TempDir::new().unwrap();
        let guard = ConcurrencyGuard::new(temp_dir.path());
        write_token(&guard, &dead_info(None));

        assert!(!guard.release(None).unwrap());
        assert!(guard.lock_path(None).exists());
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let temp_dir = TempDir::new().unwrap();
        let guard = ConcurrencyGuard::new(temp_dir.path());
        {
            let held = guard.lock(Some("p1"), Some(Path::new("/tmp/work"))).unwrap();
            assert_eq!(held.info().worktree_path.as_deref(), Some("/tmp/work"));
            assert!(matches!(
                guard.lock(Some("p1"), None),
                Err(RunError::LockContention(_))
            ));
        }
        assert!(!guard.lock_path(Some("p1")).exists());
    }

    #[test]
    fn test_fresh_unreadable_token_is_respected() {
        let temp_dir = TempDir::new().unwrap();
        let guard = ConcurrencyGuard::new(temp_dir.path());
        fs::create_dir_all(guard.lock_path(None).parent().unwrap()).unwrap();
        fs::write(guard.lock_path(None), "").unwrap();

        let acquisition = guard.acquire(None).unwrap();
        assert!(!acquisition.acquired);
        assert!(acquisition.reason.unwrap().contains("could not be read"));
        assert_eq!(fs::read_to_string(guard.lock_path(None)).unwrap(), "");
    }

    #[test]
    fn test_old_unreadable_token_is_displaced() {
        let temp_dir = TempDir::new().unwrap();
        let guard = ConcurrencyGuard::new(temp_dir.path());
        let path = guard.lock_path(None);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "not json").unwrap();
        fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(60))
            .unwrap();

        assert!(guard.acquire(None).unwrap().acquired);
    }

    #[test]
    fn test_stale_removal_spares_a_replaced_token() {
        let temp_dir = TempDir::new().unwrap();
        let guard = ConcurrencyGuard::new(temp_dir.path());
        let stale = dead_info(None);
        write_token(&guard, &stale);

        // Another process displaced the stale token first and took the lock
        let fresh = LockInfo::new(None, None);
        write_token(&guard, &fresh);

        remove_if_unchanged(&guard.lock_path(None), &stale).unwrap();
        assert_eq!(guard.read(None).unwrap().unwrap(), fresh);
    }

    #[test]
    fn test_acquire_leaves_no_temp_files() {
        let temp_dir = TempDir::new().unwrap();
        let guard = ConcurrencyGuard::new(temp_dir.path());
        assert!(guard.acquire(Some("p1")).unwrap().acquired);
        assert!(!guard.acquire(Some("p1")).unwrap().acquired);

        let names: Vec<String> = fs::read_dir(locks_dir(temp_dir.path()))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["plan-p1.lock".to_string()]);
    }

    #[test]
    fn test_find_and_remove_stale() {
        let temp_dir = TempDir::new().unwrap();
        let guard = ConcurrencyGuard::new(temp_dir.path());
        write_token(&guard, &dead_info(Some("old")));
        assert!(guard.acquire(None).unwrap().acquired);

        let stale = guard.find_stale().unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].1.plan_id.as_deref(), Some("old"));

        assert!(!guard.remove_if_stale(None).unwrap());
        assert!(guard.remove_if_stale(Some("old")).unwrap());
        assert!(guard.find_stale().unwrap().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_unrecognized_live_process_is_stale() {
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();

        let info = LockInfo {
            pid: child.id(),
            ..dead_info(None)
        };
        assert!(is_lock_stale(&info));

        let _ = child.kill();
        let _ = child.wait();
    }

    #[test]
    fn test_token_uses_camel_case_keys() {
        let info = LockInfo::new(Some("p"), Some(Path::new("/w")));
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"startedAt\""));
        assert!(json.contains("\"planId\""));
        assert!(json.contains("\"worktreePath\""));
    }
}
