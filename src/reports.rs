//! Write-once step reports
//!
//! One YAML file per step-completion event under
//! `.baton/reports/<plan_id>/`. Files are created with `create_new`, so a
//! report is never overwritten; a later event for the same step gets a
//! numbered suffix.

use crate::utils::{ensure_dir, reports_dir, sanitize_path_component};
use crate::worker::{ResultStatus, WorkerResult};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Outcome recorded in a report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportOutcome {
    Success,
    Failure,
}

/// Persisted record of one step-completion event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    pub step_id: String,
    pub outcome: ReportOutcome,
    pub details: String,
    pub timestamp: String,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub blocked_reason: Option<String>,
    #[serde(default)]
    pub test_results: Option<serde_json::Value>,
}

impl StepReport {
    pub fn from_result(result: &WorkerResult) -> Self {
        let outcome = match result.status {
            ResultStatus::Complete => ReportOutcome::Success,
            ResultStatus::Blocked => ReportOutcome::Failure,
        };
        Self {
            step_id: result.step_id.to_string(),
            outcome,
            details: result.summary.clone(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            artifacts: result.artifacts.clone(),
            blocked_reason: match result.status {
                ResultStatus::Blocked => Some(result.reason().to_string()),
                ResultStatus::Complete => None,
            },
            test_results: result.test_results.clone(),
        }
    }
}

/// Writes reports for the plans of one repository
#[derive(Debug, Clone)]
pub struct ReportWriter {
    base_dir: PathBuf,
}

impl ReportWriter {
    pub fn new(repo_path: &Path) -> Self {
        Self {
            base_dir: reports_dir(repo_path),
        }
    }

    pub fn plan_dir(&self, plan_id: &str) -> PathBuf {
        self.base_dir.join(sanitize_path_component(plan_id))
    }

    /// Persist a report for `result` and return its path
    pub fn write(&self, plan_id: &str, result: &WorkerResult) -> Result<PathBuf, String> {
        let dir = self.plan_dir(plan_id);
        ensure_dir(&dir)?;

        let report = StepReport::from_result(result);
        let content = serde_yaml::to_string(&report)
            .map_err(|e| format!("Failed to serialize report: {}", e))?;
        let stem = format!("step-{}", sanitize_path_component(result.step_id.as_str()));

        let mut n = 1;
        loop {
            let name = if n == 1 {
                format!("{}.yaml", stem)
            } else {
                format!("{}-{}.yaml", stem, n)
            };
            let path = dir.join(name);

            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(content.as_bytes())
                        .map_err(|e| format!("Failed to write report {:?}: {}", path, e))?;
                    log::debug!("[Reports] Wrote {:?}", path);
                    return Ok(path);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => n += 1,
                Err(e) => return Err(format!("Failed to create report {:?}: {}", path, e)),
            }
        }
    }

    /// All reports written for a plan, sorted by file name
    pub fn list(&self, plan_id: &str) -> Result<Vec<StepReport>, String> {
        let dir = self.plan_dir(plan_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut paths: Vec<PathBuf> = fs::read_dir(&dir)
            .map_err(|e| format!("Failed to read reports directory {:?}: {}", dir, e))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("yaml"))
            .collect();
        paths.sort();

        paths
            .iter()
            .map(|path| {
                let content = fs::read_to_string(path)
                    .map_err(|e| format!("Failed to read report {:?}: {}", path, e))?;
                serde_yaml::from_str(&content)
                    .map_err(|e| format!("Failed to parse report {:?}: {}", path, e))
            })
            .collect()
    }
}
