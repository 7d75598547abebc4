//! Plan persistence
//!
//! The store owns the in-memory plan for a run and writes it back after every
//! batch of status changes. Saves are atomic (temp file then rename) so a crash
//! never leaves a half-written plan behind.

use super::types::{can_transition, Plan, PlanOutcome, StatusSummary, StepId, StepStatus};
use super::validation::{overlapping_parallel_files, validate_plan};
use crate::error::PlanError;
use crate::utils::{atomic_write, ensure_dir};
use crate::worker::{ResultStatus, WorkerResult};
use std::fs;
use std::path::{Path, PathBuf};

/// Read and validate a plan document
pub fn load_plan(path: &Path) -> Result<Plan, PlanError> {
    let content = fs::read_to_string(path).map_err(|e| PlanError::Io {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    let plan: Plan = serde_yaml::from_str(&content).map_err(|e| PlanError::Parse {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    validate_plan(&plan)?;

    for (a, b, file) in overlapping_parallel_files(&plan) {
        log::warn!(
            "[PlanStore] Parallel steps '{}' and '{}' both touch '{}'; reintegration may conflict",
            a,
            b,
            file
        );
    }

    Ok(plan)
}

/// Serialize a plan and write it atomically
pub fn save_plan(path: &Path, plan: &Plan) -> Result<(), String> {
    let content =
        serde_yaml::to_string(plan).map_err(|e| format!("Failed to serialize plan: {}", e))?;
    atomic_write(path, &content)
}

/// Plan identifier derived from the file stem
pub fn plan_id_from_path(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "plan".to_string())
}

/// A loaded plan bound to its file
#[derive(Debug)]
pub struct PlanStore {
    path: PathBuf,
    plan_id: String,
    plan: Plan,
}

impl PlanStore {
    pub fn load(path: &Path) -> Result<Self, PlanError> {
        let plan = load_plan(path)?;
        let plan_id = plan_id_from_path(path);
        log::debug!(
            "[PlanStore] Loaded plan '{}' with {} steps",
            plan_id,
            plan.steps.len()
        );
        Ok(Self {
            path: path.to_path_buf(),
            plan_id,
            plan,
        })
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    pub fn plan_id(&self) -> &str {
        &self.plan_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self) -> Result<(), String> {
        save_plan(&self.path, &self.plan)
    }

    pub fn is_complete(&self) -> bool {
        self.plan.is_complete()
    }

    pub fn is_successful(&self) -> bool {
        self.plan.is_successful()
    }

    pub fn completed_ids(&self) -> Vec<StepId> {
        self.plan.completed_ids()
    }

    pub fn blocked_ids(&self) -> Vec<StepId> {
        self.plan.blocked_ids()
    }

    pub fn status_summary(&self) -> StatusSummary {
        self.plan.status_summary()
    }

    /// Move every listed step to `in_progress` and persist once.
    ///
    /// All transitions are checked before any step is touched, so either the
    /// whole batch is marked or nothing changes.
    pub fn mark_in_progress(&mut self, ids: &[StepId]) -> Result<(), String> {
        for id in ids {
            let step = self
                .plan
                .step(id)
                .ok_or_else(|| format!("Step '{}' not found in plan '{}'", id, self.plan_id))?;
            if !can_transition(step.status, StepStatus::InProgress) {
                return Err(format!(
                    "Step '{}' cannot start from status '{}'",
                    id, step.status
                ));
            }
        }

        for id in ids {
            if let Some(step) = self.plan.step_mut(id) {
                step.status = StepStatus::InProgress;
            }
        }
        self.save()
    }

    /// Apply a batch of worker results and persist once.
    ///
    /// Results for unknown steps, or for steps that are not in progress, are
    /// skipped. Returns the ids that changed.
    pub fn apply_results(&mut self, results: &[WorkerResult]) -> Result<Vec<StepId>, String> {
        let mut applied = Vec::new();

        for result in results {
            let Some(step) = self.plan.step_mut(&result.step_id) else {
                log::warn!(
                    "[PlanStore] Ignoring result for unknown step '{}'",
                    result.step_id
                );
                continue;
            };

            let target = match result.status {
                ResultStatus::Complete => StepStatus::Complete,
                ResultStatus::Blocked => StepStatus::Blocked,
            };
            if !can_transition(step.status, target) {
                log::warn!(
                    "[PlanStore] Ignoring '{}' result for step '{}' in status '{}'",
                    target,
                    step.id,
                    step.status
                );
                continue;
            }

            step.status = target;
            step.blocked_reason = match target {
                StepStatus::Blocked => Some(result.reason().to_string()),
                _ => None,
            };
            applied.push(step.id.clone());
        }

        if !applied.is_empty() {
            self.save()?;
        }
        Ok(applied)
    }

    /// Reset steps left `in_progress` by an interrupted run back to `pending`
    pub fn reset_in_progress(&mut self) -> Result<Vec<StepId>, String> {
        let mut reset = Vec::new();
        for step in &mut self.plan.steps {
            if step.status == StepStatus::InProgress {
                step.status = StepStatus::Pending;
                reset.push(step.id.clone());
            }
        }

        if !reset.is_empty() {
            log::info!(
                "[PlanStore] Reset {} interrupted step(s) to pending: {}",
                reset.len(),
                join_ids(&reset)
            );
            self.save()?;
        }
        Ok(reset)
    }

    /// Record the branches a dispatched plan works on
    pub fn set_branches(&mut self, source_branch: &str, work_branch: &str) -> Result<(), String> {
        self.plan.metadata.source_branch = Some(source_branch.to_string());
        self.plan.metadata.work_branch = Some(work_branch.to_string());
        self.save()
    }

    /// Record completion metadata, move the plan into `archive_dir` and
    /// return the archived path
    pub fn archive(&mut self, archive_dir: &Path, outcome: PlanOutcome) -> Result<PathBuf, String> {
        ensure_dir(archive_dir)?;

        self.plan.metadata.completed_at = Some(chrono::Utc::now().to_rfc3339());
        self.plan.metadata.outcome = Some(outcome);

        let mut target = archive_dir.join(format!("{}.yaml", self.plan_id));
        if target.exists() {
            let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
            target = archive_dir.join(format!("{}-{}.yaml", self.plan_id, stamp));
        }

        save_plan(&target, &self.plan)?;
        if self.path != target {
            fs::remove_file(&self.path)
                .map_err(|e| format!("Failed to remove active plan {:?}: {}", self.path, e))?;
        }

        log::info!(
            "[PlanStore] Archived plan '{}' ({}) to {:?}",
            self.plan_id,
            outcome,
            target
        );
        self.path = target.clone();
        Ok(target)
    }
}

/// Comma-join step ids for display and worker arguments
pub fn join_ids(ids: &[StepId]) -> String {
    ids.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(",")
}
