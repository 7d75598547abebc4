//! Scheduler loop
//!
//! One control loop per plan run. Each pass scans the plan for ready steps,
//! dispatches what the partition rules allow, and otherwise waits for the
//! first in-flight worker to finish and folds its results back into the
//! plan. Worker processes run concurrently; scheduling decisions, plan
//! writes and reintegration never do.
//!
//! Dispatch rules:
//! - parallel steps each get their own isolated workspace, up to
//!   `max_parallel` workers at a time
//! - a serial step starts only when nothing else is running, and nothing
//!   else starts while it runs
//! - with isolation disabled a parallel batch is one invocation in the
//!   shared work directory and is treated like a serial step

mod archive;
mod fan_in;
mod phase;

pub use archive::{run_integration, IntegrationContext, IntegrationStatus};
pub use fan_in::FanIn;
pub use phase::{after_scanning, RunPhase, ScanView};

use crate::config::{BatonConfig, LockScope};
use crate::error::RunError;
use crate::git::GitManager;
use crate::isolation::{
    ensure_plan_worktree, plan_worktree_path, remove_plan_worktree, settle_workspace,
    Reintegrator, WorkspaceAllocation, WorkspacePool,
};
use crate::lock::ConcurrencyGuard;
use crate::plan::{join_ids, PlanOutcome, PlanStore, StatusSummary, StepId, StepStatus};
use crate::reports::ReportWriter;
use crate::resolver::{blocked_dependents, partition, ready_steps};
use crate::shutdown::{ShutdownState, ShutdownSummary};
use crate::utils::{archive_dir, ensure_layout, sanitize_branch_name};
use crate::worker::{BatchOutcome, FailoverGateway, InvocationContext, OutputSink, ResultStatus, WorkerResult};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Exit code for a run that archived a fully successful plan
pub const EXIT_SUCCESS: i32 = 0;
/// Exit code for a run that ended with blocked steps
pub const EXIT_BLOCKED: i32 = 2;
/// Exit code for a run stopped by a signal
pub const EXIT_INTERRUPTED: i32 = 130;

/// A blocked step and the steps it holds back
#[derive(Debug, Clone)]
pub struct BlockedStep {
    pub id: StepId,
    pub reason: String,
    pub dependents: Vec<StepId>,
}

/// How a run ended
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// Every step reached a terminal status and the plan was archived
    Archived {
        path: PathBuf,
        outcome: PlanOutcome,
        integration: IntegrationStatus,
    },
    /// Nothing can progress without intervention; the plan stays resumable
    BlockedTerminal { blocked: Vec<BlockedStep> },
    /// Stopped by a shutdown request
    Interrupted(ShutdownSummary),
}

/// Summary of one orchestration run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub plan_id: String,
    pub work_branch: String,
    pub outcome: RunOutcome,
    pub summary: StatusSummary,
    /// Worker invocations started by this run
    pub invocations: usize,
}

impl RunReport {
    pub fn exit_code(&self) -> i32 {
        match &self.outcome {
            RunOutcome::Archived {
                outcome: PlanOutcome::Success,
                ..
            } => EXIT_SUCCESS,
            RunOutcome::Archived { .. } | RunOutcome::BlockedTerminal { .. } => EXIT_BLOCKED,
            RunOutcome::Interrupted(_) => EXIT_INTERRUPTED,
        }
    }
}

/// Runs plans to completion against one repository
pub struct Scheduler {
    repo_path: PathBuf,
    config: BatonConfig,
    shutdown: ShutdownState,
    sink: Option<OutputSink>,
}

impl Scheduler {
    pub fn new(repo_path: &Path, config: BatonConfig) -> Self {
        Self {
            repo_path: repo_path.to_path_buf(),
            config,
            shutdown: ShutdownState::new(),
            sink: None,
        }
    }

    /// Share a shutdown flag with signal handlers
    pub fn with_shutdown(mut self, shutdown: ShutdownState) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Receive worker output lines as they arrive
    pub fn with_output_sink(mut self, sink: OutputSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn config(&self) -> &BatonConfig {
        &self.config
    }

    /// Run the plan at `plan_path` until it is archived, blocked, or
    /// interrupted.
    ///
    /// Structural failures (malformed plan, lock contention, bad config,
    /// git errors) are returned as errors; worker failures end up as
    /// blocked steps in the report.
    pub async fn run(&self, plan_path: &Path) -> Result<RunReport, RunError> {
        self.config.validate().map_err(RunError::Config)?;
        ensure_layout(&self.repo_path).map_err(RunError::Store)?;

        let plan_path = plan_path.canonicalize().map_err(|e| {
            RunError::Store(format!("Failed to resolve plan path {:?}: {}", plan_path, e))
        })?;
        let mut store = PlanStore::load(&plan_path)?;
        let plan_id = store.plan_id().to_string();

        let guard = ConcurrencyGuard::new(&self.repo_path);
        let lock = match self.config.lock_scope {
            LockScope::Global => guard.lock(None, None)?,
            LockScope::Plan => {
                let worktree = plan_worktree_path(&self.repo_path, &plan_id);
                guard.lock(Some(&plan_id), Some(&worktree))?
            }
        };
        log::info!(
            "[Scheduler] Acquired {:?} lock for plan '{}'",
            self.config.lock_scope,
            plan_id
        );

        let result = self.run_locked(&mut store).await;

        if let Err(e) = lock.release() {
            log::warn!("[Scheduler] Failed to release lock: {}", e);
        }
        result
    }

    async fn run_locked(&self, store: &mut PlanStore) -> Result<RunReport, RunError> {
        let (work_branch, work_dir) = self.prepare_work_branch(store)?;

        let reset = store.reset_in_progress().map_err(RunError::Store)?;
        if !reset.is_empty() {
            log::warn!(
                "[Scheduler] Steps {} were in progress when the last run stopped; reset to pending",
                join_ids(&reset)
            );
        }

        let gateway =
            FailoverGateway::new(&self.config, self.sink.clone()).map_err(RunError::Config)?;
        let run_id = new_run_id();
        log::info!(
            "[Scheduler] Run {} of plan '{}' on {} in {:?} (max {} parallel)",
            run_id,
            store.plan_id(),
            work_branch,
            work_dir,
            self.config.max_parallel
        );

        let run = PlanRun {
            scheduler: self,
            pool: WorkspacePool::new(&self.repo_path, store.plan_id(), &run_id, &work_branch),
            reintegrator: Reintegrator::new(&work_dir, &work_branch),
            reports: ReportWriter::new(&self.repo_path),
            store,
            run_id,
            work_branch,
            work_dir,
            gateway,
            fan_in: FanIn::new(),
            in_flight: HashMap::new(),
            next_key: 0,
            invocations: 0,
        };
        run.drive().await
    }

    /// Create or resume the work branch and return it with the directory it
    /// is checked out in
    fn prepare_work_branch(&self, store: &mut PlanStore) -> Result<(String, PathBuf), RunError> {
        let git = GitManager::new(&self.repo_path)?;
        let plan_id = store.plan_id().to_string();

        // Serial work is committed from the root with `stage_all`, which must
        // not sweep up the user's own uncommitted files
        if self.config.lock_scope == LockScope::Global {
            let dirty: Vec<String> = git.get_status()?.into_iter().map(|f| f.path).collect();
            if !dirty.is_empty() {
                return Err(RunError::DirtyWorkTree(dirty.join(", ")));
            }
        }

        let work_branch = match store.plan().metadata.work_branch.clone() {
            Some(branch) => {
                if !git.branch_exists(&branch) {
                    log::warn!(
                        "[Scheduler] Work branch {} is missing; recreating it from HEAD",
                        branch
                    );
                    git.create_branch(&branch, false)?;
                }
                log::info!("[Scheduler] Resuming plan '{}' on {}", plan_id, branch);
                branch
            }
            None => {
                let branch = format!("baton/{}", sanitize_branch_name(&plan_id));
                if !git.branch_exists(&branch) {
                    git.create_branch(&branch, false)?;
                }
                let source = git
                    .current_branch_name()
                    .unwrap_or_else(|| "HEAD".to_string());
                store
                    .set_branches(&source, &branch)
                    .map_err(RunError::Store)?;
                log::info!("[Scheduler] Created work branch {} from {}", branch, source);
                branch
            }
        };

        let work_dir = match self.config.lock_scope {
            LockScope::Global => {
                if git.current_branch_name().as_deref() != Some(work_branch.as_str()) {
                    git.checkout_branch(&work_branch)?;
                }
                self.repo_path.clone()
            }
            LockScope::Plan => ensure_plan_worktree(&self.repo_path, &plan_id, &work_branch)
                .map_err(RunError::Isolation)?,
        };

        Ok((work_branch, work_dir))
    }
}

fn new_run_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

/// What the current scan decided to start
enum Dispatch {
    Nothing,
    /// One invocation per step, each in its own isolated workspace
    Isolated(Vec<StepId>),
    /// One invocation in the shared work directory, running alone
    Shared(Vec<StepId>),
}

struct InFlight {
    step_ids: Vec<StepId>,
    workspace: Option<WorkspaceAllocation>,
    exclusive: bool,
}

/// State of one run between lock acquisition and release
struct PlanRun<'a> {
    scheduler: &'a Scheduler,
    store: &'a mut PlanStore,
    run_id: String,
    work_branch: String,
    work_dir: PathBuf,
    gateway: FailoverGateway,
    pool: WorkspacePool,
    reintegrator: Reintegrator,
    reports: ReportWriter,
    fan_in: FanIn<u64, BatchOutcome>,
    in_flight: HashMap<u64, InFlight>,
    next_key: u64,
    invocations: usize,
}

impl PlanRun<'_> {
    fn config(&self) -> &BatonConfig {
        &self.scheduler.config
    }

    async fn drive(mut self) -> Result<RunReport, RunError> {
        let poll = Duration::from_millis(self.config().poll_interval_ms.max(10));

        loop {
            if self.scheduler.shutdown.is_shutdown_requested() {
                return Ok(self.interrupt().await);
            }

            let dispatch = self.plan_dispatch();
            let view = ScanView {
                all_terminal: self.store.is_complete(),
                successful: self.store.is_successful(),
                dispatchable: !matches!(dispatch, Dispatch::Nothing),
                in_flight: self.fan_in.len(),
                hold_blocked: !self.config().archive_on_blocked,
            };
            let phase = after_scanning(view);
            log::debug!("[Scheduler] {} -> {}", RunPhase::Scanning, phase);

            match phase {
                RunPhase::Dispatching => self.dispatch(dispatch)?,
                RunPhase::Awaiting => {
                    let shutdown = self.scheduler.shutdown.clone();
                    let done = tokio::select! {
                        done = self.fan_in.next() => done,
                        _ = shutdown.requested(poll) => None,
                    };
                    if let Some((key, outcome)) = done {
                        self.complete(key, outcome)?;
                    }
                }
                RunPhase::BlockedTerminal => return Ok(self.blocked_terminal()),
                RunPhase::Archiving => return self.archive().await,
                RunPhase::Scanning => {}
            }
        }
    }

    /// Apply the partition rules to the current ready set
    fn plan_dispatch(&self) -> Dispatch {
        if self.in_flight.values().any(|f| f.exclusive) {
            return Dispatch::Nothing;
        }

        let running = self.fan_in.len();
        let ready = ready_steps(self.store.plan());
        let split = partition(&ready, self.config().max_parallel, running);
        if split.is_empty() {
            return Dispatch::Nothing;
        }

        if !split.parallel.is_empty() {
            let ids: Vec<StepId> = split.parallel.iter().map(|s| s.id.clone()).collect();
            if self.config().isolation.enabled {
                return Dispatch::Isolated(ids);
            }
            if running == 0 {
                return Dispatch::Shared(ids);
            }
            return Dispatch::Nothing;
        }

        match split.serial.first() {
            Some(step) if running == 0 => Dispatch::Shared(vec![step.id.clone()]),
            _ => Dispatch::Nothing,
        }
    }

    fn dispatch(&mut self, dispatch: Dispatch) -> Result<(), RunError> {
        let (ids, isolated) = match dispatch {
            Dispatch::Isolated(ids) => (ids, true),
            Dispatch::Shared(ids) => (ids, false),
            Dispatch::Nothing => return Ok(()),
        };

        // Every selected step is in_progress on disk before any worker starts
        self.store.mark_in_progress(&ids).map_err(RunError::Store)?;

        if isolated {
            for id in ids {
                self.start_isolated(id)?;
            }
        } else {
            self.start(ids, None, true);
        }
        Ok(())
    }

    fn start_isolated(&mut self, id: StepId) -> Result<(), RunError> {
        let ids = vec![id];
        match self.pool.acquire(&ids) {
            Ok(allocation) => {
                self.start(ids, Some(allocation), false);
                Ok(())
            }
            Err(e) => {
                log::error!(
                    "[Scheduler] Could not isolate step {}: {}",
                    join_ids(&ids),
                    e
                );
                let reason = format!("Failed to create isolated workspace: {}", e);
                let results: Vec<WorkerResult> = ids
                    .iter()
                    .map(|id| WorkerResult::blocked(id.clone(), &reason))
                    .collect();
                self.record(&results)
            }
        }
    }

    fn start(&mut self, step_ids: Vec<StepId>, workspace: Option<WorkspaceAllocation>, exclusive: bool) {
        let cwd = workspace
            .as_ref()
            .map(|w| w.path.clone())
            .unwrap_or_else(|| self.work_dir.clone());
        let ctx = InvocationContext::new(
            self.store.path(),
            self.store.plan_id(),
            &step_ids,
            &cwd,
            &self.work_branch,
        );

        log::info!(
            "[Scheduler] Dispatching steps {} in {:?}{}",
            ctx.step_ids,
            cwd,
            if workspace.is_some() { " (isolated)" } else { "" }
        );

        let key = self.next_key;
        self.next_key += 1;
        let gateway = self.gateway.clone();
        let ids = step_ids.clone();
        self.fan_in.spawn(key, async move {
            gateway.run_batch(&ctx, &ids, &cwd).await
        });
        self.in_flight.insert(
            key,
            InFlight {
                step_ids,
                workspace,
                exclusive,
            },
        );
        self.invocations += 1;
    }

    /// Fold one finished invocation back into the plan
    fn complete(&mut self, key: u64, outcome: Result<BatchOutcome, String>) -> Result<(), RunError> {
        let Some(flight) = self.in_flight.remove(&key) else {
            log::warn!("[Scheduler] Completion for unknown invocation {}", key);
            return Ok(());
        };
        let ids = join_ids(&flight.step_ids);

        let results = match outcome {
            Ok(batch) => {
                match &batch.backend {
                    Some(backend) => log::info!(
                        "[Scheduler] Steps {} finished on '{}' (exit {:?})",
                        ids,
                        backend,
                        batch.exit_code
                    ),
                    None => log::warn!("[Scheduler] Steps {}: every backend failed", ids),
                }
                batch.results
            }
            Err(e) => {
                log::error!("[Scheduler] Steps {}: {}", ids, e);
                flight
                    .step_ids
                    .iter()
                    .map(|id| WorkerResult::blocked(id.clone(), &e))
                    .collect()
            }
        };

        let results = match &flight.workspace {
            Some(allocation) => {
                settle_workspace(&mut self.pool, &self.reintegrator, allocation, results)
            }
            None => {
                self.commit_shared(&flight.step_ids, &results);
                results
            }
        };

        self.record(&results)
    }

    /// Commit what a worker left in the shared work directory
    fn commit_shared(&self, step_ids: &[StepId], results: &[WorkerResult]) {
        if !results.iter().any(|r| r.status == ResultStatus::Complete) {
            return;
        }
        let message = format!("baton: steps {}", join_ids(step_ids));
        match GitManager::new(&self.work_dir).and_then(|git| git.commit_all_if_dirty(&message)) {
            Ok(Some(oid)) => log::info!("[Scheduler] Committed work for steps {} as {}", join_ids(step_ids), oid),
            Ok(None) => {}
            Err(e) => log::warn!(
                "[Scheduler] Failed to commit work for steps {}: {}",
                join_ids(step_ids),
                e
            ),
        }
    }

    /// Apply results to the plan and write a report per applied result
    fn record(&mut self, results: &[WorkerResult]) -> Result<(), RunError> {
        let applied = self.store.apply_results(results).map_err(RunError::Store)?;

        for result in results.iter().filter(|r| applied.contains(&r.step_id)) {
            if let Err(e) = self.reports.write(self.store.plan_id(), result) {
                log::warn!("[Scheduler] Failed to write report for step {}: {}", result.step_id, e);
            }
            match result.status {
                ResultStatus::Complete => {
                    log::info!("[Scheduler] Step {} complete", result.step_id)
                }
                ResultStatus::Blocked => {
                    log::warn!("[Scheduler] Step {} blocked: {}", result.step_id, result.reason());
                    let dependents = blocked_dependents(self.store.plan(), &result.step_id);
                    if !dependents.is_empty() {
                        log::warn!(
                            "[Scheduler] Steps {} can no longer become ready",
                            join_ids(&dependents)
                        );
                    }
                }
            }
        }

        let summary = self.store.status_summary();
        log::info!(
            "[Scheduler] Progress: {}/{} complete, {} blocked, {} in progress",
            summary.complete,
            summary.total,
            summary.blocked,
            summary.in_progress
        );
        Ok(())
    }

    fn blocked_terminal(self) -> RunReport {
        let plan = self.store.plan();
        let blocked: Vec<BlockedStep> = plan
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Blocked)
            .map(|s| BlockedStep {
                id: s.id.clone(),
                reason: s.blocked_reason.clone().unwrap_or_default(),
                dependents: blocked_dependents(plan, &s.id),
            })
            .collect();

        log::warn!(
            "[Scheduler] Plan '{}' cannot progress ({} blocked step(s)); leaving it resumable",
            self.store.plan_id(),
            blocked.len()
        );
        self.report(RunOutcome::BlockedTerminal { blocked })
    }

    async fn archive(self) -> Result<RunReport, RunError> {
        let outcome = if self.store.is_successful() {
            PlanOutcome::Success
        } else {
            PlanOutcome::Blocked
        };
        let path = self
            .store
            .archive(&archive_dir(&self.scheduler.repo_path), outcome)
            .map_err(RunError::Store)?;

        let integration = if outcome == PlanOutcome::Success {
            let ctx = IntegrationContext {
                plan_id: self.store.plan_id().to_string(),
                work_branch: self.work_branch.clone(),
                source_branch: self
                    .store
                    .plan()
                    .metadata
                    .source_branch
                    .clone()
                    .unwrap_or_default(),
                archive_path: path.display().to_string(),
            };
            run_integration(&self.config().integration, &ctx, &self.work_dir).await
        } else {
            IntegrationStatus::Skipped
        };

        if self.config().lock_scope == LockScope::Plan {
            if let Err(e) = remove_plan_worktree(&self.scheduler.repo_path, self.store.plan_id()) {
                log::warn!("[Scheduler] Failed to remove plan worktree: {}", e);
            }
        }

        Ok(self.report(RunOutcome::Archived {
            path,
            outcome,
            integration,
        }))
    }

    /// Stop workers, leave workspaces and in-progress steps for the next run
    async fn interrupt(mut self) -> RunReport {
        let workers_stopped = self.fan_in.len();
        log::warn!("[Scheduler] Interrupted; stopping {} worker(s)", workers_stopped);
        self.fan_in.shutdown().await;

        let summary = ShutdownSummary {
            workers_stopped,
            workspaces_left: self
                .pool
                .abandon_all()
                .into_iter()
                .map(|a| a.path)
                .collect(),
            steps_in_progress: self
                .store
                .plan()
                .in_progress_ids()
                .iter()
                .map(|id| id.to_string())
                .collect(),
            errors: Vec::new(),
        };
        summary.log();
        self.scheduler.shutdown.mark_cleanup_complete();
        self.report(RunOutcome::Interrupted(summary))
    }

    fn report(&self, outcome: RunOutcome) -> RunReport {
        RunReport {
            run_id: self.run_id.clone(),
            plan_id: self.store.plan_id().to_string(),
            work_branch: self.work_branch.clone(),
            outcome,
            summary: self.store.status_summary(),
            invocations: self.invocations,
        }
    }
}
