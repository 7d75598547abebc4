use anyhow::{Context, Result};
use baton_lib::config::merge_overrides;
use baton_lib::resolver::{cascade_impact, ready_steps};
use baton_lib::scheduler::{IntegrationStatus, RunOutcome};
use baton_lib::shutdown::{register_signal_handlers, ShutdownState};
use baton_lib::worker::{OutputLine, OutputSink};
use baton_lib::{plans_dir, ConcurrencyGuard, ConfigManager, PlanStore, RunError, Scheduler};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Baton - run dependency-ordered plans with autonomous coding agents
#[derive(Parser, Debug)]
#[command(name = "baton")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Repository to operate on
    #[arg(long, global = true, default_value = ".", env = "BATON_REPO")]
    repo: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute a plan until it is archived or cannot progress
    Run {
        /// Plan file, or the id of a plan under .baton/plans
        plan: String,

        /// Maximum concurrent workers
        #[arg(long)]
        max_parallel: Option<usize>,

        /// Try this agent backend first
        #[arg(long)]
        agent: Option<String>,
    },
    /// Show step statuses, the ready set and blocked cascades
    Status {
        /// Plan file, or the id of a plan under .baton/plans
        plan: String,
    },
    /// Remove a lock token, only if its owner is gone
    Unlock {
        /// Plan id for a per-plan lock; the global lock otherwise
        #[arg(long)]
        plan: Option<String>,
    },
    /// Write a default .baton/config.yaml
    Init,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let code = match execute(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            e.downcast_ref::<RunError>()
                .map(RunError::exit_code)
                .unwrap_or(1)
        }
    };
    std::process::exit(code);
}

fn execute(cli: Cli) -> Result<i32> {
    let repo = cli
        .repo
        .canonicalize()
        .with_context(|| format!("Repository {:?} not found", cli.repo))?;

    match cli.command {
        Command::Run {
            plan,
            max_parallel,
            agent,
        } => run(&repo, &plan, max_parallel, agent.as_deref()),
        Command::Status { plan } => status(&repo, &plan),
        Command::Unlock { plan } => unlock(&repo, plan.as_deref()),
        Command::Init => {
            let manager = ConfigManager::new(&repo);
            manager.initialize().map_err(anyhow::Error::msg)?;
            println!("Configuration at {}", manager.path().display());
            Ok(0)
        }
    }
}

/// Accept either a path or a bare plan id
fn resolve_plan_path(repo: &Path, plan: &str) -> PathBuf {
    let direct = PathBuf::from(plan);
    if direct.exists() {
        return direct;
    }
    plans_dir(repo).join(format!("{}.yaml", plan))
}

fn run(repo: &Path, plan: &str, max_parallel: Option<usize>, agent: Option<&str>) -> Result<i32> {
    let config = ConfigManager::new(repo)
        .load_effective()
        .map_err(anyhow::Error::msg)?;
    let config = merge_overrides(&config, max_parallel, agent).map_err(anyhow::Error::msg)?;

    let shutdown = ShutdownState::new();
    if let Err(e) = register_signal_handlers(shutdown.clone()) {
        log::warn!("Failed to register signal handlers: {}", e);
    }

    let sink: OutputSink = Arc::new(|label: &str, line: &OutputLine| {
        println!("[{}] {}: {}", label, line.stream.as_str(), line.text);
    });
    let scheduler = Scheduler::new(repo, config)
        .with_shutdown(shutdown)
        .with_output_sink(sink);

    let runtime = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;
    let report = runtime.block_on(scheduler.run(&resolve_plan_path(repo, plan)))?;

    let summary = report.summary;
    println!(
        "Plan '{}' on {}: {}/{} complete, {} blocked, {} pending",
        report.plan_id,
        report.work_branch,
        summary.complete,
        summary.total,
        summary.blocked,
        summary.pending + summary.in_progress
    );

    match &report.outcome {
        RunOutcome::Archived {
            path,
            outcome,
            integration,
        } => {
            println!("Archived ({}) to {}", outcome, path.display());
            if let IntegrationStatus::Failed(reason) = integration {
                println!("Integration failed: {}", reason);
            }
        }
        RunOutcome::BlockedTerminal { blocked } => {
            if blocked.is_empty() {
                println!("No step can become ready; check the plan for dependency cycles");
            }
            for step in blocked {
                println!("Blocked {}: {}", step.id, step.reason);
                if !step.dependents.is_empty() {
                    println!("  holds back: {}", baton_lib::plan::join_ids(&step.dependents));
                }
            }
            println!("Fix the blocked steps and run again to resume");
        }
        RunOutcome::Interrupted(left) => {
            println!("Interrupted; {} worker(s) stopped", left.workers_stopped);
            for path in &left.workspaces_left {
                println!("Workspace kept for inspection: {}", path.display());
            }
        }
    }

    Ok(report.exit_code())
}

fn status(repo: &Path, plan: &str) -> Result<i32> {
    let store = PlanStore::load(&resolve_plan_path(repo, plan))?;
    let plan = store.plan();
    let summary = store.status_summary();

    println!(
        "Plan '{}': {}/{} complete, {} blocked, {} in progress, {} pending",
        store.plan_id(),
        summary.complete,
        summary.total,
        summary.blocked,
        summary.in_progress,
        summary.pending
    );
    if let Some(branch) = &plan.metadata.work_branch {
        println!("Work branch: {}", branch);
    }

    for step in &plan.steps {
        let marker = if step.parallel { "∥" } else { " " };
        println!(
            "  {} {:<12} {:<11} {}",
            marker,
            step.id.to_string(),
            step.status.to_string(),
            step.description
        );
        if let Some(reason) = &step.blocked_reason {
            println!("      reason: {}", reason);
        }
    }

    let ready: Vec<_> = ready_steps(plan).iter().map(|s| s.id.clone()).collect();
    println!("Ready: {}", baton_lib::plan::join_ids(&ready));

    for (blocked, dependents) in cascade_impact(plan) {
        if !dependents.is_empty() {
            println!(
                "Blocked {} holds back {}",
                blocked,
                baton_lib::plan::join_ids(&dependents)
            );
        }
    }
    Ok(0)
}

fn unlock(repo: &Path, plan_id: Option<&str>) -> Result<i32> {
    let guard = ConcurrencyGuard::new(repo);
    if guard.remove_if_stale(plan_id)? {
        println!("Removed stale lock {}", guard.lock_path(plan_id).display());
        return Ok(0);
    }
    match guard.read(plan_id)? {
        Some(info) => {
            println!(
                "Lock is held by live process {} (started {}, {})",
                info.pid, info.started_at, info.command
            );
            Ok(1)
        }
        None => {
            println!("No lock at {}", guard.lock_path(plan_id).display());
            Ok(0)
        }
    }
}
