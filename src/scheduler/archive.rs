// Downstream integration after a plan is archived

use crate::config::IntegrationConfig;
use crate::worker::template::{render_args, resolve_command};
use serde::Serialize;
use std::path::Path;
use std::process::Stdio;
use tera::Context;
use tokio::process::Command;

/// Values available to the integration command template
#[derive(Debug, Clone, Serialize)]
pub struct IntegrationContext {
    pub plan_id: String,
    pub work_branch: String,
    pub source_branch: String,
    pub archive_path: String,
}

impl IntegrationContext {
    fn to_tera_context(&self) -> Context {
        let mut ctx = Context::new();
        ctx.insert("plan_id", &self.plan_id);
        ctx.insert("work_branch", &self.work_branch);
        ctx.insert("source_branch", &self.source_branch);
        ctx.insert("archive_path", &self.archive_path);
        ctx
    }
}

/// What happened to the integration step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrationStatus {
    /// No command configured, or the plan was not successful
    Skipped,
    Succeeded,
    /// The plan stays archived regardless
    Failed(String),
}

/// Run the configured integration command in `cwd`.
///
/// Only ever called after the plan has been archived.
pub async fn run_integration(
    config: &IntegrationConfig,
    ctx: &IntegrationContext,
    cwd: &Path,
) -> IntegrationStatus {
    let Some((program, args)) = config.command.split_first() else {
        return IntegrationStatus::Skipped;
    };

    match try_run(program, args, ctx, cwd).await {
        Ok(()) => {
            log::info!("[Scheduler] Integration for plan '{}' succeeded", ctx.plan_id);
            IntegrationStatus::Succeeded
        }
        Err(e) => {
            log::error!("[Scheduler] Integration for plan '{}' failed: {}", ctx.plan_id, e);
            IntegrationStatus::Failed(e)
        }
    }
}

async fn try_run(
    program: &str,
    args: &[String],
    ctx: &IntegrationContext,
    cwd: &Path,
) -> Result<(), String> {
    let tera_ctx = ctx.to_tera_context();
    let program = resolve_command(program, cwd)?;
    let args = render_args(args, &tera_ctx)?;

    log::info!("[Scheduler] Running integration: {:?} {:?}", program, args);
    let output = Command::new(&program)
        .args(&args)
        .current_dir(cwd)
        .env("BATON_PLAN_ID", &ctx.plan_id)
        .env("BATON_WORK_BRANCH", &ctx.work_branch)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| format!("Failed to run integration command: {}", e))?;

    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(format!(
        "Integration command exited with code {}: {}",
        output.status.code().unwrap_or(-1),
        stderr.trim()
    ))
}
