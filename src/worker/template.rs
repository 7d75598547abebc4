// Argument templates and command resolution for worker invocations

use crate::plan::{join_ids, StepId};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tera::{Context, Tera};

/// Values available to argument templates
#[derive(Debug, Clone, Serialize)]
pub struct InvocationContext {
    pub plan_path: String,
    pub plan_id: String,
    /// Comma-joined step ids
    pub step_ids: String,
    pub workspace: String,
    pub work_branch: String,
}

impl InvocationContext {
    pub fn new(
        plan_path: &Path,
        plan_id: &str,
        step_ids: &[StepId],
        workspace: &Path,
        work_branch: &str,
    ) -> Self {
        Self {
            plan_path: plan_path.display().to_string(),
            plan_id: plan_id.to_string(),
            step_ids: join_ids(step_ids),
            workspace: workspace.display().to_string(),
            work_branch: work_branch.to_string(),
        }
    }

    /// Convert to Tera context
    pub fn to_tera_context(&self) -> Context {
        let mut ctx = Context::new();
        ctx.insert("plan_path", &self.plan_path);
        ctx.insert("plan_id", &self.plan_id);
        ctx.insert("step_ids", &self.step_ids);
        ctx.insert("workspace", &self.workspace);
        ctx.insert("work_branch", &self.work_branch);
        ctx
    }

    /// Environment variables handed to every worker
    pub fn env_vars(&self) -> Vec<(&'static str, String)> {
        vec![
            ("BATON_PLAN", self.plan_path.clone()),
            ("BATON_PLAN_ID", self.plan_id.clone()),
            ("BATON_STEP_IDS", self.step_ids.clone()),
            ("BATON_WORKSPACE", self.workspace.clone()),
        ]
    }
}

/// Render one template string (no autoescaping; these are argv entries)
pub fn render_template(template: &str, ctx: &Context) -> Result<String, String> {
    if !template.contains("{{") && !template.contains("{%") {
        return Ok(template.to_string());
    }
    Tera::one_off(template, ctx, false)
        .map_err(|e| format!("Failed to render template '{}': {}", template, e))
}

/// Render every argument template
pub fn render_args(templates: &[String], ctx: &Context) -> Result<Vec<String>, String> {
    templates.iter().map(|t| render_template(t, ctx)).collect()
}

/// Resolve a backend command to an executable path
pub fn resolve_command(command: &str, cwd: &Path) -> Result<PathBuf, String> {
    let candidate = Path::new(command);
    if candidate.components().count() > 1 {
        let path = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            cwd.join(candidate)
        };
        return if path.exists() {
            Ok(path)
        } else {
            Err(format!("Command not found: {:?}", path))
        };
    }

    which::which(command).map_err(|e| format!("Command '{}' not found in PATH: {}", command, e))
}
