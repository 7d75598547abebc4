//! Configuration file handling
//!
//! Reads and writes `.baton/config.yaml`. Every field has a default, so a
//! missing file or a partial file both yield a usable configuration.
//! Environment variables are layered on top of the file, and command-line
//! flags on top of both.

use crate::utils::baton_dir;
use crate::worker::signatures::{SignatureSet, DEFAULT_ERROR_PATTERNS};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Which lock a run takes, and where its work branch is checked out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LockScope {
    /// One run per repository; the work branch lives in the repository root
    #[default]
    Global,
    /// One run per plan; each plan works in its own worktree
    Plan,
}

impl FromStr for LockScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "global" => Ok(LockScope::Global),
            "plan" => Ok(LockScope::Plan),
            other => Err(format!("Unknown lock scope '{}' (expected global|plan)", other)),
        }
    }
}

/// A worker backend in the failover chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentBackend {
    pub name: String,
    pub command: String,
    /// Argument templates, rendered per invocation
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl AgentBackend {
    pub fn new(name: &str, command: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: BTreeMap::new(),
        }
    }
}

fn default_agents() -> Vec<AgentBackend> {
    vec![AgentBackend::new(
        "claude",
        "claude",
        &[
            "-p",
            "Execute steps {{ step_ids }} of the plan at {{ plan_path }}",
        ],
    )]
}

/// When to abandon a backend and move to the next one
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    /// Kill a worker that produces no output for this long
    pub idle_timeout_secs: u64,
    /// Hard limit on a worker's runtime, 0 = unlimited
    pub max_runtime_secs: u64,
    /// Regexes matched against every output line
    pub error_patterns: Vec<String>,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 900,
            max_runtime_secs: 0,
            error_patterns: DEFAULT_ERROR_PATTERNS
                .iter()
                .map(|(pattern, _)| pattern.to_string())
                .collect(),
        }
    }
}

impl FailoverConfig {
    /// Idle limit, `None` when disabled with 0
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn max_runtime(&self) -> Option<Duration> {
        (self.max_runtime_secs > 0).then(|| Duration::from_secs(self.max_runtime_secs))
    }
}

/// Configuration for spawn retries and failover pacing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Spawn attempts per backend (default: 2)
    pub max_attempts: u32,
    /// Initial delay in milliseconds (default: 2000)
    pub backoff_ms: u64,
    /// Maximum delay in milliseconds (default: 30000)
    pub max_backoff_ms: u64,
    /// Backoff multiplier (default: 2.0)
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            backoff_ms: 2000,
            max_backoff_ms: 30000,
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before the retry following `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(32) as i32);
        let ms = (self.backoff_ms as f64 * factor).min(self.max_backoff_ms as f64);
        Duration::from_millis(ms as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationConfig {
    pub enabled: bool,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Command run after a plan is archived successfully
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrationConfig {
    /// argv templates; empty disables integration
    pub command: Vec<String>,
}

/// Engine configuration (.baton/config.yaml)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatonConfig {
    pub max_parallel: usize,
    pub lock_scope: LockScope,
    /// Archive all-terminal plans that still contain blocked steps; when
    /// false they stay in the plans directory for another run
    pub archive_on_blocked: bool,
    /// How often the scheduler checks for shutdown while waiting on workers
    pub poll_interval_ms: u64,
    /// Backends in priority order
    pub agents: Vec<AgentBackend>,
    pub failover: FailoverConfig,
    pub retry: RetryConfig,
    pub isolation: IsolationConfig,
    pub integration: IntegrationConfig,
}

impl Default for BatonConfig {
    fn default() -> Self {
        Self {
            max_parallel: 3,
            lock_scope: LockScope::Global,
            archive_on_blocked: true,
            poll_interval_ms: 250,
            agents: default_agents(),
            failover: FailoverConfig::default(),
            retry: RetryConfig::default(),
            isolation: IsolationConfig::default(),
            integration: IntegrationConfig::default(),
        }
    }
}

impl BatonConfig {
    /// Apply `BATON_*` environment variables
    pub fn apply_env_overrides(&mut self) -> Result<(), String> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable source
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<(), String>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("BATON_MAX_PARALLEL") {
            self.max_parallel = value
                .trim()
                .parse()
                .map_err(|e| format!("Invalid BATON_MAX_PARALLEL '{}': {}", value, e))?;
        }

        if let Some(value) = lookup("BATON_IDLE_TIMEOUT_SECS") {
            self.failover.idle_timeout_secs = value
                .trim()
                .parse()
                .map_err(|e| format!("Invalid BATON_IDLE_TIMEOUT_SECS '{}': {}", value, e))?;
        }

        if let Some(value) = lookup("BATON_LOCK_SCOPE") {
            self.lock_scope = value.parse()?;
        }

        if let Some(value) = lookup("BATON_AGENTS") {
            let names: Vec<&str> = value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .collect();
            self.select_agents(&names)?;
        }

        Ok(())
    }

    /// Keep only the named backends, in the given order
    fn select_agents(&mut self, names: &[&str]) -> Result<(), String> {
        let mut selected = Vec::with_capacity(names.len());
        for name in names {
            let agent = self
                .agents
                .iter()
                .find(|a| a.name == *name)
                .ok_or_else(|| format!("Unknown agent '{}'", name))?;
            selected.push(agent.clone());
        }
        self.agents = selected;
        Ok(())
    }

    /// Check the configuration before a run
    pub fn validate(&self) -> Result<(), String> {
        if self.max_parallel == 0 {
            return Err("max_parallel must be at least 1".to_string());
        }
        if self.agents.is_empty() {
            return Err("At least one agent backend must be configured".to_string());
        }
        for agent in &self.agents {
            if agent.command.trim().is_empty() {
                return Err(format!("Agent '{}' has an empty command", agent.name));
            }
        }
        SignatureSet::compile(&self.failover.error_patterns)?;
        Ok(())
    }
}

/// Merge config values with command-line overrides.
///
/// `agent` moves the named backend to the front of the chain; the remaining
/// backends stay available for failover.
pub fn merge_overrides(
    file_config: &BatonConfig,
    max_parallel: Option<usize>,
    agent: Option<&str>,
) -> Result<BatonConfig, String> {
    let mut config = file_config.clone();

    if let Some(max_parallel) = max_parallel {
        config.max_parallel = max_parallel;
    }

    if let Some(name) = agent {
        let index = config
            .agents
            .iter()
            .position(|a| a.name == name)
            .ok_or_else(|| format!("Unknown agent '{}'", name))?;
        let chosen = config.agents.remove(index);
        config.agents.insert(0, chosen);
    }

    Ok(config)
}

/// Configuration file manager
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new config manager for a repository
    pub fn new(repo_path: &Path) -> Self {
        Self {
            config_path: baton_dir(repo_path).join("config.yaml"),
        }
    }

    /// Check if config file exists
    pub fn exists(&self) -> bool {
        self.config_path.exists()
    }

    /// Read config from file, returning defaults if not found
    pub fn read(&self) -> Result<BatonConfig, String> {
        if !self.config_path.exists() {
            return Ok(BatonConfig::default());
        }

        let content = std::fs::read_to_string(&self.config_path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;

        serde_yaml::from_str(&content).map_err(|e| format!("Failed to parse config file: {}", e))
    }

    /// Write config to file
    pub fn write(&self, config: &BatonConfig) -> Result<(), String> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create config directory: {}", e))?;
        }

        let content = serde_yaml::to_string(config)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;

        std::fs::write(&self.config_path, content)
            .map_err(|e| format!("Failed to write config file: {}", e))
    }

    /// Initialize config with defaults if it doesn't exist
    pub fn initialize(&self) -> Result<BatonConfig, String> {
        if self.exists() {
            return self.read();
        }

        let config = BatonConfig::default();
        self.write(&config)?;
        Ok(config)
    }

    /// Read the file and apply environment overrides
    pub fn load_effective(&self) -> Result<BatonConfig, String> {
        let mut config = self.read()?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Get the config file path
    pub fn path(&self) -> &Path {
        &self.config_path
    }
}
