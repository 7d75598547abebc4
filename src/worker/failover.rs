//! Failover across worker backends
//!
//! Backends are tried in priority order, each at most once per batch. A
//! backend is abandoned when its output matches a failure signature, when it
//! goes quiet for longer than the idle timeout, when it exceeds the runtime
//! limit, when it cannot be spawned, or when it exits non-zero without
//! reporting anything while another backend is still available.

use super::process::{invoke, OutputSink, WorkerHandle};
use super::results::{collect_results, parse_results, WorkerResult};
use super::signatures::{SignatureMatch, SignatureSet};
use super::template::InvocationContext;
use crate::config::{AgentBackend, BatonConfig, FailoverConfig, RetryConfig};
use crate::plan::StepId;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Why a backend was abandoned
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptFailure {
    Spawn(String),
    Signature(SignatureMatch),
    IdleTimeout(Duration),
    RuntimeLimit(Duration),
    ExitCode(i32),
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptFailure::Spawn(e) => write!(f, "spawn failed: {}", e),
            AttemptFailure::Signature(m) => write!(f, "error signature matched: {}", m.line),
            AttemptFailure::IdleTimeout(d) => write!(f, "no output for {}s", d.as_secs()),
            AttemptFailure::RuntimeLimit(d) => write!(f, "exceeded runtime limit of {}s", d.as_secs()),
            AttemptFailure::ExitCode(code) => {
                write!(f, "exited with code {} without reporting results", code)
            }
        }
    }
}

/// One abandoned backend in the failure chain
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub backend: String,
    pub failure: AttemptFailure,
}

/// Render a failure chain for a blocked reason
pub fn describe_chain(chain: &[AttemptRecord]) -> String {
    chain
        .iter()
        .map(|a| format!("{}: {}", a.backend, a.failure))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result of running one batch through the failover chain
#[derive(Debug)]
pub struct BatchOutcome {
    /// Exactly one result per dispatched step id
    pub results: Vec<WorkerResult>,
    /// Backend that produced the results, `None` if every backend failed
    pub backend: Option<String>,
    pub exit_code: Option<i32>,
    pub failures: Vec<AttemptRecord>,
    /// Malformed result fragments in the final worker's output
    pub skipped_fragments: usize,
}

enum Monitor {
    Exited(i32),
    Aborted(AttemptFailure),
}

/// Policy layer over raw worker invocation
#[derive(Clone)]
pub struct FailoverGateway {
    agents: Vec<AgentBackend>,
    failover: FailoverConfig,
    retry: RetryConfig,
    signatures: Arc<SignatureSet>,
    sink: Option<OutputSink>,
}

impl FailoverGateway {
    pub fn new(config: &BatonConfig, sink: Option<OutputSink>) -> Result<Self, String> {
        let signatures = SignatureSet::compile(&config.failover.error_patterns)?;
        Ok(Self {
            agents: config.agents.clone(),
            failover: config.failover.clone(),
            retry: config.retry.clone(),
            signatures: Arc::new(signatures),
            sink,
        })
    }

    /// Execute `step_ids` in `cwd`, failing over as needed
    pub async fn run_batch(
        &self,
        ctx: &InvocationContext,
        step_ids: &[StepId],
        cwd: &Path,
    ) -> BatchOutcome {
        let mut failures: Vec<AttemptRecord> = Vec::new();

        for (index, backend) in self.agents.iter().enumerate() {
            let is_last = index + 1 == self.agents.len();
            if index > 0 {
                tokio::time::sleep(self.retry.delay_for(index as u32 - 1)).await;
                log::warn!(
                    "[Failover] Steps {}: switching to backend '{}' after: {}",
                    ctx.step_ids,
                    backend.name,
                    describe_chain(&failures)
                );
            }

            let mut handle = match self.spawn_with_retry(backend, ctx, cwd).await {
                Ok(handle) => handle,
                Err(e) => {
                    failures.push(AttemptRecord {
                        backend: backend.name.clone(),
                        failure: AttemptFailure::Spawn(e),
                    });
                    continue;
                }
            };

            match self.monitor(&mut handle).await {
                Monitor::Exited(code) => {
                    let parsed = parse_results(handle.stdout());
                    if parsed.skipped > 0 {
                        log::warn!(
                            "[WorkerGateway] Skipped {} malformed result fragment(s) from '{}'",
                            parsed.skipped,
                            backend.name
                        );
                    }

                    if code != 0 && parsed.results.is_empty() && !is_last {
                        failures.push(AttemptRecord {
                            backend: backend.name.clone(),
                            failure: AttemptFailure::ExitCode(code),
                        });
                        continue;
                    }

                    log::info!(
                        "[WorkerGateway] Backend '{}' finished steps {} with exit code {}",
                        backend.name,
                        ctx.step_ids,
                        code
                    );
                    // Synthesized blocked results cite the backends abandoned earlier
                    let error_output = if code != 0 && !failures.is_empty() {
                        format!(
                            "{} (after {})",
                            handle.stderr().trim(),
                            describe_chain(&failures)
                        )
                    } else {
                        handle.stderr().to_string()
                    };
                    return BatchOutcome {
                        results: collect_results(step_ids, parsed.results, code, &error_output),
                        backend: Some(backend.name.clone()),
                        exit_code: Some(code),
                        failures,
                        skipped_fragments: parsed.skipped,
                    };
                }
                Monitor::Aborted(failure) => {
                    log::warn!(
                        "[Failover] Aborting '{}' (pid {:?}) for steps {}: {}",
                        backend.name,
                        handle.pid(),
                        ctx.step_ids,
                        failure
                    );
                    handle.kill().await;
                    failures.push(AttemptRecord {
                        backend: backend.name.clone(),
                        failure,
                    });
                }
            }
        }

        let reason = format!("All worker backends failed: {}", describe_chain(&failures));
        log::error!("[Failover] Steps {}: {}", ctx.step_ids, reason);
        BatchOutcome {
            results: step_ids
                .iter()
                .map(|id| WorkerResult::blocked(id.clone(), &reason))
                .collect(),
            backend: None,
            exit_code: None,
            failures,
            skipped_fragments: 0,
        }
    }

    async fn spawn_with_retry(
        &self,
        backend: &AgentBackend,
        ctx: &InvocationContext,
        cwd: &Path,
    ) -> Result<WorkerHandle, String> {
        let attempts = self.retry.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 0..attempts {
            match invoke(backend, ctx, cwd, self.sink.clone()) {
                Ok(handle) => return Ok(handle),
                Err(e) => {
                    last_error = e;
                    if attempt + 1 < attempts {
                        let delay = self.retry.delay_for(attempt);
                        log::warn!(
                            "[Failover] Spawn of '{}' failed on attempt {}/{}: {}. Retrying in {}ms...",
                            backend.name,
                            attempt + 1,
                            attempts,
                            last_error,
                            delay.as_millis()
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(last_error)
    }

    /// Watch a running worker until it exits or must be abandoned
    async fn monitor(&self, handle: &mut WorkerHandle) -> Monitor {
        let started = Instant::now();
        let idle = self.failover.idle_timeout();
        let max_runtime = self.failover.max_runtime();

        loop {
            let remaining = match max_runtime {
                Some(limit) => {
                    let left = limit.saturating_sub(started.elapsed());
                    if left.is_zero() {
                        return Monitor::Aborted(AttemptFailure::RuntimeLimit(limit));
                    }
                    Some(left)
                }
                None => None,
            };

            let wait = match (idle, remaining) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };

            let next = match wait {
                Some(limit) => match tokio::time::timeout(limit, handle.next_line()).await {
                    Ok(next) => next,
                    Err(_) => {
                        if let Some(limit) = max_runtime {
                            if started.elapsed() >= limit {
                                return Monitor::Aborted(AttemptFailure::RuntimeLimit(limit));
                            }
                        }
                        return Monitor::Aborted(AttemptFailure::IdleTimeout(
                            idle.unwrap_or_default(),
                        ));
                    }
                },
                None => handle.next_line().await,
            };

            match next {
                Some(line) => {
                    if let Some(signature) = self.signatures.detect(&line.text) {
                        return Monitor::Aborted(AttemptFailure::Signature(signature));
                    }
                }
                None => {
                    return match handle.wait().await {
                        Ok(code) => Monitor::Exited(code),
                        Err(e) => {
                            log::error!("[WorkerGateway] {}", e);
                            Monitor::Exited(-1)
                        }
                    };
                }
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::worker::results::ResultStatus;

    fn sh(name: &str, script: &str) -> AgentBackend {
        AgentBackend::new(name, "sh", &["-c", script])
    }

    fn gateway(agents: Vec<AgentBackend>, idle_secs: u64) -> FailoverGateway {
        let mut config = BatonConfig {
            agents,
            ..Default::default()
        };
        config.failover.idle_timeout_secs = idle_secs;
        config.retry.backoff_ms = 10;
        config.retry.max_backoff_ms = 20;
        FailoverGateway::new(&config, None).unwrap()
    }

    fn ids(list: &[&str]) -> Vec<StepId> {
        list.iter().map(|s| StepId::new(*s)).collect()
    }

    fn ctx(dir: &Path, step_ids: &[StepId]) -> InvocationContext {
        InvocationContext::new(&dir.join("p.yaml"), "p", step_ids, dir, "baton/p")
    }

    #[tokio::test]
    async fn test_first_backend_success() {
        let dir = tempfile::TempDir::new().unwrap();
        let steps = ids(&["1", "2"]);
        let gw = gateway(
            vec![sh(
                "a",
                r#"echo '{"step_id":"1","status":"complete","summary":"ok"}'"#,
            )],
            30,
        );

        let outcome = gw.run_batch(&ctx(dir.path(), &steps), &steps, dir.path()).await;
        assert_eq!(outcome.backend.as_deref(), Some("a"));
        assert_eq!(outcome.results.len(), 2);
        assert_eq!(outcome.results[0].summary, "ok");
        // No report for step 2 and exit 0: synthesized complete
        assert_eq!(outcome.results[1].status, ResultStatus::Complete);
        assert!(outcome.failures.is_empty());
    }

    #[tokio::test]
    async fn test_signature_triggers_failover() {
        let dir = tempfile::TempDir::new().unwrap();
        let steps = ids(&["1"]);
        let gw = gateway(
            vec![
                sh("a", "echo 'Error: rate limit exceeded' >&2; exec sleep 30"),
                sh("b", r#"echo '{"step_id":"1","status":"complete"}'"#),
            ],
            30,
        );

        let outcome = gw.run_batch(&ctx(dir.path(), &steps), &steps, dir.path()).await;
        assert_eq!(outcome.backend.as_deref(), Some("b"));
        assert_eq!(outcome.failures.len(), 1);
        assert!(matches!(
            outcome.failures[0].failure,
            AttemptFailure::Signature(_)
        ));
        assert_eq!(outcome.results[0].status, ResultStatus::Complete);
    }

    #[tokio::test]
    async fn test_idle_timeout_triggers_failover() {
        let dir = tempfile::TempDir::new().unwrap();
        let steps = ids(&["1"]);
        let gw = gateway(
            vec![sh("slow", "exec sleep 30"), sh("fast", "exit 0")],
            1,
        );

        let outcome = gw.run_batch(&ctx(dir.path(), &steps), &steps, dir.path()).await;
        assert_eq!(outcome.backend.as_deref(), Some("fast"));
        assert!(matches!(
            outcome.failures[0].failure,
            AttemptFailure::IdleTimeout(_)
        ));
    }

    #[tokio::test]
    async fn test_exhausted_chain_blocks_every_step() {
        let dir = tempfile::TempDir::new().unwrap();
        let steps = ids(&["1", "2"]);
        let gw = gateway(
            vec![
                AgentBackend::new("ghost", "this-command-definitely-does-not-exist-12345", &[]),
                sh("flaky", "echo 'connection reset by peer'; exit 1"),
            ],
            30,
        );

        let outcome = gw.run_batch(&ctx(dir.path(), &steps), &steps, dir.path()).await;
        assert!(outcome.backend.is_none());
        assert_eq!(outcome.failures.len(), 2);
        assert_eq!(outcome.results.len(), 2);
        for result in &outcome.results {
            assert_eq!(result.status, ResultStatus::Blocked);
            assert!(result.reason().contains("ghost: spawn failed"));
            assert!(result.reason().contains("flaky: error signature matched"));
        }
    }

    #[tokio::test]
    async fn test_nonzero_exit_on_last_backend_blocks_with_stderr() {
        let dir = tempfile::TempDir::new().unwrap();
        let steps = ids(&["1"]);
        let gw = gateway(
            vec![
                sh("a", "exit 2"),
                sh("b", "echo 'tests failed' >&2; exit 1"),
            ],
            30,
        );

        let outcome = gw.run_batch(&ctx(dir.path(), &steps), &steps, dir.path()).await;
        assert_eq!(outcome.backend.as_deref(), Some("b"));
        assert_eq!(outcome.exit_code, Some(1));
        assert!(matches!(outcome.failures[0].failure, AttemptFailure::ExitCode(2)));
        assert_eq!(outcome.results[0].status, ResultStatus::Blocked);
        let reason = outcome.results[0].reason();
        assert!(reason.contains("tests failed"), "{}", reason);
        assert!(
            reason.contains("a: exited with code 2 without reporting results"),
            "{}",
            reason
        );
    }

    #[tokio::test]
    async fn test_single_backend_failure_reason_is_plain_stderr() {
        let dir = tempfile::TempDir::new().unwrap();
        let steps = ids(&["1"]);
        let gw = gateway(vec![sh("only", "echo 'lint errors' >&2; exit 1")], 30);

        let outcome = gw.run_batch(&ctx(dir.path(), &steps), &steps, dir.path()).await;
        let reason = outcome.results[0].reason();
        assert!(reason.contains("lint errors"), "{}", reason);
        assert!(!reason.contains("only:"), "{}", reason);
    }
}
