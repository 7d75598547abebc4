//! Structured results reported by workers
//!
//! Workers print JSON result objects somewhere in their primary output. The
//! parser scans free-form text for embedded objects and lists, keeps every
//! fragment that deserializes as a result, and counts the rest as skipped.
//! [`collect_results`] then guarantees exactly one result per dispatched id.

use crate::plan::StepId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// Maximum stderr tail carried into a synthesized blocked reason
const MAX_REASON_CHARS: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    #[serde(alias = "completed", alias = "done")]
    Complete,
    #[serde(alias = "failed")]
    Blocked,
}

/// Result for one step from one invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResult {
    #[serde(alias = "stepId", alias = "id")]
    pub step_id: StepId,
    pub status: ResultStatus,
    #[serde(default)]
    pub summary: String,
    #[serde(default, alias = "blockedReason", alias = "reason")]
    pub blocked_reason: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default, alias = "testResults")]
    pub test_results: Option<Value>,
}

impl WorkerResult {
    pub fn complete(step_id: StepId, summary: &str) -> Self {
        Self {
            step_id,
            status: ResultStatus::Complete,
            summary: summary.to_string(),
            blocked_reason: None,
            artifacts: Vec::new(),
            test_results: None,
        }
    }

    pub fn blocked(step_id: StepId, reason: &str) -> Self {
        Self {
            step_id,
            status: ResultStatus::Blocked,
            summary: String::new(),
            blocked_reason: Some(reason.to_string()),
            artifacts: Vec::new(),
            test_results: None,
        }
    }

    /// Why the step is blocked, falling back to the summary
    pub fn reason(&self) -> &str {
        match self.blocked_reason.as_deref() {
            Some(reason) if !reason.trim().is_empty() => reason,
            _ if !self.summary.trim().is_empty() => &self.summary,
            _ => "Worker reported the step as blocked without a reason",
        }
    }
}

/// Parsed results plus the number of fragments that could not be used
#[derive(Debug, Default)]
pub struct ParseOutcome {
    pub results: Vec<WorkerResult>,
    pub skipped: usize,
}

/// Scan raw worker output for result objects.
///
/// Accepts single objects, JSON arrays of objects, and `{"results": [...]}`
/// aggregates anywhere in the text. Never fails.
pub fn parse_results(raw: &str) -> ParseOutcome {
    let mut outcome = ParseOutcome::default();
    let mut pos = 0;

    while let Some(offset) = raw[pos..].find(['{', '[']) {
        let start = pos + offset;
        let is_object = raw[start..].starts_with('{');

        let mut stream = serde_json::Deserializer::from_str(&raw[start..]).into_iter::<Value>();
        match stream.next() {
            Some(Ok(value)) => {
                collect_value(value, &mut outcome);
                pos = start + stream.byte_offset().max(1);
            }
            _ => {
                // Brackets are common in prose; only broken objects count
                if is_object {
                    outcome.skipped += 1;
                }
                pos = start + 1;
            }
        }
    }

    outcome
}

fn collect_value(value: Value, outcome: &mut ParseOutcome) {
    match value {
        Value::Array(items) => {
            for item in items {
                if item.is_object() {
                    collect_object(item, outcome);
                }
            }
        }
        Value::Object(mut map) => {
            if matches!(map.get("results"), Some(Value::Array(_))) {
                if let Some(Value::Array(items)) = map.remove("results") {
                    for item in items {
                        collect_object(item, outcome);
                    }
                }
            } else {
                collect_object(Value::Object(map), outcome);
            }
        }
        _ => {}
    }
}

fn collect_object(value: Value, outcome: &mut ParseOutcome) {
    let Value::Object(map) = &value else {
        outcome.skipped += 1;
        return;
    };
    // Objects without any id key are ordinary JSON, not malformed results
    let has_id = ["step_id", "stepId", "id"].iter().any(|k| map.contains_key(*k));
    match serde_json::from_value::<WorkerResult>(value) {
        Ok(result) => outcome.results.push(result),
        Err(e) if has_id => {
            log::debug!("[WorkerGateway] Skipping malformed result: {}", e);
            outcome.skipped += 1;
        }
        Err(_) => {}
    }
}

/// Synthesize a result for a step the worker did not report on
pub fn default_result(step_id: &StepId, exit_code: i32, error_output: &str) -> WorkerResult {
    if exit_code == 0 {
        return WorkerResult::complete(
            step_id.clone(),
            "Worker exited successfully without a structured result",
        );
    }

    let tail = tail_chars(error_output.trim(), MAX_REASON_CHARS);
    let reason = if tail.is_empty() {
        format!("Worker exited with code {}", exit_code)
    } else {
        format!("Worker exited with code {}: {}", exit_code, tail)
    };
    WorkerResult::blocked(step_id.clone(), &reason)
}

/// Exactly one result per dispatched id, in dispatch order.
///
/// The first parsed result for an id wins; ids without one get
/// [`default_result`]; results for ids that were not dispatched are dropped.
pub fn collect_results(
    dispatched: &[StepId],
    parsed: Vec<WorkerResult>,
    exit_code: i32,
    error_output: &str,
) -> Vec<WorkerResult> {
    let wanted: HashSet<&StepId> = dispatched.iter().collect();
    let mut chosen: Vec<WorkerResult> = Vec::new();

    for mut result in parsed {
        if !wanted.contains(&result.step_id) {
            log::warn!(
                "[WorkerGateway] Ignoring result for step '{}' which was not dispatched",
                result.step_id
            );
            continue;
        }
        if chosen.iter().any(|r| r.step_id == result.step_id) {
            log::debug!(
                "[WorkerGateway] Duplicate result for step '{}', keeping the first",
                result.step_id
            );
            continue;
        }
        if result.status == ResultStatus::Blocked {
            let reason = result.reason().to_string();
            result.blocked_reason = Some(reason);
        }
        chosen.push(result);
    }

    dispatched
        .iter()
        .map(|id| {
            match chosen.iter().position(|r| &r.step_id == id) {
                Some(index) => chosen.swap_remove(index),
                None => default_result(id, exit_code, error_output),
            }
        })
        .collect()
}

fn tail_chars(s: &str, max: usize) -> &str {
    let count = s.chars().count();
    if count <= max {
        return s;
    }
    match s.char_indices().nth(count - max) {
        Some((index, _)) => &s[index..],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> Vec<StepId> {
        list.iter().map(|s| StepId::new(*s)).collect()
    }

    #[test]
    fn test_parse_single_object_in_prose() {
        let raw = r#"Working on it...
Done! {"step_id": "1", "status": "complete", "summary": "added parser", "artifacts": ["src/p.rs"]}
bye"#;
        let outcome = parse_results(raw);
        assert_eq!(outcome.results.len(), 1);
        assert_eq!(outcome.results[0].step_id, StepId::new("1"));
        assert_eq!(outcome.results[0].artifacts, vec!["src/p.rs"]);
        assert_eq!(outcome.skipped, 0);
    }

    #[test]
    fn test_parse_aggregates_and_aliases() {
        let raw = r#"[{"stepId": 2, "status": "blocked", "blockedReason": "no db"}]
{"results": [{"id": "3", "status": "complete", "testResults": {"passed": 4}}]}"#;
        let outcome = parse_results(raw);
        assert_eq!(outcome.results.len(), 2);
        assert_eq!(outcome.results[0].step_id, StepId::new("2"));
        assert_eq!(outcome.results[0].reason(), "no db");
        assert!(outcome.results[1].test_results.is_some());
    }

    #[test]
    fn test_parse_skips_malformed_fragments() {
        let raw = r#"{"step_id": "1", "status": "complete"
[1/3] compiling
{"step_id": "2", "status": "exploded"}
{"step_id": "4", "status": "complete"}
{"tool": "grep", "args": ["x"]}"#;
        let outcome = parse_results(raw);
        assert_eq!(outcome.results.len(), 1);
        assert_eq!(outcome.results[0].step_id, StepId::new("4"));
        assert_eq!(outcome.skipped, 2);
    }

    #[test]
    fn test_parse_garbage_never_fails() {
        for raw in ["", "{{{{", "]]}{[", "no json here", "{\"a\":", "ünïcödé { ["] {
            let outcome = parse_results(raw);
            assert!(outcome.results.is_empty());
        }
    }

    #[test]
    fn test_default_result() {
        let ok = default_result(&StepId::new("1"), 0, "");
        assert_eq!(ok.status, ResultStatus::Complete);

        let failed = default_result(&StepId::new("1"), 2, "boom\n");
        assert_eq!(failed.status, ResultStatus::Blocked);
        assert_eq!(failed.reason(), "Worker exited with code 2: boom");
    }

    #[test]
    fn test_collect_results_one_per_dispatched_id() {
        let parsed = vec![
            WorkerResult::complete(StepId::new("b"), "b done"),
            WorkerResult::blocked(StepId::new("b"), "second report"),
            WorkerResult::complete(StepId::new("zzz"), "not ours"),
        ];
        let results = collect_results(&ids(&["a", "b", "c"]), parsed, 1, "crashed");

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].step_id, StepId::new("a"));
        assert_eq!(results[0].status, ResultStatus::Blocked);
        assert_eq!(results[1].summary, "b done");
        assert_eq!(results[1].status, ResultStatus::Complete);
        assert_eq!(results[2].status, ResultStatus::Blocked);
        assert!(results[2].reason().contains("crashed"));
    }

    #[test]
    fn test_blocked_result_without_reason_uses_summary() {
        let mut result = WorkerResult::complete(StepId::new("1"), "needs API key");
        result.status = ResultStatus::Blocked;
        let results = collect_results(&ids(&["1"]), vec![result], 0, "");
        assert_eq!(results[0].blocked_reason.as_deref(), Some("needs API key"));
    }
}
