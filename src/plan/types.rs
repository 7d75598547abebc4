//! Plan document types
//!
//! A plan is a YAML document with a `metadata` object and an ordered `steps`
//! list. Fields the engine does not know about are carried through load/save
//! untouched so planning-time annotations survive execution.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Unknown fields preserved verbatim
pub type ExtraFields = BTreeMap<String, serde_yaml::Value>;

/// Identifier of a step.
///
/// Plans may write ids as integers (`id: 3`) or strings (`id: "setup"`).
/// Equality only looks at the textual form so a worker reporting `"3"`
/// matches a step declared as `3`; the original form is kept for saving.
#[derive(Debug, Clone, Eq, PartialOrd, Ord)]
pub struct StepId {
    raw: String,
    numeric: bool,
}

impl StepId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            numeric: false,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl PartialEq for StepId {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Hash for StepId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl From<&str> for StepId {
    fn from(s: &str) -> Self {
        StepId::new(s)
    }
}

impl From<u64> for StepId {
    fn from(n: u64) -> Self {
        Self {
            raw: n.to_string(),
            numeric: true,
        }
    }
}

impl Serialize for StepId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.numeric {
            if let Ok(n) = self.raw.parse::<i64>() {
                return serializer.serialize_i64(n);
            }
        }
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for StepId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawId {
            Int(i64),
            Str(String),
        }

        Ok(match RawId::deserialize(deserializer)? {
            RawId::Int(n) => StepId {
                raw: n.to_string(),
                numeric: true,
            },
            RawId::Str(s) => StepId::new(s),
        })
    }
}

/// Status of a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    InProgress,
    Complete,
    Blocked,
}

impl StepStatus {
    /// Complete and blocked steps need no further scheduling
    pub fn is_terminal(self) -> bool {
        matches!(self, StepStatus::Complete | StepStatus::Blocked)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepStatus::Pending => "pending",
            StepStatus::InProgress => "in_progress",
            StepStatus::Complete => "complete",
            StepStatus::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

/// Validates if a step can move from one status to another during a run.
///
/// `in_progress -> pending` is the resumption reset; terminal statuses are
/// never left by the engine itself.
pub fn can_transition(from: StepStatus, to: StepStatus) -> bool {
    matches!(
        (from, to),
        (StepStatus::Pending, StepStatus::InProgress)
            | (StepStatus::InProgress, StepStatus::Complete)
            | (StepStatus::InProgress, StepStatus::Blocked)
            | (StepStatus::InProgress, StepStatus::Pending)
    )
}

/// Final outcome recorded when a plan is archived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanOutcome {
    Success,
    Blocked,
}

impl fmt::Display for PlanOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanOutcome::Success => f.write_str("success"),
            PlanOutcome::Blocked => f.write_str("blocked"),
        }
    }
}

/// Plan metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// Branch the work branch was cut from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_branch: Option<String>,
    /// Shared work line for this plan; set once dispatch starts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<PlanOutcome>,
    #[serde(flatten)]
    pub extra: ExtraFields,
}

/// A single unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub description: String,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default)]
    pub deps: Vec<StepId>,
    #[serde(default)]
    pub parallel: bool,
    /// Advisory list of files the step expects to touch
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
    #[serde(flatten)]
    pub extra: ExtraFields,
}

impl Step {
    /// Create a pending step with no dependencies
    pub fn new(id: impl Into<StepId>, description: &str) -> Self {
        Self {
            id: id.into(),
            description: description.to_string(),
            status: StepStatus::Pending,
            deps: Vec::new(),
            parallel: false,
            files: Vec::new(),
            context_files: Vec::new(),
            blocked_reason: None,
            extra: ExtraFields::new(),
        }
    }

    pub fn with_deps(mut self, deps: &[&str]) -> Self {
        self.deps = deps.iter().map(|d| StepId::new(*d)).collect();
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_status(mut self, status: StepStatus) -> Self {
        self.status = status;
        self
    }
}

/// Counts of steps per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusSummary {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub complete: usize,
    pub blocked: usize,
}

/// A dependency-ordered work plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub metadata: PlanMetadata,
    pub steps: Vec<Step>,
    #[serde(flatten)]
    pub extra: ExtraFields,
}

impl Plan {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            metadata: PlanMetadata::default(),
            steps,
            extra: ExtraFields::new(),
        }
    }

    /// Every step is complete or blocked
    pub fn is_complete(&self) -> bool {
        self.steps.iter().all(|s| s.status.is_terminal())
    }

    /// Every step is complete
    pub fn is_successful(&self) -> bool {
        self.steps.iter().all(|s| s.status == StepStatus::Complete)
    }

    pub fn completed_ids(&self) -> Vec<StepId> {
        self.ids_with_status(StepStatus::Complete)
    }

    pub fn blocked_ids(&self) -> Vec<StepId> {
        self.ids_with_status(StepStatus::Blocked)
    }

    pub fn in_progress_ids(&self) -> Vec<StepId> {
        self.ids_with_status(StepStatus::InProgress)
    }

    fn ids_with_status(&self, status: StepStatus) -> Vec<StepId> {
        self.steps
            .iter()
            .filter(|s| s.status == status)
            .map(|s| s.id.clone())
            .collect()
    }

    pub fn step(&self, id: &StepId) -> Option<&Step> {
        self.steps.iter().find(|s| &s.id == id)
    }

    pub fn step_mut(&mut self, id: &StepId) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| &s.id == id)
    }

    pub fn status_summary(&self) -> StatusSummary {
        let mut summary = StatusSummary {
            total: self.steps.len(),
            ..Default::default()
        };
        for step in &self.steps {
            match step.status {
                StepStatus::Pending => summary.pending += 1,
                StepStatus::InProgress => summary.in_progress += 1,
                StepStatus::Complete => summary.complete += 1,
                StepStatus::Blocked => summary.blocked += 1,
            }
        }
        summary
    }
}
