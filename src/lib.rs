// Clippy allows for reasonable defaults
#![allow(clippy::too_many_arguments)] // Scheduler plumbing often needs many params
#![allow(clippy::new_without_default)] // Default not always appropriate for stateful types
#![allow(clippy::collapsible_if)] // Separate ifs can be more readable

// Module declarations
pub mod config;
pub mod error;
pub mod git;
pub mod isolation;
pub mod lock;
pub mod plan;
pub mod reports;
pub mod resolver;
pub mod scheduler;
pub mod shutdown;
mod utils;
pub mod worker;

pub use config::{BatonConfig, ConfigManager, LockScope};
pub use error::{PlanError, RunError};
pub use lock::{Acquisition, ConcurrencyGuard, LockGuard, LockInfo};
pub use plan::{Plan, PlanMetadata, PlanStore, Step, StepId, StepStatus};
pub use scheduler::{RunOutcome, RunReport, Scheduler};
pub use utils::{baton_dir, ensure_layout, plans_dir};
pub use worker::{ResultStatus, WorkerResult};
