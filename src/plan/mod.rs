//! Plan model, validation and persistence

mod store;
mod types;
mod validation;

pub use store::{join_ids, load_plan, plan_id_from_path, save_plan, PlanStore};
pub use types::{
    can_transition, ExtraFields, Plan, PlanMetadata, PlanOutcome, StatusSummary, Step, StepId,
    StepStatus,
};
pub use validation::{overlapping_parallel_files, validate_plan};
