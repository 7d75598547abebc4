//! Dependency resolution over a plan's step list
//!
//! Pure functions: nothing here touches the filesystem or mutates the plan.
//! A blocked dependency keeps its dependents out of the ready set forever,
//! which is how blocking cascades; cycles simply never become ready.

use crate::plan::{Plan, Step, StepId, StepStatus};
use std::collections::{HashSet, VecDeque};

/// Pending steps whose dependencies are all complete, in plan order
pub fn ready_steps(plan: &Plan) -> Vec<&Step> {
    let complete: HashSet<&StepId> = plan
        .steps
        .iter()
        .filter(|s| s.status == StepStatus::Complete)
        .map(|s| &s.id)
        .collect();

    plan.steps
        .iter()
        .filter(|s| s.status == StepStatus::Pending)
        .filter(|s| s.deps.iter().all(|d| complete.contains(d)))
        .collect()
}

/// Split of a ready set into what may start now and what must wait
#[derive(Debug, Default)]
pub struct Partition<'a> {
    /// Parallel-eligible steps that fit in the remaining capacity
    pub parallel: Vec<&'a Step>,
    /// Non-parallel steps, to be started one at a time in plan order
    pub serial: Vec<&'a Step>,
    /// Ready steps held back by the capacity limit or by an earlier serial step
    pub deferred: Vec<&'a Step>,
}

impl Partition<'_> {
    pub fn is_empty(&self) -> bool {
        self.parallel.is_empty() && self.serial.is_empty()
    }
}

/// Partition ready steps (in plan order) given the current load.
///
/// A non-parallel step acts as a barrier: parallel steps positioned after it
/// are deferred until it has started, even if their deps are satisfied.
pub fn partition<'a>(
    ready: &[&'a Step],
    max_parallel: usize,
    currently_running: usize,
) -> Partition<'a> {
    let capacity = max_parallel.saturating_sub(currently_running);
    let mut result = Partition::default();
    let mut barrier = false;

    for step in ready {
        if !step.parallel {
            result.serial.push(step);
            barrier = true;
        } else if !barrier && result.parallel.len() < capacity {
            result.parallel.push(step);
        } else {
            result.deferred.push(step);
        }
    }

    result
}

/// Every step whose dependency chain includes `step_id`, in plan order
pub fn blocked_dependents(plan: &Plan, step_id: &StepId) -> Vec<StepId> {
    let mut affected: HashSet<&StepId> = HashSet::new();
    let mut queue: VecDeque<&StepId> = VecDeque::new();
    queue.push_back(step_id);

    while let Some(current) = queue.pop_front() {
        for step in &plan.steps {
            if step.deps.contains(current) && affected.insert(&step.id) {
                queue.push_back(&step.id);
            }
        }
    }

    plan.steps
        .iter()
        .filter(|s| affected.contains(&s.id))
        .map(|s| s.id.clone())
        .collect()
}

/// Cascade impact of every blocked step in the plan
pub fn cascade_impact(plan: &Plan) -> Vec<(StepId, Vec<StepId>)> {
    plan.blocked_ids()
        .into_iter()
        .map(|id| {
            let dependents = blocked_dependents(plan, &id);
            (id, dependents)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(steps: &[&Step]) -> Vec<String> {
        steps.iter().map(|s| s.id.to_string()).collect()
    }

    #[test]
    fn test_ready_requires_complete_deps() {
        let plan = Plan::new(vec![
            Step::new("1", "a").with_status(StepStatus::Complete),
            Step::new("2", "b").with_deps(&["1"]),
            Step::new("3", "c").with_deps(&["2"]),
            Step::new("4", "d"),
        ]);
        assert_eq!(ids(&ready_steps(&plan)), vec!["2", "4"]);
    }

    #[test]
    fn test_blocked_dependency_excludes_dependent() {
        let plan = Plan::new(vec![
            Step::new("1", "a").with_status(StepStatus::Blocked),
            Step::new("2", "b").with_deps(&["1"]),
            Step::new("3", "c").with_deps(&["2"]),
        ]);
        assert!(ready_steps(&plan).is_empty());
        assert_eq!(
            blocked_dependents(&plan, &StepId::new("1")),
            vec![StepId::new("2"), StepId::new("3")]
        );
    }

    #[test]
    fn test_in_progress_steps_are_not_ready() {
        let plan = Plan::new(vec![Step::new("1", "a").with_status(StepStatus::InProgress)]);
        assert!(ready_steps(&plan).is_empty());
    }

    #[test]
    fn test_cycle_never_ready() {
        let plan = Plan::new(vec![
            Step::new("a", "a").with_deps(&["b"]),
            Step::new("b", "b").with_deps(&["a"]),
        ]);
        assert!(ready_steps(&plan).is_empty());
    }

    #[test]
    fn test_partition_serial_barrier() {
        let a = Step::new("A", "a").with_parallel(true);
        let b = Step::new("B", "b");
        let c = Step::new("C", "c").with_parallel(true);
        let ready = vec![&a, &b, &c];

        let p = partition(&ready, 3, 0);
        assert_eq!(ids(&p.parallel), vec!["A"]);
        assert_eq!(ids(&p.serial), vec!["B"]);
        assert_eq!(ids(&p.deferred), vec!["C"]);
    }

    #[test]
    fn test_partition_respects_capacity() {
        let a = Step::new("A", "a").with_parallel(true);
        let b = Step::new("B", "b").with_parallel(true);
        let c = Step::new("C", "c").with_parallel(true);
        let ready = vec![&a, &b, &c];

        let p = partition(&ready, 3, 1);
        assert_eq!(ids(&p.parallel), vec!["A", "B"]);
        assert_eq!(ids(&p.deferred), vec!["C"]);

        let p = partition(&ready, 2, 5);
        assert!(p.parallel.is_empty());
        assert_eq!(p.deferred.len(), 3);
    }

    #[test]
    fn test_cascade_impact() {
        let plan = Plan::new(vec![
            Step::new("1", "a").with_status(StepStatus::Blocked),
            Step::new("2", "b").with_deps(&["1"]),
            Step::new("3", "c"),
        ]);
        let impact = cascade_impact(&plan);
        assert_eq!(impact.len(), 1);
        assert_eq!(impact[0].1, vec![StepId::new("2")]);
    }
}
