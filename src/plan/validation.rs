//! Structural validation of plan documents
//!
//! Runs once at load time. Errors are malformed-plan failures; overlapping
//! `files` between independent parallel steps only produce a warning.

use super::types::{Plan, StepId};
use crate::error::PlanError;
use std::collections::{HashMap, HashSet};

/// Validate ids, dependency references and acyclicity
pub fn validate_plan(plan: &Plan) -> Result<(), PlanError> {
    let mut seen: HashSet<&StepId> = HashSet::new();
    for (index, step) in plan.steps.iter().enumerate() {
        if step.id.as_str().trim().is_empty() {
            return Err(PlanError::EmptyStepId(index));
        }
        if !seen.insert(&step.id) {
            return Err(PlanError::DuplicateStepId(step.id.to_string()));
        }
    }

    for step in &plan.steps {
        let mut deps_seen: HashSet<&StepId> = HashSet::new();
        for dep in &step.deps {
            if dep == &step.id {
                return Err(PlanError::SelfDependency(step.id.to_string()));
            }
            if !seen.contains(dep) {
                return Err(PlanError::DanglingDependency {
                    step: step.id.to_string(),
                    dependency: dep.to_string(),
                });
            }
            if !deps_seen.insert(dep) {
                return Err(PlanError::DuplicateDependency {
                    step: step.id.to_string(),
                    dependency: dep.to_string(),
                });
            }
        }
    }

    if let Some(cycle) = find_cycle(plan) {
        return Err(PlanError::DependencyCycle(cycle));
    }

    Ok(())
}

/// DFS cycle detection, visiting steps in plan order so the reported cycle
/// is deterministic
fn find_cycle(plan: &Plan) -> Option<Vec<String>> {
    let deps: HashMap<&StepId, &Vec<StepId>> =
        plan.steps.iter().map(|s| (&s.id, &s.deps)).collect();

    let mut visited: HashSet<&StepId> = HashSet::new();
    let mut in_path: HashSet<&StepId> = HashSet::new();
    let mut path: Vec<&StepId> = Vec::new();

    for step in &plan.steps {
        if !visited.contains(&step.id) {
            if let Some(cycle) = dfs(&step.id, &deps, &mut visited, &mut in_path, &mut path) {
                return Some(cycle.into_iter().map(|id| id.to_string()).collect());
            }
        }
    }
    None
}

fn dfs<'a>(
    node: &'a StepId,
    deps: &HashMap<&'a StepId, &'a Vec<StepId>>,
    visited: &mut HashSet<&'a StepId>,
    in_path: &mut HashSet<&'a StepId>,
    path: &mut Vec<&'a StepId>,
) -> Option<Vec<&'a StepId>> {
    visited.insert(node);
    in_path.insert(node);
    path.push(node);

    if let Some(node_deps) = deps.get(node) {
        for dep in node_deps.iter() {
            if in_path.contains(dep) {
                let start = path.iter().position(|n| *n == dep).unwrap_or(0);
                let mut cycle = path[start..].to_vec();
                cycle.push(dep);
                return Some(cycle);
            }
            if !visited.contains(dep) {
                if let Some(cycle) = dfs(dep, deps, visited, in_path, path) {
                    return Some(cycle);
                }
            }
        }
    }

    in_path.remove(node);
    path.pop();
    None
}

/// Pairs of parallel steps that may run concurrently and declare the same file.
///
/// Two steps can run concurrently when neither is reachable from the other
/// through `deps`. Only the first shared file of each pair is reported.
pub fn overlapping_parallel_files(plan: &Plan) -> Vec<(StepId, StepId, String)> {
    let parallel: Vec<_> = plan
        .steps
        .iter()
        .filter(|s| s.parallel && !s.files.is_empty())
        .collect();

    let mut overlaps = Vec::new();
    for (i, a) in parallel.iter().enumerate() {
        for b in parallel.iter().skip(i + 1) {
            if depends_transitively(plan, &a.id, &b.id) || depends_transitively(plan, &b.id, &a.id)
            {
                continue;
            }
            if let Some(file) = a.files.iter().find(|f| b.files.contains(f)) {
                overlaps.push((a.id.clone(), b.id.clone(), file.clone()));
            }
        }
    }
    overlaps
}

/// Whether `step` reaches `target` by following `deps`
fn depends_transitively(plan: &Plan, step: &StepId, target: &StepId) -> bool {
    let mut stack = vec![step];
    let mut seen: HashSet<&StepId> = HashSet::new();
    while let Some(current) = stack.pop() {
        if !seen.insert(current) {
            continue;
        }
        if let Some(s) = plan.step(current) {
            for dep in &s.deps {
                if dep == target {
                    return true;
                }
                stack.push(dep);
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::types::Step;

    #[test]
    fn test_valid_plan() {
        let plan = Plan::new(vec![
            Step::new("1", "a"),
            Step::new("2", "b").with_deps(&["1"]),
            Step::new("3", "c").with_deps(&["1", "2"]),
        ]);
        assert!(validate_plan(&plan).is_ok());
    }

    #[test]
    fn test_duplicate_id() {
        let plan = Plan::new(vec![Step::new("1", "a"), Step::new("1", "b")]);
        assert!(matches!(
            validate_plan(&plan),
            Err(PlanError::DuplicateStepId(id)) if id == "1"
        ));
    }

    #[test]
    fn test_empty_id() {
        let plan = Plan::new(vec![Step::new("1", "a"), Step::new(" ", "b")]);
        assert!(matches!(validate_plan(&plan), Err(PlanError::EmptyStepId(1))));
    }

    #[test]
    fn test_dangling_and_self_dependency() {
        let plan = Plan::new(vec![Step::new("1", "a").with_deps(&["9"])]);
        assert!(matches!(
            validate_plan(&plan),
            Err(PlanError::DanglingDependency { .. })
        ));

        let plan = Plan::new(vec![Step::new("1", "a").with_deps(&["1"])]);
        assert!(matches!(
            validate_plan(&plan),
            Err(PlanError::SelfDependency(_))
        ));
    }

    #[test]
    fn test_duplicate_dependency() {
        let plan = Plan::new(vec![
            Step::new("1", "a"),
            Step::new("2", "b").with_deps(&["1", "1"]),
        ]);
        assert!(matches!(
            validate_plan(&plan),
            Err(PlanError::DuplicateDependency { .. })
        ));
    }

    #[test]
    fn test_cycle_detected() {
        let plan = Plan::new(vec![
            Step::new("a", "a").with_deps(&["c"]),
            Step::new("b", "b").with_deps(&["a"]),
            Step::new("c", "c").with_deps(&["b"]),
        ]);
        match validate_plan(&plan) {
            Err(PlanError::DependencyCycle(cycle)) => {
                assert_eq!(cycle, vec!["a", "c", "b", "a"]);
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_overlapping_files_between_independent_parallel_steps() {
        let mut a = Step::new("a", "a").with_parallel(true);
        a.files = vec!["src/lib.rs".into()];
        let mut b = Step::new("b", "b").with_parallel(true);
        b.files = vec!["src/lib.rs".into(), "README.md".into()];
        let mut c = Step::new("c", "c").with_parallel(true).with_deps(&["a"]);
        c.files = vec!["src/lib.rs".into()];

        let overlaps = overlapping_parallel_files(&Plan::new(vec![a, b, c]));
        assert_eq!(overlaps.len(), 2);
        assert_eq!(overlaps[0].0, StepId::new("a"));
        assert_eq!(overlaps[0].1, StepId::new("b"));
        assert_eq!(overlaps[1].0, StepId::new("b"));
        assert_eq!(overlaps[1].1, StepId::new("c"));
    }
}
