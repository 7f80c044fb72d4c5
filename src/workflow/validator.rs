//! Workflow Validation
//!
//! Checks performed before any step executes: identifier patterns,
//! duplicate-dependency removal, reference integrity, and cycle detection
//! via Kahn's algorithm. The resulting topological order is also what the
//! workflow uses to drive per-step validation, so resource intents are
//! registered creator-first.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{ErrorKind, WorkflowError};
use crate::workflow::Workflow;

/// Pattern step and workflow names must match.
static NAME_RGX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z][-a-z0-9]*$").unwrap());

/// Checks an identifier against the required name pattern.
pub fn validate_name(name: &str, what: &str) -> Result<(), WorkflowError> {
    if NAME_RGX.is_match(name) {
        return Ok(());
    }
    Err(WorkflowError::new(
        ErrorKind::BadStepName,
        format!(
            "{} name '{}' must start with a lowercase letter and contain only lowercase letters, digits, and hyphens",
            what, name
        ),
    ))
}

/// Validates the dependency graph of `workflow` and returns a topological
/// order of its step names.
///
/// Deduplicates every step's dependency list in place, rejects references
/// to unknown steps with [`ErrorKind::MissingDependencyNode`], and rejects
/// cycles (including one-step self-dependencies) with
/// [`ErrorKind::CycleDetected`]. Ties in the returned order are broken
/// lexicographically so validation is deterministic.
pub fn validate_dag(workflow: &Arc<Workflow>) -> Result<Vec<String>, WorkflowError> {
    let steps = workflow.steps_snapshot();
    let deps = workflow.dedup_dependencies();

    for (step_name, list) in &deps {
        if !steps.contains_key(step_name) {
            return Err(WorkflowError::new(
                ErrorKind::MissingDependencyNode,
                format!(
                    "dependencies declared for unknown step '{}' in workflow '{}'",
                    step_name,
                    workflow.name()
                ),
            ));
        }
        for dep in list {
            if !steps.contains_key(dep) {
                return Err(WorkflowError::new(
                    ErrorKind::MissingDependencyNode,
                    format!(
                        "step '{}' depends on unknown step '{}' in workflow '{}'",
                        step_name,
                        dep,
                        workflow.name()
                    ),
                ));
            }
        }
    }

    // Kahn's algorithm; anything left unordered sits on a cycle.
    let mut in_degree: HashMap<&str, usize> = steps
        .keys()
        .map(|name| {
            let degree = deps.get(name).map(|list| list.len()).unwrap_or(0);
            (name.as_str(), degree)
        })
        .collect();

    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for (name, list) in &deps {
        for dep in list {
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(name.as_str());
        }
    }

    let mut roots: Vec<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(name, _)| *name)
        .collect();
    roots.sort_unstable();
    let mut queue: VecDeque<&str> = roots.into();

    let mut order: Vec<String> = Vec::with_capacity(steps.len());
    while let Some(current) = queue.pop_front() {
        order.push(current.to_string());
        let mut released: Vec<&str> = Vec::new();
        if let Some(next) = dependents.get(current) {
            for dependent in next {
                let degree = in_degree
                    .get_mut(dependent)
                    .expect("dependent is a known step");
                *degree -= 1;
                if *degree == 0 {
                    released.push(dependent);
                }
            }
        }
        released.sort_unstable();
        queue.extend(released);
    }

    if order.len() != steps.len() {
        return Err(WorkflowError::new(
            ErrorKind::CycleDetected,
            format!(
                "workflow '{}' contains a dependency cycle",
                workflow.name()
            ),
        ));
    }

    debug!("workflow '{}': topological order {:?}", workflow.name(), order);
    Ok(order)
}
