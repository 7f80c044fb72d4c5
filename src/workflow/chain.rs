//! Nested Dependency Resolution
//!
//! A step's position in the global ordering is the chain of enclosing
//! include/sub steps from the root workflow down to the step itself.
//! Dependency questions across nested workflow boundaries are answered by
//! comparing two chains: everything before the first divergence is shared
//! ancestry, and the diverging entries are siblings inside one workflow,
//! where the ordinary adjacency-list search applies.

use std::collections::HashSet;
use std::sync::Arc;

use crate::execution::step::Step;

/// Returns the chain of steps from the root workflow down to `step`,
/// including `step` itself.
///
/// Walks the parent pointers upward; at each level the enclosing step is
/// the one whose embedded workflow is the current one. Returns `None` for
/// an orphaned step: one that was never added to a workflow, or whose
/// enclosing workflow is not reachable from a root.
pub fn get_chain(step: &Arc<Step>) -> Option<Vec<Arc<Step>>> {
    let mut chain = vec![step.clone()];
    let mut workflow = step.workflow()?;
    while let Some(parent) = workflow.parent() {
        let enclosing = parent
            .steps_snapshot()
            .into_values()
            .find(|s| s.embeds(&workflow))?;
        chain.insert(0, enclosing);
        workflow = parent;
    }
    Some(chain)
}

/// Returns true if `step` transitively depends on `other`, resolving
/// across nested include/sub workflow boundaries.
pub fn nested_depends(step: &Arc<Step>, other: &Arc<Step>) -> bool {
    let (Some(a_chain), Some(b_chain)) = (get_chain(step), get_chain(other)) else {
        return false;
    };
    let (Some(a_root), Some(b_root)) = (a_chain[0].workflow(), b_chain[0].workflow()) else {
        return false;
    };
    // No shared root workflow, no dependency relationship.
    if !Arc::ptr_eq(&a_root, &b_root) {
        return false;
    }
    // The entries at the first divergence are siblings in one workflow.
    for i in 0..a_chain.len().min(b_chain.len()) {
        if !Arc::ptr_eq(&a_chain[i], &b_chain[i]) {
            return depends(&a_chain[i], &b_chain[i]);
        }
    }
    // One chain is a prefix of the other: a step never depends on itself
    // or on a workflow it is contained in.
    false
}

/// Returns true if `step` transitively depends on `other` within their
/// shared workflow.
///
/// Breadth-first search over the raw adjacency list starting from the
/// step's direct dependencies. Visited names are marked so the walk
/// terminates even if the (not yet validated) graph contains a cycle.
pub fn depends(step: &Arc<Step>, other: &Arc<Step>) -> bool {
    let Some(workflow) = step.workflow() else {
        return false;
    };
    let deps = workflow.deps_snapshot();
    let steps = workflow.steps_snapshot();

    let mut queue: Vec<String> = deps.get(step.name()).cloned().unwrap_or_default();
    let mut seen: HashSet<String> = HashSet::new();
    let mut i = 0;
    while i < queue.len() {
        let name = queue[i].clone();
        i += 1;
        if !seen.insert(name.clone()) {
            continue;
        }
        if let Some(candidate) = steps.get(&name) {
            if Arc::ptr_eq(candidate, other) {
                return true;
            }
        }
        if let Some(more) = deps.get(&name) {
            queue.extend(more.iter().cloned());
        }
    }
    false
}
