//! Workflow graph validation and execution-order computation.
//!
//! Stage B depends on stage A iff A appears in B's `depends_on`.
//! Acyclicity is checked with a three-color depth-first search that
//! reconstructs the offending path; execution order comes from Kahn's
//! algorithm with declaration-order tie-breaking, so re-running the
//! same workflow always produces the same level grouping.

use crate::errors::{CycleError, EngineError};
use crate::workflow::WorkflowDefinition;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Validates that the stage graph contains no dependency cycle.
///
/// # Errors
///
/// Returns a [`CycleError`] whose path starts and ends at the same
/// stage name, e.g. `a -> b -> a`.
pub fn validate_acyclic(workflow: &WorkflowDefinition) -> Result<(), CycleError> {
    let deps: HashMap<&str, &[String]> = workflow
        .stages
        .iter()
        .map(|s| (s.name.as_str(), s.depends_on.as_slice()))
        .collect();

    let mut colors: HashMap<&str, Color> =
        deps.keys().map(|name| (*name, Color::White)).collect();
    let mut stack: Vec<&str> = Vec::new();

    for stage in &workflow.stages {
        if colors.get(stage.name.as_str()) == Some(&Color::White) {
            if let Some(path) = visit(stage.name.as_str(), &deps, &mut colors, &mut stack) {
                return Err(CycleError::new(path));
            }
        }
    }
    Ok(())
}

fn visit<'a>(
    node: &'a str,
    deps: &HashMap<&'a str, &'a [String]>,
    colors: &mut HashMap<&'a str, Color>,
    stack: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    colors.insert(node, Color::Gray);
    stack.push(node);

    if let Some(node_deps) = deps.get(node) {
        for dep in node_deps.iter() {
            match colors.get(dep.as_str()) {
                Some(Color::Gray) => {
                    // Back-edge: the gray chain from `dep` to here,
                    // closed with `dep`, is the cycle.
                    let start = stack
                        .iter()
                        .position(|n| *n == dep.as_str())
                        .unwrap_or(0);
                    let mut path: Vec<String> =
                        stack[start..].iter().map(|s| (*s).to_string()).collect();
                    path.push(dep.clone());
                    return Some(path);
                }
                Some(Color::White) => {
                    if let Some(path) = visit(dep.as_str(), deps, colors, stack) {
                        return Some(path);
                    }
                }
                // Black or undeclared: nothing to do. Undeclared
                // dependency targets are a validation error elsewhere.
                _ => {}
            }
        }
    }

    stack.pop();
    colors.insert(node, Color::Black);
    None
}

/// Groups stages into execution levels via Kahn's algorithm.
///
/// Stages within a level have no dependency on one another and may run
/// concurrently; levels execute strictly in order. Ties at every step
/// are broken by declaration order.
///
/// # Errors
///
/// Returns an internal error if stages remain unprocessed (a cycle);
/// callers are expected to run [`validate_acyclic`] first for a proper
/// cycle path.
pub fn execution_levels(workflow: &WorkflowDefinition) -> Result<Vec<Vec<String>>, EngineError> {
    let position: HashMap<&str, usize> = workflow
        .stages
        .iter()
        .enumerate()
        .map(|(i, s)| (s.name.as_str(), i))
        .collect();

    let mut in_degree: Vec<usize> = vec![0; workflow.stages.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); workflow.stages.len()];
    for (i, stage) in workflow.stages.iter().enumerate() {
        for dep in &stage.depends_on {
            if let Some(&d) = position.get(dep.as_str()) {
                in_degree[i] += 1;
                dependents[d].push(i);
            }
        }
    }

    let mut ready: Vec<usize> = (0..workflow.stages.len())
        .filter(|&i| in_degree[i] == 0)
        .collect();

    let mut levels = Vec::new();
    let mut processed = 0;
    while !ready.is_empty() {
        ready.sort_unstable();
        levels.push(
            ready
                .iter()
                .map(|&i| workflow.stages[i].name.clone())
                .collect(),
        );
        processed += ready.len();

        let mut next = Vec::new();
        for &i in &ready {
            for &dependent in &dependents[i] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    next.push(dependent);
                }
            }
        }
        ready = next;
    }

    if processed != workflow.stages.len() {
        return Err(EngineError::Internal(
            "stage graph contains a cycle".to_string(),
        ));
    }
    Ok(levels)
}

/// Flattens execution levels into a single topological order.
#[must_use]
pub fn flatten(levels: &[Vec<String>]) -> Vec<String> {
    levels.iter().flatten().cloned().collect()
}
