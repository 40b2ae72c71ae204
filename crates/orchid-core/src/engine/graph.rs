//! Dependency graph resolution, cycle detection, and batch partitioning.
//!
//! Uses `petgraph` to model step dependencies as a directed graph. Kahn's
//! algorithm produces the execution order; keying its ready set by submission
//! index makes the order a stable extension of submission order, so steps
//! with no ordering constraint between them always run in the order they
//! were submitted. Depth-based grouping produces the batches consumed by
//! batch mode.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use orchid_types::error::OrchestrationError;
use orchid_types::workflow::Step;
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use petgraph::Direction;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Dependency graph failures. All of these describe the submitted
/// configuration, so they surface as validation errors.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// The submission contained no steps.
    #[error("workflow submission contains no steps")]
    EmptySubmission,

    /// Two steps in the submission share an id.
    #[error("duplicate step id '{0}'")]
    DuplicateStepId(String),

    /// A step references a dependency that is not in the submission.
    #[error("unknown dependency: {0}")]
    UnknownDependency(String),

    /// The dependency graph contains a cycle.
    #[error("cycle detected involving {0}")]
    CycleDetected(String),
}

impl From<GraphError> for OrchestrationError {
    fn from(err: GraphError) -> Self {
        OrchestrationError::Validation(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Execution order (stable topological sort)
// ---------------------------------------------------------------------------

/// Resolve the order steps execute in.
///
/// Validates unique ids and known `depends_on` references, then runs Kahn's
/// algorithm with the ready set keyed by submission index. The result is a
/// topological order that preserves submission order among steps with no
/// constraint between them, so resolution is deterministic for a given
/// submission.
pub fn resolve_execution_order(steps: &[Step]) -> Result<Vec<String>, GraphError> {
    let order = stable_topo_indices(steps)?;
    Ok(order.into_iter().map(|i| steps[i].step_id.clone()).collect())
}

/// Kahn's algorithm over the submission, returning submission indices in
/// execution order.
fn stable_topo_indices(steps: &[Step]) -> Result<Vec<usize>, GraphError> {
    if steps.is_empty() {
        return Err(GraphError::EmptySubmission);
    }

    let id_to_idx = unique_index_map(steps)?;

    // Build directed graph: edge from dependency -> dependent. Nodes are
    // added in submission order, so NodeIndex::index() is the submission
    // index.
    let mut graph = DiGraph::<usize, ()>::new();
    let node_indices: Vec<_> = (0..steps.len()).map(|i| graph.add_node(i)).collect();

    for (i, step) in steps.iter().enumerate() {
        for dep in &step.depends_on {
            let from = *id_to_idx.get(dep.as_str()).ok_or_else(|| {
                GraphError::UnknownDependency(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.step_id, dep
                ))
            })?;
            graph.add_edge(node_indices[from], node_indices[i], ());
        }
    }

    let mut in_degree: Vec<usize> = node_indices
        .iter()
        .map(|&n| graph.neighbors_directed(n, Direction::Incoming).count())
        .collect();

    // Min-heap on submission index keeps the tie-break stable.
    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|&(_, &d)| d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::with_capacity(steps.len());
    while let Some(Reverse(i)) = ready.pop() {
        order.push(i);
        for neighbor in graph.neighbors(node_indices[i]) {
            let j = neighbor.index();
            in_degree[j] -= 1;
            if in_degree[j] == 0 {
                ready.push(Reverse(j));
            }
        }
    }

    // Any node never emitted is on (or downstream of) a cycle.
    if order.len() != steps.len() {
        let emitted: HashSet<usize> = order.iter().copied().collect();
        let stuck: Vec<String> = (0..steps.len())
            .filter(|i| !emitted.contains(i))
            .map(|i| format!("'{}'", steps[i].step_id))
            .collect();
        return Err(GraphError::CycleDetected(format!(
            "steps {}",
            stuck.join(", ")
        )));
    }

    Ok(order)
}

fn unique_index_map(steps: &[Step]) -> Result<HashMap<&str, usize>, GraphError> {
    let mut id_to_idx = HashMap::with_capacity(steps.len());
    for (i, step) in steps.iter().enumerate() {
        if id_to_idx.insert(step.step_id.as_str(), i).is_some() {
            return Err(GraphError::DuplicateStepId(step.step_id.clone()));
        }
    }
    Ok(id_to_idx)
}

// ---------------------------------------------------------------------------
// Batch partitioning (depth-based grouping)
// ---------------------------------------------------------------------------

/// Partition steps into dependency-respecting batches.
///
/// Each batch contains step ids whose dependencies are all satisfied by
/// prior batches: a step's depth is its longest dependency path to a root,
/// and batch `k` holds the depth-`k` steps in submission order. Batch 0 is
/// the first to execute.
pub fn partition_batches(steps: &[Step]) -> Result<Vec<Vec<String>>, GraphError> {
    if steps.is_empty() {
        return Ok(vec![]);
    }

    let order = stable_topo_indices(steps)?;
    let id_to_idx = unique_index_map(steps)?;

    // Depths in topological order: max dependency depth + 1, roots at 0.
    let mut depths = vec![0usize; steps.len()];
    for &i in &order {
        depths[i] = steps[i]
            .depends_on
            .iter()
            .filter_map(|dep| id_to_idx.get(dep.as_str()))
            .map(|&d| depths[d] + 1)
            .max()
            .unwrap_or(0);
    }

    let max_depth = depths.iter().copied().max().unwrap_or(0);
    let mut batches: Vec<Vec<String>> = vec![vec![]; max_depth + 1];
    for (i, step) in steps.iter().enumerate() {
        batches[depths[i]].push(step.step_id.clone());
    }

    Ok(batches)
}

// ---------------------------------------------------------------------------
// Transitive dependents
// ---------------------------------------------------------------------------

/// Every step that depends on `step_id`, directly or transitively.
///
/// Used to prune the downstream path of a failed step: its transitive
/// dependents are skipped rather than scheduled. Unknown ids yield an
/// empty set.
pub fn transitive_dependents(step_id: &str, steps: &[Step]) -> HashSet<String> {
    let mut dependents_of: HashMap<&str, Vec<&str>> = HashMap::new();
    for step in steps {
        for dep in &step.depends_on {
            dependents_of
                .entry(dep.as_str())
                .or_default()
                .push(step.step_id.as_str());
        }
    }

    let mut visited = HashSet::new();
    let mut stack = vec![step_id];
    while let Some(current) = stack.pop() {
        if let Some(children) = dependents_of.get(current) {
            for &child in children {
                if visited.insert(child.to_string()) {
                    stack.push(child);
                }
            }
        }
    }
    visited
}

// ---------------------------------------------------------------------------
// Generic cycle check
// ---------------------------------------------------------------------------

/// Verify a set of `(id, dependencies)` pairs is acyclic.
///
/// References to ids outside the set are ignored (they cannot close a
/// cycle). Shared by step validation and thunk dependency validation.
pub fn ensure_acyclic<N>(nodes: &[(N, Vec<N>)]) -> Result<(), GraphError>
where
    N: std::hash::Hash + Eq + std::fmt::Display,
{
    let id_to_idx: HashMap<&N, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, (id, _))| (id, i))
        .collect();

    let mut graph = DiGraph::<usize, ()>::new();
    let node_indices: Vec<_> = (0..nodes.len()).map(|i| graph.add_node(i)).collect();

    for (i, (_, deps)) in nodes.iter().enumerate() {
        for dep in deps {
            if let Some(&from) = id_to_idx.get(dep) {
                graph.add_edge(node_indices[from], node_indices[i], ());
            }
        }
    }

    toposort(&graph, None).map_err(|cycle| {
        let idx = graph[cycle.node_id()];
        GraphError::CycleDetected(format!("'{}'", nodes[idx].0))
    })?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Submission validation (collects all problems)
// ---------------------------------------------------------------------------

/// Validate a submission without executing it, collecting every problem
/// found as a human-readable string. An empty vec means the submission is
/// executable.
pub fn validate_steps(steps: &[Step]) -> Vec<String> {
    let mut problems = Vec::new();

    if steps.is_empty() {
        problems.push("workflow submission contains no steps".to_string());
        return problems;
    }

    let mut seen: HashSet<&str> = HashSet::new();
    let mut duplicates: Vec<&str> = Vec::new();
    for step in steps {
        if !seen.insert(step.step_id.as_str()) && !duplicates.contains(&step.step_id.as_str()) {
            duplicates.push(step.step_id.as_str());
        }
    }
    for id in duplicates {
        problems.push(format!("duplicate step id '{id}'"));
    }

    for step in steps {
        for dep in &step.depends_on {
            if !seen.contains(dep.as_str()) {
                problems.push(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.step_id, dep
                ));
            }
        }
    }

    let nodes: Vec<(&str, Vec<&str>)> = steps
        .iter()
        .map(|s| {
            (
                s.step_id.as_str(),
                s.depends_on.iter().map(String::as_str).collect(),
            )
        })
        .collect();
    if let Err(err) = ensure_acyclic(&nodes) {
        problems.push(err.to_string());
    }

    problems
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use orchid_types::workflow::StepType;
    use serde_json::json;

    /// Helper: build a compute step with given ID and dependencies.
    fn compute_step(id: &str, depends_on: Vec<&str>) -> Step {
        Step {
            step_id: id.to_string(),
            step_name: id.to_string(),
            step_type: StepType::Compute,
            depends_on: depends_on.into_iter().map(String::from).collect(),
            enabled: true,
            timeout_ms: None,
            condition: None,
            payload: json!(null),
        }
    }

    // -----------------------------------------------------------------------
    // Execution order
    // -----------------------------------------------------------------------

    #[test]
    fn test_independent_steps_keep_submission_order() {
        let steps = vec![
            compute_step("c", vec![]),
            compute_step("a", vec![]),
            compute_step("b", vec![]),
        ];
        let order = resolve_execution_order(&steps).unwrap();
        assert_eq!(order, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_linear_chain_order() {
        // a -> b -> c
        let steps = vec![
            compute_step("a", vec![]),
            compute_step("b", vec!["a"]),
            compute_step("c", vec!["b"]),
        ];
        let order = resolve_execution_order(&steps).unwrap();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_diamond_order_is_stable() {
        // a -> {b, c} -> d; b submitted before c, so b resolves before c.
        let steps = vec![
            compute_step("a", vec![]),
            compute_step("b", vec!["a"]),
            compute_step("c", vec!["a"]),
            compute_step("d", vec!["b", "c"]),
        ];
        let order = resolve_execution_order(&steps).unwrap();
        assert_eq!(order, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_dependency_resolves_before_dependent_despite_submission() {
        // "late" is submitted first but depends on "early".
        let steps = vec![
            compute_step("late", vec!["early"]),
            compute_step("early", vec![]),
        ];
        let order = resolve_execution_order(&steps).unwrap();
        assert_eq!(order, vec!["early", "late"]);
    }

    #[test]
    fn test_cycle_error_names_involved_steps() {
        // a -> b -> a
        let steps = vec![compute_step("a", vec!["b"]), compute_step("b", vec!["a"])];
        let err = resolve_execution_order(&steps).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("cycle"), "got: {msg}");
        assert!(msg.contains("'a'") && msg.contains("'b'"), "got: {msg}");
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let steps = vec![compute_step("a", vec!["a"])];
        let err = resolve_execution_order(&steps).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_unknown_dependency_error() {
        let steps = vec![compute_step("a", vec!["missing"])];
        let err = resolve_execution_order(&steps).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("unknown"), "got: {msg}");
        assert!(msg.contains("'a'") && msg.contains("'missing'"), "got: {msg}");
    }

    #[test]
    fn test_duplicate_step_id_error() {
        let steps = vec![compute_step("a", vec![]), compute_step("a", vec![])];
        let err = resolve_execution_order(&steps).unwrap_err();
        assert!(err.to_string().contains("duplicate step id 'a'"));
    }

    #[test]
    fn test_empty_submission_error() {
        let err = resolve_execution_order(&[]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("step"), "got: {msg}");
    }

    #[test]
    fn test_graph_error_converts_to_validation() {
        let err: OrchestrationError = GraphError::EmptySubmission.into();
        assert!(err.is_validation());
    }

    // -----------------------------------------------------------------------
    // Batch partitioning
    // -----------------------------------------------------------------------

    #[test]
    fn test_no_dependencies_single_batch() {
        let steps = vec![
            compute_step("a", vec![]),
            compute_step("b", vec![]),
            compute_step("c", vec![]),
        ];
        let batches = partition_batches(&steps).unwrap();
        assert_eq!(batches.len(), 1, "all independent steps -> single batch");
        assert_eq!(batches[0], vec!["a", "b", "c"]);
    }

    #[test]
    fn test_linear_chain_n_batches() {
        let steps = vec![
            compute_step("a", vec![]),
            compute_step("b", vec!["a"]),
            compute_step("c", vec!["b"]),
        ];
        let batches = partition_batches(&steps).unwrap();
        assert_eq!(batches.len(), 3, "linear chain -> 3 batches");
        assert_eq!(batches[0], vec!["a"]);
        assert_eq!(batches[1], vec!["b"]);
        assert_eq!(batches[2], vec!["c"]);
    }

    #[test]
    fn test_diamond_three_batches() {
        let steps = vec![
            compute_step("a", vec![]),
            compute_step("b", vec!["a"]),
            compute_step("c", vec!["a"]),
            compute_step("d", vec!["b", "c"]),
        ];
        let batches = partition_batches(&steps).unwrap();
        assert_eq!(batches.len(), 3, "diamond -> 3 batches");
        assert_eq!(batches[0], vec!["a"]);
        assert_eq!(batches[1], vec!["b", "c"], "b and c share a batch");
        assert_eq!(batches[2], vec!["d"]);
    }

    #[test]
    fn test_complex_fork_join_batches() {
        //     a
        //    / \
        //   b   c
        //   |   |
        //   d   e
        //    \ /
        //     f
        let steps = vec![
            compute_step("a", vec![]),
            compute_step("b", vec!["a"]),
            compute_step("c", vec!["a"]),
            compute_step("d", vec!["b"]),
            compute_step("e", vec!["c"]),
            compute_step("f", vec!["d", "e"]),
        ];
        let batches = partition_batches(&steps).unwrap();
        assert_eq!(batches.len(), 4);
        assert_eq!(batches[0], vec!["a"]);
        assert_eq!(batches[1], vec!["b", "c"]);
        assert_eq!(batches[2], vec!["d", "e"]);
        assert_eq!(batches[3], vec!["f"]);
    }

    #[test]
    fn test_partition_empty_steps() {
        let batches = partition_batches(&[]).unwrap();
        assert!(batches.is_empty());
    }

    // -----------------------------------------------------------------------
    // Transitive dependents
    // -----------------------------------------------------------------------

    #[test]
    fn test_transitive_dependents_chain() {
        // a -> b -> c -> d
        let steps = vec![
            compute_step("a", vec![]),
            compute_step("b", vec!["a"]),
            compute_step("c", vec!["b"]),
            compute_step("d", vec!["c"]),
        ];
        let mut dependents: Vec<String> =
            transitive_dependents("a", &steps).into_iter().collect();
        dependents.sort();
        assert_eq!(dependents, vec!["b", "c", "d"]);
    }

    #[test]
    fn test_transitive_dependents_fork() {
        let steps = vec![
            compute_step("a", vec![]),
            compute_step("b", vec!["a"]),
            compute_step("c", vec!["a"]),
            compute_step("d", vec!["b"]),
        ];
        let dependents = transitive_dependents("b", &steps);
        assert!(dependents.contains("d"));
        assert!(!dependents.contains("c"), "c is a sibling, not a dependent");
    }

    #[test]
    fn test_transitive_dependents_leaf_is_empty() {
        let steps = vec![compute_step("a", vec![]), compute_step("b", vec!["a"])];
        assert!(transitive_dependents("b", &steps).is_empty());
    }

    #[test]
    fn test_transitive_dependents_unknown_step() {
        let steps = vec![compute_step("a", vec![])];
        assert!(transitive_dependents("nonexistent", &steps).is_empty());
    }

    // -----------------------------------------------------------------------
    // Generic cycle check
    // -----------------------------------------------------------------------

    #[test]
    fn test_ensure_acyclic_ok() {
        let nodes = vec![
            ("a", vec![]),
            ("b", vec!["a"]),
            ("c", vec!["a", "b"]),
        ];
        assert!(ensure_acyclic(&nodes).is_ok());
    }

    #[test]
    fn test_ensure_acyclic_detects_cycle() {
        let nodes = vec![("a", vec!["c"]), ("b", vec!["a"]), ("c", vec!["b"])];
        let err = ensure_acyclic(&nodes).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_ensure_acyclic_ignores_external_references() {
        // "other" is not in the node set; it cannot close a cycle.
        let nodes = vec![("a", vec!["other"]), ("b", vec!["a"])];
        assert!(ensure_acyclic(&nodes).is_ok());
    }

    // -----------------------------------------------------------------------
    // Submission validation
    // -----------------------------------------------------------------------

    #[test]
    fn test_validate_steps_clean_submission() {
        let steps = vec![compute_step("a", vec![]), compute_step("b", vec!["a"])];
        assert!(validate_steps(&steps).is_empty());
    }

    #[test]
    fn test_validate_steps_empty_submission() {
        let problems = validate_steps(&[]);
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("no steps"));
    }

    #[test]
    fn test_validate_steps_collects_multiple_problems() {
        let steps = vec![
            compute_step("a", vec![]),
            compute_step("a", vec![]),
            compute_step("b", vec!["missing"]),
        ];
        let problems = validate_steps(&steps);
        assert_eq!(problems.len(), 2, "got: {problems:?}");
        assert!(problems.iter().any(|p| p.contains("duplicate step id 'a'")));
        assert!(problems
            .iter()
            .any(|p| p.contains("'b'") && p.contains("'missing'")));
    }

    #[test]
    fn test_validate_steps_reports_cycle() {
        let steps = vec![compute_step("a", vec!["b"]), compute_step("b", vec!["a"])];
        let problems = validate_steps(&steps);
        assert!(problems.iter().any(|p| p.contains("cycle")), "got: {problems:?}");
    }
}
