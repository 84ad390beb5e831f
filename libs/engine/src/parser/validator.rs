//! Workflow structural validation
//!
//! Validates definitions for structural correctness: dense step ordering,
//! unique ids, resolvable routing references (with typo suggestions),
//! acyclic forward routing, reachability, and per-type settings.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use petgraph::algo;
use petgraph::graph::DiGraph;
use thiserror::Error;

use conflux_domain::{StepType, Value, Workflow};

use crate::executor::parallel::{ParallelDefaults, ParallelStepConfig};

/// Edit distance beyond which a step id is not offered as a suggestion
const MAX_SUGGESTION_DISTANCE: usize = 3;

// =============================================================================
// Errors
// =============================================================================

/// A definition rejected by structural validation
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("workflow has no steps")]
    NoSteps,

    #[error("steps[{index}] has an empty id")]
    EmptyStepId { index: usize },

    #[error("duplicate step id '{step_id}'")]
    DuplicateStepId { step_id: String },

    #[error("step '{step_id}' has order {found} but its position implies {expected}; order must be 1..N dense")]
    SparseOrder {
        step_id: String,
        found: u32,
        expected: u32,
    },

    #[error("step '{step_id}' of type {step_type:?} requires an executor_key")]
    MissingExecutorKey {
        step_id: String,
        step_type: StepType,
    },

    #[error("step '{step_id}' {field} points at unknown step '{target}'")]
    UnknownReference {
        step_id: String,
        field: &'static str,
        target: String,
        /// Closest declared step id, when one is plausibly meant
        suggestion: Option<String>,
    },

    #[error("forward routing cycles through: {}", .path.join(" -> "))]
    RoutingCycle { path: Vec<String> },

    #[error("step '{step_id}' is not reachable from entry step '{entry}'")]
    Unreachable { step_id: String, entry: String },

    #[error("step '{step_id}' timeout must be greater than 0")]
    ZeroTimeout { step_id: String },

    #[error("user task step '{step_id}' names no assignee, candidate users, or candidate groups")]
    NoTaskAudience { step_id: String },

    #[error("condition step '{step_id}' names no predicate")]
    MissingPredicate { step_id: String },

    #[error("parallel step '{step_id}': {reason}")]
    BadParallelConfig { step_id: String, reason: String },
}

impl ValidationError {
    /// Did-you-mean hint, where the check produced one
    #[must_use]
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::UnknownReference { suggestion, .. } => suggestion.as_deref(),
            _ => None,
        }
    }
}

// =============================================================================
// Validation Entry Point
// =============================================================================

/// Validate an entire workflow definition, returning the first error found
pub fn validate_workflow(workflow: &Workflow) -> Result<(), ValidationError> {
    validate_step_identity(workflow)?;
    validate_executor_keys(workflow)?;
    validate_routing_references(workflow)?;
    validate_forward_routing_acyclic(workflow)?;
    validate_reachability(workflow)?;
    validate_bounds(workflow)?;
    validate_step_settings(workflow)?;
    Ok(())
}

/// Steps exist, ids are unique, and order values are 1..N dense
fn validate_step_identity(workflow: &Workflow) -> Result<(), ValidationError> {
    if workflow.steps.is_empty() {
        return Err(ValidationError::NoSteps);
    }

    let mut seen_ids = HashSet::new();
    for (index, step) in workflow.steps.iter().enumerate() {
        if step.id.is_empty() {
            return Err(ValidationError::EmptyStepId { index });
        }
        if !seen_ids.insert(step.id.as_str()) {
            return Err(ValidationError::DuplicateStepId {
                step_id: step.id.clone(),
            });
        }
        let expected = index as u32 + 1;
        if step.order != expected {
            return Err(ValidationError::SparseOrder {
                step_id: step.id.clone(),
                found: step.order,
                expected,
            });
        }
    }
    Ok(())
}

/// Executor key is required exactly when the step type demands execution
fn validate_executor_keys(workflow: &Workflow) -> Result<(), ValidationError> {
    for step in &workflow.steps {
        if step.step_type.demands_execution() && step.executor_key.is_none() {
            return Err(ValidationError::MissingExecutorKey {
                step_id: step.id.clone(),
                step_type: step.step_type,
            });
        }
    }
    Ok(())
}

/// All routing references resolve to declared steps
fn validate_routing_references(workflow: &Workflow) -> Result<(), ValidationError> {
    let step_ids: HashSet<&str> = workflow.steps.iter().map(|s| s.id.as_str()).collect();

    for step in &workflow.steps {
        for (field, target) in [
            ("next_step_id", &step.next_step_id),
            ("error_step_id", &step.error_step_id),
        ] {
            let Some(target) = target else { continue };
            if !step_ids.contains(target.as_str()) {
                return Err(ValidationError::UnknownReference {
                    step_id: step.id.clone(),
                    field,
                    target: target.clone(),
                    suggestion: closest_step(target, step_ids.iter().copied())
                        .map(str::to_string),
                });
            }
        }
    }
    Ok(())
}

/// The declared step id closest to `target` within the suggestion radius
fn closest_step<'a>(target: &str, step_ids: impl Iterator<Item = &'a str>) -> Option<&'a str> {
    step_ids
        .map(|id| (strsim::levenshtein(target, id), id))
        .filter(|(distance, _)| *distance <= MAX_SUGGESTION_DISTANCE)
        .min_by_key(|(distance, _)| *distance)
        .map(|(_, id)| id)
}

fn forward_graph(
    workflow: &Workflow,
) -> (DiGraph<&str, ()>, HashMap<&str, petgraph::graph::NodeIndex>) {
    let mut graph = DiGraph::new();
    let mut nodes = HashMap::new();

    for step in &workflow.steps {
        let idx = graph.add_node(step.id.as_str());
        nodes.insert(step.id.as_str(), idx);
    }
    for step in &workflow.steps {
        if let Some(next) = &step.next_step_id {
            if let (Some(&from), Some(&to)) =
                (nodes.get(step.id.as_str()), nodes.get(next.as_str()))
            {
                graph.add_edge(from, to, ());
            }
        }
    }
    (graph, nodes)
}

/// Forward routing (`next_step_id` edges) must not cycle; error routing may
/// legitimately point backwards and is excluded.
fn validate_forward_routing_acyclic(workflow: &Workflow) -> Result<(), ValidationError> {
    let (graph, _) = forward_graph(workflow);
    if algo::is_cyclic_directed(&graph) {
        let path = algo::kosaraju_scc(&graph)
            .into_iter()
            .find(|scc| scc.len() > 1)
            .map(|scc| scc.iter().map(|&idx| graph[idx].to_string()).collect())
            .unwrap_or_default();
        return Err(ValidationError::RoutingCycle { path });
    }
    Ok(())
}

/// Every step is reachable from the entry step.
///
/// Condition steps route dynamically through predicate output, so workflows
/// containing one cannot be checked statically and are accepted as-is.
fn validate_reachability(workflow: &Workflow) -> Result<(), ValidationError> {
    let has_dynamic_routing = workflow
        .steps
        .iter()
        .any(|s| s.step_type == StepType::Condition);
    if has_dynamic_routing {
        return Ok(());
    }

    let Some(entry) = workflow.entry_step() else {
        return Err(ValidationError::NoSteps);
    };

    // Error routing counts for reachability even though it is excluded from
    // the cycle check.
    let (mut graph, nodes) = forward_graph(workflow);
    for step in &workflow.steps {
        if let Some(error_step) = &step.error_step_id {
            if let (Some(&from), Some(&to)) =
                (nodes.get(step.id.as_str()), nodes.get(error_step.as_str()))
            {
                graph.add_edge(from, to, ());
            }
        }
    }

    let Some(&entry_idx) = nodes.get(entry.id.as_str()) else {
        return Err(ValidationError::NoSteps);
    };

    let mut reachable = HashSet::new();
    let mut dfs = petgraph::visit::Dfs::new(&graph, entry_idx);
    while let Some(node) = dfs.next(&graph) {
        reachable.insert(graph[node]);
    }

    for step in &workflow.steps {
        if !reachable.contains(step.id.as_str()) {
            return Err(ValidationError::Unreachable {
                step_id: step.id.clone(),
                entry: entry.id.clone(),
            });
        }
    }
    Ok(())
}

/// Timeouts must be positive when present
fn validate_bounds(workflow: &Workflow) -> Result<(), ValidationError> {
    for step in &workflow.steps {
        if step.timeout_seconds == Some(0) {
            return Err(ValidationError::ZeroTimeout {
                step_id: step.id.clone(),
            });
        }
    }
    Ok(())
}

/// Per-type settings checks mirroring the executors' own validation
fn validate_step_settings(workflow: &Workflow) -> Result<(), ValidationError> {
    for step in &workflow.steps {
        match step.step_type {
            StepType::UserTask => {
                let has_assignee = step.config_str("assignee").is_some();
                let has_candidates = step
                    .config
                    .get("candidate_users")
                    .and_then(Value::as_list)
                    .is_some_and(|l| !l.is_empty());
                let has_groups = step
                    .config
                    .get("candidate_groups")
                    .and_then(Value::as_list)
                    .is_some_and(|l| !l.is_empty());
                if !has_assignee && !has_candidates && !has_groups {
                    return Err(ValidationError::NoTaskAudience {
                        step_id: step.id.clone(),
                    });
                }
            }
            StepType::Condition => {
                if step.config_str("predicate").is_none() {
                    return Err(ValidationError::MissingPredicate {
                        step_id: step.id.clone(),
                    });
                }
            }
            StepType::ParallelGateway => {
                let defaults = ParallelDefaults {
                    step_timeout: Duration::from_millis(30_000),
                    branch_timeout: Duration::from_millis(10_000),
                };
                if let Err(err) = ParallelStepConfig::decode(step, defaults) {
                    return Err(ValidationError::BadParallelConfig {
                        step_id: step.id.clone(),
                        reason: err.message,
                    });
                }
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use conflux_domain::{Step, ValueMap, WorkflowId, WorkflowStatus};

    fn step(id: &str, order: u32, step_type: StepType) -> Step {
        Step {
            id: id.to_string(),
            name: id.to_uppercase(),
            description: String::new(),
            order,
            step_type,
            executor_key: step_type.demands_execution().then(|| "task".to_string()),
            config: ValueMap::new(),
            precondition: None,
            next_step_id: None,
            error_step_id: None,
            optional: false,
            timeout_seconds: None,
            retry_count: 0,
            rollbackable: false,
            async_step: false,
        }
    }

    fn workflow(steps: Vec<Step>) -> Workflow {
        Workflow {
            id: WorkflowId::new(),
            name: "test".to_string(),
            version: "1.0".to_string(),
            description: String::new(),
            status: WorkflowStatus::Draft,
            steps,
            config: ValueMap::new(),
        }
    }

    #[test]
    fn test_valid_linear_workflow() {
        let mut s1 = step("a", 1, StepType::Task);
        s1.next_step_id = Some("b".to_string());
        let wf = workflow(vec![s1, step("b", 2, StepType::End)]);
        assert!(validate_workflow(&wf).is_ok());
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let wf = workflow(vec![step("a", 1, StepType::Task), step("a", 2, StepType::End)]);
        assert!(matches!(
            validate_workflow(&wf),
            Err(ValidationError::DuplicateStepId { step_id }) if step_id == "a"
        ));
    }

    #[test]
    fn test_sparse_order_rejected() {
        let wf = workflow(vec![step("a", 1, StepType::Task), step("b", 3, StepType::End)]);
        assert!(matches!(
            validate_workflow(&wf),
            Err(ValidationError::SparseOrder {
                found: 3,
                expected: 2,
                ..
            })
        ));
    }

    #[test]
    fn test_missing_executor_key_rejected() {
        let mut s = step("a", 1, StepType::Script);
        s.executor_key = None;
        assert!(matches!(
            validate_workflow(&workflow(vec![s])),
            Err(ValidationError::MissingExecutorKey {
                step_type: StepType::Script,
                ..
            })
        ));
    }

    #[test]
    fn test_typo_suggestion() {
        let mut s1 = step("annotate", 1, StepType::Task);
        s1.next_step_id = Some("reviwe".to_string());
        let wf = workflow(vec![s1, step("review", 2, StepType::End)]);

        let err = validate_workflow(&wf).unwrap_err();
        assert_eq!(err.suggestion(), Some("review"));
    }

    #[test]
    fn test_unknown_reference_without_lookalike() {
        let mut s1 = step("a", 1, StepType::Task);
        s1.error_step_id = Some("completely-unrelated".to_string());
        let wf = workflow(vec![s1]);

        let err = validate_workflow(&wf).unwrap_err();
        assert!(matches!(
            &err,
            ValidationError::UnknownReference {
                field: "error_step_id",
                ..
            }
        ));
        assert_eq!(err.suggestion(), None);
    }

    #[test]
    fn test_forward_cycle_rejected() {
        let mut a = step("a", 1, StepType::Task);
        a.next_step_id = Some("b".to_string());
        let mut b = step("b", 2, StepType::Task);
        b.next_step_id = Some("a".to_string());

        let err = validate_workflow(&workflow(vec![a, b])).unwrap_err();
        assert!(matches!(
            &err,
            ValidationError::RoutingCycle { path } if path.len() == 2
        ));
    }

    #[test]
    fn test_backward_error_route_allowed() {
        let mut a = step("a", 1, StepType::Task);
        a.next_step_id = Some("b".to_string());
        let mut b = step("b", 2, StepType::Task);
        b.error_step_id = Some("a".to_string());

        assert!(validate_workflow(&workflow(vec![a, b])).is_ok());
    }

    #[test]
    fn test_unreachable_step_rejected() {
        let a = step("a", 1, StepType::Task);
        let orphan = step("orphan", 2, StepType::Task);
        assert!(matches!(
            validate_workflow(&workflow(vec![a, orphan])),
            Err(ValidationError::Unreachable { step_id, .. }) if step_id == "orphan"
        ));
    }

    #[test]
    fn test_condition_disables_reachability_check() {
        let mut route = step("route", 1, StepType::Condition);
        route
            .config
            .insert("predicate".to_string(), Value::from("pick"));
        // 'target' is only reachable through the predicate's dynamic output
        let wf = workflow(vec![route, step("target", 2, StepType::End)]);
        assert!(validate_workflow(&wf).is_ok());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut s = step("a", 1, StepType::Task);
        s.timeout_seconds = Some(0);
        assert!(matches!(
            validate_workflow(&workflow(vec![s])),
            Err(ValidationError::ZeroTimeout { .. })
        ));
    }

    #[test]
    fn test_user_task_needs_audience() {
        let s = step("approve", 1, StepType::UserTask);
        assert!(matches!(
            validate_workflow(&workflow(vec![s])),
            Err(ValidationError::NoTaskAudience { .. })
        ));
    }

    #[test]
    fn test_closest_step_radius() {
        let ids = ["annotate", "review", "finish"];
        assert_eq!(closest_step("reviwe", ids.iter().copied()), Some("review"));
        assert_eq!(closest_step("zzzzzzzz", ids.iter().copied()), None);
    }
}
