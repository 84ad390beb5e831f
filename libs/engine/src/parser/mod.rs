//! Workflow definition intake
//!
//! Definitions arrive as YAML documents or in-memory values; both paths run
//! through normalization and structural validation before the engine will
//! accept them.

pub mod validator;

pub use validator::{validate_workflow, ValidationError};

use thiserror::Error;

use conflux_domain::Workflow;

/// Errors parsing a workflow definition document
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yml::Error),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Parse a YAML workflow definition, normalize it, and validate it
pub fn parse_workflow(yaml: &str) -> Result<Workflow, ParseError> {
    let mut workflow: Workflow = serde_yml::from_str(yaml)?;
    normalize(&mut workflow);
    validate_workflow(&workflow)?;
    Ok(workflow)
}

/// Fill derivable fields: step order defaults to document position
pub fn normalize(workflow: &mut Workflow) {
    let needs_order = workflow.steps.iter().any(|s| s.order == 0);
    if needs_order {
        for (idx, step) in workflow.steps.iter_mut().enumerate() {
            step.order = idx as u32 + 1;
        }
    }
}
