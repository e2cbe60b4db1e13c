//! Workflow Validation
//!
//! Structural checks applied when a workflow is loaded and before any
//! update is persisted:
//! - Step field validation per action kind
//! - Unique, non-empty step identifiers
//! - Variable references resolve to something the run can bind

use std::collections::{BTreeSet, HashSet};

use log::{debug, info};

use super::model::{Action, Step, Workflow};
use super::render::step_variables;

/// Validation error types for user-friendly error messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    EmptyWorkflow,
    EmptyName,
    DuplicateStepId(String),
    EmptyStepId,
    MissingLocator { step: String, action: String },
    MissingField { step: String, field: String },
    ZeroTimeout(String),
    UnknownVariable { step: String, variable: String },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyWorkflow => write!(f, "Workflow has no steps"),
            Self::EmptyName => write!(f, "Workflow has no name"),
            Self::DuplicateStepId(id) => write!(f, "Duplicate step ID: '{}'", id),
            Self::EmptyStepId => write!(f, "Step has empty or whitespace-only ID"),
            Self::MissingLocator { step, action } => {
                write!(f, "Step '{}': {} requires a selector or xpath", step, action)
            }
            Self::MissingField { step, field } => {
                write!(f, "Step '{}' has no {} specified", step, field)
            }
            Self::ZeroTimeout(step) => write!(f, "Step '{}' has a zero timeout", step),
            Self::UnknownVariable { step, variable } => {
                write!(f, "Step '{}' references unknown variable '{}'", step, variable)
            }
        }
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}

/// Validates a single step's fields.
pub fn validate_step(step: &Step) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if step.id.trim().is_empty() {
        errors.push(ValidationError::EmptyStepId);
        return errors; // Can't validate further without ID
    }

    let missing = |field: &str| ValidationError::MissingField {
        step: step.id.clone(),
        field: field.to_string(),
    };

    if step.action.requires_locator() && step.locator().is_none() {
        errors.push(ValidationError::MissingLocator {
            step: step.id.clone(),
            action: step.kind().to_string(),
        });
    }

    match &step.action {
        Action::Navigate { url } if url.trim().is_empty() => errors.push(missing("url")),
        Action::PressKey { key } if key.trim().is_empty() => errors.push(missing("key")),
        Action::Fill if step.value.is_none() => errors.push(missing("value")),
        Action::Select if is_blank(&step.value) => errors.push(missing("value")),
        Action::Custom if is_blank(&step.value) => {
            // Decoded at run time; an empty payload degrades to a no-op.
            debug!("Custom step '{}' has an empty payload", step.id);
        }
        _ => {}
    }

    if step.timeout_ms == Some(0) {
        errors.push(ValidationError::ZeroTimeout(step.id.clone()));
    }

    errors
}

/// Names a run can bind besides declared variables: outputs of the
/// workflow's extract steps.
pub fn extracted_outputs(steps: &[Step]) -> BTreeSet<String> {
    steps
        .iter()
        .filter_map(|step| match &step.action {
            Action::Extract { output } => Some(
                output
                    .clone()
                    .unwrap_or_else(|| format!("extracted_{}", step.id)),
            ),
            _ => None,
        })
        .collect()
}

/// Checks that every `${name}` in `steps` resolves to a declared variable,
/// an extract output of `workflow`, or a name in `also_known`.
pub fn check_variable_references(
    workflow: &Workflow,
    steps: &[Step],
    also_known: &BTreeSet<String>,
) -> Vec<ValidationError> {
    let outputs = extracted_outputs(&workflow.steps);
    let mut errors = Vec::new();

    for step in steps {
        for variable in step_variables(step) {
            let known = workflow.variables.contains_key(&variable)
                || outputs.contains(&variable)
                || also_known.contains(&variable);
            if !known {
                errors.push(ValidationError::UnknownVariable {
                    step: step.id.clone(),
                    variable,
                });
            }
        }
    }

    errors
}

/// Validates the entire workflow structure.
///
/// Performs the following checks:
/// 1. Workflow has a name and at least one step
/// 2. No duplicate step IDs
/// 3. All steps have the fields their action needs
pub fn validate_workflow(workflow: &Workflow) -> Result<(), String> {
    debug!("Validating workflow '{}' with {} steps", workflow.name, workflow.steps.len());

    let errors = collect_errors(workflow);
    if !errors.is_empty() {
        let error_messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        return Err(error_messages.join("\n"));
    }

    info!("Workflow '{}' validated: {} steps", workflow.name, workflow.steps.len());
    Ok(())
}

/// Returns every structural problem found in the workflow.
pub fn collect_errors(workflow: &Workflow) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if workflow.name.trim().is_empty() {
        errors.push(ValidationError::EmptyName);
    }

    if workflow.steps.is_empty() {
        errors.push(ValidationError::EmptyWorkflow);
        return errors;
    }

    let mut seen_ids: HashSet<&str> = HashSet::new();
    for step in &workflow.steps {
        if !step.id.trim().is_empty() && !seen_ids.insert(step.id.as_str()) {
            errors.push(ValidationError::DuplicateStepId(step.id.clone()));
        }
        errors.extend(validate_step(step));
    }

    errors
}
