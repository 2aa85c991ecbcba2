//! Core error type for the Troupe engine.
//!
//! `CoreError` is used throughout the domain (context store, executor,
//! feedback engine, storage, telemetry). Variants carry enough structure
//! for callers to decide retry/skip/abort at the step boundary, and
//! [`CoreError::recovery`] gives a short operator hint the CLI prints
//! under the error message.

use crate::schema::SchemaViolation;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// A context write was rejected by the schema attached to the write.
    #[error("Validation failed at '{path}': {}", summarize(.violations))]
    ContextValidation {
        path: String,
        violations: Vec<SchemaViolation>,
    },

    /// Step output failed the validation gate, after auto-fix if enabled.
    #[error("Gate '{schema}' rejected output of step {step}: {}", summarize(.violations))]
    GateRejected {
        step: u32,
        schema: String,
        violations: Vec<SchemaViolation>,
    },

    #[error("Render failed for artifact type '{artifact_type}': {reason}")]
    Render {
        artifact_type: String,
        reason: String,
    },

    #[error("No renderer registered for artifact type '{0}'")]
    UnknownRenderer(String),

    #[error("Cannot push to non-array value at '{0}'")]
    PushNonArray(String),

    #[error("Cannot merge into non-object value at '{0}'")]
    UpdateNonObject(String),

    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(String),

    #[error("Feedback loop not found: {0}")]
    LoopNotFound(String),

    #[error("Feedback loop {0} is already resolved")]
    LoopAlreadyResolved(String),

    #[error("Feedback trigger is missing required field '{0}'")]
    MissingTriggerField(&'static str),

    #[error("Step {step} blocked: dependencies {missing:?} have not completed")]
    DependencyUnmet { step: u32, missing: Vec<u32> },

    #[error("Agent '{agent}' failed on step {step} after {attempts} attempt(s): {reason}")]
    StepFailed {
        step: u32,
        agent: String,
        attempts: u32,
        reason: String,
    },

    #[error("Group '{group}' timed out after {timeout_secs}s")]
    GroupTimeout { group: String, timeout_secs: u64 },

    #[error("Timed out after {0}ms waiting for {1}")]
    Timeout(u64, String),

    #[error("Workflow paused: {0}")]
    Paused(String),

    #[error("Invalid workflow definition: {0}")]
    Definition(String),

    #[error("Unknown agent '{0}'")]
    UnknownAgent(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Telemetry error: {0}")]
    Telemetry(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// A one-line recovery suggestion for operators, or `None` when the
    /// message already says everything there is to say.
    pub fn recovery(&self) -> Option<&'static str> {
        match self {
            CoreError::ContextValidation { .. } => {
                Some("compare the written value against the schema named by the workflow step")
            }
            CoreError::GateRejected { .. } => {
                Some("inspect the gate record under gates/ for per-attempt errors")
            }
            CoreError::DependencyUnmet { .. } => {
                Some("reorder the sequence or mark the step `optional: true`")
            }
            CoreError::GroupTimeout { .. } => {
                Some("raise `synchronization.timeout` for the group or split slow agents out")
            }
            CoreError::Paused { .. } => {
                Some("resolve the blocking feedback loop, then resume the workflow")
            }
            CoreError::Definition(_) => Some("run `troupe lint` against the workflow file"),
            CoreError::UnknownAgent(_) => {
                Some("check the roster with `troupe agents list` or add an override definition")
            }
            CoreError::Storage(_) => Some("check that the storage root exists and is writable"),
            _ => None,
        }
    }
}

fn summarize(violations: &[SchemaViolation]) -> String {
    let mut parts: Vec<String> = violations.iter().take(3).map(|v| v.to_string()).collect();
    if violations.len() > 3 {
        parts.push(format!("… and {} more", violations.len() - 3));
    }
    parts.join("; ")
}
