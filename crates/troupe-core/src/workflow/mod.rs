//! Workflow engine — YAML-driven multi-step agent orchestration.
//!
//! Defines delivery workflows in YAML (sequential or parallel-grouped),
//! then executes them against the agent roster, with a step pipeline
//! handling validation, rendering, and context updates per step.
//!
//! # Architecture
//!
//! ```text
//! workflow.yaml ──► WorkflowDefinition ──► WorkflowExecutor
//!                                              │
//!                        AgentRunner ◄────────┤  (per step)
//!                                              │
//!                                        StepPipeline
//!                                    validate ► render ► context ► trace
//! ```

pub mod definition;
pub mod executor;
pub mod pipeline;

pub use definition::{
    ExecutionConfig, GroupConfig, PartialCompletion, PropagationRule, RenderConfig, StepConfig,
    SyncConfig, WorkflowDefinition,
};
pub use executor::{RunOutcome, WorkflowExecutor};
pub use pipeline::{StepPipeline, StepReport};
