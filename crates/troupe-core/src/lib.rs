//! Troupe Core — workflow execution engine for agent-driven delivery.
//!
//! This crate is the transport-agnostic heart of Troupe: a shared
//! context store with history/checkpoints, a YAML-driven workflow
//! executor over a fixed roster of agent personas, per-step validation
//! gates and artifact rendering, a cross-agent feedback-loop engine,
//! and SQLite-backed run telemetry. It has **no CLI or server
//! dependency**, making it suitable for:
//!
//! - the `troupe` CLI (via `troupe-cli`)
//! - embedding in services that drive workflows programmatically
//! - custom [`agents::AgentRunner`] implementations backed by real models
//!
//! # Feature Flags
//!
//! - `test-support` — exposes [`testing`] (the scripted agent runner)
//!   to downstream integration tests.

pub mod agents;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod feedback;
pub mod gate;
pub mod lint;
pub mod metrics;
pub mod render;
pub mod schema;
pub mod storage;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod trace;
pub mod workflow;

// Convenience re-exports
pub use config::EngineConfig;
pub use context::ContextStore;
pub use error::CoreError;
pub use events::{EngineEvent, EngineEventType, EventBus};
pub use feedback::FeedbackEngine;
pub use workflow::{WorkflowDefinition, WorkflowExecutor};
