//! Per-step output processing: validate, render, fold into context,
//! log the trace entry.
//!
//! The executor hands each step's raw agent output to [`StepPipeline`];
//! everything that turns that output into durable session state lives
//! here. A gate or render failure surfaces as an error for the
//! executor's retry/skip/abort policy — the pipeline itself never
//! decides whether a failure is fatal.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::context::ContextStore;
use crate::error::CoreError;
use crate::gate::{self, GateStatus};
use crate::render::RendererRegistry;
use crate::storage::SessionStorage;
use crate::trace::{EntryStatus, ExecutionTrace, TraceEntry, TraceStatus};
use crate::workflow::definition::StepConfig;

/// What the pipeline did with one step's output.
#[derive(Debug, Clone)]
pub struct StepReport {
    /// The document carried forward (auto-fixed when the gate fixed it).
    pub document: Value,
    /// Artifact paths written or declared this step.
    pub artifacts: Vec<String>,
    /// Gate outcome, when the step named a schema.
    pub validation: Option<(GateStatus, usize)>,
}

pub struct StepPipeline {
    store: Arc<ContextStore>,
    storage: SessionStorage,
    renderers: Arc<RendererRegistry>,
    schemas: Arc<HashMap<String, Value>>,
    session_id: String,
    workflow: String,
    project: String,
    total_steps: u32,
    /// Serializes trace load-append-save so concurrent group members
    /// cannot drop each other's entries.
    trace_lock: tokio::sync::Mutex<()>,
}

impl StepPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<ContextStore>,
        storage: SessionStorage,
        renderers: Arc<RendererRegistry>,
        schemas: Arc<HashMap<String, Value>>,
        session_id: impl Into<String>,
        workflow: impl Into<String>,
        project: impl Into<String>,
        total_steps: u32,
    ) -> Self {
        Self {
            store,
            storage,
            renderers,
            schemas,
            session_id: session_id.into(),
            workflow: workflow.into(),
            project: project.into(),
            total_steps,
            trace_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Runs the full pipeline on a step's output document.
    pub async fn process(
        &self,
        step: &StepConfig,
        payload: Value,
        duration_ms: u64,
        quality_score: Option<f64>,
    ) -> Result<StepReport, CoreError> {
        let (document, validation) = self.validate(step, payload).await?;
        let artifacts = self.render(step, &document).await?;
        self.update_context(step, &document, &artifacts, validation)
            .await?;
        self.log_trace(step, duration_ms, quality_score, &artifacts, validation)
            .await?;
        Ok(StepReport {
            document,
            artifacts,
            validation,
        })
    }

    // ── Stage 1: validate ────────────────────────────────────────────────

    async fn validate(
        &self,
        step: &StepConfig,
        payload: Value,
    ) -> Result<(Value, Option<(GateStatus, usize)>), CoreError> {
        let Some(schema_name) = &step.schema else {
            return Ok((payload, None));
        };
        let schema = self.schemas.get(schema_name).ok_or_else(|| {
            CoreError::Definition(format!(
                "step {} references unknown schema '{schema_name}'",
                step.step
            ))
        })?;

        let outcome = gate::check(schema_name, schema, &payload, true);
        self.storage
            .save_gate_record(&self.workflow, step.step, &outcome.record)
            .await?;

        if !outcome.record.status.passed() {
            self.store
                .push_unique("workflow_state.quality_gates_failed", json!(step.step))?;
            return Err(CoreError::GateRejected {
                step: step.step,
                schema: schema_name.clone(),
                violations: outcome.record.errors,
            });
        }
        debug!(
            "[Pipeline] Step {} output passed gate '{}' ({})",
            step.step, schema_name, outcome.record.status
        );
        let summary = (outcome.record.status, outcome.record.errors.len());
        Ok((outcome.document, Some(summary)))
    }

    // ── Stage 2: render ──────────────────────────────────────────────────

    async fn render(&self, step: &StepConfig, document: &Value) -> Result<Vec<String>, CoreError> {
        let mut artifacts = Vec::new();
        if let Some(render) = &step.render {
            let pretty = serde_json::to_string_pretty(document)
                .map_err(|e| CoreError::Internal(format!("serialize step output: {e}")))?;
            self.storage
                .save_artifact(&self.session_id, &render.from, &pretty)
                .await?;
            let markdown = self.renderers.render(&render.renderer, document)?;
            self.storage
                .save_artifact(&self.session_id, &render.to, &markdown)
                .await?;
            info!(
                "[Pipeline] Step {} rendered '{}' to {}",
                step.step, render.renderer, render.to
            );
            artifacts.push(render.from.clone());
            artifacts.push(render.to.clone());
        }
        if let Some(creates) = &step.creates {
            if !artifacts.contains(creates) {
                artifacts.push(creates.clone());
            }
        }
        Ok(artifacts)
    }

    // ── Stage 3: update context ──────────────────────────────────────────

    async fn update_context(
        &self,
        step: &StepConfig,
        document: &Value,
        artifacts: &[String],
        validation: Option<(GateStatus, usize)>,
    ) -> Result<(), CoreError> {
        let agent_path = format!("agent_contexts.{}", step.agent);
        let mut patch = json!({
            "status": "completed",
            "last_step": step.step,
            "completed_at": Utc::now().to_rfc3339(),
        });
        if let Some((status, error_count)) = validation {
            patch["validation"] = json!({
                "status": status.as_str(),
                "error_count": error_count,
            });
        }
        self.store.update(&agent_path, patch)?;
        self.store.set(
            &format!("{agent_path}.outputs.step_{}", step.step),
            document.clone(),
        )?;

        self.store
            .push_unique("workflow_state.completed_steps", json!(step.step))?;
        self.store
            .set("workflow_state.current_step", json!(step.step + 1))?;
        if validation.is_some() {
            self.store
                .push_unique("workflow_state.quality_gates_passed", json!(step.step))?;
        }
        for artifact in artifacts {
            self.store
                .push_unique("artifacts.generated", json!(artifact))?;
        }
        if let Some(schema) = &step.schema {
            self.store
                .push_unique("artifacts.schemas_used", json!(schema))?;
        }

        self.storage
            .save_context(&self.session_id, &self.store.export())
            .await?;
        Ok(())
    }

    // ── Stage 4: log trace ───────────────────────────────────────────────

    async fn log_trace(
        &self,
        step: &StepConfig,
        duration_ms: u64,
        quality_score: Option<f64>,
        artifacts: &[String],
        validation: Option<(GateStatus, usize)>,
    ) -> Result<(), CoreError> {
        let mut entry = TraceEntry::new(step.step, step.agent.as_str())
            .with_status(EntryStatus::Completed)
            .with_duration_ms(duration_ms)
            .with_artifacts(artifacts.to_vec());
        if let Some(score) = quality_score {
            entry = entry.with_quality_score(score);
        }
        if let Some((status, error_count)) = validation {
            entry = entry.with_validation(status, error_count);
        }
        self.append_trace_entry(entry).await
    }

    /// Records a skipped step in the trace (unmet optional dependency).
    pub async fn log_skip(&self, step: &StepConfig, reason: &str) -> Result<(), CoreError> {
        let entry = TraceEntry::new(step.step, step.agent.as_str())
            .with_status(EntryStatus::Skipped)
            .with_error(reason);
        self.append_trace_entry(entry).await
    }

    /// Records a failed step in the trace.
    pub async fn log_failure(
        &self,
        step: &StepConfig,
        duration_ms: u64,
        error: &str,
    ) -> Result<(), CoreError> {
        let entry = TraceEntry::new(step.step, step.agent.as_str())
            .with_status(EntryStatus::Failed)
            .with_duration_ms(duration_ms)
            .with_error(error);
        self.append_trace_entry(entry).await
    }

    /// Marks the trace finished without requiring every step recorded.
    pub async fn finish_trace(&self, status: TraceStatus) -> Result<(), CoreError> {
        if let Some(mut trace) = self.storage.load_trace(&self.session_id).await? {
            trace.finish(status);
            self.storage.save_trace(&trace).await?;
        }
        Ok(())
    }

    async fn append_trace_entry(&self, entry: TraceEntry) -> Result<(), CoreError> {
        let _guard = self.trace_lock.lock().await;
        let mut trace = match self.storage.load_trace(&self.session_id).await? {
            Some(trace) => trace,
            None => ExecutionTrace::new(
                self.session_id.as_str(),
                self.workflow.as_str(),
                self.project.as_str(),
                self.total_steps,
            ),
        };
        trace.record(entry);
        self.storage.save_trace(&trace).await?;
        Ok(())
    }
}
