//! Workflow Executor — runs a workflow definition end to end.
//!
//! The executor:
//! 1. Validates the definition and seeds a fresh context store
//! 2. Drives steps sequentially or in parallel groups
//! 3. Gates each step on its declared dependencies
//! 4. Retries failures per the workflow's `execution` policy
//! 5. Hands step output to the [`StepPipeline`] and applies
//!    propagation rules after each completed step
//! 6. Finalizes the session (context + trace) or persists a failure
//!    snapshot for postmortem
//!
//! Run state machine: `pending → running → completed | failed`,
//! mirrored in `workflow_state.status`. A feedback loop can flip
//! `workflow_state.paused`; the executor waits at step and group
//! boundaries until the flag clears.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future;
use serde_json::{json, Value};
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::agents::{build_step_prompt, AgentRegistry, AgentRunner, StubRunner};
use crate::config::{EngineConfig, DEFAULT_GROUP_TIMEOUT_SECS};
use crate::context::ContextStore;
use crate::error::CoreError;
use crate::events::{EngineEvent, EngineEventType, EventBus};
use crate::metrics::{estimate_tokens, StepUsage, TelemetryStore};
use crate::render::RendererRegistry;
use crate::storage::{FailureSnapshot, SessionStorage};
use crate::trace::{ExecutionTrace, TraceStatus};
use crate::workflow::definition::{
    GroupConfig, PartialCompletion, StepConfig, WorkflowDefinition,
};
use crate::workflow::pipeline::StepPipeline;

/// What a successful run reports back to the caller.
#[derive(Debug)]
pub struct RunOutcome {
    pub success: bool,
    pub session_id: String,
    pub duration_ms: u64,
    pub trace: Option<ExecutionTrace>,
}

/// Per-run state created by `initialize()`.
struct RunSession {
    session_id: String,
    store: Arc<ContextStore>,
    storage: SessionStorage,
    pipeline: StepPipeline,
}

pub struct WorkflowExecutor {
    definition: WorkflowDefinition,
    project_name: String,
    config: EngineConfig,
    registry: AgentRegistry,
    runner: Arc<dyn AgentRunner>,
    renderers: Arc<RendererRegistry>,
    schemas: Arc<HashMap<String, Value>>,
    telemetry: Option<TelemetryStore>,
    events: EventBus,
    session: Option<RunSession>,
}

impl WorkflowExecutor {
    pub fn new(definition: WorkflowDefinition) -> Self {
        Self {
            definition,
            project_name: "Unnamed Project".to_string(),
            config: EngineConfig::default(),
            registry: AgentRegistry::builtin(),
            runner: Arc::new(StubRunner),
            renderers: Arc::new(RendererRegistry::with_builtins()),
            schemas: Arc::new(HashMap::new()),
            telemetry: None,
            events: EventBus::new(),
            session: None,
        }
    }

    /// Load the workflow definition from a YAML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, CoreError> {
        Ok(Self::new(WorkflowDefinition::from_file(path)?))
    }

    pub fn with_project_name(mut self, name: impl Into<String>) -> Self {
        self.project_name = name.into();
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_registry(mut self, registry: AgentRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_runner(mut self, runner: Arc<dyn AgentRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_renderers(mut self, renderers: RendererRegistry) -> Self {
        self.renderers = Arc::new(renderers);
        self
    }

    /// Output schemas referenced by step `schema:` fields, keyed by name.
    pub fn with_schemas(mut self, schemas: HashMap<String, Value>) -> Self {
        self.schemas = Arc::new(schemas);
        self
    }

    pub fn with_telemetry(mut self, telemetry: TelemetryStore) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.session_id.as_str())
    }

    /// The run's shared context store, once initialized.
    pub fn store(&self) -> Option<Arc<ContextStore>> {
        self.session.as_ref().map(|s| s.store.clone())
    }

    /// Validates the definition, generates the session id, and seeds
    /// the context store. Returns the session id.
    pub fn initialize(&mut self) -> Result<String, CoreError> {
        self.definition.validate()?;
        for step in self.definition.all_steps() {
            if !self.registry.contains(&step.agent) {
                return Err(CoreError::UnknownAgent(step.agent.clone()));
            }
        }

        let session_id = format!("sess-{}", Uuid::new_v4());
        let execution_mode = if self.definition.parallel_groups.is_some() {
            "parallel_groups"
        } else {
            "sequential"
        };
        let seed = json!({
            "session_id": session_id,
            "project_metadata": {
                "name": self.project_name,
                "workflow_type": self.definition.name,
                "workflow_version": self.definition.version,
                "created_at": Utc::now().to_rfc3339(),
            },
            "workflow_state": {
                "status": "pending",
                "current_step": 0,
                "completed_steps": [],
                "failed_steps": [],
                "skipped_steps": [],
                "quality_gates_passed": [],
                "quality_gates_failed": [],
                "overall_quality_score": 0.0,
                "execution_mode": execution_mode,
                "paused": false,
            },
            "agent_contexts": {},
            "global_context": {},
            "artifacts": {"generated": [], "schemas_used": [], "context_files": []},
            "feedback_loops": [],
            "checkpoints": [],
        });

        let store = Arc::new(
            ContextStore::with_root(seed).with_history_limit(self.config.history_limit),
        );
        let storage = match &self.config.storage_root {
            Some(root) => SessionStorage::new(root),
            None => SessionStorage::new(SessionStorage::default_root()),
        };
        let pipeline = StepPipeline::new(
            store.clone(),
            storage.clone(),
            self.renderers.clone(),
            self.schemas.clone(),
            session_id.as_str(),
            self.definition.name.as_str(),
            self.project_name.as_str(),
            self.definition.total_agent_steps() as u32,
        );

        info!(
            "[Executor] Session {session_id} initialized for workflow '{}' ({} step(s), {execution_mode})",
            self.definition.name,
            self.definition.total_agent_steps()
        );
        self.session = Some(RunSession {
            session_id: session_id.clone(),
            store,
            storage,
            pipeline,
        });
        Ok(session_id)
    }

    /// Runs the workflow to completion. On failure the context export
    /// is persisted as a failure snapshot and the error re-raised.
    pub async fn execute(&self) -> Result<RunOutcome, CoreError> {
        let session = self.session.as_ref().ok_or_else(|| {
            CoreError::Internal("execute() called before initialize()".to_string())
        })?;
        let started = Instant::now();
        info!(
            "[Executor] Starting workflow '{}' (session {})",
            self.definition.name, session.session_id
        );
        session.store.set("workflow_state.status", json!("running"))?;

        let result = if self.definition.parallel_groups.is_some() {
            self.execute_parallel_groups(session).await
        } else {
            self.execute_sequential(session).await
        };

        match result {
            Ok(()) => {
                self.finalize(session).await?;
                let duration_ms = started.elapsed().as_millis() as u64;
                let trace = session.storage.load_trace(&session.session_id).await?;
                info!(
                    "[Executor] Workflow '{}' completed in {duration_ms}ms",
                    self.definition.name
                );
                Ok(RunOutcome {
                    success: true,
                    session_id: session.session_id.clone(),
                    duration_ms,
                    trace,
                })
            }
            Err(e) => {
                error!("[Executor] Workflow '{}' failed: {e}", self.definition.name);
                self.handle_failure(session, &e).await;
                Err(e)
            }
        }
    }

    async fn execute_sequential(&self, session: &RunSession) -> Result<(), CoreError> {
        let steps = self.definition.sequence.clone().unwrap_or_default();
        for step in &steps {
            self.wait_if_paused(session).await?;
            self.execute_agent_step(session, step).await?;
        }
        Ok(())
    }

    async fn execute_parallel_groups(&self, session: &RunSession) -> Result<(), CoreError> {
        let groups = self.definition.parallel_groups.clone().unwrap_or_default();
        for group in &groups {
            info!("[Executor] --- Group: {} ---", group.name);
            self.wait_if_paused(session).await?;
            if group.parallel && group.agents.len() > 1 {
                self.execute_parallel_group(session, group).await?;
            } else {
                for step in &group.agents {
                    self.wait_if_paused(session).await?;
                    self.execute_agent_step(session, step).await?;
                }
            }
        }
        Ok(())
    }

    /// Launches every agent step of the group concurrently, racing the
    /// joined settlement against the group timeout. Failures settle
    /// (they never crash siblings) and are tallied afterwards.
    async fn execute_parallel_group(
        &self,
        session: &RunSession,
        group: &GroupConfig,
    ) -> Result<(), CoreError> {
        let window = Duration::from_secs(group.synchronization.timeout_secs);
        info!(
            "[Executor] Running {} agent(s) of group '{}' in parallel",
            group.agents.len(),
            group.name
        );
        let started = Instant::now();
        let members: Vec<_> = group
            .agents
            .iter()
            .map(|step| self.execute_agent_step(session, step))
            .collect();
        let results = timeout(window, future::join_all(members))
            .await
            .map_err(|_| CoreError::GroupTimeout {
                group: group.name.clone(),
                timeout_secs: group.synchronization.timeout_secs,
            })?;

        let successes = results.iter().filter(|r| r.is_ok()).count();
        let failures = results.len() - successes;
        info!(
            "[Executor] Group '{}' settled in {}ms: {successes} succeeded, {failures} failed",
            group.name,
            started.elapsed().as_millis()
        );
        if failures == 0 {
            return Ok(());
        }
        if successes >= 1
            && group.synchronization.partial_completion
                == Some(PartialCompletion::AllowWithOneSuccess)
        {
            warn!(
                "[Executor] Group '{}' accepted with partial completion ({failures} failure(s))",
                group.name
            );
            return Ok(());
        }
        Err(results
            .into_iter()
            .find_map(Result::err)
            .unwrap_or_else(|| {
                CoreError::Internal(format!(
                    "group '{}' tallied failures without an error",
                    group.name
                ))
            }))
    }

    /// Dependency gate, retry loop, and failure bookkeeping for one step.
    async fn execute_agent_step(
        &self,
        session: &RunSession,
        step: &StepConfig,
    ) -> Result<(), CoreError> {
        info!("[Executor] [Step {}] {}", step.step, step.agent);

        if let Some(deps) = &step.depends_on {
            let missing = unmet_dependencies(&session.store, deps);
            if !missing.is_empty() {
                if step.optional {
                    info!(
                        "[Executor] Skipping optional step {}: dependencies {missing:?} not met",
                        step.step
                    );
                    let reason = format!("dependencies {missing:?} not completed");
                    session
                        .store
                        .push("workflow_state.skipped_steps", json!(step.step))?;
                    session.pipeline.log_skip(step, &reason).await?;
                    return Ok(());
                }
                return Err(CoreError::DependencyUnmet {
                    step: step.step,
                    missing,
                });
            }
        }

        session
            .store
            .set("workflow_state.current_step", json!(step.step))?;

        let retries = if self.definition.execution.retry_on_failure {
            self.definition.execution.max_attempts
        } else {
            0
        };
        let backoff = Duration::from_millis(self.definition.execution.backoff_ms);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let attempt_started = Instant::now();
            match self.run_step_once(session, step).await {
                Ok(artifacts) => {
                    self.events.emit(EngineEvent::new(
                        EngineEventType::StepCompleted,
                        session.session_id.as_str(),
                        json!({
                            "step": step.step,
                            "agent": step.agent,
                            "attempt": attempt,
                            "artifacts": artifacts,
                        }),
                    ));
                    self.autopropagate(session, &step.agent);
                    info!("[Executor] ✓ Step {} completed", step.step);
                    return Ok(());
                }
                Err(e) if attempt <= retries => {
                    warn!(
                        "[Executor] Step {} attempt {attempt} failed: {e}; retrying in {}ms",
                        step.step,
                        backoff.as_millis()
                    );
                    sleep(backoff).await;
                }
                Err(e) => {
                    let duration_ms = attempt_started.elapsed().as_millis() as u64;
                    session.store.push(
                        "workflow_state.failed_steps",
                        json!({
                            "step_id": step.step,
                            "agent": step.agent,
                            "error": e.to_string(),
                            "timestamp": Utc::now().to_rfc3339(),
                        }),
                    )?;
                    session
                        .pipeline
                        .log_failure(step, duration_ms, &e.to_string())
                        .await?;
                    self.events.emit(EngineEvent::new(
                        EngineEventType::StepFailed,
                        session.session_id.as_str(),
                        json!({
                            "step": step.step,
                            "agent": step.agent,
                            "attempts": attempt,
                            "error": e.to_string(),
                        }),
                    ));
                    if step.optional {
                        warn!(
                            "[Executor] Optional step {} failed after {attempt} attempt(s); continuing",
                            step.step
                        );
                        session
                            .store
                            .push("workflow_state.skipped_steps", json!(step.step))?;
                        return Ok(());
                    }
                    return Err(CoreError::StepFailed {
                        step: step.step,
                        agent: step.agent.clone(),
                        attempts: attempt,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    /// One attempt: prompt, run the agent, pipeline the output,
    /// record telemetry.
    async fn run_step_once(
        &self,
        session: &RunSession,
        step: &StepConfig,
    ) -> Result<Vec<String>, CoreError> {
        let agent = self
            .registry
            .get(&step.agent)
            .ok_or_else(|| CoreError::UnknownAgent(step.agent.clone()))?;

        session.store.update(
            &format!("agent_contexts.{}", step.agent),
            json!({"status": "running", "current_step": step.step}),
        )?;

        let excerpt = json!({
            "project": session.store.get("project_metadata"),
            "agent": session.store.get(&format!("agent_contexts.{}", step.agent)),
            "global": session.store.get("global_context"),
        });
        let prompt = build_step_prompt(agent, step.step, &step.description, &excerpt);

        let started = Instant::now();
        let output = self.runner.run_step(agent, step.step, &prompt).await?;
        let duration_ms = started.elapsed().as_millis() as u64;

        let artifacts = match output.payload.clone() {
            Some(payload) => {
                let report = session
                    .pipeline
                    .process(step, payload, duration_ms, output.quality_score)
                    .await?;
                report.artifacts
            }
            None => {
                // No structured output; the step still counts as done.
                session
                    .store
                    .push_unique("workflow_state.completed_steps", json!(step.step))?;
                Vec::new()
            }
        };

        if let Some(telemetry) = &self.telemetry {
            let rendered_payload = output
                .payload
                .as_ref()
                .map(|p| p.to_string())
                .unwrap_or_default();
            let usage = StepUsage {
                session_id: session.session_id.clone(),
                workflow: self.definition.name.clone(),
                step: step.step,
                agent: step.agent.clone(),
                model: output.model.clone().unwrap_or_else(|| "unknown".to_string()),
                input_tokens: output
                    .input_tokens
                    .unwrap_or_else(|| estimate_tokens(&prompt)),
                output_tokens: output
                    .output_tokens
                    .unwrap_or_else(|| estimate_tokens(&rendered_payload)),
                quality_score: output.quality_score,
                duration_ms,
                recorded_at: Utc::now(),
            };
            telemetry.record_step(&usage).await?;
        }
        Ok(artifacts)
    }

    fn autopropagate(&self, session: &RunSession, completed_agent: &str) {
        for rule in self.definition.propagation_rules_for(completed_agent) {
            let copied = session
                .store
                .propagate(&rule.source, &rule.target, &rule.fields);
            let count = copied.as_object().map(|m| m.len()).unwrap_or(0);
            if count > 0 {
                info!(
                    "[Executor] Propagated {count} field(s) from {} to {}",
                    rule.source, rule.target
                );
            }
        }
    }

    /// Blocks while `workflow_state.paused` is set, bounded by the
    /// group-timeout default.
    async fn wait_if_paused(&self, session: &RunSession) -> Result<(), CoreError> {
        if !is_paused(&session.store) {
            return Ok(());
        }
        info!("[Executor] Workflow paused; waiting for resume");
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(DEFAULT_GROUP_TIMEOUT_SECS);
        while is_paused(&session.store) {
            if tokio::time::Instant::now() >= deadline {
                let reason = session
                    .store
                    .get("workflow_state.pause_reason")
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_else(|| "no reason recorded".to_string());
                return Err(CoreError::Paused(format!(
                    "workflow did not resume within {DEFAULT_GROUP_TIMEOUT_SECS}s ({reason})"
                )));
            }
            sleep(self.config.poll_interval).await;
        }
        info!("[Executor] Workflow resumed");
        Ok(())
    }

    async fn finalize(&self, session: &RunSession) -> Result<(), CoreError> {
        session
            .store
            .set("workflow_state.status", json!("completed"))?;
        if let Some(score) = self.average_quality(session).await? {
            session
                .store
                .set("workflow_state.overall_quality_score", json!(score))?;
        }
        session
            .storage
            .save_context(&session.session_id, &session.store.export())
            .await?;
        session.pipeline.finish_trace(TraceStatus::Completed).await?;
        Ok(())
    }

    async fn average_quality(&self, session: &RunSession) -> Result<Option<f64>, CoreError> {
        let Some(trace) = session.storage.load_trace(&session.session_id).await? else {
            return Ok(None);
        };
        let scores: Vec<f64> = trace.entries.iter().filter_map(|e| e.quality_score).collect();
        if scores.is_empty() {
            return Ok(None);
        }
        Ok(Some(scores.iter().sum::<f64>() / scores.len() as f64))
    }

    /// Persists the failure snapshot without masking the run error.
    async fn handle_failure(&self, session: &RunSession, error: &CoreError) {
        if let Err(e) = session.store.set("workflow_state.status", json!("failed")) {
            warn!("[Executor] Could not record failed status: {e}");
        }
        let snapshot = FailureSnapshot {
            session_id: session.session_id.clone(),
            workflow: self.definition.name.clone(),
            error: error.to_string(),
            recovery: error.recovery().map(str::to_string),
            context: session.store.export(),
            timestamp: Utc::now(),
        };
        if let Err(e) = session.storage.save_failure(&snapshot).await {
            warn!("[Executor] Could not persist failure snapshot: {e}");
        }
        if let Err(e) = session.pipeline.finish_trace(TraceStatus::Failed).await {
            warn!("[Executor] Could not finalize trace: {e}");
        }
    }
}

fn is_paused(store: &ContextStore) -> bool {
    store
        .get("workflow_state.paused")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

fn unmet_dependencies(store: &ContextStore, deps: &[u32]) -> Vec<u32> {
    let completed: HashSet<u32> = store
        .get("workflow_state.completed_steps")
        .and_then(|v| v.as_array().cloned())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_u64())
                .map(|v| v as u32)
                .collect()
        })
        .unwrap_or_default();
    deps.iter().copied().filter(|d| !completed.contains(d)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedRunner;
    use crate::trace::EntryStatus;

    fn executor(yaml: &str, dir: &std::path::Path) -> WorkflowExecutor {
        WorkflowExecutor::new(WorkflowDefinition::from_yaml(yaml).unwrap())
            .with_project_name("demo")
            .with_config(EngineConfig::default().with_storage_root(dir))
    }

    const TWO_STEP: &str = r#"
name: "two-step"
sequence:
  - step: 1
    agent: analyst
    description: "Brief"
  - step: 2
    agent: pm
    description: "PRD"
    depends_on: [1]
"#;

    #[tokio::test]
    async fn test_sequential_run_completes_steps_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut executor = executor(TWO_STEP, dir.path());
        let session_id = executor.initialize().unwrap();
        assert!(session_id.starts_with("sess-"));

        let outcome = executor.execute().await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.session_id, session_id);

        let store = executor.store().unwrap();
        assert_eq!(
            store.get("workflow_state.completed_steps"),
            Some(json!([1, 2]))
        );
        assert_eq!(store.get("workflow_state.status"), Some(json!("completed")));

        let trace = outcome.trace.unwrap();
        assert_eq!(trace.entries.len(), 2);
        assert_eq!(trace.status, crate::trace::TraceStatus::Completed);

        // Final context persisted under the session dir.
        let storage = SessionStorage::new(dir.path());
        let context = storage.load_context(&session_id).await.unwrap().unwrap();
        assert_eq!(context["workflow_state"]["status"], json!("completed"));
        assert!(
            store
                .get("workflow_state.overall_quality_score")
                .and_then(|v| v.as_f64())
                .unwrap()
                > 0.0
        );
    }

    #[tokio::test]
    async fn test_unmet_required_dependency_aborts_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut executor = executor(
            r#"
name: "blocked"
sequence:
  - step: 1
    agent: pm
    description: "PRD"
    depends_on: [99]
"#,
            dir.path(),
        );
        let session_id = executor.initialize().unwrap();
        let err = executor.execute().await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::DependencyUnmet { step: 1, ref missing } if missing == &vec![99]
        ));

        let store = executor.store().unwrap();
        assert_eq!(store.get("workflow_state.status"), Some(json!("failed")));

        let storage = SessionStorage::new(dir.path());
        let failure = storage.load_failure(&session_id).await.unwrap().unwrap();
        assert!(failure.error.contains("dependencies [99]"));
        assert!(failure.recovery.is_some());
        assert_eq!(failure.context["session_id"], json!(session_id));
    }

    #[tokio::test]
    async fn test_unmet_optional_dependency_skips_step() {
        let dir = tempfile::tempdir().unwrap();
        let mut executor = executor(
            r#"
name: "skippy"
sequence:
  - step: 1
    agent: analyst
    description: "Brief"
  - step: 2
    agent: qa
    description: "Early test plan"
    depends_on: [99]
    optional: true
  - step: 3
    agent: pm
    description: "PRD"
    depends_on: [1]
"#,
            dir.path(),
        );
        executor.initialize().unwrap();
        executor.execute().await.unwrap();

        let store = executor.store().unwrap();
        assert_eq!(
            store.get("workflow_state.completed_steps"),
            Some(json!([1, 3]))
        );
        assert_eq!(store.get("workflow_state.skipped_steps"), Some(json!([2])));
        // qa never ran.
        assert_eq!(store.get("agent_contexts.qa"), None);
    }

    #[tokio::test]
    async fn test_gate_failure_without_retry_lands_in_failed_steps() {
        let dir = tempfile::tempdir().unwrap();
        let mut schemas = HashMap::new();
        schemas.insert(
            "strict-brief".to_string(),
            json!({
                "type": "object",
                "required": ["title"],
                "properties": {"title": {"type": "string"}},
                "additionalProperties": false
            }),
        );
        let mut executor = executor(
            r#"
name: "gated"
sequence:
  - step: 1
    agent: analyst
    description: "Brief"
    schema: strict-brief
"#,
            dir.path(),
        )
        .with_schemas(schemas);
        let session_id = executor.initialize().unwrap();
        let err = executor.execute().await.unwrap_err();
        assert!(matches!(err, CoreError::StepFailed { step: 1, attempts: 1, .. }));
        assert!(err.to_string().contains("title"));

        let store = executor.store().unwrap();
        let failed = store.get("workflow_state.failed_steps").unwrap();
        assert_eq!(failed[0]["step_id"], json!(1));
        assert_eq!(failed[0]["agent"], json!("analyst"));
        assert!(failed[0]["error"].as_str().unwrap().contains("title"));
        assert_eq!(store.get("workflow_state.status"), Some(json!("failed")));
        assert_eq!(
            store.get("workflow_state.quality_gates_failed"),
            Some(json!([1]))
        );

        // The gate record persisted even though the run failed.
        let storage = SessionStorage::new(dir.path());
        let record = storage.load_gate_record("gated", 1).await.unwrap().unwrap();
        assert!(!record.status.passed());
        drop(session_id);
    }

    #[tokio::test]
    async fn test_optional_step_failure_skips_and_continues() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new().fail("qa", "flaky harness"));
        let mut executor = executor(
            r#"
name: "tolerant"
sequence:
  - step: 1
    agent: qa
    description: "Optional early QA"
    optional: true
  - step: 2
    agent: pm
    description: "PRD"
"#,
            dir.path(),
        )
        .with_runner(runner);
        executor.initialize().unwrap();
        let outcome = executor.execute().await.unwrap();
        assert!(outcome.success);

        let store = executor.store().unwrap();
        assert_eq!(store.get("workflow_state.completed_steps"), Some(json!([2])));
        assert_eq!(store.get("workflow_state.skipped_steps"), Some(json!([1])));
        let failed = store.get("workflow_state.failed_steps").unwrap();
        assert!(failed[0]["error"].as_str().unwrap().contains("flaky harness"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_from_transient_failure() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new().fail_times("developer", 1, "transient"));
        let mut executor = executor(
            r#"
name: "retrying"
execution:
  retry_on_failure: true
  max_attempts: 2
  backoff_ms: 50
sequence:
  - step: 1
    agent: developer
    description: "Implement"
"#,
            dir.path(),
        )
        .with_runner(runner.clone());
        executor.initialize().unwrap();
        executor.execute().await.unwrap();

        assert_eq!(runner.call_count("developer"), 2);
        let store = executor.store().unwrap();
        assert_eq!(store.get("workflow_state.completed_steps"), Some(json!([1])));
        // The transient failure never landed in failed_steps.
        assert_eq!(store.get("workflow_state.failed_steps"), Some(json!([])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_exhaustion_records_failure() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new().fail_times("developer", 10, "still broken"));
        let mut executor = executor(
            r#"
name: "exhausted"
execution:
  retry_on_failure: true
  max_attempts: 2
  backoff_ms: 50
sequence:
  - step: 1
    agent: developer
    description: "Implement"
"#,
            dir.path(),
        )
        .with_runner(runner.clone());
        executor.initialize().unwrap();
        let err = executor.execute().await.unwrap_err();
        // First try plus two retries.
        assert_eq!(runner.call_count("developer"), 3);
        assert!(matches!(err, CoreError::StepFailed { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_parallel_group_partial_completion_accepts_one_success() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(
            ScriptedRunner::new()
                .fail("architect", "design blocked")
                .fail("qa", "no fixtures"),
        );
        let mut executor = executor(
            r#"
name: "partial"
parallel_groups:
  - name: "design"
    parallel: true
    synchronization:
      timeout_secs: 30
      partial_completion: allow_with_one_success
    agents:
      - step: 1
        agent: architect
        description: "Architecture"
      - step: 2
        agent: qa
        description: "Test plan"
      - step: 3
        agent: developer
        description: "Spike"
"#,
            dir.path(),
        )
        .with_runner(runner);
        executor.initialize().unwrap();
        let outcome = executor.execute().await.unwrap();
        assert!(outcome.success);

        let store = executor.store().unwrap();
        assert_eq!(store.get("workflow_state.completed_steps"), Some(json!([3])));
        let failed = store.get("workflow_state.failed_steps").unwrap();
        assert_eq!(failed.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_parallel_group_without_policy_aborts_on_any_failure() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new().fail("qa", "no fixtures"));
        let mut executor = executor(
            r#"
name: "strict-group"
parallel_groups:
  - name: "design"
    parallel: true
    agents:
      - step: 1
        agent: architect
        description: "Architecture"
      - step: 2
        agent: qa
        description: "Test plan"
"#,
            dir.path(),
        )
        .with_runner(runner);
        executor.initialize().unwrap();
        let err = executor.execute().await.unwrap_err();
        assert!(matches!(err, CoreError::StepFailed { step: 2, .. }));
        let store = executor.store().unwrap();
        assert_eq!(store.get("workflow_state.status"), Some(json!("failed")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_group_timeout_aborts_run() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new().delay("qa", Duration::from_secs(5)));
        let mut executor = executor(
            r#"
name: "slow-group"
parallel_groups:
  - name: "design"
    parallel: true
    synchronization:
      timeout_secs: 2
    agents:
      - step: 1
        agent: architect
        description: "Architecture"
      - step: 2
        agent: qa
        description: "Test plan"
"#,
            dir.path(),
        )
        .with_runner(runner);
        executor.initialize().unwrap();
        let err = executor.execute().await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::GroupTimeout { timeout_secs: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_propagation_rules_applied_after_source_completes() {
        let dir = tempfile::tempdir().unwrap();
        let mut executor = executor(
            r#"
name: "handoff"
sequence:
  - step: 1
    agent: analyst
    description: "Brief"
  - step: 2
    agent: pm
    description: "PRD"
    depends_on: [1]
propagation:
  - source: analyst
    target: pm
    fields:
      "outputs.step_1.summary": "inputs.brief_summary"
"#,
            dir.path(),
        );
        executor.initialize().unwrap();
        executor.execute().await.unwrap();

        let store = executor.store().unwrap();
        let brief = store.get("agent_contexts.pm.inputs.brief_summary").unwrap();
        assert!(brief.as_str().unwrap().contains("Mary"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_workflow_waits_until_resumed() {
        let dir = tempfile::tempdir().unwrap();
        let mut executor = executor(TWO_STEP, dir.path());
        executor.initialize().unwrap();
        let store = executor.store().unwrap();
        store.set("workflow_state.paused", json!(true)).unwrap();

        let resume_store = store.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(3)).await;
            resume_store
                .set("workflow_state.paused", json!(false))
                .unwrap();
        });

        let outcome = executor.execute().await.unwrap();
        assert!(outcome.success);
        assert_eq!(
            store.get("workflow_state.completed_steps"),
            Some(json!([1, 2]))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_without_resume_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let mut executor = executor(TWO_STEP, dir.path());
        executor.initialize().unwrap();
        let store = executor.store().unwrap();
        store.set("workflow_state.paused", json!(true)).unwrap();
        store
            .set("workflow_state.pause_reason", json!("constraint violation"))
            .unwrap();

        let err = executor.execute().await.unwrap_err();
        assert!(matches!(err, CoreError::Paused(_)));
        assert!(err.to_string().contains("constraint violation"));
        assert_eq!(
            store.get("workflow_state.status"),
            Some(json!("failed"))
        );
        // Nothing ran while paused.
        assert_eq!(store.get("workflow_state.completed_steps"), Some(json!([])));
    }

    #[tokio::test]
    async fn test_execute_before_initialize_is_an_error() {
        let executor = WorkflowExecutor::new(WorkflowDefinition::from_yaml(TWO_STEP).unwrap());
        assert!(matches!(
            executor.execute().await,
            Err(CoreError::Internal(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_agent_rejected_at_initialize() {
        let dir = tempfile::tempdir().unwrap();
        let mut executor = executor(
            "name: bad\nsequence:\n  - step: 1\n    agent: intern\n",
            dir.path(),
        );
        assert!(matches!(
            executor.initialize(),
            Err(CoreError::UnknownAgent(agent)) if agent == "intern"
        ));
    }

    #[tokio::test]
    async fn test_failed_step_recorded_in_trace() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new().fail("pm", "no requirements"));
        let mut executor = executor(
            "name: tracing\nsequence:\n  - step: 1\n    agent: pm\n",
            dir.path(),
        )
        .with_runner(runner);
        let session_id = executor.initialize().unwrap();
        executor.execute().await.unwrap_err();

        let storage = SessionStorage::new(dir.path());
        let trace = storage.load_trace(&session_id).await.unwrap().unwrap();
        assert_eq!(trace.status, crate::trace::TraceStatus::Failed);
        assert_eq!(trace.entries[0].status, EntryStatus::Failed);
        assert!(trace.entries[0]
            .error
            .as_deref()
            .unwrap()
            .contains("no requirements"));
    }

    #[tokio::test]
    async fn test_telemetry_rows_recorded_per_step() {
        let dir = tempfile::tempdir().unwrap();
        let telemetry = crate::metrics::TelemetryStore::open_in_memory().unwrap();
        let mut executor = executor(TWO_STEP, dir.path()).with_telemetry(telemetry.clone());
        let session_id = executor.initialize().unwrap();
        executor.execute().await.unwrap();

        let summary = telemetry.session_summary(&session_id).await.unwrap();
        assert_eq!(summary.steps, 2);
        assert!(summary.input_tokens > 0);
    }
}
