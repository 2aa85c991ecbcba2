//! Feedback Loop Engine — adaptive cross-agent coordination.
//!
//! When a step or consistency check finds a problem mid-run, the engine
//! opens a feedback loop: the source agent's issue is delivered to every
//! target agent's `feedback_received` queue in the shared context, and
//! the loop advances through a small state machine until someone
//! resolves it (or escalation gives up and pauses the workflow).
//!
//! ```text
//! IDLE ─► NOTIFYING ─► WAITING_RESPONSE ─► RESOLVING ─► RESOLVED
//!                            │ timeout          ▲
//!                            ▼                  │ acknowledge
//!                       ESCALATING ─────────────┘
//!                            │ re-notify (count < max)
//!                            └─ count ≥ max ⇒ pause workflow
//! ```
//!
//! Severities `blocking` and `critical` pause the workflow at trigger
//! time, before any agent can act on stale state. Every transition is
//! published on the engine [`EventBus`] under the stable wire names
//! (`loop:triggered`, `loop:resolved`, `loop:escalated`,
//! `workflow:paused`, `workflow:resumed`).

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::context::ContextStore;
use crate::error::CoreError;
use crate::events::{EngineEvent, EngineEventType, EventBus};

// ─── Loop vocabulary ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoopState {
    Idle,
    Notifying,
    WaitingResponse,
    Resolving,
    Escalating,
    Resolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStatus {
    Pending,
    Escalated,
    Resolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    ConstraintViolation,
    TechnicalInfeasibility,
    Inconsistency,
    MissingRequirement,
    ValidationFailure,
    QualityGateFailure,
}

impl IssueType {
    pub fn as_str(self) -> &'static str {
        match self {
            IssueType::ConstraintViolation => "constraint_violation",
            IssueType::TechnicalInfeasibility => "technical_infeasibility",
            IssueType::Inconsistency => "inconsistency",
            IssueType::MissingRequirement => "missing_requirement",
            IssueType::ValidationFailure => "validation_failure",
            IssueType::QualityGateFailure => "quality_gate_failure",
        }
    }
}

impl std::fmt::Display for IssueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Blocking,
    Critical,
}

impl Severity {
    /// Severities that halt the workflow at trigger time.
    pub fn pauses_workflow(self) -> bool {
        matches!(self, Severity::Blocking | Severity::Critical)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Blocking => "blocking",
            Severity::Critical => "critical",
        }
    }
}

impl Default for Severity {
    fn default() -> Self {
        Severity::Error
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Records ──────────────────────────────────────────────────────────────

/// One issue raised between agents, tracked until resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackLoop {
    pub id: String,
    pub triggered_at: DateTime<Utc>,
    pub source_agent: String,
    pub target_agents: Vec<String>,
    pub issue_type: IssueType,
    pub severity: Severity,
    pub description: String,
    #[serde(default)]
    pub details: Value,
    #[serde(default)]
    pub options: Vec<String>,
    pub status: LoopStatus,
    pub state: LoopState,
    #[serde(default)]
    pub notifications_sent: Vec<String>,
    #[serde(default)]
    pub responses: Vec<LoopResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub escalation_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_reason: Option<String>,
}

/// A target agent's acknowledgment, recorded on the loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopResponse {
    pub agent: String,
    pub acknowledged_at: DateTime<Utc>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<String>,
}

/// What a target agent says when acknowledging a loop.
#[derive(Debug, Clone, Default)]
pub struct Acknowledgment {
    pub message: String,
    pub action: Option<String>,
    pub eta: Option<String>,
}

impl Acknowledgment {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            action: None,
            eta: None,
        }
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_eta(mut self, eta: impl Into<String>) -> Self {
        self.eta = Some(eta.into());
        self
    }
}

/// Parameters for [`FeedbackEngine::trigger`]. `source`, `targets`, and
/// `description` are required and checked at trigger time.
#[derive(Debug, Clone)]
pub struct TriggerConfig {
    pub source: String,
    pub targets: Vec<String>,
    pub issue_type: IssueType,
    pub severity: Severity,
    pub description: String,
    pub details: Value,
    pub options: Vec<String>,
}

impl TriggerConfig {
    pub fn new(source: impl Into<String>, issue_type: IssueType) -> Self {
        Self {
            source: source.into(),
            targets: Vec::new(),
            issue_type,
            severity: Severity::default(),
            description: String::new(),
            details: Value::Null,
            options: Vec::new(),
        }
    }

    pub fn with_targets<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.targets = targets.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options = options.into_iter().map(Into::into).collect();
        self
    }
}

/// Counts for the CLI status view.
#[derive(Debug, Clone, Serialize)]
pub struct FeedbackStats {
    pub active: usize,
    pub resolved: usize,
    pub total: usize,
    pub escalations: u64,
    pub by_type: BTreeMap<String, u64>,
    pub by_severity: BTreeMap<String, u64>,
}

// ─── Engine ───────────────────────────────────────────────────────────────

#[derive(Default)]
struct EngineInner {
    active: HashMap<String, FeedbackLoop>,
    resolved: Vec<FeedbackLoop>,
}

pub struct FeedbackEngine {
    store: Arc<ContextStore>,
    session_id: String,
    config: EngineConfig,
    events: EventBus,
    inner: Mutex<EngineInner>,
    escalations: AtomicU64,
    loop_seq: AtomicU64,
}

impl FeedbackEngine {
    /// Builds an engine over the run's context store, publishing on the
    /// given bus (share the executor's so observers see both streams).
    pub fn new(store: Arc<ContextStore>, events: EventBus) -> Self {
        let session_id = store
            .get("session_id")
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        Self {
            store,
            session_id,
            config: EngineConfig::default(),
            events,
            inner: Mutex::new(EngineInner::default()),
            escalations: AtomicU64::new(0),
            loop_seq: AtomicU64::new(0),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    fn inner_guard(&self) -> MutexGuard<'_, EngineInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self, prefix: &str) -> String {
        let seq = self.loop_seq.fetch_add(1, Ordering::Relaxed);
        format!("{prefix}-{}-{seq}", Utc::now().timestamp_millis())
    }

    // ─── Core operations ──────────────────────────────────────────────

    /// Opens a loop: notifies every target agent through the context
    /// store, registers the loop, and pauses the workflow for
    /// destructive severities. Returns the loop id.
    pub fn trigger(&self, config: TriggerConfig) -> Result<String, CoreError> {
        if config.source.is_empty() {
            return Err(CoreError::MissingTriggerField("source"));
        }
        if config.targets.is_empty() {
            return Err(CoreError::MissingTriggerField("targets"));
        }
        if config.description.is_empty() {
            return Err(CoreError::MissingTriggerField("description"));
        }

        let id = self.next_id("loop");
        let mut record = FeedbackLoop {
            id: id.clone(),
            triggered_at: Utc::now(),
            source_agent: config.source,
            target_agents: config.targets,
            issue_type: config.issue_type,
            severity: config.severity,
            description: config.description,
            details: config.details,
            options: config.options,
            status: LoopStatus::Pending,
            state: LoopState::Notifying,
            notifications_sent: Vec::new(),
            responses: Vec::new(),
            resolution: None,
            resolved_at: None,
            duration_ms: None,
            escalation_count: 0,
            escalation_reason: None,
        };
        info!(
            "[Feedback] Loop {id} triggered: {} -> {:?} ({}, {})",
            record.source_agent, record.target_agents, record.issue_type, record.severity
        );

        self.notify_agents(&mut record)?;
        let record_value = to_loop_value(&record)?;
        self.inner_guard().active.insert(id.clone(), record.clone());
        self.store.push("feedback_loops", record_value.clone())?;
        self.events.emit(EngineEvent::new(
            EngineEventType::LoopTriggered,
            self.session_id.as_str(),
            record_value,
        ));

        if record.severity.pauses_workflow() {
            self.pause_workflow(&id, &format!("{} issue detected", record.severity))?;
        }
        Ok(id)
    }

    /// Delivers one notification per target into
    /// `agent_contexts.<target>.feedback_received`, then parks the loop
    /// in `WAITING_RESPONSE`.
    fn notify_agents(&self, record: &mut FeedbackLoop) -> Result<(), CoreError> {
        record.state = LoopState::Notifying;
        for target in &record.target_agents {
            let notification_id = self.next_id("notif");
            let notification = json!({
                "id": notification_id,
                "loop_id": record.id,
                "from_agent": record.source_agent,
                "to_agent": target,
                "type": record.issue_type,
                "severity": record.severity,
                "message": record.description,
                "details": record.details,
                "options": record.options,
                "timestamp": Utc::now().to_rfc3339(),
                "acknowledged": false,
                "resolved": false,
            });
            self.store.push(
                &format!("agent_contexts.{target}.feedback_received"),
                notification,
            )?;
            record.notifications_sent.push(notification_id);
            debug!("[Feedback] Notified {target} about loop {}", record.id);
        }
        record.state = LoopState::WaitingResponse;
        Ok(())
    }

    /// Records a target agent's acknowledgment and moves the loop to
    /// `RESOLVING`. Does not resolve it.
    pub fn acknowledge(
        &self,
        loop_id: &str,
        agent: &str,
        ack: Acknowledgment,
    ) -> Result<(), CoreError> {
        let mut inner = self.inner_guard();
        let record = inner
            .active
            .get_mut(loop_id)
            .ok_or_else(|| CoreError::LoopNotFound(loop_id.to_string()))?;
        info!("[Feedback] {agent} acknowledged loop {loop_id}");
        record.responses.push(LoopResponse {
            agent: agent.to_string(),
            acknowledged_at: Utc::now(),
            message: ack.message,
            action: ack.action,
            eta: ack.eta,
        });
        record.state = LoopState::Resolving;
        Ok(())
    }

    /// Closes the loop: stamps the resolution, marks every delivered
    /// notification resolved, moves the loop out of the active set, and
    /// resumes the workflow if it was paused. Resolving an unknown or
    /// already-resolved loop is an error.
    pub fn resolve(&self, loop_id: &str, resolution: Value) -> Result<Value, CoreError> {
        let mut inner = self.inner_guard();
        let Some(mut record) = inner.active.remove(loop_id) else {
            return Err(if inner.resolved.iter().any(|l| l.id == loop_id) {
                CoreError::LoopAlreadyResolved(loop_id.to_string())
            } else {
                CoreError::LoopNotFound(loop_id.to_string())
            });
        };

        let now = Utc::now();
        record.status = LoopStatus::Resolved;
        record.state = LoopState::Resolved;
        record.resolution = Some(resolution.clone());
        record.resolved_at = Some(now);
        record.duration_ms = Some((now - record.triggered_at).num_milliseconds().max(0) as u64);
        info!(
            "[Feedback] Loop {loop_id} resolved after {}ms",
            record.duration_ms.unwrap_or(0)
        );

        for target in &record.target_agents {
            let path = format!("agent_contexts.{target}.feedback_received");
            if let Some(Value::Array(mut entries)) = self.store.get(&path) {
                let mut changed = false;
                for entry in entries.iter_mut() {
                    if entry.get("loop_id").and_then(Value::as_str) == Some(loop_id) {
                        entry["resolved"] = json!(true);
                        entry["resolution"] = resolution.clone();
                        changed = true;
                    }
                }
                if changed {
                    self.store.set(&path, Value::Array(entries))?;
                }
            }
        }

        let record_value = to_loop_value(&record)?;
        if let Some(Value::Array(mut loops)) = self.store.get("feedback_loops") {
            if let Some(slot) = loops
                .iter_mut()
                .find(|l| l.get("id").and_then(Value::as_str) == Some(loop_id))
            {
                *slot = record_value.clone();
                self.store.set("feedback_loops", Value::Array(loops))?;
            }
        }

        if is_paused(&self.store) {
            self.resume_workflow(loop_id)?;
        }

        inner.resolved.push(record);
        drop(inner);
        self.events.emit(EngineEvent::new(
            EngineEventType::LoopResolved,
            self.session_id.as_str(),
            record_value,
        ));
        Ok(resolution)
    }

    /// Bumps the loop's escalation counter. Below the cap the targets
    /// are re-notified and the loop waits again; at the cap the
    /// workflow is paused for manual intervention (once — an already
    /// paused workflow is left alone).
    pub fn escalate(&self, loop_id: &str, reason: &str) -> Result<(), CoreError> {
        let mut inner = self.inner_guard();
        let record = inner
            .active
            .get_mut(loop_id)
            .ok_or_else(|| CoreError::LoopNotFound(loop_id.to_string()))?;

        record.escalation_count += 1;
        record.status = LoopStatus::Escalated;
        record.state = LoopState::Escalating;
        record.escalation_reason = Some(reason.to_string());
        self.escalations.fetch_add(1, Ordering::Relaxed);
        warn!(
            "[Feedback] Escalating loop {loop_id} (count {}): {reason}",
            record.escalation_count
        );

        if record.escalation_count >= self.config.max_escalations {
            if !is_paused(&self.store) {
                self.pause_workflow(
                    loop_id,
                    &format!(
                        "Escalation limit reached for loop {loop_id}; manual intervention required"
                    ),
                )?;
            }
        } else {
            self.notify_agents(record)?;
        }

        let record_value = to_loop_value(record)?;
        drop(inner);
        self.events.emit(EngineEvent::new(
            EngineEventType::LoopEscalated,
            self.session_id.as_str(),
            record_value,
        ));
        Ok(())
    }

    /// Polls until the loop resolves, or escalates with reason
    /// `"timeout"` and fails once the window elapses. `timeout` falls
    /// back to the engine's configured resolution timeout.
    pub async fn wait_for_resolution(
        &self,
        loop_id: &str,
        timeout: Option<Duration>,
    ) -> Result<Value, CoreError> {
        {
            let inner = self.inner_guard();
            if !inner.active.contains_key(loop_id) {
                return inner
                    .resolved
                    .iter()
                    .find(|l| l.id == loop_id)
                    .map(|l| l.resolution.clone().unwrap_or(Value::Null))
                    .ok_or_else(|| CoreError::LoopNotFound(loop_id.to_string()));
            }
        }

        let window = timeout.unwrap_or(self.config.resolution_timeout);
        let deadline = tokio::time::Instant::now() + window;
        info!(
            "[Feedback] Waiting up to {}ms for resolution of loop {loop_id}",
            window.as_millis()
        );
        loop {
            {
                let inner = self.inner_guard();
                if let Some(record) = inner.resolved.iter().find(|l| l.id == loop_id) {
                    return Ok(record.resolution.clone().unwrap_or(Value::Null));
                }
                if !inner.active.contains_key(loop_id) {
                    return Err(CoreError::Internal(format!(
                        "feedback loop {loop_id} left the active set without a resolution"
                    )));
                }
            }
            if tokio::time::Instant::now() >= deadline {
                self.escalate(loop_id, "timeout")?;
                return Err(CoreError::Timeout(
                    window.as_millis() as u64,
                    format!("resolution of feedback loop {loop_id}"),
                ));
            }
            sleep(self.config.poll_interval).await;
        }
    }

    // ─── Workflow control ─────────────────────────────────────────────

    pub fn pause_workflow(&self, loop_id: &str, reason: &str) -> Result<(), CoreError> {
        warn!("[Feedback] Pausing workflow: {reason}");
        self.store.set("workflow_state.paused", json!(true))?;
        self.store.set("workflow_state.pause_reason", json!(reason))?;
        self.store.set("workflow_state.paused_by_loop", json!(loop_id))?;
        self.events.emit(EngineEvent::new(
            EngineEventType::WorkflowPaused,
            self.session_id.as_str(),
            json!({"loop_id": loop_id, "reason": reason}),
        ));
        Ok(())
    }

    pub fn resume_workflow(&self, loop_id: &str) -> Result<(), CoreError> {
        info!("[Feedback] Resuming workflow (loop {loop_id} resolved)");
        self.store.set("workflow_state.paused", json!(false))?;
        self.store.set("workflow_state.pause_reason", Value::Null)?;
        self.store.set("workflow_state.paused_by_loop", Value::Null)?;
        self.events.emit(EngineEvent::new(
            EngineEventType::WorkflowResumed,
            self.session_id.as_str(),
            json!({"loop_id": loop_id}),
        ));
        Ok(())
    }

    // ─── Specialized triggers ─────────────────────────────────────────

    /// Implementation constraint discovered downstream: developer
    /// raises a blocking loop back to architect and pm.
    pub fn backpropagate_constraint(
        &self,
        requirement_id: &str,
        constraint: &str,
    ) -> Result<String, CoreError> {
        self.trigger(
            TriggerConfig::new("developer", IssueType::ConstraintViolation)
                .with_targets(["architect", "pm"])
                .with_severity(Severity::Blocking)
                .with_description(format!(
                    "Implementation constraint discovered: {constraint}"
                ))
                .with_details(json!({
                    "requirement_id": requirement_id,
                    "constraint": constraint,
                })),
        )
    }

    /// A downstream validation found an upstream artifact wanting
    /// (architect review of a PRD, qa review of an implementation).
    pub fn validation_failure(
        &self,
        source: &str,
        target: &str,
        requirement_id: &str,
        finding: &str,
    ) -> Result<String, CoreError> {
        self.trigger(
            TriggerConfig::new(source, IssueType::ValidationFailure)
                .with_targets([target])
                .with_description(format!("Validation failed: {finding}"))
                .with_details(json!({
                    "requirement_id": requirement_id,
                    "finding": finding,
                })),
        )
    }

    /// Two agents disagree on the same field; the orchestrator asks
    /// them to reconcile.
    pub fn report_inconsistency<I, S>(
        &self,
        agents: I,
        field: &str,
        values: Value,
    ) -> Result<String, CoreError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let agents: Vec<String> = agents.into_iter().map(Into::into).collect();
        self.trigger(
            TriggerConfig::new("orchestrator", IssueType::Inconsistency)
                .with_targets(agents.clone())
                .with_severity(Severity::Warning)
                .with_description(format!("Inconsistency detected in {field}"))
                .with_details(json!({
                    "field": field,
                    "values": values,
                    "agents": agents,
                })),
        )
    }

    /// A quality gate came in under threshold; qa routes the gap to the
    /// agents who own the output.
    pub fn quality_gate_failure<I, S>(
        &self,
        gate_name: &str,
        threshold: f64,
        actual: f64,
        affected: I,
    ) -> Result<String, CoreError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.trigger(
            TriggerConfig::new("qa", IssueType::QualityGateFailure)
                .with_targets(affected)
                .with_description(format!("Quality gate failed: {gate_name}"))
                .with_details(json!({
                    "gate_name": gate_name,
                    "threshold": threshold,
                    "actual": actual,
                    "gap": threshold - actual,
                })),
        )
    }

    // ─── Monitoring ───────────────────────────────────────────────────

    pub fn active_loops(&self) -> Vec<FeedbackLoop> {
        self.inner_guard().active.values().cloned().collect()
    }

    pub fn resolved_loops(&self) -> Vec<FeedbackLoop> {
        self.inner_guard().resolved.clone()
    }

    /// Active or resolved, by id.
    pub fn get_loop(&self, loop_id: &str) -> Option<FeedbackLoop> {
        let inner = self.inner_guard();
        inner
            .active
            .get(loop_id)
            .cloned()
            .or_else(|| inner.resolved.iter().find(|l| l.id == loop_id).cloned())
    }

    pub fn statistics(&self) -> FeedbackStats {
        let inner = self.inner_guard();
        let mut by_type: BTreeMap<String, u64> = BTreeMap::new();
        let mut by_severity: BTreeMap<String, u64> = BTreeMap::new();
        for record in inner.active.values().chain(inner.resolved.iter()) {
            *by_type.entry(record.issue_type.as_str().to_string()).or_default() += 1;
            *by_severity
                .entry(record.severity.as_str().to_string())
                .or_default() += 1;
        }
        FeedbackStats {
            active: inner.active.len(),
            resolved: inner.resolved.len(),
            total: inner.active.len() + inner.resolved.len(),
            escalations: self.escalations.load(Ordering::Relaxed),
            by_type,
            by_severity,
        }
    }
}

fn to_loop_value(record: &FeedbackLoop) -> Result<Value, CoreError> {
    serde_json::to_value(record)
        .map_err(|e| CoreError::Internal(format!("serialize feedback loop: {e}")))
}

fn is_paused(store: &ContextStore) -> bool {
    store
        .get("workflow_state.paused")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}
