//! Per-session execution traces.
//!
//! One trace file accumulates a log entry per executed step: who ran,
//! how long it took, what it produced, and how validation went. The
//! trace is load-or-initialize — the pipeline appends to whatever is
//! already on disk for the session, so parallel group members land in
//! one file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::gate::GateStatus;

/// Bumped when the trace file shape changes.
pub const TRACE_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationSummary {
    pub status: GateStatus,
    pub error_count: usize,
}

/// One executed (or skipped) step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceEntry {
    pub timestamp: DateTime<Utc>,
    pub step: u32,
    pub agent: String,
    pub action: String,
    pub status: EntryStatus,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TraceEntry {
    pub fn new(step: u32, agent: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            step,
            agent: agent.into(),
            action: "execute_step".to_string(),
            status: EntryStatus::Completed,
            duration_ms: 0,
            quality_score: None,
            artifacts: Vec::new(),
            validation: None,
            error: None,
        }
    }

    pub fn with_status(mut self, status: EntryStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_quality_score(mut self, score: f64) -> Self {
        self.quality_score = Some(score);
        self
    }

    pub fn with_artifacts(mut self, artifacts: Vec<String>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn with_validation(mut self, status: GateStatus, error_count: usize) -> Self {
        self.validation = Some(ValidationSummary {
            status,
            error_count,
        });
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// The whole per-session trace document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionTrace {
    pub version: String,
    pub session_id: String,
    pub workflow: String,
    pub project: String,
    pub status: TraceStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub total_steps: u32,
    #[serde(default)]
    pub entries: Vec<TraceEntry>,
}

impl ExecutionTrace {
    pub fn new(
        session_id: impl Into<String>,
        workflow: impl Into<String>,
        project: impl Into<String>,
        total_steps: u32,
    ) -> Self {
        Self {
            version: TRACE_VERSION.to_string(),
            session_id: session_id.into(),
            workflow: workflow.into(),
            project: project.into(),
            status: TraceStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            total_steps,
            entries: Vec::new(),
        }
    }

    /// Appends an entry and flips the trace to completed once every
    /// workflow step has a completed entry.
    pub fn record(&mut self, entry: TraceEntry) {
        self.entries.push(entry);
        if self.status == TraceStatus::Running
            && self.completed_steps() >= self.total_steps as usize
        {
            self.finish(TraceStatus::Completed);
        }
    }

    /// Distinct steps with a completed entry.
    pub fn completed_steps(&self) -> usize {
        let mut steps: Vec<u32> = self
            .entries
            .iter()
            .filter(|e| e.status == EntryStatus::Completed)
            .map(|e| e.step)
            .collect();
        steps.sort_unstable();
        steps.dedup();
        steps.len()
    }

    pub fn finish(&mut self, status: TraceStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_builder_chain() {
        let entry = TraceEntry::new(3, "developer")
            .with_status(EntryStatus::Completed)
            .with_duration_ms(120)
            .with_quality_score(0.9)
            .with_artifacts(vec!["src/login.ts".into()])
            .with_validation(GateStatus::Fixed, 0);
        assert_eq!(entry.step, 3);
        assert_eq!(entry.duration_ms, 120);
        assert_eq!(entry.validation.unwrap().status, GateStatus::Fixed);
    }

    #[test]
    fn test_trace_completes_when_every_step_has_completed_entry() {
        let mut trace = ExecutionTrace::new("s-1", "greenfield", "demo", 2);
        trace.record(TraceEntry::new(1, "analyst"));
        assert_eq!(trace.status, TraceStatus::Running);
        // A failed entry for step 2 does not complete the trace.
        trace.record(TraceEntry::new(2, "pm").with_status(EntryStatus::Failed));
        assert_eq!(trace.status, TraceStatus::Running);
        trace.record(TraceEntry::new(2, "pm"));
        assert_eq!(trace.status, TraceStatus::Completed);
        assert!(trace.finished_at.is_some());
    }

    #[test]
    fn test_duplicate_step_entries_count_once() {
        let mut trace = ExecutionTrace::new("s-1", "wf", "demo", 2);
        trace.record(TraceEntry::new(1, "analyst"));
        trace.record(TraceEntry::new(1, "analyst"));
        assert_eq!(trace.completed_steps(), 1);
        assert_eq!(trace.status, TraceStatus::Running);
    }

    #[test]
    fn test_serializes_camel_case() {
        let trace = ExecutionTrace::new("s-1", "wf", "demo", 1);
        let wire = serde_json::to_value(&trace).unwrap();
        assert!(wire.get("sessionId").is_some());
        assert!(wire.get("totalSteps").is_some());
        assert!(wire.get("startedAt").is_some());
    }
}
