//! Session persistence under one storage root.
//!
//! Layout:
//!
//! ```text
//! .troupe/
//!   sessions/<session_id>/context.json    final or failure-time context
//!   sessions/<session_id>/failure.json    failure snapshot, when a run aborts
//!   sessions/<session_id>/artifacts/...   rendered artifact files
//!   traces/<session_id>.json              execution trace
//!   gates/<workflow>/step-<n>.json        gate records
//! ```
//!
//! Directories are created on first write; reads of absent files return
//! `None` rather than erroring.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tracing::{debug, info};

use crate::error::CoreError;
use crate::gate::GateRecord;
use crate::trace::ExecutionTrace;

/// Everything worth keeping when a run aborts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureSnapshot {
    pub session_id: String,
    pub workflow: String,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery: Option<String>,
    pub context: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SessionStorage {
    root: PathBuf,
}

impl SessionStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Project-local `.troupe/`, falling back to the home directory when
    /// there is no working directory to speak of.
    pub fn default_root() -> PathBuf {
        std::env::current_dir()
            .ok()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".troupe")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join("sessions").join(sanitize(session_id))
    }

    pub fn context_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("context.json")
    }

    pub fn failure_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("failure.json")
    }

    pub fn trace_path(&self, session_id: &str) -> PathBuf {
        self.root
            .join("traces")
            .join(format!("{}.json", sanitize(session_id)))
    }

    pub fn gate_path(&self, workflow: &str, step: u32) -> PathBuf {
        self.root
            .join("gates")
            .join(sanitize(workflow))
            .join(format!("step-{step}.json"))
    }

    // ── Context ──────────────────────────────────────────────────────────

    pub async fn save_context(
        &self,
        session_id: &str,
        context: &Value,
    ) -> Result<PathBuf, CoreError> {
        self.write_json(self.context_path(session_id), context).await
    }

    pub async fn load_context(&self, session_id: &str) -> Result<Option<Value>, CoreError> {
        self.read_json(self.context_path(session_id)).await
    }

    // ── Failure snapshots ────────────────────────────────────────────────

    pub async fn save_failure(&self, snapshot: &FailureSnapshot) -> Result<PathBuf, CoreError> {
        info!(
            "[Storage] Persisting failure snapshot for session {}",
            snapshot.session_id
        );
        self.write_json(self.failure_path(&snapshot.session_id), snapshot)
            .await
    }

    pub async fn load_failure(
        &self,
        session_id: &str,
    ) -> Result<Option<FailureSnapshot>, CoreError> {
        self.read_json(self.failure_path(session_id)).await
    }

    // ── Traces ───────────────────────────────────────────────────────────

    pub async fn save_trace(&self, trace: &ExecutionTrace) -> Result<PathBuf, CoreError> {
        self.write_json(self.trace_path(&trace.session_id), trace).await
    }

    pub async fn load_trace(
        &self,
        session_id: &str,
    ) -> Result<Option<ExecutionTrace>, CoreError> {
        self.read_json(self.trace_path(session_id)).await
    }

    // ── Gate records ─────────────────────────────────────────────────────

    pub async fn save_gate_record(
        &self,
        workflow: &str,
        step: u32,
        record: &GateRecord,
    ) -> Result<PathBuf, CoreError> {
        self.write_json(self.gate_path(workflow, step), record).await
    }

    pub async fn load_gate_record(
        &self,
        workflow: &str,
        step: u32,
    ) -> Result<Option<GateRecord>, CoreError> {
        self.read_json(self.gate_path(workflow, step)).await
    }

    // ── Artifacts ────────────────────────────────────────────────────────

    /// Writes a rendered artifact under the session's artifacts dir.
    /// `rel_path` may contain sub-directories.
    pub async fn save_artifact(
        &self,
        session_id: &str,
        rel_path: &str,
        contents: &str,
    ) -> Result<PathBuf, CoreError> {
        let path = self.session_dir(session_id).join("artifacts").join(rel_path);
        self.ensure_parent(&path).await?;
        fs::write(&path, contents)
            .await
            .map_err(|e| CoreError::Storage(format!("write {}: {e}", path.display())))?;
        debug!("[Storage] Artifact written to {}", path.display());
        Ok(path)
    }

    pub async fn list_sessions(&self) -> Result<Vec<String>, CoreError> {
        let dir = self.root.join("sessions");
        let mut sessions = Vec::new();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(sessions),
            Err(e) => return Err(CoreError::Storage(format!("read {}: {e}", dir.display()))),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CoreError::Storage(format!("read {}: {e}", dir.display())))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| CoreError::Storage(format!("stat {}: {e}", dir.display())))?;
            if file_type.is_dir() {
                sessions.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        sessions.sort();
        Ok(sessions)
    }

    // ── Internals ────────────────────────────────────────────────────────

    async fn ensure_parent(&self, path: &Path) -> Result<(), CoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| CoreError::Storage(format!("mkdir {}: {e}", parent.display())))?;
        }
        Ok(())
    }

    async fn write_json<T: Serialize>(
        &self,
        path: PathBuf,
        value: &T,
    ) -> Result<PathBuf, CoreError> {
        self.ensure_parent(&path).await?;
        let json = serde_json::to_string_pretty(value)
            .map_err(|e| CoreError::Storage(format!("serialize {}: {e}", path.display())))?;
        fs::write(&path, json)
            .await
            .map_err(|e| CoreError::Storage(format!("write {}: {e}", path.display())))?;
        debug!("[Storage] Wrote {}", path.display());
        Ok(path)
    }

    async fn read_json<T: for<'de> Deserialize<'de>>(
        &self,
        path: PathBuf,
    ) -> Result<Option<T>, CoreError> {
        let raw = match fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CoreError::Storage(format!("read {}: {e}", path.display()))),
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| CoreError::Storage(format!("parse {}: {e}", path.display())))
    }
}

/// Keeps ids and workflow names path-safe.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect()
}
