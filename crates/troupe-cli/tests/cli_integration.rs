//! Integration tests for the troupe-cli commands.
//!
//! These tests exercise the same troupe-core code paths the binary
//! wraps — run, gate, lint, render, trace and metrics — using temp
//! directories for storage isolation.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;

use troupe_core::agents::AgentRegistry;
use troupe_core::config::EngineConfig;
use troupe_core::gate::{self, GateStatus};
use troupe_core::lint::ProjectLinter;
use troupe_core::metrics::TelemetryStore;
use troupe_core::render::RendererRegistry;
use troupe_core::storage::SessionStorage;
use troupe_core::testing::ScriptedRunner;
use troupe_core::trace::TraceStatus;
use troupe_core::workflow::{WorkflowDefinition, WorkflowExecutor};

const TWO_STEP: &str = r#"
name: "brief-then-prd"
sequence:
  - step: 1
    agent: analyst
    description: "Draft the project brief"
  - step: 2
    agent: pm
    description: "Draft the PRD"
    depends_on: [1]
"#;

const SINGLE_STEP: &str = r#"
name: "implement"
sequence:
  - step: 1
    agent: developer
    description: "Implement the feature"
"#;

const UNKNOWN_AGENT_WORKFLOW: &str = r#"
name: "demo"
sequence:
  - step: 1
    agent: wizard
    description: "Conjure the architecture"
"#;

const DEVELOPER_OVERRIDE: &str = r#"
id: developer
name: "Dana"
title: "Staff Engineer"
persona: "You are Dana, a pragmatic staff engineer who ships small, reviewable changes."
principles:
  - "Prefer boring technology"
"#;

fn write_file(dir: &Path, rel: &str, contents: &str) -> PathBuf {
    let path = dir.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create parent dir");
    }
    std::fs::write(&path, contents).expect("write file");
    path
}

#[tokio::test]
async fn test_run_persists_trace_and_session_listing() {
    let dir = TempDir::new().expect("tempdir");
    let workflow = write_file(dir.path(), "workflows/brief.yaml", TWO_STEP);

    let mut executor = WorkflowExecutor::from_file(&workflow)
        .expect("load workflow")
        .with_project_name("Troupe Demo")
        .with_config(EngineConfig::default().with_storage_root(dir.path().join("state")));
    let session_id = executor.initialize().expect("initialize");
    let outcome = executor.execute().await.expect("execute");

    assert!(outcome.success);
    assert_eq!(outcome.session_id, session_id);
    let trace = outcome.trace.expect("trace recorded");
    assert_eq!(trace.status, TraceStatus::Completed);
    assert_eq!(trace.entries.len(), 2);

    // What `troupe trace show` and `troupe trace sessions` read back.
    let storage = SessionStorage::new(dir.path().join("state"));
    let loaded = storage
        .load_trace(&session_id)
        .await
        .expect("load trace")
        .expect("trace saved");
    assert_eq!(loaded.workflow, "brief-then-prd");
    assert_eq!(loaded.entries.len(), 2);

    let sessions = storage.list_sessions().await.expect("list sessions");
    assert!(sessions.contains(&session_id));
}

#[tokio::test]
async fn test_failed_run_leaves_failure_snapshot() {
    let dir = TempDir::new().expect("tempdir");
    let workflow = write_file(dir.path(), "workflows/single.yaml", SINGLE_STEP);
    let runner = ScriptedRunner::new().fail("developer", "model unavailable");

    let mut executor = WorkflowExecutor::from_file(&workflow)
        .expect("load workflow")
        .with_config(EngineConfig::default().with_storage_root(dir.path().join("state")))
        .with_runner(Arc::new(runner));
    let session_id = executor.initialize().expect("initialize");
    let err = executor.execute().await.expect_err("run fails");
    assert!(err.to_string().contains("model unavailable"));

    // What a user inspects after `troupe run` exits non-zero.
    let storage = SessionStorage::new(dir.path().join("state"));
    let snapshot = storage
        .load_failure(&session_id)
        .await
        .expect("load failure")
        .expect("snapshot saved");
    assert_eq!(snapshot.session_id, session_id);
    assert!(snapshot.error.contains("model unavailable"));
}

#[tokio::test]
async fn test_gate_exit_code_contract() {
    let schema = json!({
        "type": "object",
        "required": ["title"],
        "properties": { "title": { "type": "string" } },
        "additionalProperties": false
    });

    let passing = gate::check("project-brief", &schema, &json!({"title": "Brief"}), false);
    assert_eq!(passing.record.status, GateStatus::Pass);
    assert_eq!(passing.record.status.exit_code(), 0);

    let fixable = gate::check(
        "project-brief",
        &schema,
        &json!({"title": "Brief", "draft": true}),
        true,
    );
    assert_eq!(fixable.record.status, GateStatus::Fixed);
    assert_eq!(fixable.record.status.exit_code(), 0);
    assert!(fixable.document.get("draft").is_none());

    let broken = gate::check("project-brief", &schema, &json!({"owner": "pm"}), true);
    assert_eq!(broken.record.status, GateStatus::FailAfterFix);
    assert_eq!(broken.record.status.exit_code(), 1);
    assert!(!broken.record.errors.is_empty());
}

#[tokio::test]
async fn test_lint_flags_unknown_agent() {
    let dir = TempDir::new().expect("tempdir");
    write_file(dir.path(), "workflows/demo.yaml", UNKNOWN_AGENT_WORKFLOW);

    let report = ProjectLinter::new(dir.path()).lint_all().expect("lint");
    assert!(!report.success());
    assert!(report
        .errors
        .iter()
        .any(|issue| issue.message.contains("unknown agent 'wizard'")));
    assert_eq!(report.stats.workflows, 1);
}

#[tokio::test]
async fn test_render_builtin_and_unknown_type() {
    let registry = RendererRegistry::with_builtins();
    let brief = json!({
        "title": "Checkout Revamp",
        "problem_statement": "Cart abandonment is above 70% on mobile.",
        "goals": ["Reduce abandonment", "Speed up checkout"]
    });

    let markdown = registry
        .render("project-brief", &brief)
        .expect("render brief");
    assert!(markdown.contains("# Project Brief: Checkout Revamp"));
    assert!(markdown.contains("Reduce abandonment"));

    let err = registry.render("poem", &brief).expect_err("unknown type");
    assert!(err.to_string().contains("poem"));
    // The CLI lists these when the type is unknown.
    assert!(registry.types().contains(&"project-brief".to_string()));
}

#[tokio::test]
async fn test_agent_overrides_replace_builtins() {
    let dir = TempDir::new().expect("tempdir");
    write_file(dir.path(), "developer.agent.yaml", DEVELOPER_OVERRIDE);

    let mut registry = AgentRegistry::builtin();
    assert_eq!(registry.len(), 6);
    let applied = registry.load_overrides(dir.path()).expect("load overrides");
    assert_eq!(applied, 1);
    assert_eq!(registry.len(), 6);

    let developer = registry.get("developer").expect("developer present");
    assert_eq!(developer.name, "Dana");
    assert_eq!(developer.title, "Staff Engineer");
}

#[tokio::test]
async fn test_metrics_survive_reopen_after_run() {
    let dir = TempDir::new().expect("tempdir");
    let workflow = write_file(dir.path(), "workflows/brief.yaml", TWO_STEP);
    let db_path = dir.path().join("state/metrics.sqlite");

    let mut executor = WorkflowExecutor::from_file(&workflow)
        .expect("load workflow")
        .with_config(EngineConfig::default().with_storage_root(dir.path().join("state")))
        .with_telemetry(TelemetryStore::open(&db_path).expect("open metrics"));
    let session_id = executor.initialize().expect("initialize");
    executor.execute().await.expect("execute");

    // Reopen the database the way `troupe metrics` does.
    let store = TelemetryStore::open(&db_path).expect("reopen metrics");
    let summary = store.session_summary(&session_id).await.expect("summary");
    assert_eq!(summary.steps, 2);
    assert!(summary.input_tokens > 0);

    let costs = store.session_costs().await.expect("costs");
    assert!(costs.iter().any(|c| c.session_id == session_id));
}

#[tokio::test]
async fn test_workflow_definition_rejects_duplicate_ordinals() {
    let yaml = r#"
name: "dup"
sequence:
  - step: 1
    agent: analyst
  - step: 1
    agent: pm
"#;
    let definition = WorkflowDefinition::from_yaml(yaml).expect("parse");
    let err = definition.validate().expect_err("duplicate ordinals");
    assert!(err.to_string().contains("duplicate step"));
}
