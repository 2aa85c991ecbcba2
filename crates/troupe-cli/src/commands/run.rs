//! `troupe run` — execute a workflow YAML end to end.

use std::collections::HashMap;
use std::path::Path;

use serde_json::Value;

use troupe_core::agents::AgentRegistry;
use troupe_core::config::EngineConfig;
use troupe_core::events::EngineEventType;
use troupe_core::metrics::TelemetryStore;
use troupe_core::workflow::{WorkflowDefinition, WorkflowExecutor};

use super::{describe, metrics_db_path};

/// Run a workflow from a YAML file.
pub async fn run(
    workflow_file: &str,
    project: Option<&str>,
    agents_dir: Option<&str>,
    schemas_dir: Option<&str>,
    storage_dir: Option<&str>,
) -> Result<(), String> {
    let definition = WorkflowDefinition::from_file(workflow_file).map_err(describe)?;
    tracing::info!("[Run] Loaded workflow '{}' from '{}'", definition.name, workflow_file);

    println!("📄 Loaded workflow: {} ({})", definition.name, workflow_file);
    println!("   {} agent step(s)", definition.total_agent_steps());

    let mut executor = WorkflowExecutor::new(definition);

    if let Some(name) = project {
        executor = executor.with_project_name(name);
    }
    if let Some(dir) = storage_dir {
        executor = executor.with_config(EngineConfig::default().with_storage_root(dir));
    }
    if let Some(dir) = agents_dir {
        let mut registry = AgentRegistry::builtin();
        let count = registry.load_overrides(Path::new(dir)).map_err(describe)?;
        println!("   {} persona override(s) from '{}'", count, dir);
        executor = executor.with_registry(registry);
    }
    if let Some(dir) = schemas_dir {
        let schemas = load_schemas(Path::new(dir))?;
        println!("   {} output schema(s) from '{}'", schemas.len(), dir);
        executor = executor.with_schemas(schemas);
    }

    let telemetry = TelemetryStore::open(&metrics_db_path(storage_dir)).map_err(describe)?;
    executor = executor.with_telemetry(telemetry.clone());

    let session_id = executor.initialize().map_err(describe)?;
    println!("🎬 Session {}", session_id);
    println!();

    // Echo step progress from the event bus while the run is in flight.
    let mut events = executor.events().subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event.event_type {
                EngineEventType::StepCompleted => {
                    let step = event.data.get("step").and_then(Value::as_u64).unwrap_or(0);
                    let agent = event.data.get("agent").and_then(Value::as_str).unwrap_or("?");
                    println!("  ✅ step {} ({})", step, agent);
                }
                EngineEventType::StepFailed => {
                    let step = event.data.get("step").and_then(Value::as_u64).unwrap_or(0);
                    let agent = event.data.get("agent").and_then(Value::as_str).unwrap_or("?");
                    let error = event.data.get("error").and_then(Value::as_str).unwrap_or("");
                    println!("  ❌ step {} ({}): {}", step, agent, error);
                }
                _ => {}
            }
        }
    });

    let outcome = executor.execute().await;
    printer.abort();

    let outcome = outcome.map_err(describe)?;

    println!();
    println!("🎉 Workflow completed in {}ms", outcome.duration_ms);
    match telemetry.session_summary(&outcome.session_id).await {
        Ok(summary) => println!(
            "   {} step(s) recorded, {} in / {} out tokens, ${:.4}",
            summary.steps, summary.input_tokens, summary.output_tokens, summary.cost_usd
        ),
        Err(err) => tracing::warn!("[Run] Telemetry summary unavailable: {}", err),
    }
    println!("   Trace: troupe trace show {}", outcome.session_id);
    Ok(())
}

/// Load every `*.json` in the directory as a schema keyed by file stem.
fn load_schemas(dir: &Path) -> Result<HashMap<String, Value>, String> {
    let mut schemas = HashMap::new();
    let entries = std::fs::read_dir(dir)
        .map_err(|e| format!("failed to read schemas dir '{}': {e}", dir.display()))?;
    for entry in entries {
        let path = entry.map_err(|e| e.to_string())?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let name = match path.file_stem().and_then(|s| s.to_str()) {
            Some(name) => name.to_string(),
            None => continue,
        };
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| format!("failed to read '{}': {e}", path.display()))?;
        let schema = serde_json::from_str(&raw)
            .map_err(|e| format!("failed to parse '{}': {e}", path.display()))?;
        schemas.insert(name, schema);
    }
    Ok(schemas)
}
