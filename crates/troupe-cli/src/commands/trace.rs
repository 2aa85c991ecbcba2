//! `troupe trace` — inspect persisted execution traces.

use chrono::{DateTime, Utc};

use troupe_core::storage::SessionStorage;
use troupe_core::trace::{EntryStatus, TraceStatus};

use super::{describe, print_json, storage_root, truncate};

/// Show the trace for one session.
pub async fn show(session_id: &str, json: bool, storage_dir: Option<&str>) -> Result<(), String> {
    let storage = SessionStorage::new(storage_root(storage_dir));
    let trace = storage
        .load_trace(session_id)
        .await
        .map_err(describe)?
        .ok_or_else(|| {
            format!(
                "no trace for session '{}' under '{}'",
                session_id,
                storage.root().display()
            )
        })?;

    if json {
        let value = serde_json::to_value(&trace).map_err(|e| e.to_string())?;
        print_json(&value);
        return Ok(());
    }

    let status = match trace.status {
        TraceStatus::Running => "running",
        TraceStatus::Completed => "completed",
        TraceStatus::Failed => "failed",
    };
    println!("📊 {} — {} [{}]", trace.session_id, trace.workflow, status);
    println!("   project: {}", trace.project);
    println!("   started: {}", fmt_time(&trace.started_at));
    if let Some(finished) = &trace.finished_at {
        println!("   finished: {}", fmt_time(finished));
    }
    println!("   steps: {}/{}", trace.entries.len(), trace.total_steps);
    println!();

    println!("┌──────┬──────────────┬──────────────────────────┬───────────┬──────────┬─────────┐");
    println!("│ Step │ Agent        │ Action                   │ Status    │ Duration │ Quality │");
    println!("├──────┼──────────────┼──────────────────────────┼───────────┼──────────┼─────────┤");
    for entry in &trace.entries {
        let status = match entry.status {
            EntryStatus::Completed => "completed",
            EntryStatus::Failed => "failed",
            EntryStatus::Skipped => "skipped",
        };
        let quality = entry
            .quality_score
            .map(|q| format!("{:.2}", q))
            .unwrap_or_else(|| "—".to_string());
        println!(
            "│ {:>4} │ {:<12} │ {:<24} │ {:<9} │ {:>6}ms │ {:>7} │",
            entry.step,
            truncate(&entry.agent, 12),
            truncate(&entry.action, 24),
            status,
            entry.duration_ms,
            quality,
        );
    }
    println!("└──────┴──────────────┴──────────────────────────┴───────────┴──────────┴─────────┘");

    for entry in &trace.entries {
        if let Some(error) = &entry.error {
            println!("  ❌ step {}: {}", entry.step, error);
        }
    }
    Ok(())
}

/// List sessions that have persisted state under the storage root.
pub async fn sessions(storage_dir: Option<&str>) -> Result<(), String> {
    let storage = SessionStorage::new(storage_root(storage_dir));
    let mut sessions = storage.list_sessions().await.map_err(describe)?;
    if sessions.is_empty() {
        println!("No sessions under '{}'", storage.root().display());
        return Ok(());
    }
    sessions.sort();
    for session in sessions {
        println!("{}", session);
    }
    Ok(())
}

fn fmt_time(t: &DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}
