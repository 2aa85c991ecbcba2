//! `troupe metrics` — query the step telemetry database.

use troupe_core::metrics::TelemetryStore;

use super::{describe, metrics_db_path, truncate};

fn open_store(storage_dir: Option<&str>) -> Result<TelemetryStore, String> {
    TelemetryStore::open(&metrics_db_path(storage_dir)).map_err(describe)
}

/// Token and cost rollup for one session.
pub async fn session(session_id: &str, storage_dir: Option<&str>) -> Result<(), String> {
    let store = open_store(storage_dir)?;
    let summary = store.session_summary(session_id).await.map_err(describe)?;

    println!("📈 {}", summary.session_id);
    println!("   steps:    {}", summary.steps);
    println!(
        "   tokens:   {} in / {} out",
        summary.input_tokens, summary.output_tokens
    );
    println!("   cost:     ${:.4}", summary.cost_usd);
    if let Some(quality) = summary.avg_quality {
        println!("   quality:  {:.2}", quality);
    }
    println!("   duration: {}ms", summary.total_duration_ms);
    Ok(())
}

/// Most recent step records for one session.
pub async fn steps(session_id: &str, limit: u32, storage_dir: Option<&str>) -> Result<(), String> {
    let store = open_store(storage_dir)?;
    let rows = store
        .recent_steps(session_id, limit)
        .await
        .map_err(describe)?;
    if rows.is_empty() {
        println!("No step records for session '{}'", session_id);
        return Ok(());
    }

    println!("┌──────┬──────────────┬──────────────────┬──────────┬──────────┬──────────┐");
    println!("│ Step │ Agent        │ Model            │ Tok in   │ Tok out  │ Cost     │");
    println!("├──────┼──────────────┼──────────────────┼──────────┼──────────┼──────────┤");
    for row in &rows {
        println!(
            "│ {:>4} │ {:<12} │ {:<16} │ {:>8} │ {:>8} │ {:>8} │",
            row.step,
            truncate(&row.agent, 12),
            truncate(&row.model, 16),
            row.input_tokens,
            row.output_tokens,
            format!("${:.4}", row.cost_usd()),
        );
    }
    println!("└──────┴──────────────┴──────────────────┴──────────┴──────────┴──────────┘");
    Ok(())
}

/// Cost rollup across all sessions, most recently active first.
pub async fn costs(storage_dir: Option<&str>) -> Result<(), String> {
    let store = open_store(storage_dir)?;
    let rows = store.session_costs().await.map_err(describe)?;
    if rows.is_empty() {
        println!("No recorded sessions");
        return Ok(());
    }

    println!("┌────────────────────────────────────────────┬───────┬──────────┐");
    println!("│ Session                                    │ Steps │ Cost     │");
    println!("├────────────────────────────────────────────┼───────┼──────────┤");
    for row in &rows {
        println!(
            "│ {:<42} │ {:>5} │ {:>8} │",
            truncate(&row.session_id, 42),
            row.steps,
            format!("${:.4}", row.cost_usd),
        );
    }
    println!("└────────────────────────────────────────────┴───────┴──────────┘");
    Ok(())
}
