//! CLI command implementations.
//!
//! Each submodule corresponds to a top-level CLI command and reuses
//! the troupe-core domain logic. Commands return `Err(String)` for
//! anything main() should print and exit non-zero on.

pub mod agents;
pub mod gate;
pub mod lint;
pub mod metrics;
pub mod render;
pub mod run;
pub mod trace;

use std::path::PathBuf;

use troupe_core::error::CoreError;
use troupe_core::storage::SessionStorage;

/// Resolve the storage root: explicit flag/env first, then the
/// platform default.
pub fn storage_root(dir: Option<&str>) -> PathBuf {
    dir.map(PathBuf::from)
        .unwrap_or_else(SessionStorage::default_root)
}

/// The telemetry database lives alongside sessions/ and traces/.
pub fn metrics_db_path(dir: Option<&str>) -> PathBuf {
    storage_root(dir).join("metrics.sqlite")
}

/// Format a core error for the terminal, appending the recovery hint
/// when the error carries one.
pub fn describe(e: CoreError) -> String {
    match e.recovery() {
        Some(hint) => format!("{e}\n  hint: {hint}"),
        None => e.to_string(),
    }
}

/// Read and parse a JSON file.
pub fn read_json(path: &str) -> Result<serde_json::Value, String> {
    let raw =
        std::fs::read_to_string(path).map_err(|e| format!("failed to read '{path}': {e}"))?;
    serde_json::from_str(&raw).map_err(|e| format!("failed to parse '{path}': {e}"))
}

/// Pretty-print a JSON value to stdout.
pub fn print_json(value: &serde_json::Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}

pub fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        format!("{}…", &s[..max.saturating_sub(1)])
    }
}
