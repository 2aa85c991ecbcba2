//! `troupe gate` — validate a document against an output schema.
//!
//! Exit code follows the gate contract: 0 for pass/fixed, 1 for
//! fail/fail_after_fix.

use std::path::Path;

use troupe_core::gate::{self, GateStatus};

use super::{print_json, read_json};

pub async fn run(
    schema_file: &str,
    input_file: &str,
    fix: bool,
    json: bool,
) -> Result<(), String> {
    let schema = read_json(schema_file)?;
    let document = read_json(input_file)?;
    let schema_name = Path::new(schema_file)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("schema")
        .to_string();

    let outcome = gate::check(&schema_name, &schema, &document, fix);
    let record = &outcome.record;

    if json {
        let value = serde_json::to_value(record).map_err(|e| e.to_string())?;
        print_json(&value);
    } else {
        match record.status {
            GateStatus::Pass => println!("✅ {}: pass", schema_name),
            GateStatus::Fixed => {
                println!("🔧 {}: fixed (auto-fix applied, re-validation passed)", schema_name)
            }
            GateStatus::Fail | GateStatus::FailAfterFix => {
                println!("❌ {}: {}", schema_name, record.status);
                for violation in &record.errors {
                    println!("   • {}", violation);
                }
            }
        }
        println!(
            "   {} attempt(s), {} outstanding violation(s)",
            record.attempts.len(),
            record.errors.len()
        );
    }

    if record.status.exit_code() == 0 {
        Ok(())
    } else {
        Err(format!(
            "gate '{}' {}: {} violation(s)",
            schema_name,
            record.status,
            record.errors.len()
        ))
    }
}
