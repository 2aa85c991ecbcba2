//! Validation gate for step outputs.
//!
//! A gate checks an agent's output document against the schema named by
//! the workflow step. When auto-fix is enabled and the first attempt
//! fails, the two safe repairs from [`crate::schema::auto_fix`] are
//! applied and the document is validated once more. Every run produces a
//! [`GateRecord`] suitable for persisting next to the workflow, whether
//! the gate passed or not.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::schema::{self, SchemaViolation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Pass,
    Fail,
    Fixed,
    FailAfterFix,
}

impl GateStatus {
    pub fn passed(self) -> bool {
        matches!(self, GateStatus::Pass | GateStatus::Fixed)
    }

    /// Process exit code contract: 0 for pass/fixed, 1 otherwise.
    pub fn exit_code(self) -> i32 {
        if self.passed() {
            0
        } else {
            1
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GateStatus::Pass => "pass",
            GateStatus::Fail => "fail",
            GateStatus::Fixed => "fixed",
            GateStatus::FailAfterFix => "fail_after_fix",
        }
    }
}

impl std::fmt::Display for GateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateAttempt {
    pub auto_fix_applied: bool,
    pub passed: bool,
    pub errors: Vec<SchemaViolation>,
    pub timestamp: DateTime<Utc>,
}

/// The persisted report of one gate run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateRecord {
    pub status: GateStatus,
    pub attempts: Vec<GateAttempt>,
    /// Violations still outstanding after the final attempt.
    pub errors: Vec<SchemaViolation>,
    /// Name of the schema the document was checked against.
    pub schema: String,
    /// The document as submitted to the gate.
    pub input: Value,
    pub timestamp: DateTime<Utc>,
}

/// Result of a gate run: the record, plus the document to carry forward
/// (auto-fixed when the fix made it pass, otherwise the original).
#[derive(Debug, Clone)]
pub struct GateOutcome {
    pub record: GateRecord,
    pub document: Value,
}

/// Runs the gate. `fix` enables the auto-fix attempt on failure.
pub fn check(schema_name: &str, schema: &Value, document: &Value, fix: bool) -> GateOutcome {
    let mut attempts = Vec::new();
    let first = schema::validate_value(document, schema);
    attempts.push(GateAttempt {
        auto_fix_applied: false,
        passed: first.is_empty(),
        errors: first.clone(),
        timestamp: Utc::now(),
    });

    let (status, errors, outgoing) = if first.is_empty() {
        debug!("[Gate] '{schema_name}' passed on first attempt");
        (GateStatus::Pass, Vec::new(), document.clone())
    } else if !fix {
        warn!(
            "[Gate] '{schema_name}' failed with {} violation(s), auto-fix disabled",
            first.len()
        );
        (GateStatus::Fail, first, document.clone())
    } else {
        let (repaired, _changed) = schema::auto_fix(document, schema);
        let second = schema::validate_value(&repaired, schema);
        attempts.push(GateAttempt {
            auto_fix_applied: true,
            passed: second.is_empty(),
            errors: second.clone(),
            timestamp: Utc::now(),
        });
        if second.is_empty() {
            debug!("[Gate] '{schema_name}' passed after auto-fix");
            (GateStatus::Fixed, Vec::new(), repaired)
        } else {
            warn!(
                "[Gate] '{schema_name}' still failing after auto-fix: {} violation(s)",
                second.len()
            );
            // A half-repaired document is not carried forward.
            (GateStatus::FailAfterFix, second, document.clone())
        }
    };

    GateOutcome {
        record: GateRecord {
            status,
            attempts,
            errors,
            schema: schema_name.to_string(),
            input: document.clone(),
            timestamp: Utc::now(),
        },
        document: outgoing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "type": "object",
            "required": ["title"],
            "additionalProperties": false,
            "properties": {
                "title": { "type": "string", "minLength": 3 }
            }
        })
    }

    #[test]
    fn test_clean_input_passes_with_single_attempt() {
        let outcome = check("brief", &schema(), &json!({"title": "Checkout"}), true);
        assert_eq!(outcome.record.status, GateStatus::Pass);
        assert_eq!(outcome.record.attempts.len(), 1);
        assert!(outcome.record.errors.is_empty());
        assert_eq!(outcome.document, json!({"title": "Checkout"}));
        assert_eq!(outcome.record.status.exit_code(), 0);
    }

    #[test]
    fn test_failure_without_fix_keeps_one_attempt() {
        let outcome = check("brief", &schema(), &json!({"stray": 1}), false);
        assert_eq!(outcome.record.status, GateStatus::Fail);
        assert_eq!(outcome.record.attempts.len(), 1);
        assert_eq!(outcome.record.errors.len(), 2);
        assert_eq!(outcome.record.status.exit_code(), 1);
    }

    #[test]
    fn test_fixable_input_reports_fixed_and_returns_repaired_document() {
        let doc = json!({"title": "  Checkout  ", "stray": true});
        // Untrimmed title passes minLength, but the stray property fails
        // the sealed schema.
        let outcome = check("brief", &schema(), &doc, true);
        assert_eq!(outcome.record.status, GateStatus::Fixed);
        assert_eq!(outcome.record.attempts.len(), 2);
        assert!(outcome.record.attempts[1].auto_fix_applied);
        assert_eq!(outcome.document, json!({"title": "Checkout"}));
        // The record keeps the document as submitted.
        assert_eq!(outcome.record.input, doc);
    }

    #[test]
    fn test_unfixable_input_reports_fail_after_fix_with_original_document() {
        let doc = json!({"title": "ab"});
        let outcome = check("brief", &schema(), &doc, true);
        assert_eq!(outcome.record.status, GateStatus::FailAfterFix);
        assert_eq!(outcome.record.attempts.len(), 2);
        assert!(!outcome.record.errors.is_empty());
        assert_eq!(outcome.document, doc);
        assert_eq!(outcome.record.status.exit_code(), 1);
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let wire = serde_json::to_string(&GateStatus::FailAfterFix).unwrap();
        assert_eq!(wire, "\"fail_after_fix\"");
    }
}
