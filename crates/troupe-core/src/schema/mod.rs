//! Lightweight JSON-schema-flavoured validation.
//!
//! Supports the ruleset workflow schemas actually use: `type`, `enum`,
//! `required`, `additionalProperties: false`, array `minItems`/`items`,
//! string `minLength`/`maxLength`/`pattern`, and numeric
//! `minimum`/`maximum`. Validation never mutates the candidate value;
//! repairs live in [`auto_fix`] so gate records can report exactly what
//! changed.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One failed rule, located by a dot/bracket path into the candidate value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaViolation {
    pub path: String,
    pub message: String,
}

impl SchemaViolation {
    fn new(path: &str, message: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "`{}`: {}", self.path, self.message)
        }
    }
}

/// Validates `value` against `schema`. An empty vec means the value passed.
pub fn validate_value(value: &Value, schema: &Value) -> Vec<SchemaViolation> {
    let mut out = Vec::new();
    check("", value, schema, &mut out);
    out
}

fn check(path: &str, value: &Value, schema: &Value, out: &mut Vec<SchemaViolation>) {
    let Some(schema) = schema.as_object() else {
        return;
    };

    if let Some(expected) = schema.get("type").and_then(Value::as_str) {
        if !type_matches(expected, value) {
            out.push(SchemaViolation::new(
                path,
                format!("expected {expected}, got {}", json_type_of(value)),
            ));
            return;
        }
    }

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            let options: Vec<String> = allowed.iter().map(render_terse).collect();
            out.push(SchemaViolation::new(
                path,
                format!("expected one of [{}]", options.join(", ")),
            ));
        }
    }

    match value {
        Value::Object(map) => {
            if let Some(required) = schema.get("required").and_then(Value::as_array) {
                for name in required.iter().filter_map(Value::as_str) {
                    if !map.contains_key(name) {
                        out.push(SchemaViolation::new(
                            path,
                            format!("missing required property '{name}'"),
                        ));
                    }
                }
            }

            let properties = schema.get("properties").and_then(Value::as_object);
            let sealed = schema.get("additionalProperties") == Some(&Value::Bool(false));
            for (key, child) in map {
                let child_schema = properties.and_then(|p| p.get(key));
                match child_schema {
                    Some(sub) => check(&join_key(path, key), child, sub, out),
                    None if sealed => out.push(SchemaViolation::new(
                        path,
                        format!("undeclared property '{key}'"),
                    )),
                    None => {}
                }
            }
        }
        Value::Array(items) => {
            if let Some(min) = schema.get("minItems").and_then(Value::as_u64) {
                if (items.len() as u64) < min {
                    out.push(SchemaViolation::new(
                        path,
                        format!("array has {} item(s), minItems is {min}", items.len()),
                    ));
                }
            }
            if let Some(item_schema) = schema.get("items") {
                for (i, item) in items.iter().enumerate() {
                    check(&format!("{path}[{i}]"), item, item_schema, out);
                }
            }
        }
        Value::String(s) => {
            if let Some(min) = schema.get("minLength").and_then(Value::as_u64) {
                if (s.chars().count() as u64) < min {
                    out.push(SchemaViolation::new(
                        path,
                        format!("length {} is below minLength {min}", s.chars().count()),
                    ));
                }
            }
            if let Some(max) = schema.get("maxLength").and_then(Value::as_u64) {
                if (s.chars().count() as u64) > max {
                    out.push(SchemaViolation::new(
                        path,
                        format!("length {} exceeds maxLength {max}", s.chars().count()),
                    ));
                }
            }
            if let Some(pattern) = schema.get("pattern").and_then(Value::as_str) {
                match Regex::new(pattern) {
                    Ok(re) => {
                        if !re.is_match(s) {
                            out.push(SchemaViolation::new(
                                path,
                                format!("does not match pattern '{pattern}'"),
                            ));
                        }
                    }
                    Err(_) => out.push(SchemaViolation::new(
                        path,
                        format!("schema pattern '{pattern}' is not a valid regex"),
                    )),
                }
            }
        }
        Value::Number(n) => {
            let candidate = n.as_f64().unwrap_or(f64::NAN);
            if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
                if candidate < min {
                    out.push(SchemaViolation::new(
                        path,
                        format!("value {candidate} is below minimum {min}"),
                    ));
                }
            }
            if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
                if candidate > max {
                    out.push(SchemaViolation::new(
                        path,
                        format!("value {candidate} exceeds maximum {max}"),
                    ));
                }
            }
        }
        _ => {}
    }
}

/// Applies the two safe repairs: trims string leaves, and drops undeclared
/// properties from objects whose schema sets `additionalProperties: false`.
/// Returns the repaired copy and whether anything actually changed.
pub fn auto_fix(value: &Value, schema: &Value) -> (Value, bool) {
    let mut changed = false;
    let fixed = fix(value, Some(schema), &mut changed);
    (fixed, changed)
}

fn fix(value: &Value, schema: Option<&Value>, changed: &mut bool) -> Value {
    let schema_map = schema.and_then(Value::as_object);
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed != s {
                *changed = true;
            }
            Value::String(trimmed.to_string())
        }
        Value::Object(map) => {
            let properties = schema_map
                .and_then(|m| m.get("properties"))
                .and_then(Value::as_object);
            let sealed =
                schema_map.and_then(|m| m.get("additionalProperties")) == Some(&Value::Bool(false));
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, child) in map {
                let child_schema = properties.and_then(|p| p.get(key));
                if sealed && child_schema.is_none() {
                    *changed = true;
                    continue;
                }
                out.insert(key.clone(), fix(child, child_schema, changed));
            }
            Value::Object(out)
        }
        Value::Array(items) => {
            let item_schema = schema_map.and_then(|m| m.get("items"));
            Value::Array(items.iter().map(|v| fix(v, item_schema, changed)).collect())
        }
        other => other.clone(),
    }
}

/// The JSON type name used in violation messages.
pub fn json_type_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "integer" => matches!(value, Value::Number(n) if n.is_i64() || n.is_u64()),
        "number" => value.is_number(),
        other => json_type_of(value) == other,
    }
}

fn join_key(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

fn render_terse(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn brief_schema() -> Value {
        json!({
            "type": "object",
            "required": ["title", "owner"],
            "additionalProperties": false,
            "properties": {
                "title": { "type": "string", "minLength": 3 },
                "owner": { "type": "string", "enum": ["analyst", "pm"] },
                "goals": {
                    "type": "array",
                    "minItems": 1,
                    "items": { "type": "string" }
                },
                "revision": { "type": "integer", "minimum": 1, "maximum": 99 }
            }
        })
    }

    #[test]
    fn test_valid_document_produces_no_violations() {
        let doc = json!({
            "title": "Checkout flow",
            "owner": "analyst",
            "goals": ["reduce drop-off"],
            "revision": 2
        });
        assert!(validate_value(&doc, &brief_schema()).is_empty());
    }

    #[test]
    fn test_type_mismatch_short_circuits_nested_rules() {
        let violations = validate_value(&json!("not an object"), &brief_schema());
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].message, "expected object, got string");
    }

    #[test]
    fn test_collects_required_enum_and_bound_violations() {
        let doc = json!({
            "title": "ok",
            "owner": "intern",
            "goals": [],
            "revision": 450
        });
        let violations = validate_value(&doc, &brief_schema());
        let messages: Vec<&str> = violations.iter().map(|v| v.message.as_str()).collect();
        assert!(messages.contains(&"length 2 is below minLength 3"));
        assert!(messages.contains(&"expected one of [analyst, pm]"));
        assert!(messages.contains(&"array has 0 item(s), minItems is 1"));
        assert!(messages.contains(&"value 450 exceeds maximum 99"));
    }

    #[test]
    fn test_undeclared_property_flagged_only_when_sealed() {
        let doc = json!({ "title": "Checkout", "owner": "pm", "notes": "extra" });
        let sealed = validate_value(&doc, &brief_schema());
        assert!(sealed.iter().any(|v| v.message.contains("undeclared property 'notes'")));

        let mut open = brief_schema();
        open.as_object_mut().unwrap().remove("additionalProperties");
        assert!(validate_value(&doc, &open).is_empty());
    }

    #[test]
    fn test_array_item_violations_carry_indexed_paths() {
        let doc = json!({ "title": "Checkout", "owner": "pm", "goals": ["ok", 7] });
        let violations = validate_value(&doc, &brief_schema());
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].path, "goals[1]");
    }

    #[test]
    fn test_pattern_rule_and_invalid_pattern_report() {
        let schema = json!({ "type": "string", "pattern": "^v\\d+$" });
        assert!(validate_value(&json!("v12"), &schema).is_empty());
        assert_eq!(validate_value(&json!("release-1"), &schema).len(), 1);

        let broken = json!({ "type": "string", "pattern": "([" });
        let violations = validate_value(&json!("anything"), &broken);
        assert!(violations[0].message.contains("not a valid regex"));
    }

    #[test]
    fn test_auto_fix_trims_strings_and_drops_undeclared() {
        let doc = json!({
            "title": "  Checkout flow  ",
            "owner": "pm",
            "stray": true
        });
        let (fixed, changed) = auto_fix(&doc, &brief_schema());
        assert!(changed);
        assert_eq!(fixed["title"], "Checkout flow");
        assert!(fixed.get("stray").is_none());
        assert_eq!(fixed["owner"], "pm");
    }

    #[test]
    fn test_auto_fix_reports_unchanged_for_clean_input() {
        let doc = json!({ "title": "Checkout", "owner": "pm" });
        let (fixed, changed) = auto_fix(&doc, &brief_schema());
        assert!(!changed);
        assert_eq!(fixed, doc);
    }

    #[test]
    fn test_validation_does_not_mutate_candidate() {
        let doc = json!({ "title": "  padded  ", "owner": "pm", "stray": 1 });
        let before = doc.clone();
        let _ = validate_value(&doc, &brief_schema());
        assert_eq!(doc, before);
    }
}
