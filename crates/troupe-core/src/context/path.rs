//! Dot-path addressing into the shared context tree.
//!
//! Paths are parsed once into typed segments so traversal never re-splits
//! strings. A segment made only of canonical ASCII digits (`"0"`, `"12"`,
//! but not `"01"`) addresses an array index; everything else is an object
//! key. Traversal short-circuits to "absent" the moment an intermediate
//! value is missing or `null` — it never errors for a path that is not
//! there.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContextPath {
    raw: String,
    segments: Vec<PathSegment>,
}

impl ContextPath {
    pub fn parse(path: &str) -> Self {
        let segments = if path.is_empty() {
            Vec::new()
        } else {
            path.split('.').map(parse_segment).collect()
        };
        Self {
            raw: path.to_string(),
            segments,
        }
    }

    /// The empty path addresses the whole context document.
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    /// Walks `root` and returns the addressed value, if present.
    ///
    /// A stored `null` at the final position resolves to `Some(&Null)`;
    /// a `null` (or missing key) anywhere earlier resolves to `None`.
    pub fn resolve<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        let mut current = root;
        for segment in &self.segments {
            if current.is_null() {
                return None;
            }
            current = step(current, segment)?;
        }
        Some(current)
    }

    /// Mutable variant of [`resolve`](Self::resolve). Never creates
    /// intermediate values.
    pub fn resolve_mut<'a>(&self, root: &'a mut Value) -> Option<&'a mut Value> {
        let mut current = root;
        for segment in &self.segments {
            if current.is_null() {
                return None;
            }
            current = step_mut(current, segment)?;
        }
        Some(current)
    }

    /// Walks to the parent of the final segment, creating intermediate
    /// objects as needed, and returns the parent plus the final segment.
    /// Non-container intermediates are overwritten with empty objects so a
    /// write along this path always lands.
    ///
    /// Returns `None` for the root path, which has no parent.
    pub fn ensure_parent<'a>(&self, root: &'a mut Value) -> Option<(&'a mut Value, &PathSegment)> {
        let (last, ancestors) = self.segments.split_last()?;
        let mut current = root;
        for segment in ancestors {
            current = descend_or_create(current, segment);
        }
        Some((current, last))
    }
}

impl std::fmt::Display for ContextPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

fn parse_segment(part: &str) -> PathSegment {
    let canonical_digits =
        !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()) && (part == "0" || !part.starts_with('0'));
    if canonical_digits {
        if let Ok(index) = part.parse::<usize>() {
            return PathSegment::Index(index);
        }
    }
    PathSegment::Key(part.to_string())
}

fn step<'a>(current: &'a Value, segment: &PathSegment) -> Option<&'a Value> {
    match (segment, current) {
        (PathSegment::Key(k), Value::Object(map)) => map.get(k),
        (PathSegment::Index(i), Value::Array(items)) => items.get(*i),
        // Numeric segments double as object keys ("steps.0" into a map).
        (PathSegment::Index(i), Value::Object(map)) => map.get(&i.to_string()),
        _ => None,
    }
}

fn step_mut<'a>(current: &'a mut Value, segment: &PathSegment) -> Option<&'a mut Value> {
    match (segment, current) {
        (PathSegment::Key(k), Value::Object(map)) => map.get_mut(k),
        (PathSegment::Index(i), Value::Array(items)) => items.get_mut(*i),
        (PathSegment::Index(i), Value::Object(map)) => map.get_mut(&i.to_string()),
        _ => None,
    }
}

fn descend_or_create<'a>(current: &'a mut Value, segment: &PathSegment) -> &'a mut Value {
    match segment {
        PathSegment::Key(k) => {
            if !current.is_object() {
                *current = Value::Object(serde_json::Map::new());
            }
            let map = current.as_object_mut().expect("just coerced to object");
            map.entry(k.clone())
                .and_modify(|v| {
                    if !v.is_object() && !v.is_array() {
                        *v = Value::Object(serde_json::Map::new());
                    }
                })
                .or_insert_with(|| Value::Object(serde_json::Map::new()))
        }
        PathSegment::Index(i) => {
            if let Value::Array(items) = current {
                while items.len() <= *i {
                    items.push(Value::Null);
                }
                let slot = &mut items[*i];
                if !slot.is_object() && !slot.is_array() {
                    *slot = Value::Object(serde_json::Map::new());
                }
                slot
            } else {
                descend_or_create(current, &PathSegment::Key(i.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_distinguishes_keys_and_indices() {
        let path = ContextPath::parse("artifacts.files.2.path");
        assert_eq!(
            path.segments(),
            &[
                PathSegment::Key("artifacts".into()),
                PathSegment::Key("files".into()),
                PathSegment::Index(2),
                PathSegment::Key("path".into()),
            ]
        );
        // Leading zeros stay object keys, matching canonical index form.
        assert_eq!(
            ContextPath::parse("a.01").segments()[1],
            PathSegment::Key("01".into())
        );
    }

    #[test]
    fn test_empty_path_is_root() {
        let path = ContextPath::parse("");
        assert!(path.is_root());
        let doc = json!({"a": 1});
        assert_eq!(path.resolve(&doc), Some(&doc));
    }

    #[test]
    fn test_resolve_short_circuits_on_null_and_missing() {
        let doc = json!({"a": {"b": null}, "c": null});
        assert_eq!(ContextPath::parse("a.b.c").resolve(&doc), None);
        assert_eq!(ContextPath::parse("c.anything").resolve(&doc), None);
        assert_eq!(ContextPath::parse("missing.x.y").resolve(&doc), None);
        // A null at the final position is still a present value.
        assert_eq!(ContextPath::parse("a.b").resolve(&doc), Some(&Value::Null));
    }

    #[test]
    fn test_resolve_indexes_arrays_and_numeric_object_keys() {
        let doc = json!({"list": [10, 20], "map": {"0": "zero"}});
        assert_eq!(ContextPath::parse("list.1").resolve(&doc), Some(&json!(20)));
        assert_eq!(ContextPath::parse("list.5").resolve(&doc), None);
        assert_eq!(ContextPath::parse("map.0").resolve(&doc), Some(&json!("zero")));
    }

    #[test]
    fn test_ensure_parent_creates_intermediate_objects() {
        let mut doc = json!({});
        let path = ContextPath::parse("agent_contexts.pm.notes");
        let (parent, last) = path.ensure_parent(&mut doc).unwrap();
        assert_eq!(last, &PathSegment::Key("notes".into()));
        parent
            .as_object_mut()
            .unwrap()
            .insert("notes".into(), json!("hi"));
        assert_eq!(doc, json!({"agent_contexts": {"pm": {"notes": "hi"}}}));
    }

    #[test]
    fn test_ensure_parent_overwrites_scalar_intermediates() {
        let mut doc = json!({"slot": "scalar"});
        let path = ContextPath::parse("slot.deep.value");
        let (parent, _) = path.ensure_parent(&mut doc).unwrap();
        assert!(parent.is_object());
        assert_eq!(doc["slot"]["deep"], json!({}));
    }

    #[test]
    fn test_ensure_parent_pads_arrays_with_nulls() {
        let mut doc = json!({"rows": [1]});
        let path = ContextPath::parse("rows.3.cell");
        let (parent, _) = path.ensure_parent(&mut doc).unwrap();
        parent
            .as_object_mut()
            .unwrap()
            .insert("cell".into(), json!(true));
        assert_eq!(doc["rows"], json!([1, null, null, {"cell": true}]));
    }
}
