//! Shared context store for one workflow session.
//!
//! A single JSON document holds everything the agents exchange: project
//! metadata, workflow progress, per-agent scratch space, artifacts, and
//! feedback-loop records. All mutations go through dot-path operations
//! that validate (optionally), record a bounded change history, and fan
//! changes out to path-scoped watchers.
//!
//! Ordering guarantee: for any single mutation, the history record is
//! appended before any watcher sees the change. Watchers receive cloned
//! values, so they must diff by value, not identity.

pub mod path;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::CoreError;
use crate::schema;
pub use path::{ContextPath, PathSegment};

/// Change records kept per session before the oldest are dropped.
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

// ─────────────────────────────────────────────────────────────────────────────
// Records
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Set,
    Push,
    Delete,
    Restore,
    Load,
    Propagate,
}

/// One entry in the bounded mutation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub op: ChangeOp,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ChangeRecord {
    fn new(op: ChangeOp, path: &str, old_value: Option<Value>, new_value: Option<Value>) -> Self {
        Self {
            op,
            path: path.to_string(),
            old_value,
            new_value,
            checkpoint: None,
            timestamp: Utc::now(),
        }
    }
}

/// What a watcher receives for each matching mutation.
///
/// For `push` the post-push array is passed as both old and new value,
/// so array watchers diff by value rather than by before/after identity.
#[derive(Debug, Clone)]
pub struct ContextChange {
    pub path: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub created_at: DateTime<Utc>,
}

struct Checkpoint {
    info: CheckpointInfo,
    snapshot: Value,
}

/// Counters for introspection and the CLI status view.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub history_len: usize,
    pub checkpoint_count: usize,
    pub watcher_count: usize,
    pub validation_cache_len: usize,
}

// ─────────────────────────────────────────────────────────────────────────────
// Watchers
// ─────────────────────────────────────────────────────────────────────────────

struct WatcherEntry {
    id: u64,
    pattern: String,
    tx: mpsc::UnboundedSender<ContextChange>,
}

/// Receiving half of a context subscription.
///
/// Matching is exact, or prefix-based for patterns ending in `.*`
/// (`agent_contexts.*` matches every path under `agent_contexts.` but
/// not `agent_contexts` itself). Dropping the watcher ends the
/// subscription on the next delivery attempt.
pub struct ContextWatcher {
    id: u64,
    pattern: String,
    rx: mpsc::UnboundedReceiver<ContextChange>,
}

impl ContextWatcher {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Waits for the next matching change. `None` once unsubscribed.
    pub async fn changed(&mut self) -> Option<ContextChange> {
        self.rx.recv().await
    }

    /// Non-blocking variant of [`changed`](Self::changed).
    pub fn try_changed(&mut self) -> Option<ContextChange> {
        self.rx.try_recv().ok()
    }

    /// Drains every change delivered so far.
    pub fn drain(&mut self) -> Vec<ContextChange> {
        let mut out = Vec::new();
        while let Ok(change) = self.rx.try_recv() {
            out.push(change);
        }
        out
    }
}

fn pattern_matches(pattern: &str, path: &str) -> bool {
    if pattern == path {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(".*") {
        return path.len() > prefix.len() + 1
            && path.starts_with(prefix)
            && path.as_bytes()[prefix.len()] == b'.';
    }
    false
}

// ─────────────────────────────────────────────────────────────────────────────
// Store
// ─────────────────────────────────────────────────────────────────────────────

struct StoreInner {
    root: Value,
    history: VecDeque<ChangeRecord>,
    checkpoints: Vec<Checkpoint>,
    watchers: Vec<WatcherEntry>,
    validation_cache: HashMap<u64, bool>,
}

/// The shared context document plus its history, checkpoints, and watchers.
///
/// All methods take `&self`; the store is safe to share behind an `Arc`
/// across concurrently running steps. Each operation is atomic, including
/// [`push_unique`](Self::push_unique), which exists so concurrent group
/// members can append progress markers without duplicating them.
pub struct ContextStore {
    inner: RwLock<StoreInner>,
    checkpoint_seq: AtomicU64,
    watcher_seq: AtomicU64,
    history_limit: usize,
}

impl Default for ContextStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextStore {
    pub fn new() -> Self {
        Self::with_root(Value::Object(serde_json::Map::new()))
    }

    /// Seeds the document directly, without history entries or
    /// notifications. Used by the executor to lay down the session shape.
    pub fn with_root(root: Value) -> Self {
        Self {
            inner: RwLock::new(StoreInner {
                root,
                history: VecDeque::new(),
                checkpoints: Vec::new(),
                watchers: Vec::new(),
                validation_cache: HashMap::new(),
            }),
            checkpoint_seq: AtomicU64::new(0),
            watcher_seq: AtomicU64::new(0),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    fn read_inner(&self) -> RwLockReadGuard<'_, StoreInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_inner(&self) -> RwLockWriteGuard<'_, StoreInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Reads ────────────────────────────────────────────────────────────

    /// Returns a clone of the value at `path`, or `None` when the path
    /// (or any intermediate) is absent. The empty path returns the whole
    /// document.
    pub fn get(&self, path: &str) -> Option<Value> {
        let inner = self.read_inner();
        ContextPath::parse(path).resolve(&inner.root).cloned()
    }

    /// Deep clone of the full document.
    pub fn export(&self) -> Value {
        self.read_inner().root.clone()
    }

    pub fn history(&self) -> Vec<ChangeRecord> {
        self.read_inner().history.iter().cloned().collect()
    }

    /// History entries touching exactly `path`.
    pub fn history_for(&self, path: &str) -> Vec<ChangeRecord> {
        self.read_inner()
            .history
            .iter()
            .filter(|r| r.path == path)
            .cloned()
            .collect()
    }

    pub fn checkpoints(&self) -> Vec<CheckpointInfo> {
        self.read_inner()
            .checkpoints
            .iter()
            .map(|c| c.info.clone())
            .collect()
    }

    pub fn stats(&self) -> StoreStats {
        let inner = self.read_inner();
        StoreStats {
            history_len: inner.history.len(),
            checkpoint_count: inner.checkpoints.len(),
            watcher_count: inner.watchers.len(),
            validation_cache_len: inner.validation_cache.len(),
        }
    }

    // ── Writes ───────────────────────────────────────────────────────────

    pub fn set(&self, path: &str, value: Value) -> Result<(), CoreError> {
        self.set_with_schema(path, value, None)
    }

    /// Writes `value` at `path`, creating intermediate objects as needed.
    /// With a schema attached, an invalid value is rejected before any
    /// mutation, history entry, or notification happens.
    pub fn set_with_schema(
        &self,
        path: &str,
        value: Value,
        validation: Option<&Value>,
    ) -> Result<(), CoreError> {
        if path.is_empty() {
            return Err(CoreError::Internal(
                "set requires a non-empty path; use load() to replace the document".into(),
            ));
        }
        let parsed = ContextPath::parse(path);
        let mut inner = self.write_inner();
        if let Some(schema) = validation {
            Self::check_valid(&mut inner, path, &value, schema)?;
        }
        let old = parsed.resolve(&inner.root).cloned();
        write_value(&mut inner.root, &parsed, value.clone());
        debug!("[Context] set {path}");
        Self::commit(
            &mut inner,
            self.history_limit,
            ChangeRecord::new(ChangeOp::Set, path, old.clone(), Some(value.clone())),
            vec![ContextChange {
                path: path.to_string(),
                old_value: old,
                new_value: Some(value),
            }],
        );
        Ok(())
    }

    pub fn update(&self, path: &str, patch: Value) -> Result<(), CoreError> {
        self.update_with_schema(path, patch, None)
    }

    /// Shallow-merges an object `patch` into the object at `path`
    /// (created when absent). The merged result is what gets validated.
    /// Recorded in history as a `set` of the merged value.
    pub fn update_with_schema(
        &self,
        path: &str,
        patch: Value,
        validation: Option<&Value>,
    ) -> Result<(), CoreError> {
        if path.is_empty() {
            return Err(CoreError::Internal(
                "update requires a non-empty path; use load() to replace the document".into(),
            ));
        }
        let Value::Object(patch_map) = patch else {
            return Err(CoreError::UpdateNonObject(path.to_string()));
        };
        let parsed = ContextPath::parse(path);
        let mut inner = self.write_inner();
        let existing = parsed.resolve(&inner.root).cloned();
        let mut merged = match &existing {
            Some(Value::Object(map)) => map.clone(),
            None | Some(Value::Null) => serde_json::Map::new(),
            Some(_) => return Err(CoreError::UpdateNonObject(path.to_string())),
        };
        for (key, value) in patch_map {
            merged.insert(key, value);
        }
        let merged = Value::Object(merged);
        if let Some(schema) = validation {
            Self::check_valid(&mut inner, path, &merged, schema)?;
        }
        write_value(&mut inner.root, &parsed, merged.clone());
        debug!("[Context] update {path}");
        Self::commit(
            &mut inner,
            self.history_limit,
            ChangeRecord::new(ChangeOp::Set, path, existing.clone(), Some(merged.clone())),
            vec![ContextChange {
                path: path.to_string(),
                old_value: existing,
                new_value: Some(merged),
            }],
        );
        Ok(())
    }

    /// Appends `item` to the array at `path`, creating the array when the
    /// slot is absent or `null`. Returns a clone of the post-push array.
    pub fn push(&self, path: &str, item: Value) -> Result<Value, CoreError> {
        let parsed = ContextPath::parse(path);
        let mut inner = self.write_inner();
        let array = Self::push_locked(&mut inner, &parsed, path, item.clone())?;
        debug!("[Context] push {path}");
        Self::commit(
            &mut inner,
            self.history_limit,
            ChangeRecord::new(ChangeOp::Push, path, None, Some(item)),
            vec![ContextChange {
                path: path.to_string(),
                old_value: Some(array.clone()),
                new_value: Some(array.clone()),
            }],
        );
        Ok(array)
    }

    /// Appends `item` only when the array does not already contain an
    /// equal value. The contains-check and append happen under one lock,
    /// so concurrent group members cannot double-append. Returns whether
    /// the item was pushed.
    pub fn push_unique(&self, path: &str, item: Value) -> Result<bool, CoreError> {
        let parsed = ContextPath::parse(path);
        let mut inner = self.write_inner();
        if let Some(Value::Array(items)) = parsed.resolve(&inner.root) {
            if items.contains(&item) {
                return Ok(false);
            }
        }
        let array = Self::push_locked(&mut inner, &parsed, path, item.clone())?;
        Self::commit(
            &mut inner,
            self.history_limit,
            ChangeRecord::new(ChangeOp::Push, path, None, Some(item)),
            vec![ContextChange {
                path: path.to_string(),
                old_value: Some(array.clone()),
                new_value: Some(array),
            }],
        );
        Ok(true)
    }

    fn push_locked(
        inner: &mut StoreInner,
        parsed: &ContextPath,
        path: &str,
        item: Value,
    ) -> Result<Value, CoreError> {
        if let Some(slot) = parsed.resolve_mut(&mut inner.root) {
            match slot {
                Value::Array(items) => {
                    items.push(item);
                    Ok(Value::Array(items.clone()))
                }
                Value::Null => {
                    *slot = Value::Array(vec![item]);
                    Ok(slot.clone())
                }
                _ => Err(CoreError::PushNonArray(path.to_string())),
            }
        } else {
            let fresh = Value::Array(vec![item]);
            write_value(&mut inner.root, parsed, fresh.clone());
            Ok(fresh)
        }
    }

    /// Removes the value at `path`. Returns whether anything existed.
    /// Array elements are removed in place (later elements shift down).
    pub fn delete(&self, path: &str) -> bool {
        let parsed = ContextPath::parse(path);
        let Some((last, _)) = parsed.segments().split_last() else {
            return false;
        };
        let parent_path = ContextPath::parse(
            path.rsplit_once('.').map(|(head, _)| head).unwrap_or(""),
        );
        let mut inner = self.write_inner();
        let removed = match parent_path.resolve_mut(&mut inner.root) {
            Some(Value::Object(map)) => match last {
                PathSegment::Key(k) => map.remove(k),
                PathSegment::Index(i) => map.remove(&i.to_string()),
            },
            Some(Value::Array(items)) => match last {
                PathSegment::Index(i) if *i < items.len() => Some(items.remove(*i)),
                _ => None,
            },
            _ => None,
        };
        let Some(old) = removed else {
            return false;
        };
        debug!("[Context] delete {path}");
        Self::commit(
            &mut inner,
            self.history_limit,
            ChangeRecord::new(ChangeOp::Delete, path, Some(old.clone()), None),
            vec![ContextChange {
                path: path.to_string(),
                old_value: Some(old),
                new_value: None,
            }],
        );
        true
    }

    /// Replaces the whole document, e.g. when resuming a persisted
    /// session. Notifies with the empty path as a bulk-change signal.
    pub fn load(&self, document: Value) -> Result<(), CoreError> {
        if !document.is_object() {
            return Err(CoreError::Internal(
                "context document must be a JSON object".into(),
            ));
        }
        let mut inner = self.write_inner();
        let old = std::mem::replace(&mut inner.root, document.clone());
        info!("[Context] Document replaced via load");
        Self::commit(
            &mut inner,
            self.history_limit,
            ChangeRecord::new(ChangeOp::Load, "", None, None),
            vec![ContextChange {
                path: String::new(),
                old_value: Some(old),
                new_value: Some(document),
            }],
        );
        Ok(())
    }

    // ── Checkpoints ──────────────────────────────────────────────────────

    /// Snapshots the current document. Ids stay unique even for
    /// checkpoints taken within the same millisecond.
    pub fn checkpoint(&self, label: Option<&str>) -> String {
        let seq = self.checkpoint_seq.fetch_add(1, Ordering::Relaxed);
        let id = format!("cp-{}-{}", Utc::now().timestamp_millis(), seq);
        let info = CheckpointInfo {
            id: id.clone(),
            label: label.map(str::to_string),
            created_at: Utc::now(),
        };
        let mut inner = self.write_inner();
        let snapshot = inner.root.clone();
        // Mirror a summary into the document so agents can see what
        // restore points exist.
        if let Some(Value::Array(list)) = ContextPath::parse("checkpoints").resolve_mut(&mut inner.root)
        {
            list.push(serde_json::json!({
                "id": info.id,
                "label": info.label,
                "timestamp": info.created_at,
            }));
        }
        inner.checkpoints.push(Checkpoint { info, snapshot });
        info!("[Context] Checkpoint {id} created");
        id
    }

    /// Restores a snapshot wholesale and signals watchers with the empty
    /// path. The snapshot list itself is kept, so restores can be
    /// replayed in any order.
    pub fn restore(&self, checkpoint_id: &str) -> Result<(), CoreError> {
        let mut inner = self.write_inner();
        let snapshot = inner
            .checkpoints
            .iter()
            .find(|c| c.info.id == checkpoint_id)
            .map(|c| c.snapshot.clone())
            .ok_or_else(|| CoreError::CheckpointNotFound(checkpoint_id.to_string()))?;
        let old = std::mem::replace(&mut inner.root, snapshot.clone());
        info!("[Context] Restored checkpoint {checkpoint_id}");
        let mut record = ChangeRecord::new(ChangeOp::Restore, "", None, None);
        record.checkpoint = Some(checkpoint_id.to_string());
        Self::commit(
            &mut inner,
            self.history_limit,
            record,
            vec![ContextChange {
                path: String::new(),
                old_value: Some(old),
                new_value: Some(snapshot),
            }],
        );
        Ok(())
    }

    // ── Subscriptions ────────────────────────────────────────────────────

    /// Registers a watcher for `pattern` (exact path, or `prefix.*`).
    pub fn subscribe(&self, pattern: &str) -> ContextWatcher {
        let id = self.watcher_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.write_inner().watchers.push(WatcherEntry {
            id,
            pattern: pattern.to_string(),
            tx,
        });
        debug!("[Context] Watcher {id} subscribed to '{pattern}'");
        ContextWatcher {
            id,
            pattern: pattern.to_string(),
            rx,
        }
    }

    /// Removes a watcher by id. Returns whether one was removed.
    pub fn unsubscribe(&self, watcher_id: u64) -> bool {
        let mut inner = self.write_inner();
        let before = inner.watchers.len();
        inner.watchers.retain(|w| w.id != watcher_id);
        inner.watchers.len() < before
    }

    // ── Validation ───────────────────────────────────────────────────────

    /// Memoized validity check; results are cached per (value, schema)
    /// pair for the life of the store.
    pub fn validate(&self, value: &Value, validation: &Value) -> bool {
        Self::validate_cached(&mut self.write_inner(), value, validation)
    }

    fn validate_cached(inner: &mut StoreInner, value: &Value, schema: &Value) -> bool {
        let key = cache_key(value, schema);
        if let Some(&hit) = inner.validation_cache.get(&key) {
            return hit;
        }
        let ok = schema::validate_value(value, schema).is_empty();
        inner.validation_cache.insert(key, ok);
        ok
    }

    fn check_valid(
        inner: &mut StoreInner,
        path: &str,
        value: &Value,
        schema: &Value,
    ) -> Result<(), CoreError> {
        if Self::validate_cached(inner, value, schema) {
            return Ok(());
        }
        Err(CoreError::ContextValidation {
            path: path.to_string(),
            violations: schema::validate_value(value, schema),
        })
    }

    // ── Propagation ──────────────────────────────────────────────────────

    /// Copies values between agent scopes: for each `(from, to)` pair in
    /// `mapping`, `agent_contexts.<source>.<from>` is copied to
    /// `agent_contexts.<target>.<to>`. Missing sources are skipped.
    /// Records one `propagate` history entry with the copied subset and
    /// returns it.
    pub fn propagate(
        &self,
        source: &str,
        target: &str,
        mapping: &BTreeMap<String, String>,
    ) -> Value {
        let mut inner = self.write_inner();
        let mut subset = serde_json::Map::new();
        let mut notifications = Vec::new();
        for (from, to) in mapping {
            let source_path = ContextPath::parse(&format!("agent_contexts.{source}.{from}"));
            let Some(value) = source_path.resolve(&inner.root).cloned() else {
                continue;
            };
            let target_str = format!("agent_contexts.{target}.{to}");
            let target_path = ContextPath::parse(&target_str);
            let old = target_path.resolve(&inner.root).cloned();
            write_value(&mut inner.root, &target_path, value.clone());
            notifications.push(ContextChange {
                path: target_str,
                old_value: old,
                new_value: Some(value.clone()),
            });
            subset.insert(to.clone(), value);
        }
        let subset = Value::Object(subset);
        if !notifications.is_empty() {
            debug!(
                "[Context] Propagated {} value(s) from {source} to {target}",
                notifications.len()
            );
            Self::commit(
                &mut inner,
                self.history_limit,
                ChangeRecord::new(
                    ChangeOp::Propagate,
                    &format!("agent_contexts.{target}"),
                    None,
                    Some(subset.clone()),
                ),
                notifications,
            );
        }
        subset
    }

    // ── Internals ────────────────────────────────────────────────────────

    /// History append happens-before watcher dispatch, always.
    fn commit(
        inner: &mut StoreInner,
        limit: usize,
        record: ChangeRecord,
        notifications: Vec<ContextChange>,
    ) {
        if inner.history.len() >= limit {
            inner.history.pop_front();
        }
        inner.history.push_back(record);
        for change in notifications {
            inner.watchers.retain(|w| {
                if pattern_matches(&w.pattern, &change.path) {
                    w.tx.send(change.clone()).is_ok()
                } else {
                    true
                }
            });
        }
    }
}

fn write_value(root: &mut Value, path: &ContextPath, value: Value) {
    if path.is_root() {
        *root = value;
        return;
    }
    if let Some((parent, last)) = path.ensure_parent(root) {
        assign_child(parent, last, value);
    }
}

fn assign_child(parent: &mut Value, segment: &PathSegment, value: Value) {
    match segment {
        PathSegment::Key(k) => {
            if !parent.is_object() {
                *parent = Value::Object(serde_json::Map::new());
            }
            if let Some(map) = parent.as_object_mut() {
                map.insert(k.clone(), value);
            }
        }
        PathSegment::Index(i) => {
            if let Value::Array(items) = parent {
                while items.len() <= *i {
                    items.push(Value::Null);
                }
                items[*i] = value;
            } else {
                if !parent.is_object() {
                    *parent = Value::Object(serde_json::Map::new());
                }
                if let Some(map) = parent.as_object_mut() {
                    map.insert(i.to_string(), value);
                }
            }
        }
    }
}

fn cache_key(value: &Value, schema: &Value) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.to_string().hash(&mut hasher);
    schema.to_string().hash(&mut hasher);
    hasher.finish()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> ContextStore {
        ContextStore::new()
    }

    #[test]
    fn test_set_creates_intermediates_and_get_reads_back() {
        let ctx = store();
        ctx.set("agent_contexts.pm.draft.title", json!("Checkout")).unwrap();
        assert_eq!(
            ctx.get("agent_contexts.pm.draft.title"),
            Some(json!("Checkout"))
        );
        assert_eq!(ctx.get("agent_contexts.pm.missing"), None);
        assert_eq!(ctx.get(""), Some(ctx.export()));
    }

    #[test]
    fn test_get_never_errors_through_null_intermediates() {
        let ctx = store();
        ctx.set("a.b", Value::Null).unwrap();
        assert_eq!(ctx.get("a.b.c.d"), None);
        assert_eq!(ctx.get("a.b"), Some(Value::Null));
    }

    #[test]
    fn test_set_with_schema_rejects_without_mutating() {
        let ctx = store();
        let schema = json!({"type": "object", "required": ["title"]});
        let err = ctx
            .set_with_schema("artifacts.brief", json!({"owner": "pm"}), Some(&schema))
            .unwrap_err();
        assert!(matches!(err, CoreError::ContextValidation { .. }));
        assert_eq!(ctx.get("artifacts.brief"), None);
        assert!(ctx.history().is_empty());
    }

    #[test]
    fn test_update_shallow_merges_and_validates_merged_value() {
        let ctx = store();
        ctx.set("global_context.flags", json!({"a": 1, "b": 2})).unwrap();
        ctx.update("global_context.flags", json!({"b": 3, "c": 4})).unwrap();
        assert_eq!(
            ctx.get("global_context.flags"),
            Some(json!({"a": 1, "b": 3, "c": 4}))
        );

        let schema = json!({"type": "object", "required": ["a", "z"]});
        let err = ctx
            .update_with_schema("global_context.flags", json!({"d": 5}), Some(&schema))
            .unwrap_err();
        assert!(matches!(err, CoreError::ContextValidation { .. }));
        // Rejected merge leaves the previous value in place.
        assert_eq!(
            ctx.get("global_context.flags"),
            Some(json!({"a": 1, "b": 3, "c": 4}))
        );
    }

    #[test]
    fn test_update_rejects_non_object_target_and_patch() {
        let ctx = store();
        ctx.set("slot", json!("scalar")).unwrap();
        assert!(matches!(
            ctx.update("slot", json!({"a": 1})),
            Err(CoreError::UpdateNonObject(_))
        ));
        assert!(matches!(
            ctx.update("global_context", json!([1, 2])),
            Err(CoreError::UpdateNonObject(_))
        ));
    }

    #[test]
    fn test_update_creates_missing_target() {
        let ctx = store();
        ctx.update("agent_contexts.qa", json!({"status": "ready"})).unwrap();
        assert_eq!(ctx.get("agent_contexts.qa.status"), Some(json!("ready")));
    }

    #[test]
    fn test_push_creates_array_and_returns_post_push_state() {
        let ctx = store();
        let arr = ctx.push("feedback_loops", json!({"id": "loop-1"})).unwrap();
        assert_eq!(arr, json!([{"id": "loop-1"}]));
        let arr = ctx.push("feedback_loops", json!({"id": "loop-2"})).unwrap();
        assert_eq!(arr.as_array().map(Vec::len), Some(2));
    }

    #[test]
    fn test_push_onto_scalar_fails() {
        let ctx = store();
        ctx.set("session_id", json!("s-1")).unwrap();
        assert!(matches!(
            ctx.push("session_id", json!(1)),
            Err(CoreError::PushNonArray(_))
        ));
    }

    #[test]
    fn push_notifies_with_post_mutation_array_for_old_and_new() {
        let ctx = store();
        ctx.set("workflow_state.completed_steps", json!([])).unwrap();
        let mut watcher = ctx.subscribe("workflow_state.completed_steps");
        ctx.push("workflow_state.completed_steps", json!(1)).unwrap();
        let change = watcher.try_changed().unwrap();
        assert_eq!(change.old_value, Some(json!([1])));
        assert_eq!(change.new_value, Some(json!([1])));
        assert_eq!(change.old_value, change.new_value);
    }

    #[test]
    fn test_push_unique_skips_duplicates_atomically() {
        let ctx = store();
        assert!(ctx.push_unique("workflow_state.completed_steps", json!(3)).unwrap());
        assert!(!ctx.push_unique("workflow_state.completed_steps", json!(3)).unwrap());
        assert_eq!(
            ctx.get("workflow_state.completed_steps"),
            Some(json!([3]))
        );
    }

    #[test]
    fn test_delete_reports_existence() {
        let ctx = store();
        ctx.set("artifacts.tmp", json!(1)).unwrap();
        assert!(ctx.delete("artifacts.tmp"));
        assert!(!ctx.delete("artifacts.tmp"));
        assert_eq!(ctx.get("artifacts.tmp"), None);
    }

    #[test]
    fn test_checkpoint_restore_round_trip() {
        let ctx = ContextStore::with_root(json!({"checkpoints": [], "n": 1}));
        let cp = ctx.checkpoint(Some("before-edit"));
        ctx.set("n", json!(2)).unwrap();
        ctx.restore(&cp).unwrap();
        assert_eq!(ctx.get("n"), Some(json!(1)));
        // Snapshots survive a restore; restoring again still works.
        ctx.set("n", json!(9)).unwrap();
        ctx.restore(&cp).unwrap();
        assert_eq!(ctx.get("n"), Some(json!(1)));
        assert!(matches!(
            ctx.restore("cp-0-0"),
            Err(CoreError::CheckpointNotFound(_))
        ));
    }

    #[test]
    fn checkpoint_ids_unique_within_same_millisecond() {
        let ctx = store();
        let ids: Vec<String> = (0..50).map(|_| ctx.checkpoint(None)).collect();
        let mut deduped = ids.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(deduped.len(), ids.len());
    }

    #[test]
    fn test_checkpoint_mirrors_summary_into_document() {
        let ctx = ContextStore::with_root(json!({"checkpoints": []}));
        let id = ctx.checkpoint(Some("phase-1"));
        let list = ctx.get("checkpoints").unwrap();
        assert_eq!(list[0]["id"], json!(id));
        assert_eq!(list[0]["label"], json!("phase-1"));
    }

    #[test]
    fn test_restore_notifies_root_watchers() {
        let ctx = ContextStore::with_root(json!({"n": 1}));
        let cp = ctx.checkpoint(None);
        ctx.set("n", json!(2)).unwrap();
        let mut root_watcher = ctx.subscribe("");
        let mut wild_watcher = ctx.subscribe("n.*");
        ctx.restore(&cp).unwrap();
        let change = root_watcher.try_changed().unwrap();
        assert_eq!(change.path, "");
        assert_eq!(change.new_value, Some(json!({"n": 1})));
        // Wildcards do not match the bulk-change signal.
        assert!(wild_watcher.try_changed().is_none());
    }

    #[test]
    fn test_wildcard_subscription_scopes_to_prefix() {
        let ctx = store();
        let mut wild = ctx.subscribe("agent_contexts.*");
        let mut exact = ctx.subscribe("agent_contexts.pm.notes");
        ctx.set("agent_contexts.pm.notes", json!("draft")).unwrap();
        ctx.set("agent_contexts.dev.notes", json!("other")).unwrap();
        ctx.set("global_context.x", json!(1)).unwrap();
        // The prefix itself does not match its own wildcard.
        ctx.set("agent_contexts", json!({})).unwrap();

        let wild_paths: Vec<String> = wild.drain().into_iter().map(|c| c.path).collect();
        assert_eq!(wild_paths, vec!["agent_contexts.pm.notes", "agent_contexts.dev.notes"]);
        assert_eq!(exact.drain().len(), 1);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let ctx = store();
        let mut watcher = ctx.subscribe("global_context.x");
        assert!(ctx.unsubscribe(watcher.id()));
        assert!(!ctx.unsubscribe(watcher.id()));
        ctx.set("global_context.x", json!(1)).unwrap();
        assert!(watcher.try_changed().is_none());
    }

    #[test]
    fn test_history_is_ordered_and_bounded_fifo() {
        let ctx = ContextStore::new().with_history_limit(5);
        for i in 0..8 {
            ctx.set("global_context.n", json!(i)).unwrap();
        }
        let history = ctx.history();
        assert_eq!(history.len(), 5);
        assert_eq!(history[0].new_value, Some(json!(3)));
        assert_eq!(history[4].new_value, Some(json!(7)));
        assert!(history.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn test_history_record_lands_before_notification() {
        let ctx = store();
        let mut watcher = ctx.subscribe("global_context.flag");
        ctx.set("global_context.flag", json!(true)).unwrap();
        // By the time the change is observable, the history entry exists.
        assert!(watcher.try_changed().is_some());
        let history = ctx.history_for("global_context.flag");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].op, ChangeOp::Set);
    }

    #[test]
    fn test_propagate_copies_subset_and_skips_missing() {
        let ctx = store();
        ctx.set("agent_contexts.analyst.findings", json!(["f1"])).unwrap();
        let mut watcher = ctx.subscribe("agent_contexts.pm.*");
        let mut mapping = BTreeMap::new();
        mapping.insert("findings".to_string(), "inputs.findings".to_string());
        mapping.insert("absent".to_string(), "inputs.absent".to_string());

        let subset = ctx.propagate("analyst", "pm", &mapping);
        assert_eq!(subset, json!({"inputs.findings": ["f1"]}));
        assert_eq!(
            ctx.get("agent_contexts.pm.inputs.findings"),
            Some(json!(["f1"]))
        );
        assert_eq!(ctx.get("agent_contexts.pm.inputs.absent"), None);

        let changes = watcher.drain();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path, "agent_contexts.pm.inputs.findings");

        let records = ctx.history_for("agent_contexts.pm");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].op, ChangeOp::Propagate);
    }

    #[test]
    fn test_validation_results_are_memoized() {
        let ctx = store();
        let schema = json!({"type": "string"});
        assert!(ctx.validate(&json!("ok"), &schema));
        assert!(ctx.validate(&json!("ok"), &schema));
        assert!(!ctx.validate(&json!(1), &schema));
        assert_eq!(ctx.stats().validation_cache_len, 2);
    }

    #[test]
    fn test_load_replaces_document_and_signals_root() {
        let ctx = store();
        let mut watcher = ctx.subscribe("");
        ctx.load(json!({"session_id": "s-9"})).unwrap();
        assert_eq!(ctx.get("session_id"), Some(json!("s-9")));
        assert_eq!(watcher.try_changed().unwrap().path, "");
        assert!(ctx.load(json!([1])).is_err());
    }

    #[tokio::test]
    async fn test_concurrent_pushes_preserve_every_item() {
        use std::sync::Arc;
        let ctx = Arc::new(ContextStore::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let ctx = Arc::clone(&ctx);
            handles.push(tokio::spawn(async move {
                ctx.push("artifacts.files", json!(i)).unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let files = ctx.get("artifacts.files").unwrap();
        assert_eq!(files.as_array().map(Vec::len), Some(16));
    }
}
