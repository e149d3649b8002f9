//! Observability sinks.
//!
//! The engine mirrors every log line as a structured [`LogEvent`] to attached [`DebugSink`]s and
//! hands them each published [`Snapshot`]. Sinks only observe; nothing they do feeds back into
//! engine state.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::rc::Rc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::snapshot::Snapshot;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(serialize_with = "serialize_level")]
    pub level: log::Level,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

fn serialize_level<S>(level: &log::Level, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(level.as_str())
}

impl LogEvent {
    #[must_use]
    pub fn new(level: log::Level, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            data,
        }
    }
}

pub trait DebugSink {
    fn on_log(&mut self, event: &LogEvent);

    fn on_snapshot(&mut self, _snapshot: &Snapshot) {}

    /// Called after a derived field was successfully recomputed.
    fn on_field_computed(&mut self, _field: &str, _value: f64) {}
}

impl<T: DebugSink + ?Sized> DebugSink for Rc<RefCell<T>> {
    fn on_log(&mut self, event: &LogEvent) {
        self.borrow_mut().on_log(event);
    }

    fn on_snapshot(&mut self, snapshot: &Snapshot) {
        self.borrow_mut().on_snapshot(snapshot);
    }

    fn on_field_computed(&mut self, field: &str, value: f64) {
        self.borrow_mut().on_field_computed(field, value);
    }
}

/// One differing leaf between two JSON documents.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValueChange {
    /// Dotted path, e.g. `fields.2.value`.
    pub path: String,
    pub before: Option<Value>,
    pub after: Option<Value>,
}

/// Recursively compare two JSON values and list the differing leaves.
#[must_use]
pub fn compare_values(before: &Value, after: &Value) -> Vec<ValueChange> {
    let mut out = Vec::new();
    compare_at(String::new(), Some(before), Some(after), &mut out);
    out
}

fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

fn compare_at(path: String, before: Option<&Value>, after: Option<&Value>, out: &mut Vec<ValueChange>) {
    match (before, after) {
        (Some(Value::Object(a)), Some(Value::Object(b))) => {
            for (key, value) in a {
                compare_at(join_path(&path, key), Some(value), b.get(key), out);
            }
            for (key, value) in b {
                if !a.contains_key(key) {
                    compare_at(join_path(&path, key), None, Some(value), out);
                }
            }
        }
        (Some(Value::Array(a)), Some(Value::Array(b))) => {
            for idx in 0..a.len().max(b.len()) {
                compare_at(join_path(&path, &idx.to_string()), a.get(idx), b.get(idx), out);
            }
        }
        (a, b) if a != b => out.push(ValueChange {
            path,
            before: a.cloned(),
            after: b.cloned(),
        }),
        _ => {}
    }
}

/// Predicate over a freshly computed value; the breakpoint only fires when it holds.
pub type BreakpointCondition = Box<dyn Fn(f64) -> bool>;

#[derive(Default)]
pub struct Breakpoint {
    pub enabled: bool,
    /// Times the breakpoint fired (enabled and condition held).
    pub hit_count: u64,
    condition: Option<BreakpointCondition>,
}

impl Breakpoint {
    fn new(condition: Option<BreakpointCondition>) -> Self {
        Self {
            enabled: true,
            hit_count: 0,
            condition,
        }
    }

    #[must_use]
    pub fn has_condition(&self) -> bool {
        self.condition.is_some()
    }

    fn fires_on(&self, value: f64) -> bool {
        self.enabled && self.condition.as_ref().map_or(true, |holds| holds(value))
    }
}

impl fmt::Debug for Breakpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Breakpoint")
            .field("enabled", &self.enabled)
            .field("hit_count", &self.hit_count)
            .field("has_condition", &self.has_condition())
            .finish()
    }
}

/// In-memory recorder: bounded log ring, named snapshots, and field breakpoints.
#[derive(Debug)]
pub struct DebugRecorder {
    enabled: bool,
    max_logs: usize,
    logs: VecDeque<LogEvent>,
    snapshots: BTreeMap<String, Snapshot>,
    latest: Option<Snapshot>,
    breakpoints: BTreeMap<String, Breakpoint>,
}

impl Default for DebugRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl DebugRecorder {
    pub const DEFAULT_MAX_LOGS: usize = 1000;

    #[must_use]
    pub fn new() -> Self {
        Self::with_max_logs(Self::DEFAULT_MAX_LOGS)
    }

    #[must_use]
    pub fn with_max_logs(max_logs: usize) -> Self {
        Self {
            enabled: true,
            max_logs,
            logs: VecDeque::new(),
            snapshots: BTreeMap::new(),
            latest: None,
            breakpoints: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn shared() -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self::new()))
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn logs(&self) -> impl Iterator<Item = &LogEvent> + '_ {
        self.logs.iter()
    }

    #[must_use]
    pub fn latest_snapshot(&self) -> Option<&Snapshot> {
        self.latest.as_ref()
    }

    /// Keep a copy of `snapshot` under `name` for later comparison.
    pub fn record_snapshot(&mut self, name: impl Into<String>, snapshot: &Snapshot) {
        self.snapshots.insert(name.into(), snapshot.clone());
    }

    #[must_use]
    pub fn snapshot(&self, name: &str) -> Option<&Snapshot> {
        self.snapshots.get(name)
    }

    /// Differences between two recorded snapshots; `None` if either name is unknown.
    #[must_use]
    pub fn compare(&self, before: &str, after: &str) -> Option<Vec<ValueChange>> {
        let before = self.snapshots.get(before)?;
        let after = self.snapshots.get(after)?;
        Some(compare_values(&before.to_json(), &after.to_json()))
    }

    /// Break on every recomputation of `field`. Replaces any existing breakpoint on it.
    pub fn set_breakpoint(&mut self, field: impl Into<String>) {
        self.breakpoints.insert(field.into(), Breakpoint::new(None));
    }

    /// Break on recomputations of `field` whose new value satisfies `condition`.
    pub fn set_conditional_breakpoint(
        &mut self,
        field: impl Into<String>,
        condition: impl Fn(f64) -> bool + 'static,
    ) {
        self.breakpoints
            .insert(field.into(), Breakpoint::new(Some(Box::new(condition))));
    }

    /// Flip a breakpoint between enabled and disabled, returning the new state. Hit counts are
    /// kept. `None` if `field` has no breakpoint.
    pub fn toggle_breakpoint(&mut self, field: &str) -> Option<bool> {
        let bp = self.breakpoints.get_mut(field)?;
        bp.enabled = !bp.enabled;
        Some(bp.enabled)
    }

    pub fn remove_breakpoint(&mut self, field: &str) -> bool {
        self.breakpoints.remove(field).is_some()
    }

    #[must_use]
    pub fn breakpoint(&self, field: &str) -> Option<&Breakpoint> {
        self.breakpoints.get(field)
    }

    /// Drop logs, named snapshots and breakpoints.
    pub fn clear(&mut self) {
        self.logs.clear();
        self.snapshots.clear();
        self.latest = None;
        self.breakpoints.clear();
    }

    fn push_log(&mut self, event: LogEvent) {
        if self.max_logs == 0 {
            return;
        }
        while self.logs.len() >= self.max_logs {
            self.logs.pop_front();
        }
        self.logs.push_back(event);
    }
}

impl DebugSink for DebugRecorder {
    fn on_log(&mut self, event: &LogEvent) {
        if self.enabled {
            self.push_log(event.clone());
        }
    }

    fn on_snapshot(&mut self, snapshot: &Snapshot) {
        if self.enabled {
            self.latest = Some(snapshot.clone());
        }
    }

    fn on_field_computed(&mut self, field: &str, value: f64) {
        if !self.enabled {
            return;
        }
        let Some(bp) = self.breakpoints.get_mut(field) else {
            return;
        };
        if !bp.fires_on(value) {
            return;
        }
        bp.hit_count += 1;
        let hit_count = bp.hit_count;
        self.push_log(LogEvent::new(
            log::Level::Debug,
            format!("breakpoint hit: {field}"),
            Some(serde_json::json!({ "field": field, "value": value, "hitCount": hit_count })),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn log_ring_is_bounded() {
        let mut recorder = DebugRecorder::with_max_logs(2);
        for i in 0..3 {
            recorder.on_log(&LogEvent::new(log::Level::Info, format!("event {i}"), None));
        }
        let messages: Vec<&str> = recorder.logs().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["event 1", "event 2"]);
    }

    #[test]
    fn disabled_recorder_ignores_events() {
        let mut recorder = DebugRecorder::new();
        recorder.disable();
        recorder.on_log(&LogEvent::new(log::Level::Info, "ignored", None));
        assert_eq!(recorder.logs().count(), 0);
    }

    #[test]
    fn compares_nested_values() {
        let before = json!({ "a": 1, "nested": { "x": [1, 2] }, "gone": true });
        let after = json!({ "a": 2, "nested": { "x": [1, 3, 4] }, "new": "y" });
        let changes = compare_values(&before, &after);
        let paths: Vec<&str> = changes.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(paths, vec!["a", "nested.x.1", "nested.x.2", "gone", "new"]);
        assert_eq!(changes[2].before, None);
        assert_eq!(changes[2].after, Some(json!(4)));
    }

    #[test]
    fn breakpoints_count_hits() {
        let mut recorder = DebugRecorder::new();
        recorder.set_breakpoint("total");
        recorder.on_field_computed("total", 40.0);
        recorder.on_field_computed("other", 1.0);
        recorder.on_field_computed("total", 41.0);

        assert_eq!(recorder.breakpoint("total").unwrap().hit_count, 2);
        let last = recorder.logs().last().unwrap();
        assert_eq!(last.message, "breakpoint hit: total");
        assert_eq!(last.data.as_ref().unwrap()["hitCount"], 2);

        assert!(recorder.remove_breakpoint("total"));
        assert!(recorder.breakpoint("total").is_none());
    }

    #[test]
    fn log_event_serializes_level_as_string() {
        let event = LogEvent::new(log::Level::Warn, "careful", Some(json!({ "field": "a" })));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["level"], "WARN");
        assert_eq!(json["data"]["field"], "a");
    }
}
