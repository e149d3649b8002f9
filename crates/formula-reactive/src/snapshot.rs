//! Immutable state snapshots and their delivery to subscribers.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::config::{Configuration, Field};
use crate::error::EngineError;
use crate::format::format_number;

/// A deep, independent copy of every field at one consistent point in time.
///
/// Snapshots own all of their data; nothing a consumer does with one can reach engine state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    revision: u64,
    fields: Vec<Field>,
    #[serde(serialize_with = "serialize_errors")]
    errors: Vec<EngineError>,
}

fn serialize_errors<S>(errors: &[EngineError], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.collect_seq(errors.iter().map(ToString::to_string))
}

impl Snapshot {
    #[must_use]
    pub fn capture(revision: u64, config: &Configuration, errors: Vec<EngineError>) -> Self {
        Self {
            revision,
            fields: config.iter().cloned().collect(),
            errors,
        }
    }

    /// Number of passes published before this snapshot was taken (0 = initial state).
    #[must_use]
    pub fn revision(&self) -> u64 {
        self.revision
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    #[must_use]
    pub fn value(&self, name: &str) -> Option<f64> {
        self.get(name).map(|f| f.value)
    }

    /// Fields in configuration order.
    pub fn fields(&self) -> impl Iterator<Item = &Field> + '_ {
        self.fields.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Outstanding per-field errors when the snapshot was taken, in field order.
    #[must_use]
    pub fn errors(&self) -> &[EngineError] {
        &self.errors
    }

    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// One line per field: `name (description): 1,234.50unit`.
    #[must_use]
    pub fn format_report(&self) -> String {
        self.fields
            .iter()
            .map(|field| {
                let precision = field.meta.precision().unwrap_or(2);
                let unit = field.meta.unit().unwrap_or("");
                let value = format_number(field.value, precision, unit, true);
                match field.meta.description() {
                    Some(description) => format!("{} ({description}): {value}", field.name),
                    None => format!("{}: {value}", field.name),
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Returned by a subscriber callback to signal that it could not handle a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct SubscriberError(pub String);

impl From<&str> for SubscriberError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

impl From<String> for SubscriberError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

pub type SubscriberResult = Result<(), SubscriberError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subscription#{}", self.0)
    }
}

type Callback = Box<dyn FnMut(&Snapshot) -> SubscriberResult>;

/// Delivers snapshots to subscribers synchronously, in registration order.
#[derive(Default)]
pub struct SnapshotNotifier {
    next_id: u64,
    subscribers: Vec<(SubscriptionId, Callback)>,
}

impl fmt::Debug for SnapshotNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotNotifier")
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

impl SnapshotNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&mut self, callback: F) -> SubscriptionId
    where
        F: FnMut(&Snapshot) -> SubscriberResult + 'static,
    {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.subscribers.push((id, Box::new(callback)));
        id
    }

    /// Returns `false` when `id` was not subscribed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sub, _)| *sub != id);
        self.subscribers.len() != before
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Deliver `snapshot` to every subscriber.
    ///
    /// A subscriber that returns an error or panics does not prevent later subscribers from
    /// receiving the snapshot; its failure is returned to the caller instead.
    pub fn publish(&mut self, snapshot: &Snapshot) -> Vec<(SubscriptionId, SubscriberError)> {
        let mut failures = Vec::new();
        for (id, callback) in &mut self.subscribers {
            match catch_unwind(AssertUnwindSafe(|| callback(snapshot))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => failures.push((*id, err)),
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| (*s).to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "subscriber panicked".to_string());
                    failures.push((*id, SubscriberError(format!("panic: {message}"))));
                }
            }
        }
        failures
    }
}
