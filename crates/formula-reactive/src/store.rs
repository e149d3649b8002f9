//! Observable field storage.
//!
//! Every successful write is recorded as a [`Mutation`]; the engine drains the log after each
//! write and turns value mutations into scheduled recompute passes. Callers never notify
//! anything themselves.

use serde_json::{Map, Value};

use crate::config::{Configuration, Field, FieldId};
use crate::error::{EngineError, EngineResult};
use crate::format::validate_number_range;

/// A single observed change.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// An input field's value changed.
    Value { field: String, old: f64, new: f64 },
    /// Auxiliary metadata changed at `path` (`None` means the key was removed).
    Meta {
        field: String,
        path: Vec<String>,
        value: Option<Value>,
    },
}

impl Mutation {
    #[must_use]
    pub fn field(&self) -> &str {
        match self {
            Mutation::Value { field, .. } | Mutation::Meta { field, .. } => field,
        }
    }
}

#[derive(Debug)]
pub struct ReactiveStore {
    config: Configuration,
    mutations: Vec<Mutation>,
}

impl ReactiveStore {
    #[must_use]
    pub fn new(config: Configuration) -> Self {
        Self {
            config,
            mutations: Vec::new(),
        }
    }

    #[must_use]
    pub fn configuration(&self) -> &Configuration {
        &self.config
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<f64> {
        self.config.get(name).map(|f| f.value)
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.config.get(name)
    }

    /// Assign an input field.
    ///
    /// Returns `Ok(true)` and records exactly one [`Mutation::Value`] when the stored value
    /// changed; `Ok(false)` (and no mutation) when `value` equals the current value.
    pub fn set(&mut self, name: &str, value: f64) -> EngineResult<bool> {
        let id = self
            .config
            .id_of(name)
            .ok_or_else(|| EngineError::UnknownField(name.to_string()))?;
        let Some(field) = self.config.by_id_mut(id) else {
            return Err(EngineError::UnknownField(name.to_string()));
        };

        if field.is_derived() {
            return Err(EngineError::DerivedFieldReadOnly(field.name.clone()));
        }
        if !value.is_finite() {
            return Err(EngineError::InvalidValue {
                field: field.name.clone(),
                value,
            });
        }
        if let Some(rule) = field.meta.validation() {
            validate_number_range(value, &rule).map_err(|reason| EngineError::ValidationFailed {
                field: field.name.clone(),
                value,
                reason,
            })?;
        }

        if field.value == value {
            return Ok(false);
        }

        let old = std::mem::replace(&mut field.value, value);
        self.mutations.push(Mutation::Value {
            field: field.name.clone(),
            old,
            new: value,
        });
        Ok(true)
    }

    /// Cursor over `name`'s metadata for observable nested writes.
    pub fn meta_mut(&mut self, name: &str) -> EngineResult<MetaCursor<'_>> {
        let field = self
            .config
            .id_of(name)
            .ok_or_else(|| EngineError::UnknownField(name.to_string()))?;
        Ok(MetaCursor {
            store: self,
            field,
            path: Vec::new(),
        })
    }

    /// Drain the recorded mutations, oldest first.
    pub fn take_mutations(&mut self) -> Vec<Mutation> {
        std::mem::take(&mut self.mutations)
    }

    /// Evaluator-owned write path for derived fields. Not recorded as a mutation.
    pub(crate) fn write_computed(&mut self, id: FieldId, value: f64) {
        if let Some(field) = self.config.by_id_mut(id) {
            field.value = value;
            field.computed = true;
        }
    }
}

/// Points at a (possibly nested) object inside a field's metadata.
///
/// Descending with [`MetaCursor::at`] only extends the path, so nesting cursors any number of
/// times addresses the same storage.
pub struct MetaCursor<'a> {
    store: &'a mut ReactiveStore,
    field: FieldId,
    path: Vec<String>,
}

impl<'a> MetaCursor<'a> {
    #[must_use]
    pub fn at(mut self, key: impl Into<String>) -> Self {
        self.path.push(key.into());
        self
    }

    #[must_use]
    pub fn path(&self) -> &[String] {
        &self.path
    }

    /// Value at the cursor position.
    #[must_use]
    pub fn get(&self) -> Option<&Value> {
        let field = self.store.config.by_id(self.field)?;
        let (first, rest) = self.path.split_first()?;
        let mut cur = field.meta.get(first)?;
        for key in rest {
            cur = cur.as_object()?.get(key)?;
        }
        Some(cur)
    }

    /// Set `key` on the object at the cursor, creating missing intermediate objects.
    ///
    /// Returns `Ok(false)` without recording a mutation when the stored value is already equal.
    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> EngineResult<bool> {
        let key = key.into();
        let value = value.into();
        let (field_name, object) = self.object_mut(true)?;
        let Some(object) = object else {
            return Ok(false);
        };
        if object.get(&key) == Some(&value) {
            return Ok(false);
        }
        object.insert(key.clone(), value.clone());

        let mut path = self.path;
        path.push(key);
        self.store.mutations.push(Mutation::Meta {
            field: field_name,
            path,
            value: Some(value),
        });
        Ok(true)
    }

    /// Remove `key` from the object at the cursor. Returns whether a key was removed.
    pub fn remove(mut self, key: &str) -> EngineResult<bool> {
        let (field_name, object) = self.object_mut(false)?;
        let removed = object.and_then(|o| o.remove(key)).is_some();
        if removed {
            let mut path = self.path;
            path.push(key.to_string());
            self.store.mutations.push(Mutation::Meta {
                field: field_name,
                path,
                value: None,
            });
        }
        Ok(removed)
    }

    fn object_mut(&mut self, create: bool) -> EngineResult<(String, Option<&mut Map<String, Value>>)> {
        let field = self
            .store
            .config
            .by_id_mut(self.field)
            .ok_or_else(|| EngineError::UnknownField(format!("#{}", self.field)))?;
        let name = field.name.clone();

        let mut cur = field.meta.as_map_mut();
        for key in &self.path {
            if !cur.contains_key(key) {
                if !create {
                    return Ok((name, None));
                }
                cur.insert(key.clone(), Value::Object(Map::new()));
            }
            cur = match cur.get_mut(key) {
                Some(Value::Object(next)) => next,
                _ => {
                    return Err(EngineError::InvalidConfig {
                        field: name,
                        reason: format!("metadata at {:?} is not an object", key),
                    })
                }
            };
        }
        Ok((name, Some(cur)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RawConfig, RawField};
    use crate::format::ValidationRule;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn store() -> ReactiveStore {
        let raw = RawConfig::new()
            .field(
                "qty",
                RawField::input(10.0).with_validation(ValidationRule {
                    min: Some(0.0),
                    max: Some(1000.0),
                    precision: Some(0),
                }),
            )
            .field("price", RawField::input(2.0).with_unit("元"))
            .field("total", RawField::derived("qty * price"));
        ReactiveStore::new(Configuration::from_raw(&raw).unwrap().0)
    }

    #[test]
    fn set_records_one_mutation_per_change() {
        let mut store = store();
        assert_eq!(store.set("qty", 20.0), Ok(true));
        assert_eq!(store.get("qty"), Some(20.0));
        assert_eq!(
            store.take_mutations(),
            vec![Mutation::Value {
                field: "qty".into(),
                old: 10.0,
                new: 20.0
            }]
        );
    }

    #[test]
    fn setting_equal_value_is_silent() {
        let mut store = store();
        assert_eq!(store.set("qty", 10.0), Ok(false));
        assert!(store.take_mutations().is_empty());
    }

    #[test]
    fn rejects_invalid_writes() {
        let mut store = store();
        assert_eq!(
            store.set("nope", 1.0),
            Err(EngineError::UnknownField("nope".into()))
        );
        assert_eq!(
            store.set("total", 1.0),
            Err(EngineError::DerivedFieldReadOnly("total".into()))
        );
        assert!(matches!(
            store.set("price", f64::NAN),
            Err(EngineError::InvalidValue { .. })
        ));
        assert!(matches!(
            store.set("qty", 5000.0),
            Err(EngineError::ValidationFailed { .. })
        ));
        assert_eq!(store.get("qty"), Some(10.0));
        assert!(store.take_mutations().is_empty());
    }

    #[test]
    fn nested_metadata_writes_are_observed() {
        let mut store = store();
        let changed = store
            .meta_mut("price")
            .unwrap()
            .at("display")
            .at("style")
            .set("color", "red")
            .unwrap();
        assert!(changed);
        assert_eq!(
            store.field("price").unwrap().meta.get("display"),
            Some(&json!({ "style": { "color": "red" } }))
        );
        assert_eq!(
            store.take_mutations(),
            vec![Mutation::Meta {
                field: "price".into(),
                path: vec!["display".into(), "style".into(), "color".into()],
                value: Some(json!("red")),
            }]
        );

        // Same value again: no mutation.
        let changed = store
            .meta_mut("price")
            .unwrap()
            .at("display")
            .at("style")
            .set("color", "red")
            .unwrap();
        assert!(!changed);
        assert!(store.take_mutations().is_empty());
    }

    #[test]
    fn metadata_cursor_reads_and_removes() {
        let mut store = store();
        let cursor = store.meta_mut("price").unwrap().at("unit");
        assert_eq!(cursor.get(), Some(&json!("元")));

        assert_eq!(store.meta_mut("price").unwrap().remove("unit"), Ok(true));
        assert_eq!(store.meta_mut("price").unwrap().remove("unit"), Ok(false));
        assert_eq!(store.field("price").unwrap().meta.unit(), None);
        assert_eq!(store.take_mutations().len(), 1);
    }

    #[test]
    fn descending_into_scalar_metadata_fails() {
        let mut store = store();
        let err = store
            .meta_mut("price")
            .unwrap()
            .at("unit")
            .set("x", 1)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig { .. }));
    }

    #[test]
    fn computed_writes_are_not_mutations() {
        let mut store = store();
        let total = store.configuration().id_of("total").unwrap();
        store.write_computed(total, 20.0);
        assert_eq!(store.get("total"), Some(20.0));
        assert!(store.field("total").unwrap().computed);
        assert!(store.take_mutations().is_empty());
    }
}
