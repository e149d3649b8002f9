//! Field configuration: the raw, caller-supplied form and the validated [`Configuration`].

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::{EngineError, EngineResult};
use crate::format::ValidationRule;
use crate::parser::{check_formula, extract_variables, is_function_name};

/// Index of a field in [`Configuration`] insertion order.
pub type FieldId = usize;

/// One entry of a raw configuration, as written by the host.
///
/// ```json
/// { "value": 5.99, "eqn": "", "unit": "元", "precision": 2 }
/// ```
///
/// Every key other than `value` and `eqn`/`formula` is kept as auxiliary metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawField {
    #[serde(default)]
    pub value: Value,
    #[serde(default, alias = "formula", skip_serializing_if = "Option::is_none")]
    pub eqn: Option<String>,
    #[serde(flatten)]
    pub meta: Map<String, Value>,
}

impl RawField {
    #[must_use]
    pub fn input(value: f64) -> Self {
        Self {
            value: Value::from(value),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn derived(formula: impl Into<String>) -> Self {
        Self {
            value: Value::from(0.0),
            eqn: Some(formula.into()),
            meta: Map::new(),
        }
    }

    /// Seed value for a derived field (kept until the first successful evaluation).
    #[must_use]
    pub fn with_value(mut self, value: f64) -> Self {
        self.value = Value::from(value);
        self
    }

    #[must_use]
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_precision(self, precision: u32) -> Self {
        self.with_meta("precision", precision)
    }

    #[must_use]
    pub fn with_unit(self, unit: impl Into<String>) -> Self {
        self.with_meta("unit", unit.into())
    }

    #[must_use]
    pub fn with_validation(self, rule: ValidationRule) -> Self {
        let rule = serde_json::to_value(rule).unwrap_or(Value::Null);
        self.with_meta("validation", rule)
    }
}

/// Caller-supplied field mapping. Entry order is preserved.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawConfig {
    entries: Vec<(String, RawField)>,
}

impl RawConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn field(mut self, name: impl Into<String>, field: RawField) -> Self {
        self.push(name, field);
        self
    }

    pub fn push(&mut self, name: impl Into<String>, field: RawField) {
        self.entries.push((name.into(), field));
    }

    #[must_use]
    pub fn entries(&self) -> &[(String, RawField)] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parse a JSON object of `name -> field` entries.
    pub fn from_json_str(json: &str) -> EngineResult<Self> {
        serde_json::from_str(json).map_err(|err| EngineError::InvalidConfig {
            field: String::new(),
            reason: err.to_string(),
        })
    }

    pub fn from_json_value(value: Value) -> EngineResult<Self> {
        serde_json::from_value(value).map_err(|err| EngineError::InvalidConfig {
            field: String::new(),
            reason: err.to_string(),
        })
    }
}

impl<'de> Deserialize<'de> for RawConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct RawConfigVisitor;

        impl<'de> Visitor<'de> for RawConfigVisitor {
            type Value = RawConfig;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of field names to field definitions")
            }

            fn visit_map<A>(self, mut map: A) -> Result<RawConfig, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut config = RawConfig::new();
                while let Some((name, field)) = map.next_entry::<String, RawField>()? {
                    config.push(name, field);
                }
                Ok(config)
            }
        }

        deserializer.deserialize_map(RawConfigVisitor)
    }
}

/// Auxiliary per-field metadata (unit, precision, description, validation and any extra keys).
///
/// Stored as a JSON object so nested structures of any depth can be addressed and mutated
/// through [`crate::store::MetaCursor`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct FieldMeta(Map<String, Value>);

impl FieldMeta {
    #[must_use]
    pub fn new(map: Map<String, Value>) -> Self {
        Self(map)
    }

    #[must_use]
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub(crate) fn as_map_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.0
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    #[must_use]
    pub fn unit(&self) -> Option<&str> {
        self.0.get("unit").and_then(Value::as_str)
    }

    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.0.get("description").and_then(Value::as_str)
    }

    #[must_use]
    pub fn precision(&self) -> Option<u32> {
        self.0
            .get("precision")
            .and_then(Value::as_u64)
            .and_then(|p| u32::try_from(p).ok())
    }

    /// The `validation` rule, if present and well formed.
    #[must_use]
    pub fn validation(&self) -> Option<ValidationRule> {
        let rule = self.0.get("validation")?;
        match serde_json::from_value(rule.clone()) {
            Ok(rule) => Some(rule),
            Err(err) => {
                log::warn!("ignoring malformed validation rule {rule}: {err}");
                None
            }
        }
    }
}

/// A named slot holding either an input value or a formula-derived value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Field {
    pub name: String,
    /// Last successfully computed (or directly assigned) value.
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,
    /// Variables referenced by `formula`, fixed at configuration time.
    pub depends_on: BTreeSet<String>,
    /// Whether `value` is the result of a successful formula evaluation.
    pub computed: bool,
    pub meta: FieldMeta,
}

impl Field {
    #[must_use]
    pub fn is_derived(&self) -> bool {
        self.formula.is_some()
    }
}

/// Validated field collection in insertion order.
#[derive(Debug, Clone, Default)]
pub struct Configuration {
    fields: Vec<Field>,
    index: HashMap<String, FieldId>,
}

impl Configuration {
    /// Validate `raw`.
    ///
    /// Returns the configuration plus non-fatal warnings (formula syntax problems). Malformed
    /// values, empty or duplicate names, and names that shadow a built-in function (formulas could
    /// never reference them) are fatal [`EngineError::InvalidConfig`]s.
    pub fn from_raw(raw: &RawConfig) -> EngineResult<(Self, Vec<EngineError>)> {
        let mut config = Configuration::default();
        let mut warnings = Vec::new();

        for (name, raw_field) in raw.entries() {
            let invalid = |reason: String| EngineError::InvalidConfig {
                field: name.clone(),
                reason,
            };

            if name.trim().is_empty() {
                return Err(invalid("field name must not be empty".to_string()));
            }
            if config.index.contains_key(name) {
                return Err(invalid("duplicate field name".to_string()));
            }
            if is_function_name(name) {
                return Err(invalid(format!(
                    "field name collides with function `{name}()`"
                )));
            }

            let value = match &raw_field.value {
                Value::Null => 0.0,
                Value::Number(n) => n
                    .as_f64()
                    .filter(|v| v.is_finite())
                    .ok_or_else(|| invalid(format!("value {n} is not a finite number")))?,
                other => return Err(invalid(format!("value {other} is not a number"))),
            };

            let formula = raw_field
                .eqn
                .as_deref()
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(str::to_string);

            let depends_on = formula
                .as_deref()
                .map(extract_variables)
                .unwrap_or_default();

            if let Some(formula) = &formula {
                if let Err(err) = check_formula(formula) {
                    warnings.push(EngineError::InvalidFormulaSyntax {
                        field: name.clone(),
                        formula: formula.clone(),
                        reason: err.to_string(),
                    });
                }
            }

            config.index.insert(name.clone(), config.fields.len());
            config.fields.push(Field {
                name: name.clone(),
                value,
                formula,
                depends_on,
                computed: false,
                meta: FieldMeta::new(raw_field.meta.clone()),
            });
        }

        Ok((config, warnings))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    #[must_use]
    pub fn id_of(&self, name: &str) -> Option<FieldId> {
        self.index.get(name).copied()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Field> {
        self.fields.get(self.id_of(name)?)
    }

    #[must_use]
    pub fn by_id(&self, id: FieldId) -> Option<&Field> {
        self.fields.get(id)
    }

    pub(crate) fn by_id_mut(&mut self, id: FieldId) -> Option<&mut Field> {
        self.fields.get_mut(id)
    }

    /// Fields in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Field> + '_ {
        self.fields.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_json_preserving_order_and_metadata() {
        let raw = RawConfig::from_json_str(
            r#"{
                "quantity": { "value": 100, "unit": "个", "precision": 0,
                              "validation": { "min": 0, "max": 1000 } },
                "unitPrice": { "value": 5.99, "eqn": "" },
                "total": { "value": 0, "eqn": "quantity * unitPrice", "precision": 2 }
            }"#,
        )
        .unwrap();

        let (config, warnings) = Configuration::from_raw(&raw).unwrap();
        assert!(warnings.is_empty());

        let names: Vec<&str> = config.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["quantity", "unitPrice", "total"]);

        let quantity = config.get("quantity").unwrap();
        assert_eq!(quantity.value, 100.0);
        assert!(!quantity.is_derived());
        assert_eq!(quantity.meta.unit(), Some("个"));
        assert_eq!(quantity.meta.validation().unwrap().max, Some(1000.0));

        // Empty `eqn` marks an input field.
        assert_eq!(config.get("unitPrice").unwrap().formula, None);

        let total = config.get("total").unwrap();
        assert_eq!(total.formula.as_deref(), Some("quantity * unitPrice"));
        assert_eq!(
            total.depends_on.iter().cloned().collect::<Vec<_>>(),
            vec!["quantity".to_string(), "unitPrice".to_string()]
        );
        assert_eq!(total.meta.precision(), Some(2));
    }

    #[test]
    fn formula_alias_is_accepted() {
        let raw = RawConfig::from_json_str(r#"{ "a": { "value": 1 }, "b": { "formula": "a + 1" } }"#)
            .unwrap();
        let (config, _) = Configuration::from_raw(&raw).unwrap();
        assert_eq!(config.get("b").unwrap().formula.as_deref(), Some("a + 1"));
        assert_eq!(config.get("b").unwrap().value, 0.0);
    }

    #[test]
    fn rejects_non_numeric_values() {
        let raw = RawConfig::from_json_str(r#"{ "a": { "value": "ten" } }"#).unwrap();
        let err = Configuration::from_raw(&raw).unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig { ref field, .. } if field == "a"));
    }

    #[test]
    fn rejects_duplicate_and_empty_names() {
        let raw = RawConfig::new()
            .field("a", RawField::input(1.0))
            .field("a", RawField::input(2.0));
        assert!(matches!(
            Configuration::from_raw(&raw),
            Err(EngineError::InvalidConfig { .. })
        ));

        let raw = RawConfig::new().field(" ", RawField::input(1.0));
        assert!(matches!(
            Configuration::from_raw(&raw),
            Err(EngineError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn rejects_names_of_builtin_functions() {
        let raw = RawConfig::new()
            .field("max", RawField::input(1.0))
            .field("double", RawField::derived("max * 2"));
        let err = Configuration::from_raw(&raw).unwrap_err();
        assert_eq!(
            err,
            EngineError::InvalidConfig {
                field: "max".into(),
                reason: "field name collides with function `max()`".into(),
            }
        );

        let raw = RawConfig::new().field("maximum", RawField::input(1.0));
        assert!(Configuration::from_raw(&raw).is_ok());
    }

    #[test]
    fn rejects_non_object_json() {
        assert!(matches!(
            RawConfig::from_json_str("[1, 2]"),
            Err(EngineError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn syntax_problems_are_warnings() {
        let raw = RawConfig::new()
            .field("a", RawField::input(1.0))
            .field("b", RawField::derived("a +* 2"));
        let (config, warnings) = Configuration::from_raw(&raw).unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(matches!(warnings[0], EngineError::InvalidFormulaSyntax { ref field, .. } if field == "b"));
        assert!(config.get("b").unwrap().depends_on.contains("a"));
    }
}
