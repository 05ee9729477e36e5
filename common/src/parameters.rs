use crate::Real;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParameterError {
    #[error("required parameter `{0}` is missing")]
    Missing(String),

    #[error("parameter `{name}` should be {expected}, got {found}")]
    WrongKind {
        name: String,
        expected: &'static str,
        found: &'static str,
    },
}

/// One primitive parameter value.
///
/// `Int` is declared before `Float` so untagged deserialization keeps
/// whole numbers as integers and a serialized map replays with the same
/// kinds it was produced with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Int(i64),
    Float(Real),
    Bool(bool),
    Choice(String),
}

impl ParameterValue {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Int(_) => "an integer",
            Self::Float(_) => "a float",
            Self::Bool(_) => "a boolean",
            Self::Choice(_) => "a choice string",
        }
    }
}

impl From<Real> for ParameterValue {
    fn from(value: Real) -> Self {
        Self::Float(value)
    }
}

impl From<i64> for ParameterValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for ParameterValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for ParameterValue {
    fn from(value: &str) -> Self {
        Self::Choice(value.to_owned())
    }
}

impl From<String> for ParameterValue {
    fn from(value: String) -> Self {
        Self::Choice(value)
    }
}

/// Flat, ordered name-to-value map that fully determines one analysis run.
///
/// Every numeric bound an analysis uses must come through here so a result
/// can be reproduced from its recorded parameters alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Parameters(BTreeMap<String, ParameterValue>);

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<ParameterValue>) {
        self.0.insert(name.into(), value.into());
    }

    /// Chainable form of [`set`](Self::set) for literal parameter sets.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<ParameterValue>) -> Self {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParameterValue> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParameterValue)> {
        self.0.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Required float; an integer value is widened rather than rejected,
    /// since form layers routinely send `5` for `5.0`.
    pub fn float(&self, name: &str) -> Result<Real, ParameterError> {
        match self.0.get(name) {
            Some(ParameterValue::Float(value)) => Ok(*value),
            Some(ParameterValue::Int(value)) => Ok(*value as Real),
            Some(other) => Err(wrong_kind(name, "a float", other)),
            None => Err(ParameterError::Missing(name.to_owned())),
        }
    }

    pub fn float_or(&self, name: &str, default: Real) -> Result<Real, ParameterError> {
        match self.optional_float(name)? {
            Some(value) => Ok(value),
            None => Ok(default),
        }
    }

    pub fn optional_float(&self, name: &str) -> Result<Option<Real>, ParameterError> {
        match self.0.get(name) {
            Some(ParameterValue::Float(value)) => Ok(Some(*value)),
            Some(ParameterValue::Int(value)) => Ok(Some(*value as Real)),
            Some(other) => Err(wrong_kind(name, "a float", other)),
            None => Ok(None),
        }
    }

    pub fn int(&self, name: &str) -> Result<i64, ParameterError> {
        match self.0.get(name) {
            Some(ParameterValue::Int(value)) => Ok(*value),
            Some(other) => Err(wrong_kind(name, "an integer", other)),
            None => Err(ParameterError::Missing(name.to_owned())),
        }
    }

    pub fn int_or(&self, name: &str, default: i64) -> Result<i64, ParameterError> {
        match self.0.get(name) {
            Some(ParameterValue::Int(value)) => Ok(*value),
            Some(other) => Err(wrong_kind(name, "an integer", other)),
            None => Ok(default),
        }
    }

    pub fn boolean_or(&self, name: &str, default: bool) -> Result<bool, ParameterError> {
        match self.0.get(name) {
            Some(ParameterValue::Bool(value)) => Ok(*value),
            Some(other) => Err(wrong_kind(name, "a boolean", other)),
            None => Ok(default),
        }
    }

    pub fn choice(&self, name: &str) -> Result<&str, ParameterError> {
        match self.0.get(name) {
            Some(ParameterValue::Choice(value)) => Ok(value),
            Some(other) => Err(wrong_kind(name, "a choice string", other)),
            None => Err(ParameterError::Missing(name.to_owned())),
        }
    }

    pub fn choice_or<'a>(
        &'a self,
        name: &str,
        default: &'a str,
    ) -> Result<&'a str, ParameterError> {
        match self.0.get(name) {
            Some(ParameterValue::Choice(value)) => Ok(value),
            Some(other) => Err(wrong_kind(name, "a choice string", other)),
            None => Ok(default),
        }
    }
}

fn wrong_kind(name: &str, expected: &'static str, found: &ParameterValue) -> ParameterError {
    ParameterError::WrongKind {
        name: name.to_owned(),
        expected,
        found: found.kind_name(),
    }
}

/// Declared kind of a parameter, for schema consumers building forms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "type")]
pub enum ParameterKind {
    Float,
    Int,
    Bool,
    Choice { options: Vec<String> },
}

/// One entry of an analysis parameter schema: enough for a host to render
/// an input, validate a value, and fall back to the default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ParameterDescriptor {
    pub name: String,
    pub label: String,
    pub kind: ParameterKind,
    pub default: ParameterValue,
    /// Inclusive numeric bounds, meaningful for `Float` and `Int` kinds.
    pub bounds: Option<(Real, Real)>,
    /// Name of a boolean parameter gating this one's visibility in a form.
    pub visible_when: Option<String>,
}

impl ParameterDescriptor {
    pub fn new(
        name: impl Into<String>,
        label: impl Into<String>,
        kind: ParameterKind,
        default: impl Into<ParameterValue>,
    ) -> Self {
        Self {
            name: name.into(),
            label: label.into(),
            kind,
            default: default.into(),
            bounds: None,
            visible_when: None,
        }
    }

    pub fn with_bounds(mut self, low: Real, high: Real) -> Self {
        self.bounds = Some((low, high));
        self
    }

    pub fn visible_when(mut self, gate: impl Into<String>) -> Self {
        self.visible_when = Some(gate.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_getters_enforce_kinds() {
        let parameters = Parameters::new()
            .with("threshold", -5.0)
            .with("order", 4_i64)
            .with("reject", true)
            .with("direction", "negative");

        assert_eq!(parameters.float("threshold").unwrap(), -5.0);
        assert_eq!(parameters.int("order").unwrap(), 4);
        assert!(parameters.boolean_or("reject", false).unwrap());
        assert_eq!(parameters.choice("direction").unwrap(), "negative");

        assert!(matches!(
            parameters.float("direction"),
            Err(ParameterError::WrongKind { .. })
        ));
        assert!(matches!(
            parameters.float("missing"),
            Err(ParameterError::Missing(_))
        ));
    }

    #[test]
    fn integers_widen_to_floats() {
        let parameters = Parameters::new().with("tau", 5_i64);
        assert_eq!(parameters.float("tau").unwrap(), 5.0);
        assert_eq!(parameters.optional_float("tau").unwrap(), Some(5.0));
    }

    #[test]
    fn defaults_apply_only_when_missing() {
        let parameters = Parameters::new().with("cutoff", 250.0);
        assert_eq!(parameters.float_or("cutoff", 1000.0).unwrap(), 250.0);
        assert_eq!(parameters.float_or("absent", 1000.0).unwrap(), 1000.0);
        assert_eq!(parameters.optional_float("absent").unwrap(), None);
    }

    #[test]
    fn serde_round_trip_preserves_kinds() {
        let parameters = Parameters::new()
            .with("tau_rise_ms", 1.0)
            .with("order", 4_i64)
            .with("reject", false)
            .with("direction", "positive");

        let text = serde_json::to_string(&parameters).unwrap();
        let replayed: Parameters = serde_json::from_str(&text).unwrap();
        assert_eq!(parameters, replayed);
        assert!(matches!(
            replayed.get("order"),
            Some(ParameterValue::Int(4))
        ));
        assert!(matches!(
            replayed.get("tau_rise_ms"),
            Some(ParameterValue::Float(_))
        ));
    }
}
