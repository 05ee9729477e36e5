use crate::{Parameters, Real};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Reserved key marking a recoverable non-finding ("window empty",
/// "no events found"). Presence of this key is the failure signal; the
/// value is the human-readable message.
pub const ERROR_KEY: &str = "error";

/// Keys starting with this prefix are overlay data for plot layers and are
/// excluded from any tabular presentation of the result.
pub const OVERLAY_PREFIX: char = '_';

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResultValue {
    Scalar(Real),
    Array(Vec<Real>),
    Text(String),
}

impl ResultValue {
    pub fn as_scalar(&self) -> Option<Real> {
        match self {
            Self::Scalar(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Real]> {
        match self {
            Self::Array(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }
}

impl From<Real> for ResultValue {
    fn from(value: Real) -> Self {
        Self::Scalar(value)
    }
}

impl From<usize> for ResultValue {
    fn from(value: usize) -> Self {
        Self::Scalar(value as Real)
    }
}

impl From<Vec<Real>> for ResultValue {
    fn from(values: Vec<Real>) -> Self {
        Self::Array(values)
    }
}

impl From<&str> for ResultValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for ResultValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// Flat key-to-value map produced by one analysis run, carrying an embedded
/// copy of the [`Parameters`] that produced it.
///
/// Consumers split the keys by the leading-underscore convention:
/// [`table_entries`](Self::table_entries) feeds result tables and exports,
/// [`overlay_entries`](Self::overlay_entries) feeds plot overlays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    values: BTreeMap<String, ResultValue>,
    parameters: Parameters,
}

impl AnalysisResult {
    pub fn new(parameters: Parameters) -> Self {
        Self {
            values: BTreeMap::new(),
            parameters,
        }
    }

    /// A result whose only content is the reserved error key.
    pub fn error(parameters: Parameters, message: impl Into<String>) -> Self {
        let mut result = Self::new(parameters);
        result.insert(ERROR_KEY, message.into());
        result
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<ResultValue>) {
        self.values.insert(key.into(), value.into());
    }

    /// Chainable form of [`insert`](Self::insert).
    pub fn with(mut self, key: impl Into<String>, value: impl Into<ResultValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&ResultValue> {
        self.values.get(key)
    }

    pub fn is_error(&self) -> bool {
        self.values.contains_key(ERROR_KEY)
    }

    pub fn error_message(&self) -> Option<&str> {
        self.values.get(ERROR_KEY).and_then(ResultValue::as_text)
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Entries that are candidate table columns.
    pub fn table_entries(&self) -> impl Iterator<Item = (&str, &ResultValue)> {
        self.entries()
            .filter(|(key, _)| !key.starts_with(OVERLAY_PREFIX))
    }

    /// Entries destined for plot overlays only.
    pub fn overlay_entries(&self) -> impl Iterator<Item = (&str, &ResultValue)> {
        self.entries()
            .filter(|(key, _)| key.starts_with(OVERLAY_PREFIX))
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &ResultValue)> {
        self.values.iter().map(|(key, value)| (key.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn underscore_keys_are_overlay_only() {
        let result = AnalysisResult::new(Parameters::new())
            .with("event_count", 3_usize)
            .with("mean_amplitude", -41.5)
            .with("_deconvolved_z", vec![0.0, 1.0])
            .with("_event_markers", vec![12.0]);

        let table: Vec<&str> = result.table_entries().map(|(key, _)| key).collect();
        let overlay: Vec<&str> = result.overlay_entries().map(|(key, _)| key).collect();
        assert_eq!(table, vec!["event_count", "mean_amplitude"]);
        assert_eq!(overlay, vec!["_deconvolved_z", "_event_markers"]);
    }

    #[test]
    fn error_results_carry_the_reserved_key() {
        let result = AnalysisResult::error(Parameters::new(), "window empty");
        assert!(result.is_error());
        assert_eq!(result.error_message(), Some("window empty"));

        let ok = AnalysisResult::new(Parameters::new()).with("event_count", 0_usize);
        assert!(!ok.is_error());
        assert_eq!(ok.error_message(), None);
    }

    #[test]
    fn results_embed_their_parameters() {
        let parameters = Parameters::new().with("threshold_sd", 4.0);
        let result = AnalysisResult::new(parameters.clone()).with("event_count", 0_usize);
        assert_eq!(result.parameters(), &parameters);
    }

    #[test]
    fn serde_round_trip() {
        let result = AnalysisResult::new(Parameters::new().with("threshold_sd", 4.0))
            .with("event_count", 2_usize)
            .with("event_times", vec![0.125, 0.5])
            .with("note", "ok");

        let text = serde_json::to_string(&result).unwrap();
        let replayed: AnalysisResult = serde_json::from_str(&text).unwrap();
        assert_eq!(result, replayed);
    }
}
