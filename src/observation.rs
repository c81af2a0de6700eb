//! Observation events and step inputs.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::value::Value;

/// An immutable observation event: variable name -> value.
///
/// Observations are shared between listeners; cloning is cheap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    values: Arc<BTreeMap<String, Value>>,
    observed_at: DateTime<Utc>,
}

impl Observation {
    /// Creates an observation from a set of named values.
    #[must_use]
    pub fn new(values: BTreeMap<String, Value>) -> Self {
        Self {
            values: Arc::new(values),
            observed_at: Utc::now(),
        }
    }

    /// Creates an observation holding a single value.
    #[must_use]
    pub fn single(name: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut values = BTreeMap::new();
        values.insert(name.into(), value.into());
        Self::new(values)
    }

    /// Returns the value recorded for `name`, if any.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Iterates over `(name, value)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of named values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True if the observation carries no values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Wall-clock time at which the observation was created.
    #[must_use]
    pub const fn observed_at(&self) -> DateTime<Utc> {
        self.observed_at
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Observation {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::new(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Inputs handed to one inference step.
///
/// Built from the observation merged over the auto-update outputs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Inputs {
    values: BTreeMap<String, Value>,
}

impl Inputs {
    /// Creates empty inputs.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a value.
    pub fn insert(&mut self, name: impl Into<String>, value: Value) -> Option<Value> {
        self.values.insert(name.into(), value)
    }

    /// Returns the value for `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Convenience float read.
    #[must_use]
    pub fn float(&self, name: &str) -> Option<f64> {
        self.values.get(name).and_then(Value::as_float)
    }

    /// True if `name` is present.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Number of values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True if empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterates over `(name, value)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Overlays the observation's values; observed values win on name clashes.
    ///
    /// Returns the names that shadowed an existing input.
    pub fn overlay(&mut self, observation: &Observation) -> Vec<String> {
        let mut shadowed = Vec::new();
        for (name, value) in observation.iter() {
            if self.values.insert(name.to_string(), value.clone()).is_some() {
                shadowed.push(name.to_string());
            }
        }
        shadowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observation_from_iter() {
        let obs: Observation = [("y", 1.5), ("x", 2.0)].into_iter().collect();
        assert_eq!(obs.len(), 2);
        assert_eq!(obs.get("y"), Some(&Value::Float(1.5)));
        let names: Vec<_> = obs.iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["x", "y"]);
    }

    #[test]
    fn test_observation_clone_shares_values() {
        let obs = Observation::single("y", 1.0);
        let copy = obs.clone();
        assert_eq!(obs, copy);
        assert!(Arc::ptr_eq(&obs.values, &copy.values));
    }

    #[test]
    fn test_inputs_overlay_prefers_observation() {
        let mut inputs = Inputs::new();
        inputs.insert("prior_mean", Value::Float(0.0));
        inputs.insert("y", Value::Float(-1.0));

        let shadowed = inputs.overlay(&Observation::single("y", 3.0));

        assert_eq!(shadowed, vec!["y".to_string()]);
        assert_eq!(inputs.float("y"), Some(3.0));
        assert_eq!(inputs.float("prior_mean"), Some(0.0));
    }
}
