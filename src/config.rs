//! Engine configuration.
//!
//! Every field has a default, so a host can deserialize a partial JSON
//! document and fill in only what it cares about.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::history::RetentionPolicy;

/// A variable whose beliefs are kept in history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackedVariable {
    /// Which iterations to keep.
    pub policy: RetentionPolicy,
    /// Overrides `EngineConfig::history_capacity` for this variable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity: Option<usize>,
}

/// What to do with an observation arriving at a full queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Discard the arriving observation.
    #[default]
    DropNewest,
    /// Discard the oldest queued observation to make room.
    DropOldest,
}

/// Pending-observation queue settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Max observations waiting behind the in-flight pass; `None` = unbounded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity: Option<usize>,
    /// Applied when `capacity` is reached.
    pub overflow: OverflowPolicy,
}

/// Engine construction options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Inference iterations per observation (>= 1).
    pub iterations: u32,
    /// Require and record an energy value per iteration.
    pub track_energy: bool,
    /// Default history capacity per tracked variable and for energy views.
    pub history_capacity: usize,
    /// Variables kept in history.
    pub tracked: BTreeMap<String, TrackedVariable>,
    /// Start as soon as the engine is built.
    pub autostart: bool,
    /// Pending-observation queue bound and overflow policy.
    pub queue: QueueConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            iterations: 1,
            track_energy: false,
            history_capacity: 0,
            tracked: BTreeMap::new(),
            autostart: false,
            queue: QueueConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ValidationError> {
        let cfg: Self = serde_json::from_str(json).map_err(|e| ValidationError::InvalidConfig {
            reason: e.to_string(),
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Track `variable` with `policy` at the default capacity.
    #[must_use]
    pub fn track(mut self, variable: impl Into<String>, policy: RetentionPolicy) -> Self {
        self.tracked.insert(
            variable.into(),
            TrackedVariable {
                policy,
                capacity: None,
            },
        );
        self
    }

    /// Capacity of `variable`'s history buffer.
    #[must_use]
    pub fn capacity_for(&self, variable: &str) -> usize {
        self.tracked
            .get(variable)
            .and_then(|t| t.capacity)
            .unwrap_or(self.history_capacity)
    }

    /// Check field ranges.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.iterations == 0 {
            return Err(ValidationError::InvalidIterationCount {
                value: self.iterations,
            });
        }
        if self.queue.capacity == Some(0) {
            return Err(ValidationError::InvalidQueueCapacity);
        }
        if self.tracked.keys().any(|k| k.trim().is_empty()) {
            return Err(ValidationError::EmptyVariableName);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.iterations, 1);
        assert!(!cfg.track_energy);
        assert_eq!(cfg.history_capacity, 0);
        assert!(!cfg.autostart);
        assert_eq!(cfg.queue.capacity, None);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_from_partial_json() {
        let cfg = EngineConfig::from_json_str(
            r#"{
                "iterations": 10,
                "track_energy": true,
                "history_capacity": 100,
                "tracked": {
                    "x": {},
                    "tau": {"policy": "every_iteration", "capacity": 5}
                },
                "queue": {"capacity": 8, "overflow": "drop_oldest"}
            }"#,
        )
        .unwrap();

        assert_eq!(cfg.iterations, 10);
        assert!(cfg.track_energy);
        assert_eq!(cfg.tracked["x"].policy, RetentionPolicy::LastOnly);
        assert_eq!(cfg.capacity_for("x"), 100);
        assert_eq!(cfg.tracked["tau"].policy, RetentionPolicy::EveryIteration);
        assert_eq!(cfg.capacity_for("tau"), 5);
        assert_eq!(cfg.queue.overflow, OverflowPolicy::DropOldest);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = EngineConfig::from_json_str(r#"{"iterations": 0}"#).unwrap_err();
        assert_eq!(err, ValidationError::InvalidIterationCount { value: 0 });

        let err = EngineConfig::from_json_str(r#"{"queue": {"capacity": 0}}"#).unwrap_err();
        assert_eq!(err, ValidationError::InvalidQueueCapacity);

        let err = EngineConfig::from_json_str("not json").unwrap_err();
        assert!(matches!(err, ValidationError::InvalidConfig { .. }));
    }

    #[test]
    fn test_track_builder() {
        let cfg = EngineConfig::default().track("x", RetentionPolicy::EveryIteration);
        assert_eq!(cfg.tracked["x"].policy, RetentionPolicy::EveryIteration);
    }
}
