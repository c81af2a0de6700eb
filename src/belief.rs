//! Beliefs and belief state.
//!
//! A [`Belief`] is the current estimate of one latent variable. The engine
//! treats it as opaque beyond moment reads (used by auto-update extraction)
//! and finiteness checks (used to detect divergence). A [`BeliefState`] maps
//! each latent variable to exactly one belief and is replaced atomically after
//! every successful pass.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::value::Value;

/// Distribution-like summary of one latent variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum Belief {
    /// A point estimate.
    PointMass {
        /// The point value.
        value: f64,
    },
    /// Normal distribution summarized by mean and variance.
    Gaussian {
        /// Mean.
        mean: f64,
        /// Variance (must be positive).
        variance: f64,
    },
    /// Gamma distribution in shape/rate form.
    Gamma {
        /// Shape parameter.
        shape: f64,
        /// Rate parameter.
        rate: f64,
    },
    /// Beta distribution.
    Beta {
        /// First shape parameter.
        alpha: f64,
        /// Second shape parameter.
        beta: f64,
    },
    /// Categorical probabilities.
    Categorical {
        /// Category probabilities.
        probabilities: Vec<f64>,
    },
    /// Any other family, carried as named parameters.
    Parameters {
        /// Named parameters.
        params: BTreeMap<String, f64>,
    },
}

impl Belief {
    /// Point-mass belief.
    #[must_use]
    pub const fn point(value: f64) -> Self {
        Self::PointMass { value }
    }

    /// Gaussian belief.
    #[must_use]
    pub const fn gaussian(mean: f64, variance: f64) -> Self {
        Self::Gaussian { mean, variance }
    }

    /// Gamma belief.
    #[must_use]
    pub const fn gamma(shape: f64, rate: f64) -> Self {
        Self::Gamma { shape, rate }
    }

    /// Beta belief.
    #[must_use]
    pub const fn beta(alpha: f64, beta: f64) -> Self {
        Self::Beta { alpha, beta }
    }

    /// The current value read: the mean where one is defined.
    #[must_use]
    pub fn mean(&self) -> Option<f64> {
        match self {
            Self::PointMass { value } => Some(*value),
            Self::Gaussian { mean, .. } => Some(*mean),
            Self::Gamma { shape, rate } => Some(shape / rate),
            Self::Beta { alpha, beta } => Some(alpha / (alpha + beta)),
            Self::Categorical { .. } | Self::Parameters { .. } => None,
        }
    }

    /// Second central moment where one is defined.
    #[must_use]
    pub fn variance(&self) -> Option<f64> {
        match self {
            Self::PointMass { .. } => Some(0.0),
            Self::Gaussian { variance, .. } => Some(*variance),
            Self::Gamma { shape, rate } => Some(shape / (rate * rate)),
            Self::Beta { alpha, beta } => {
                let total = alpha + beta;
                Some(alpha * beta / (total * total * (total + 1.0)))
            }
            Self::Categorical { .. } | Self::Parameters { .. } => None,
        }
    }

    /// All parameters as a structured [`Value`].
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::PointMass { value } => Value::Float(*value),
            Self::Categorical { probabilities } => Value::Vector(probabilities.clone()),
            other => serde_json::to_value(other).map_or(Value::Null, Value::Structured),
        }
    }

    /// False if any parameter is NaN or infinite.
    #[must_use]
    pub fn is_finite(&self) -> bool {
        match self {
            Self::PointMass { value } => value.is_finite(),
            Self::Gaussian { mean, variance } => mean.is_finite() && variance.is_finite(),
            Self::Gamma { shape, rate } => shape.is_finite() && rate.is_finite(),
            Self::Beta { alpha, beta } => alpha.is_finite() && beta.is_finite(),
            Self::Categorical { probabilities } => probabilities.iter().all(|p| p.is_finite()),
            Self::Parameters { params } => params.values().all(|p| p.is_finite()),
        }
    }

    /// Returns the family name.
    #[must_use]
    pub const fn family(&self) -> &'static str {
        match self {
            Self::PointMass { .. } => "point_mass",
            Self::Gaussian { .. } => "gaussian",
            Self::Gamma { .. } => "gamma",
            Self::Beta { .. } => "beta",
            Self::Categorical { .. } => "categorical",
            Self::Parameters { .. } => "parameters",
        }
    }
}

impl fmt::Display for Belief {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PointMass { value } => write!(f, "PointMass({value})"),
            Self::Gaussian { mean, variance } => write!(f, "Gaussian(μ={mean}, σ²={variance})"),
            Self::Gamma { shape, rate } => write!(f, "Gamma(shape={shape}, rate={rate})"),
            Self::Beta { alpha, beta } => write!(f, "Beta({alpha}, {beta})"),
            Self::Categorical { probabilities } => write!(f, "Categorical[{}]", probabilities.len()),
            Self::Parameters { params } => write!(f, "Parameters[{}]", params.len()),
        }
    }
}

/// The belief for every latent variable, plus a commit revision.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BeliefState {
    beliefs: BTreeMap<String, Belief>,
    revision: u64,
}

impl BeliefState {
    /// Creates an empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a state from initial beliefs, rejecting empty names.
    pub fn from_initial(
        initial: impl IntoIterator<Item = (String, Belief)>,
    ) -> Result<Self, ValidationError> {
        let mut beliefs = BTreeMap::new();
        for (name, belief) in initial {
            let name = name.trim().to_string();
            if name.is_empty() {
                return Err(ValidationError::EmptyVariableName);
            }
            beliefs.insert(name, belief);
        }
        Ok(Self { beliefs, revision: 0 })
    }

    /// Belief for `variable`.
    #[must_use]
    pub fn get(&self, variable: &str) -> Option<&Belief> {
        self.beliefs.get(variable)
    }

    /// True if `variable` has a belief.
    #[must_use]
    pub fn contains(&self, variable: &str) -> bool {
        self.beliefs.contains_key(variable)
    }

    /// Variable names in order.
    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.beliefs.keys().map(String::as_str)
    }

    /// Iterates over `(variable, belief)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Belief)> {
        self.beliefs.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of variables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.beliefs.len()
    }

    /// True if no variable has a belief.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.beliefs.is_empty()
    }

    /// Number of committed passes that produced this state.
    #[must_use]
    pub const fn revision(&self) -> u64 {
        self.revision
    }

    /// Replaces an existing variable's belief; returns false for unknown names.
    pub(crate) fn update(&mut self, variable: &str, belief: Belief) -> bool {
        match self.beliefs.get_mut(variable) {
            Some(slot) => {
                *slot = belief;
                true
            }
            None => false,
        }
    }

    pub(crate) fn bump_revision(&mut self) {
        self.revision += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_belief_moments() {
        assert_eq!(Belief::gaussian(1.0, 2.0).mean(), Some(1.0));
        assert_eq!(Belief::gamma(2.0, 4.0).mean(), Some(0.5));
        assert_eq!(Belief::gamma(2.0, 4.0).variance(), Some(0.125));
        assert_eq!(Belief::beta(1.0, 3.0).mean(), Some(0.25));
        assert_eq!(Belief::point(7.0).variance(), Some(0.0));
        assert!(Belief::Categorical { probabilities: vec![0.5, 0.5] }.mean().is_none());
    }

    #[test]
    fn test_belief_finiteness() {
        assert!(Belief::gaussian(0.0, 1.0).is_finite());
        assert!(!Belief::gaussian(f64::NAN, 1.0).is_finite());
        assert!(!Belief::gamma(1.0, f64::INFINITY).is_finite());
    }

    #[test]
    fn test_belief_to_value() {
        assert_eq!(Belief::point(2.0).to_value(), Value::Float(2.0));
        let structured = Belief::gaussian(1.0, 0.5).to_value();
        let json = structured.as_structured().unwrap();
        assert_eq!(json["family"], "gaussian");
        assert_eq!(json["mean"], 1.0);
    }

    #[test]
    fn test_state_from_initial_rejects_empty_name() {
        let err = BeliefState::from_initial([("  ".to_string(), Belief::point(0.0))]).unwrap_err();
        assert_eq!(err, ValidationError::EmptyVariableName);
    }

    #[test]
    fn test_state_update_only_known_variables() {
        let mut state =
            BeliefState::from_initial([("x".to_string(), Belief::gaussian(0.0, 1.0))]).unwrap();
        assert!(state.update("x", Belief::gaussian(1.0, 0.5)));
        assert!(!state.update("y", Belief::point(1.0)));
        assert_eq!(state.get("x").and_then(Belief::mean), Some(1.0));
        assert_eq!(state.len(), 1);
        assert_eq!(state.revision(), 0);
        state.bump_revision();
        assert_eq!(state.revision(), 1);
    }
}
