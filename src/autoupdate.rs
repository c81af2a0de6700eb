//! Auto-update rules.
//!
//! Before each pass the engine derives extra model inputs from the current
//! beliefs, e.g. "next prior mean = mean of the current posterior". Rules are
//! fixed at construction and are pure: they read a belief snapshot and never
//! mutate it.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::belief::{Belief, BeliefState};
use crate::error::{ExecutionError, ValidationError};
use crate::observation::Inputs;
use crate::value::Value;

/// Custom extraction over the rule's source beliefs, in declaration order.
pub type ExtractFn = Arc<dyn Fn(&[&Belief]) -> Result<Value, String> + Send + Sync>;

/// How a rule turns beliefs into an input value.
#[derive(Clone)]
pub enum Extract {
    /// Mean of the single source belief.
    Mean,
    /// Variance of the single source belief.
    Variance,
    /// All parameters of the single source belief.
    Parameters,
    /// Arbitrary pure function of one or more beliefs.
    Custom(ExtractFn),
}

impl fmt::Debug for Extract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mean => write!(f, "Mean"),
            Self::Variance => write!(f, "Variance"),
            Self::Parameters => write!(f, "Parameters"),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// One auto-update rule: `target <- extract(sources...)`.
#[derive(Debug, Clone)]
pub struct AutoUpdateRule {
    target: String,
    sources: Vec<String>,
    extract: Extract,
}

impl AutoUpdateRule {
    /// `target <- mean(source)`.
    #[must_use]
    pub fn mean(target: impl Into<String>, source: impl Into<String>) -> Self {
        Self::with_source(target, source, Extract::Mean)
    }

    /// `target <- variance(source)`.
    #[must_use]
    pub fn variance(target: impl Into<String>, source: impl Into<String>) -> Self {
        Self::with_source(target, source, Extract::Variance)
    }

    /// `target <- params(source)`.
    #[must_use]
    pub fn parameters(target: impl Into<String>, source: impl Into<String>) -> Self {
        Self::with_source(target, source, Extract::Parameters)
    }

    /// `target <- f(sources...)`.
    pub fn custom<F>(
        target: impl Into<String>,
        sources: impl IntoIterator<Item = impl Into<String>>,
        f: F,
    ) -> Self
    where
        F: Fn(&[&Belief]) -> Result<Value, String> + Send + Sync + 'static,
    {
        Self {
            target: target.into(),
            sources: sources.into_iter().map(Into::into).collect(),
            extract: Extract::Custom(Arc::new(f)),
        }
    }

    fn with_source(target: impl Into<String>, source: impl Into<String>, extract: Extract) -> Self {
        Self {
            target: target.into(),
            sources: vec![source.into()],
            extract,
        }
    }

    /// Input name written by this rule.
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Latent variables read by this rule.
    #[must_use]
    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    fn apply(&self, beliefs: &[&Belief]) -> Result<Value, String> {
        match &self.extract {
            Extract::Mean => {
                let b = single(beliefs)?;
                b.mean()
                    .map(Value::Float)
                    .ok_or_else(|| format!("{} belief has no mean", b.family()))
            }
            Extract::Variance => {
                let b = single(beliefs)?;
                b.variance()
                    .map(Value::Float)
                    .ok_or_else(|| format!("{} belief has no variance", b.family()))
            }
            Extract::Parameters => Ok(single(beliefs)?.to_value()),
            Extract::Custom(f) => f(beliefs),
        }
    }
}

fn single<'a>(beliefs: &[&'a Belief]) -> Result<&'a Belief, String> {
    match beliefs {
        [b] => Ok(*b),
        _ => Err(format!("expected 1 source belief, got {}", beliefs.len())),
    }
}

/// The immutable set of auto-update rules.
#[derive(Debug, Clone, Default)]
pub struct AutoUpdateSpec {
    rules: Vec<AutoUpdateRule>,
}

impl AutoUpdateSpec {
    /// Validate and freeze a rule set.
    ///
    /// # Validation
    /// - Targets must be non-empty and unique.
    /// - Every rule needs at least one source; built-in extractors exactly one.
    pub fn new(rules: Vec<AutoUpdateRule>) -> Result<Self, ValidationError> {
        let mut targets = HashSet::with_capacity(rules.len());
        for rule in &rules {
            if rule.target.trim().is_empty() {
                return Err(ValidationError::EmptyVariableName);
            }
            if !targets.insert(rule.target.as_str()) {
                return Err(ValidationError::InvalidAutoUpdateRule {
                    target: rule.target.clone(),
                    reason: "duplicate target".to_string(),
                });
            }
            if rule.sources.is_empty() || rule.sources.iter().any(|s| s.trim().is_empty()) {
                return Err(ValidationError::InvalidAutoUpdateRule {
                    target: rule.target.clone(),
                    reason: "rule needs non-empty source variables".to_string(),
                });
            }
            if !matches!(rule.extract, Extract::Custom(_)) && rule.sources.len() != 1 {
                return Err(ValidationError::InvalidAutoUpdateRule {
                    target: rule.target.clone(),
                    reason: "built-in extractors read exactly one variable".to_string(),
                });
            }
        }
        Ok(Self { rules })
    }

    /// The rules, in declaration order.
    #[must_use]
    pub fn rules(&self) -> &[AutoUpdateRule] {
        &self.rules
    }

    /// True if there are no rules.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Every latent variable referenced by some rule, deduplicated.
    #[must_use]
    pub fn referenced_variables(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.rules
            .iter()
            .flat_map(|r| r.sources.iter())
            .filter(|s| seen.insert(s.as_str()))
            .map(String::as_str)
            .collect()
    }

    /// Check that every referenced variable has a belief.
    pub fn validate(&self, beliefs: &BeliefState) -> Result<(), ExecutionError> {
        match self
            .referenced_variables()
            .into_iter()
            .find(|v| !beliefs.contains(v))
        {
            Some(variable) => Err(ExecutionError::MissingInitialBelief {
                variable: variable.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Compute the auto-update inputs from a belief snapshot.
    pub fn resolve(&self, beliefs: &BeliefState) -> Result<Inputs, ExecutionError> {
        let mut inputs = Inputs::new();
        for rule in &self.rules {
            let sources = rule
                .sources
                .iter()
                .map(|name| {
                    beliefs
                        .get(name)
                        .ok_or_else(|| ExecutionError::MissingInitialBelief {
                            variable: name.clone(),
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;

            let value = rule
                .apply(&sources)
                .map_err(|reason| ExecutionError::AutoUpdateFailed {
                    target: rule.target.clone(),
                    reason,
                })?;
            if !value.is_finite() {
                return Err(ExecutionError::AutoUpdateFailed {
                    target: rule.target.clone(),
                    reason: "extracted value is not finite".to_string(),
                });
            }
            inputs.insert(rule.target.clone(), value);
        }
        Ok(inputs)
    }
}
