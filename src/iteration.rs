//! Iteration engine.
//!
//! Runs the external inference step `iterations` times for one observation.
//! Each step reads the previous step's belief snapshot; the last snapshot is
//! what the engine commits. Every intermediate result is kept so histories
//! with `EveryIteration` retention can record them.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::belief::{Belief, BeliefState};
use crate::error::{ExecutionError, ValidationError};
use crate::observation::Inputs;

/// Failure reported by an inference step.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct StepError {
    message: String,
}

impl StepError {
    /// Creates a step error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Output of one inference step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutput {
    /// Updated beliefs. Variables not listed keep their previous belief.
    pub beliefs: BTreeMap<String, Belief>,
    /// Energy for this step, if the step computes one.
    pub energy: Option<f64>,
}

impl StepOutput {
    /// Empty output (no updates, no energy).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an updated belief.
    #[must_use]
    pub fn with_belief(mut self, variable: impl Into<String>, belief: Belief) -> Self {
        self.beliefs.insert(variable.into(), belief);
        self
    }

    /// Sets the step's energy.
    #[must_use]
    pub const fn with_energy(mut self, energy: f64) -> Self {
        self.energy = Some(energy);
        self
    }
}

/// The single capability the engine consumes from the inference backend.
pub trait InferenceStep: Send + Sync {
    /// Run one refinement step.
    fn step(&self, inputs: &Inputs, beliefs: &BeliefState) -> Result<StepOutput, StepError>;
}

impl<F> InferenceStep for F
where
    F: Fn(&Inputs, &BeliefState) -> Result<StepOutput, StepError> + Send + Sync,
{
    fn step(&self, inputs: &Inputs, beliefs: &BeliefState) -> Result<StepOutput, StepError> {
        self(inputs, beliefs)
    }
}

/// Result of a single iteration.
#[derive(Debug, Clone)]
pub struct IterationResult {
    /// Zero-based iteration index within the pass.
    pub iteration: u32,
    /// Belief snapshot after this iteration.
    pub beliefs: Arc<BeliefState>,
    /// Energy after this iteration (present iff energy tracking is on).
    pub energy: Option<f64>,
}

/// Result of a full pass.
#[derive(Debug, Clone)]
pub struct PassOutcome {
    /// Final snapshot to commit.
    pub beliefs: Arc<BeliefState>,
    /// Every iteration, in order.
    pub iterations: Vec<IterationResult>,
}

impl PassOutcome {
    /// Per-iteration energies, in order. Empty when energy is not tracked.
    #[must_use]
    pub fn energies(&self) -> Vec<f64> {
        self.iterations.iter().filter_map(|i| i.energy).collect()
    }
}

/// Iteration boundaries reported while a pass runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationMark {
    /// About to run iteration `n`.
    Before(u32),
    /// Iteration `n` produced a valid result.
    After(u32),
}

/// Runs N sequential inference steps per observation.
#[derive(Clone)]
pub struct IterationEngine {
    step: Arc<dyn InferenceStep>,
    iterations: u32,
    track_energy: bool,
}

impl fmt::Debug for IterationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IterationEngine")
            .field("iterations", &self.iterations)
            .field("track_energy", &self.track_energy)
            .finish_non_exhaustive()
    }
}

impl IterationEngine {
    /// Creates an engine; `iterations` must be at least 1.
    pub fn new(
        step: Arc<dyn InferenceStep>,
        iterations: u32,
        track_energy: bool,
    ) -> Result<Self, ValidationError> {
        if iterations == 0 {
            return Err(ValidationError::InvalidIterationCount { value: iterations });
        }
        Ok(Self {
            step,
            iterations,
            track_energy,
        })
    }

    /// Iterations per pass.
    #[must_use]
    pub const fn iterations(&self) -> u32 {
        self.iterations
    }

    /// Whether each iteration must report an energy.
    #[must_use]
    pub const fn tracks_energy(&self) -> bool {
        self.track_energy
    }

    /// Run a pass without observing iteration boundaries.
    pub fn run(&self, inputs: &Inputs, beliefs: &BeliefState) -> Result<PassOutcome, ExecutionError> {
        self.run_observed(inputs, beliefs, |_| {})
    }

    /// Run a pass, reporting iteration boundaries to `observe`.
    ///
    /// Fails with `InferenceDivergence` if a step errors, returns a
    /// non-finite belief or energy, updates an unknown variable, or omits
    /// the energy while energy tracking is on. On failure nothing is
    /// returned, so the caller's beliefs stay untouched.
    pub fn run_observed(
        &self,
        inputs: &Inputs,
        beliefs: &BeliefState,
        mut observe: impl FnMut(IterationMark),
    ) -> Result<PassOutcome, ExecutionError> {
        let mut results = Vec::with_capacity(self.iterations as usize);
        let mut current = Arc::new(beliefs.clone());

        for iteration in 0..self.iterations {
            observe(IterationMark::Before(iteration));

            let output = self
                .step
                .step(inputs, &current)
                .map_err(|e| diverged(iteration, e.to_string()))?;

            let mut next = (*current).clone();
            for (variable, belief) in output.beliefs {
                if !belief.is_finite() {
                    return Err(diverged(
                        iteration,
                        format!("belief for '{variable}' is not finite"),
                    ));
                }
                if !next.update(&variable, belief) {
                    return Err(diverged(
                        iteration,
                        format!("step updated unknown variable '{variable}'"),
                    ));
                }
            }

            let energy = match (self.track_energy, output.energy) {
                (true, None) => {
                    return Err(diverged(iteration, "energy not reported".to_string()));
                }
                (true, Some(e)) if !e.is_finite() => {
                    return Err(diverged(iteration, format!("energy is {e}")));
                }
                (true, Some(e)) => Some(e),
                (false, _) => None,
            };

            current = Arc::new(next);
            results.push(IterationResult {
                iteration,
                beliefs: Arc::clone(&current),
                energy,
            });
            observe(IterationMark::After(iteration));
        }

        let mut committed = (*current).clone();
        committed.bump_revision();
        Ok(PassOutcome {
            beliefs: Arc::new(committed),
            iterations: results,
        })
    }
}

fn diverged(iteration: u32, reason: String) -> ExecutionError {
    ExecutionError::InferenceDivergence { iteration, reason }
}
