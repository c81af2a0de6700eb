//! The reactive engine controller.
//!
//! [`ReactiveEngine`] owns the belief state, the history buffers and the
//! listener registries, and wires an [`ObservationSource`] to an
//! [`IterationEngine`] through a serialized pipeline. Engines are assembled
//! with [`EngineBuilder`]:
//!
//! ```rust,ignore
//! let engine = ReactiveEngine::builder()
//!     .source(subject.clone())
//!     .step(my_step)
//!     .initial_belief("x", Belief::gaussian(0.0, 1.0))
//!     .autoupdate(AutoUpdateRule::mean("prior_mean", "x"))
//!     .track("x", RetentionPolicy::LastOnly)
//!     .history_capacity(100)
//!     .build()?;
//! engine.start()?;
//! ```

mod events;
mod listeners;
mod pipeline;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::autoupdate::{AutoUpdateRule, AutoUpdateSpec};
use crate::belief::{Belief, BeliefState};
use crate::config::{EngineConfig, QueueConfig, TrackedVariable};
use crate::error::{EngineResult, ExecutionError, ValidationError};
use crate::history::{BeliefHistory, EnergyHistory, HistoryBuffer, HistoryEntry, RetentionPolicy};
use crate::iteration::{InferenceStep, IterationEngine};
use crate::observation::Observation;
use crate::source::ObservationSource;

pub use events::EngineEvent;
pub use listeners::{BeliefUpdate, EnergyUpdate, EngineFault, ListenerId, ListenerResult};

use pipeline::{Histories, Pipeline, PipelineParts};

/// Lifecycle state of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// Built but never started.
    Constructed,
    /// Subscribed to its source and processing observations.
    Running,
    /// Stopped after having run at least once.
    Stopped,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Constructed => write!(f, "constructed"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Point-in-time engine counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    /// Current lifecycle state.
    pub state: EngineState,
    /// Observations accepted into the queue (including later drops).
    pub received: u64,
    /// Passes committed.
    pub processed: u64,
    /// Passes that failed (divergence, auto-update failure).
    pub failed: u64,
    /// Observations dropped by the queue overflow policy.
    pub dropped: u64,
    /// Queued or in-flight observations abandoned by `stop`.
    pub discarded: u64,
    /// Listener callbacks that returned an error or panicked.
    pub listener_failures: u64,
    /// Observations currently waiting.
    pub queued: usize,
}

/// An online-inference engine that refines beliefs as observations arrive.
///
/// Dropping the engine stops it.
pub struct ReactiveEngine {
    pipeline: Arc<Pipeline>,
    config: EngineConfig,
}

impl fmt::Debug for ReactiveEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactiveEngine")
            .field("name", &self.pipeline.name())
            .field("state", &self.pipeline.state())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ReactiveEngine {
    /// Creates a builder.
    #[must_use]
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Subscribe to the source and begin processing.
    ///
    /// A replay-capable source delivers its buffered observation before this
    /// returns; that pass updates beliefs and belief history but records no
    /// energy.
    ///
    /// # Errors
    /// `AlreadyRunning` if the engine is running, or the source's
    /// subscription error.
    pub fn start(&self) -> EngineResult<()> {
        self.pipeline.start()
    }

    /// Unsubscribe, drop queued observations and wait for an in-flight pass.
    ///
    /// Returns false (and does nothing) if the engine was not running. Once
    /// this returns, no listener is called and no history is appended until
    /// the next `start`.
    pub fn stop(&self) -> bool {
        self.pipeline.stop()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        self.pipeline.state()
    }

    /// True while running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    /// The configuration the engine was built with.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Inject an observation as if the source had emitted it.
    ///
    /// Returns the observation's sequence index. When called from inside a
    /// listener the observation is queued and processed after the current
    /// pass.
    ///
    /// # Errors
    /// `NotRunning` if the engine is not running; `QueueFull` if a bounded
    /// queue dropped this observation.
    pub fn feed(&self, observation: Observation) -> EngineResult<u64> {
        Ok(self.pipeline.feed(observation)?)
    }

    /// Listen for belief updates of `variable`, once per committed pass.
    ///
    /// # Errors
    /// `UnknownVariable` if `variable` has no belief.
    pub fn subscribe_belief<F>(&self, variable: &str, listener: F) -> EngineResult<ListenerId>
    where
        F: Fn(&BeliefUpdate) -> ListenerResult + Send + Sync + 'static,
    {
        let registry = self.pipeline.belief_listeners.get(variable).ok_or_else(|| {
            ValidationError::UnknownVariable {
                variable: variable.to_string(),
            }
        })?;
        Ok(registry.add(listener))
    }

    /// Listen for per-pass energy updates.
    ///
    /// # Errors
    /// `EnergyTrackingDisabled` if the engine does not track energy.
    pub fn subscribe_energy<F>(&self, listener: F) -> EngineResult<ListenerId>
    where
        F: Fn(&EnergyUpdate) -> ListenerResult + Send + Sync + 'static,
    {
        if !self.config.track_energy {
            return Err(ValidationError::EnergyTrackingDisabled.into());
        }
        Ok(self.pipeline.energy_listeners.add(listener))
    }

    /// Listen for per-pass failures.
    pub fn subscribe_errors<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&EngineFault) -> ListenerResult + Send + Sync + 'static,
    {
        self.pipeline.error_listeners.add(listener)
    }

    /// Listen for lifecycle and pipeline events.
    pub fn subscribe_events<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&EngineEvent) -> ListenerResult + Send + Sync + 'static,
    {
        self.pipeline.event_listeners.add(listener)
    }

    /// Remove a listener of any kind. Returns false if the id was unknown.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let p = &self.pipeline;
        p.belief_listeners.values().any(|r| r.remove(id))
            || p.energy_listeners.remove(id)
            || p.error_listeners.remove(id)
            || p.event_listeners.remove(id)
    }

    /// Current belief of `variable`.
    #[must_use]
    pub fn belief(&self, variable: &str) -> Option<Belief> {
        self.pipeline.beliefs().get(variable).cloned()
    }

    /// Snapshot of every current belief.
    #[must_use]
    pub fn beliefs(&self) -> Arc<BeliefState> {
        self.pipeline.beliefs()
    }

    /// Counters since construction.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        self.pipeline.stats()
    }

    /// Belief history of a tracked variable, oldest first.
    ///
    /// # Errors
    /// `NotTracked` if `variable` is not tracked; `NeverStarted` before the
    /// first `start`.
    pub fn history(&self, variable: &str) -> EngineResult<Vec<HistoryEntry<Belief>>> {
        self.with_belief_buffer(variable, HistoryBuffer::snapshot)
    }

    /// Number of history entries held for a tracked variable.
    ///
    /// # Errors
    /// Same as [`history`](Self::history).
    pub fn history_len(&self, variable: &str) -> EngineResult<usize> {
        self.with_belief_buffer(variable, HistoryBuffer::len)
    }

    /// Mean energy per pass, oldest first.
    ///
    /// # Errors
    /// `EnergyTrackingDisabled`, or `NeverStarted` before the first `start`.
    pub fn energy_history_averaged(&self) -> EngineResult<Vec<HistoryEntry<f64>>> {
        self.with_energy(|e| e.averaged().snapshot())
    }

    /// Every iteration's energy, oldest first.
    ///
    /// # Errors
    /// Same as [`energy_history_averaged`](Self::energy_history_averaged).
    pub fn energy_history_raw(&self) -> EngineResult<Vec<HistoryEntry<f64>>> {
        self.with_energy(|e| e.raw().snapshot())
    }

    /// Last iteration's energy per pass, oldest first.
    ///
    /// # Errors
    /// Same as [`energy_history_averaged`](Self::energy_history_averaged).
    pub fn energy_history_final_only(&self) -> EngineResult<Vec<HistoryEntry<f64>>> {
        self.with_energy(|e| e.final_only().snapshot())
    }

    fn ensure_started(&self) -> EngineResult<()> {
        if self.state() == EngineState::Constructed {
            return Err(ExecutionError::NeverStarted.into());
        }
        Ok(())
    }

    fn with_belief_buffer<R>(
        &self,
        variable: &str,
        f: impl FnOnce(&HistoryBuffer<Belief>) -> R,
    ) -> EngineResult<R> {
        let histories = self.pipeline.histories();
        let buffer = histories
            .beliefs
            .buffer(variable)
            .ok_or_else(|| ValidationError::NotTracked {
                variable: variable.to_string(),
            })?;
        self.ensure_started()?;
        Ok(f(buffer))
    }

    fn with_energy<R>(&self, f: impl FnOnce(&EnergyHistory) -> R) -> EngineResult<R> {
        let histories = self.pipeline.histories();
        let energy = histories
            .energy
            .as_ref()
            .ok_or(ValidationError::EnergyTrackingDisabled)?;
        self.ensure_started()?;
        Ok(f(energy))
    }
}

impl Drop for ReactiveEngine {
    fn drop(&mut self) {
        if self.pipeline.stop() {
            debug!(engine = %self.pipeline.name(), "engine stopped on drop");
        }
    }
}

/// Builder for [`ReactiveEngine`].
#[derive(Default)]
pub struct EngineBuilder {
    name: Option<String>,
    config: EngineConfig,
    source: Option<Arc<dyn ObservationSource>>,
    step: Option<Arc<dyn InferenceStep>>,
    rules: Vec<AutoUpdateRule>,
    initial: Vec<(String, Belief)>,
}

impl fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("has_source", &self.source.is_some())
            .field("has_step", &self.step.is_some())
            .field("rules", &self.rules.len())
            .field("initial", &self.initial)
            .finish()
    }
}

impl EngineBuilder {
    /// Creates a builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine name used in logs and thread names.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Replace the whole configuration.
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// The observation source.
    #[must_use]
    pub fn source(mut self, source: Arc<dyn ObservationSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// The inference step run on every iteration.
    #[must_use]
    pub fn step(mut self, step: impl InferenceStep + 'static) -> Self {
        self.step = Some(Arc::new(step));
        self
    }

    /// Add an auto-update rule.
    #[must_use]
    pub fn autoupdate(mut self, rule: AutoUpdateRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Add several auto-update rules.
    #[must_use]
    pub fn autoupdate_rules(mut self, rules: impl IntoIterator<Item = AutoUpdateRule>) -> Self {
        self.rules.extend(rules);
        self
    }

    /// Set the initial belief of a latent variable.
    #[must_use]
    pub fn initial_belief(mut self, variable: impl Into<String>, belief: Belief) -> Self {
        self.initial.push((variable.into(), belief));
        self
    }

    /// Set several initial beliefs.
    #[must_use]
    pub fn initial_beliefs(mut self, beliefs: impl IntoIterator<Item = (String, Belief)>) -> Self {
        self.initial.extend(beliefs);
        self
    }

    /// Inference iterations per observation.
    #[must_use]
    pub fn iterations(mut self, iterations: u32) -> Self {
        self.config.iterations = iterations;
        self
    }

    /// Require and record per-iteration energy.
    #[must_use]
    pub fn track_energy(mut self, track: bool) -> Self {
        self.config.track_energy = track;
        self
    }

    /// Default history capacity.
    #[must_use]
    pub fn history_capacity(mut self, capacity: usize) -> Self {
        self.config.history_capacity = capacity;
        self
    }

    /// Keep `variable` in history.
    #[must_use]
    pub fn track(mut self, variable: impl Into<String>, policy: RetentionPolicy) -> Self {
        self.config = self.config.track(variable, policy);
        self
    }

    /// Keep `variable` in history with its own capacity.
    #[must_use]
    pub fn track_with_capacity(
        mut self,
        variable: impl Into<String>,
        policy: RetentionPolicy,
        capacity: usize,
    ) -> Self {
        self.config.tracked.insert(
            variable.into(),
            TrackedVariable {
                policy,
                capacity: Some(capacity),
            },
        );
        self
    }

    /// Start as soon as the engine is built.
    #[must_use]
    pub fn autostart(mut self, autostart: bool) -> Self {
        self.config.autostart = autostart;
        self
    }

    /// Pending-observation queue settings.
    #[must_use]
    pub fn queue(mut self, queue: QueueConfig) -> Self {
        self.config.queue = queue;
        self
    }

    /// Validate everything and build the engine.
    ///
    /// # Errors
    /// Validation errors for bad configuration, rules or tracked variables;
    /// `MissingInitialBelief` if a rule references a variable without an
    /// initial belief; any error from an autostart.
    pub fn build(self) -> EngineResult<ReactiveEngine> {
        let Self {
            name,
            config,
            source,
            step,
            rules,
            initial,
        } = self;

        config.validate()?;
        let source = source.ok_or_else(|| ValidationError::MissingField {
            field: "source".to_string(),
        })?;
        let step = step.ok_or_else(|| ValidationError::MissingField {
            field: "step".to_string(),
        })?;

        let beliefs = BeliefState::from_initial(initial)?;
        let autoupdate = AutoUpdateSpec::new(rules)?;
        autoupdate.validate(&beliefs)?;

        if let Some(variable) = config.tracked.keys().find(|v| !beliefs.contains(v)) {
            return Err(ValidationError::UnknownVariable {
                variable: variable.clone(),
            }
            .into());
        }

        let iteration = IterationEngine::new(step, config.iterations, config.track_energy)?;
        let histories = Histories {
            beliefs: BeliefHistory::new(
                config
                    .tracked
                    .iter()
                    .map(|(v, t)| (v.clone(), t.policy, config.capacity_for(v))),
            ),
            energy: config
                .track_energy
                .then(|| EnergyHistory::new(config.history_capacity, config.iterations)),
        };

        let name = name.unwrap_or_else(|| "engine".to_string());
        debug!(
            engine = %name,
            variables = beliefs.len(),
            rules = autoupdate.rules().len(),
            iterations = config.iterations,
            track_energy = config.track_energy,
            "engine built"
        );

        let engine = ReactiveEngine {
            pipeline: Arc::new(Pipeline::new(PipelineParts {
                name,
                source,
                autoupdate,
                iteration,
                queue: config.queue,
                beliefs,
                histories,
            })),
            config,
        };
        if engine.config.autostart {
            engine.start()?;
        }
        Ok(engine)
    }
}
