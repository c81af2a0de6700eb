//! # beliefstream - Reactive Online Inference
//!
//! beliefstream keeps a set of probabilistic beliefs about latent variables
//! up to date as observations stream in. Every observation triggers one
//! pass: auto-update inputs are derived from the current beliefs, a
//! pluggable inference step refines the beliefs over a fixed number of
//! iterations, and the result is committed, recorded in bounded histories
//! and published to listeners.
//!
//! ## Core Concepts
//!
//! - **Observation**: an immutable map of named values delivered by an
//!   [`ObservationSource`]
//! - **Belief**: a distribution-like summary of one latent variable
//! - **Auto-Update**: rules that turn current beliefs into step inputs
//! - **Iteration**: one call of the [`InferenceStep`]; a pass runs N of them
//! - **Energy**: optional per-iteration convergence score
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use beliefstream::{
//!     AutoUpdateRule, Belief, Observation, ReactiveEngine, ReplaySubject,
//!     RetentionPolicy, StepOutput, Value,
//! };
//!
//! let subject = Arc::new(ReplaySubject::new("sensor"));
//! let engine = ReactiveEngine::builder()
//!     .source(subject.clone())
//!     .step(|inputs: &_, beliefs: &_| Ok(StepOutput::new()))
//!     .initial_belief("x", Belief::gaussian(0.0, 1.0))
//!     .autoupdate(AutoUpdateRule::mean("prior_mean", "x"))
//!     .track("x", RetentionPolicy::LastOnly)
//!     .history_capacity(100)
//!     .build()?;
//!
//! engine.start()?;
//! subject.next(Observation::single("y", Value::Float(1.5)))?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod autoupdate;
pub mod belief;
pub mod config;
pub mod engine;
pub mod error;
pub mod history;
pub mod iteration;
pub mod observation;
pub mod source;
pub mod value;

// Re-export primary types at crate root for convenience
pub use autoupdate::{AutoUpdateRule, AutoUpdateSpec, Extract, ExtractFn};
pub use belief::{Belief, BeliefState};
pub use config::{EngineConfig, OverflowPolicy, QueueConfig, TrackedVariable};
pub use engine::{
    BeliefUpdate, EnergyUpdate, EngineBuilder, EngineEvent, EngineFault, EngineState, EngineStats,
    ListenerId, ListenerResult, ReactiveEngine,
};
pub use error::{EngineError, EngineResult, ExecutionError, ValidationError};
pub use history::{BeliefHistory, EnergyHistory, HistoryBuffer, HistoryEntry, RetentionPolicy};
pub use iteration::{
    InferenceStep, IterationEngine, IterationMark, IterationResult, PassOutcome, StepError,
    StepOutput,
};
pub use observation::{Inputs, Observation};
pub use source::{ChannelSource, ObservationListener, ObservationSource, ReplaySubject, SubscriptionId};
pub use value::Value;
