//! Serialized per-observation processing.
//!
//! Observations may arrive on any thread. Each one is stamped with a sequence
//! index and queued; the first thread to find no pass in flight becomes the
//! drainer and runs queued passes in FIFO order until the queue is empty.
//! Other threads only enqueue, so exactly one pass is in flight at a time.
//!
//! Every start opens a new generation. Passes, history appends and listener
//! calls check the active generation first, so once `stop` has closed a
//! generation nothing from it is committed or published.

use std::collections::{BTreeMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::thread::{self, ThreadId};

use chrono::Utc;
use tracing::{debug, info, trace, warn};

use crate::autoupdate::AutoUpdateSpec;
use crate::belief::BeliefState;
use crate::config::{OverflowPolicy, QueueConfig};
use crate::error::{EngineResult, ExecutionError};
use crate::history::{BeliefHistory, EnergyHistory};
use crate::iteration::{IterationEngine, IterationMark, PassOutcome};
use crate::observation::Observation;
use crate::source::{ObservationListener, ObservationSource, SubscriptionId};

use super::events::EngineEvent;
use super::listeners::{invoke, BeliefUpdate, EnergyUpdate, EngineFault, Registry};
use super::{EngineState, EngineStats};

pub(crate) struct Histories {
    pub(crate) beliefs: BeliefHistory,
    pub(crate) energy: Option<EnergyHistory>,
}

struct Pending {
    sequence: u64,
    generation: u64,
    observation: Observation,
    record_energy: bool,
}

struct Control {
    state: EngineState,
    generation: u64,
    subscription: Option<SubscriptionId>,
    queue: VecDeque<Pending>,
    drainer: Option<ThreadId>,
    next_sequence: u64,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    discarded: AtomicU64,
    listener_failures: AtomicU64,
}

pub(crate) struct PipelineParts {
    pub(crate) name: String,
    pub(crate) source: Arc<dyn ObservationSource>,
    pub(crate) autoupdate: AutoUpdateSpec,
    pub(crate) iteration: IterationEngine,
    pub(crate) queue: QueueConfig,
    pub(crate) beliefs: BeliefState,
    pub(crate) histories: Histories,
}

pub(crate) struct Pipeline {
    name: String,
    source: Arc<dyn ObservationSource>,
    autoupdate: AutoUpdateSpec,
    iteration: IterationEngine,
    queue: QueueConfig,
    control: Mutex<Control>,
    idle: Condvar,
    active: AtomicU64,
    beliefs: RwLock<Arc<BeliefState>>,
    history: Mutex<Histories>,
    pub(crate) belief_listeners: BTreeMap<String, Registry<BeliefUpdate>>,
    pub(crate) energy_listeners: Registry<EnergyUpdate>,
    pub(crate) error_listeners: Registry<EngineFault>,
    pub(crate) event_listeners: Registry<EngineEvent>,
    counters: Counters,
}

impl Pipeline {
    pub(crate) fn new(parts: PipelineParts) -> Self {
        let belief_listeners = parts
            .beliefs
            .variables()
            .map(|v| (v.to_string(), Registry::new("belief")))
            .collect();

        Self {
            name: parts.name,
            source: parts.source,
            autoupdate: parts.autoupdate,
            iteration: parts.iteration,
            queue: parts.queue,
            control: Mutex::new(Control {
                state: EngineState::Constructed,
                generation: 0,
                subscription: None,
                queue: VecDeque::new(),
                drainer: None,
                next_sequence: 0,
            }),
            idle: Condvar::new(),
            active: AtomicU64::new(0),
            beliefs: RwLock::new(Arc::new(parts.beliefs)),
            history: Mutex::new(parts.histories),
            belief_listeners,
            energy_listeners: Registry::new("energy"),
            error_listeners: Registry::new("errors"),
            event_listeners: Registry::new("events"),
            counters: Counters::default(),
        }
    }

    // No callback ever runs under these locks, so a poisoned guard still
    // protects consistent data.
    fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn histories(&self) -> MutexGuard<'_, Histories> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn state(&self) -> EngineState {
        self.control().state
    }

    pub(crate) fn beliefs(&self) -> Arc<BeliefState> {
        Arc::clone(&self.beliefs.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn is_active(&self, generation: u64) -> bool {
        generation != 0 && self.active.load(Ordering::Acquire) == generation
    }

    pub(crate) fn stats(&self) -> EngineStats {
        let (state, queued) = {
            let ctl = self.control();
            (ctl.state, ctl.queue.len())
        };
        EngineStats {
            state,
            received: self.counters.received.load(Ordering::Relaxed),
            processed: self.counters.processed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
            listener_failures: self.counters.listener_failures.load(Ordering::Relaxed),
            queued,
        }
    }

    pub(crate) fn start(self: &Arc<Self>) -> EngineResult<()> {
        if self.state() == EngineState::Running {
            return Err(ExecutionError::AlreadyRunning.into());
        }
        self.emit(None, EngineEvent::BeforeStart);

        let me = thread::current().id();
        let generation = {
            let mut ctl = self.control();
            if ctl.state == EngineState::Running {
                return Err(ExecutionError::AlreadyRunning.into());
            }
            ctl.generation += 1;
            ctl.state = EngineState::Running;
            self.active.store(ctl.generation, Ordering::Release);
            ctl.generation
        };

        // Set while `subscribe` runs. The first value this subscription gets
        // on the starting thread in that window is the source's replay.
        let subscribing = Arc::new(AtomicBool::new(true));
        let replay_flag = Arc::clone(&subscribing);
        let weak: Weak<Self> = Arc::downgrade(self);
        let listener: ObservationListener = Arc::new(move |observation: &Observation| {
            let replayed =
                thread::current().id() == me && replay_flag.swap(false, Ordering::AcqRel);
            if let Some(pipeline) = weak.upgrade() {
                if let Err(e) = pipeline.deliver(generation, observation.clone(), !replayed) {
                    trace!(engine = %pipeline.name, error = %e, "observation not accepted");
                }
            }
        });

        // A replay-capable source delivers its buffered value in here.
        let subscribed = self.source.subscribe(listener);
        subscribing.store(false, Ordering::Release);

        let mut ctl = self.control();
        match subscribed {
            Ok(id) if ctl.state == EngineState::Running && ctl.generation == generation => {
                ctl.subscription = Some(id);
            }
            Ok(id) => {
                // Stopped from inside the replayed pass.
                drop(ctl);
                self.source.unsubscribe(id);
                return Ok(());
            }
            Err(e) => {
                ctl.state = EngineState::Stopped;
                self.active.store(0, Ordering::Release);
                return Err(e);
            }
        }
        drop(ctl);

        info!(engine = %self.name, generation, "engine started");
        self.emit(None, EngineEvent::AfterStart);
        Ok(())
    }

    /// Returns false if the engine was not running.
    pub(crate) fn stop(&self) -> bool {
        if self.state() != EngineState::Running {
            return false;
        }
        self.emit(None, EngineEvent::BeforeStop);

        let (subscription, cleared) = {
            let mut ctl = self.control();
            if ctl.state != EngineState::Running {
                return false;
            }
            ctl.state = EngineState::Stopped;
            self.active.store(0, Ordering::Release);
            let cleared = ctl.queue.len() as u64;
            ctl.queue.clear();
            (ctl.subscription.take(), cleared)
        };
        if let Some(id) = subscription {
            self.source.unsubscribe(id);
        }

        // Join an in-flight pass on another thread. When called from inside
        // a listener, the generation check suppresses the rest of that pass.
        let me = thread::current().id();
        {
            let mut ctl = self.control();
            while ctl.drainer.is_some() && ctl.drainer != Some(me) {
                ctl = self.idle.wait(ctl).unwrap_or_else(PoisonError::into_inner);
            }
        }

        self.counters.discarded.fetch_add(cleared, Ordering::Relaxed);
        info!(engine = %self.name, discarded = cleared, "engine stopped");
        self.emit(None, EngineEvent::AfterStop);
        true
    }

    /// Inject an observation into the running generation.
    pub(crate) fn feed(&self, observation: Observation) -> Result<u64, ExecutionError> {
        let generation = {
            let ctl = self.control();
            if ctl.state != EngineState::Running {
                return Err(ExecutionError::NotRunning);
            }
            ctl.generation
        };
        self.deliver(generation, observation, true)
    }

    fn deliver(
        &self,
        generation: u64,
        observation: Observation,
        record_energy: bool,
    ) -> Result<u64, ExecutionError> {
        let me = thread::current().id();
        let mut overflowed = None;

        let (sequence, become_drainer) = {
            let mut ctl = self.control();
            if ctl.state != EngineState::Running || ctl.generation != generation {
                return Err(ExecutionError::NotRunning);
            }
            let sequence = ctl.next_sequence;
            ctl.next_sequence += 1;
            self.counters.received.fetch_add(1, Ordering::Relaxed);

            let pending = Pending {
                sequence,
                generation,
                observation,
                record_energy,
            };
            match self.queue.capacity {
                Some(capacity) if ctl.queue.len() >= capacity => match self.queue.overflow {
                    OverflowPolicy::DropNewest => overflowed = Some((sequence, capacity)),
                    OverflowPolicy::DropOldest => {
                        overflowed = ctl.queue.pop_front().map(|p| (p.sequence, capacity));
                        ctl.queue.push_back(pending);
                    }
                },
                _ => ctl.queue.push_back(pending),
            }

            let become_drainer = ctl.drainer.is_none() && !ctl.queue.is_empty();
            if become_drainer {
                ctl.drainer = Some(me);
            }
            (sequence, become_drainer)
        };

        if let Some((dropped, capacity)) = overflowed {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(engine = %self.name, sequence = dropped, capacity, "event queue full, observation dropped");
            self.report(
                Some(generation),
                Some(dropped),
                ExecutionError::QueueFull { capacity },
            );
        }

        if become_drainer {
            self.drain();
        }

        match overflowed {
            Some((dropped, capacity)) if dropped == sequence => {
                Err(ExecutionError::QueueFull { capacity })
            }
            _ => Ok(sequence),
        }
    }

    fn drain(&self) {
        loop {
            let next = {
                let mut ctl = self.control();
                let next = ctl.queue.pop_front();
                if next.is_none() {
                    ctl.drainer = None;
                    self.idle.notify_all();
                }
                next
            };
            let Some(pending) = next else {
                return;
            };
            if self.is_active(pending.generation) {
                self.process(pending);
            }
        }
    }

    fn process(&self, pending: Pending) {
        let Pending {
            sequence,
            generation,
            observation,
            record_energy,
        } = pending;
        let gate = Some(generation);

        self.emit(gate, EngineEvent::OnNewData { sequence });
        let snapshot = self.beliefs();

        self.emit(gate, EngineEvent::BeforeAutoUpdate { sequence });
        let resolved = catch_unwind(AssertUnwindSafe(|| self.autoupdate.resolve(&snapshot)))
            .unwrap_or_else(|_| {
                Err(ExecutionError::AutoUpdateFailed {
                    target: "*".to_string(),
                    reason: "extraction panicked".to_string(),
                })
            });
        let mut inputs = match resolved {
            Ok(inputs) => inputs,
            Err(e) => return self.fail(generation, sequence, e),
        };
        self.emit(gate, EngineEvent::AfterAutoUpdate { sequence });

        let shadowed = inputs.overlay(&observation);
        if !shadowed.is_empty() {
            debug!(engine = %self.name, sequence, ?shadowed, "observation overrides auto-update inputs");
        }

        let mut current = 0;
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.iteration.run_observed(&inputs, &snapshot, |mark| match mark {
                IterationMark::Before(iteration) => {
                    current = iteration;
                    self.emit(gate, EngineEvent::BeforeIteration { sequence, iteration });
                }
                IterationMark::After(iteration) => {
                    self.emit(gate, EngineEvent::AfterIteration { sequence, iteration });
                }
            })
        }))
        .unwrap_or_else(|_| {
            Err(ExecutionError::InferenceDivergence {
                iteration: current,
                reason: "inference step panicked".to_string(),
            })
        });
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => return self.fail(generation, sequence, e),
        };

        if !self.commit(generation, &outcome) {
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
            debug!(engine = %self.name, sequence, "engine stopped during pass, results discarded");
            return;
        }

        self.emit(gate, EngineEvent::BeforeHistorySave { sequence });
        self.record(generation, sequence, &outcome, record_energy);
        self.emit(gate, EngineEvent::AfterHistorySave { sequence });

        self.publish_beliefs(generation, sequence, &outcome);
        if record_energy {
            self.publish_energy(generation, sequence, &outcome);
        }

        self.counters.processed.fetch_add(1, Ordering::Relaxed);
        debug!(
            engine = %self.name,
            sequence,
            iterations = outcome.iterations.len(),
            revision = outcome.beliefs.revision(),
            "pass committed"
        );
    }

    fn commit(&self, generation: u64, outcome: &PassOutcome) -> bool {
        let ctl = self.control();
        if ctl.state != EngineState::Running || ctl.generation != generation {
            return false;
        }
        *self.beliefs.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&outcome.beliefs);
        drop(ctl);
        true
    }

    fn record(&self, generation: u64, sequence: u64, outcome: &PassOutcome, record_energy: bool) {
        if !self.is_active(generation) {
            return;
        }
        let mut histories = self.histories();
        histories.beliefs.record(sequence, outcome);
        if record_energy {
            if let Some(energy) = histories.energy.as_mut() {
                energy.record(sequence, &outcome.energies());
            }
        }
    }

    fn publish_beliefs(&self, generation: u64, sequence: u64, outcome: &PassOutcome) {
        for (variable, registry) in &self.belief_listeners {
            if registry.is_empty() {
                continue;
            }
            let Some(belief) = outcome.beliefs.get(variable) else {
                continue;
            };
            let update = BeliefUpdate {
                variable: variable.clone(),
                sequence,
                belief: belief.clone(),
            };
            self.dispatch(Some(generation), registry, &update, Some(sequence));
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn publish_energy(&self, generation: u64, sequence: u64, outcome: &PassOutcome) {
        if self.energy_listeners.is_empty() {
            return;
        }
        let per_iteration = outcome.energies();
        let Some(&final_value) = per_iteration.last() else {
            return;
        };
        let update = EnergyUpdate {
            sequence,
            averaged: per_iteration.iter().sum::<f64>() / per_iteration.len() as f64,
            final_value,
            per_iteration,
        };
        self.dispatch(Some(generation), &self.energy_listeners, &update, Some(sequence));
    }

    fn fail(&self, generation: u64, sequence: u64, error: ExecutionError) {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        warn!(engine = %self.name, sequence, error = %error, "pass failed, observation dropped");
        self.report(Some(generation), Some(sequence), error);
    }

    fn emit(&self, gate: Option<u64>, event: EngineEvent) {
        if self.event_listeners.is_empty() {
            return;
        }
        self.dispatch(gate, &self.event_listeners, &event, event.sequence());
    }

    /// Call every listener in `registry`, isolating failures.
    ///
    /// With a gate, delivery stops as soon as that generation is closed.
    fn dispatch<T>(&self, gate: Option<u64>, registry: &Registry<T>, payload: &T, sequence: Option<u64>) {
        for (label, callback) in registry.snapshot() {
            if gate.is_some_and(|g| !self.is_active(g)) {
                return;
            }
            if let Err(message) = invoke(&callback, payload) {
                self.counters.listener_failures.fetch_add(1, Ordering::Relaxed);
                warn!(engine = %self.name, listener = %label, error = %message, "listener failed");
                self.report(
                    gate,
                    sequence,
                    ExecutionError::ListenerFailure {
                        listener: label.to_string(),
                        message,
                    },
                );
            }
        }
    }

    /// Deliver a fault to the error listeners. Their own failures are only logged.
    fn report(&self, gate: Option<u64>, sequence: Option<u64>, error: ExecutionError) {
        let fault = EngineFault {
            sequence,
            error,
            at: Utc::now(),
        };
        for (label, callback) in self.error_listeners.snapshot() {
            if gate.is_some_and(|g| !self.is_active(g)) {
                return;
            }
            if let Err(message) = invoke(&callback, &fault) {
                self.counters.listener_failures.fetch_add(1, Ordering::Relaxed);
                warn!(engine = %self.name, listener = %label, error = %message, "error listener failed");
            }
        }
    }
}
