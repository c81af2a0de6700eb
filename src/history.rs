//! Bounded history buffers.
//!
//! Every buffer is a FIFO with a fixed capacity: once full, each append
//! evicts the oldest entry. A capacity of zero retains nothing.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::belief::Belief;
use crate::iteration::PassOutcome;

/// One recorded value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry<T> {
    /// Sequence index of the observation that produced the value.
    pub sequence: u64,
    /// Iteration index within the pass (for per-event views: the last one).
    pub iteration: u32,
    /// The recorded value.
    pub value: T,
}

/// Which iterations of a pass a tracked variable retains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Only the final iteration of each pass.
    #[default]
    LastOnly,
    /// Every iteration of each pass.
    EveryIteration,
}

/// A bounded FIFO buffer of history entries.
#[derive(Debug, Clone)]
pub struct HistoryBuffer<T> {
    entries: VecDeque<HistoryEntry<T>>,
    capacity: usize,
}

impl<T: Clone> HistoryBuffer<T> {
    /// Creates an empty buffer holding at most `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
        }
    }

    /// Appends an entry, evicting the oldest if the buffer is full.
    pub fn append(&mut self, entry: HistoryEntry<T>) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Entries from oldest to newest.
    #[must_use]
    pub fn snapshot(&self) -> Vec<HistoryEntry<T>> {
        self.entries.iter().cloned().collect()
    }

    /// Values only, from oldest to newest.
    #[must_use]
    pub fn values(&self) -> Vec<T> {
        self.entries.iter().map(|e| e.value.clone()).collect()
    }

    /// Most recent entry.
    #[must_use]
    pub fn last(&self) -> Option<&HistoryEntry<T>> {
        self.entries.back()
    }

    /// Number of entries currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no entries are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of entries.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

#[derive(Debug, Clone)]
struct TrackedBuffer {
    policy: RetentionPolicy,
    buffer: HistoryBuffer<Belief>,
}

/// Per-variable belief history.
#[derive(Debug, Clone, Default)]
pub struct BeliefHistory {
    tracked: BTreeMap<String, TrackedBuffer>,
}

impl BeliefHistory {
    /// Creates a history over `(variable, policy, capacity)` triples.
    #[must_use]
    pub fn new(tracked: impl IntoIterator<Item = (String, RetentionPolicy, usize)>) -> Self {
        Self {
            tracked: tracked
                .into_iter()
                .map(|(name, policy, capacity)| {
                    (
                        name,
                        TrackedBuffer {
                            policy,
                            buffer: HistoryBuffer::new(capacity),
                        },
                    )
                })
                .collect(),
        }
    }

    /// True if `variable` is tracked.
    #[must_use]
    pub fn is_tracked(&self, variable: &str) -> bool {
        self.tracked.contains_key(variable)
    }

    /// Retention policy of `variable`.
    #[must_use]
    pub fn policy(&self, variable: &str) -> Option<RetentionPolicy> {
        self.tracked.get(variable).map(|t| t.policy)
    }

    /// Buffer of `variable`.
    #[must_use]
    pub fn buffer(&self, variable: &str) -> Option<&HistoryBuffer<Belief>> {
        self.tracked.get(variable).map(|t| &t.buffer)
    }

    /// Record a pass according to each variable's policy.
    pub fn record(&mut self, sequence: u64, outcome: &PassOutcome) {
        for (variable, tracked) in &mut self.tracked {
            let iterations = match tracked.policy {
                RetentionPolicy::LastOnly => &outcome.iterations[outcome.iterations.len().saturating_sub(1)..],
                RetentionPolicy::EveryIteration => &outcome.iterations[..],
            };
            for result in iterations {
                if let Some(belief) = result.beliefs.get(variable) {
                    tracked.buffer.append(HistoryEntry {
                        sequence,
                        iteration: result.iteration,
                        value: belief.clone(),
                    });
                }
            }
        }
    }
}

/// The three energy views over one stream of per-iteration energies.
///
/// `averaged` and `final_only` hold one entry per pass and are bounded in
/// passes; `raw` holds one entry per iteration and is bounded in iterations.
#[derive(Debug, Clone)]
pub struct EnergyHistory {
    averaged: HistoryBuffer<f64>,
    raw: HistoryBuffer<f64>,
    final_only: HistoryBuffer<f64>,
}

impl EnergyHistory {
    /// Creates energy views holding `capacity` passes (raw: `capacity * iterations`).
    #[must_use]
    pub fn new(capacity: usize, iterations: u32) -> Self {
        Self {
            averaged: HistoryBuffer::new(capacity),
            raw: HistoryBuffer::new(capacity.saturating_mul(iterations as usize)),
            final_only: HistoryBuffer::new(capacity),
        }
    }

    /// Record one pass's energies; ignored when `energies` is empty.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    pub fn record(&mut self, sequence: u64, energies: &[f64]) {
        let Some(&last) = energies.last() else {
            return;
        };
        let last_iteration = (energies.len() - 1) as u32;

        for (iteration, &value) in energies.iter().enumerate() {
            self.raw.append(HistoryEntry {
                sequence,
                iteration: iteration as u32,
                value,
            });
        }

        let mean = energies.iter().sum::<f64>() / energies.len() as f64;
        self.averaged.append(HistoryEntry {
            sequence,
            iteration: last_iteration,
            value: mean,
        });
        self.final_only.append(HistoryEntry {
            sequence,
            iteration: last_iteration,
            value: last,
        });
    }

    /// Mean energy per pass.
    #[must_use]
    pub const fn averaged(&self) -> &HistoryBuffer<f64> {
        &self.averaged
    }

    /// Every iteration's energy.
    #[must_use]
    pub const fn raw(&self) -> &HistoryBuffer<f64> {
        &self.raw
    }

    /// Last iteration's energy per pass.
    #[must_use]
    pub const fn final_only(&self) -> &HistoryBuffer<f64> {
        &self.final_only
    }
}
