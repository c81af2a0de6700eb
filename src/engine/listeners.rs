//! Listener registries and the payloads they receive.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::belief::Belief;
use crate::error::ExecutionError;

/// Return type of every listener callback.
///
/// An `Err` (or a panic) is reported as a `ListenerFailure` and does not
/// affect other listeners.
pub type ListenerResult = Result<(), String>;

pub(crate) type Callback<T> = Arc<dyn Fn(&T) -> ListenerResult + Send + Sync>;

/// Handle for unregistering a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListenerId(Uuid);

impl ListenerId {
    /// Create a new random listener id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ListenerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Published once per pass for every variable with listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeliefUpdate {
    /// Latent variable name.
    pub variable: String,
    /// Sequence index of the observation.
    pub sequence: u64,
    /// Belief after the final iteration.
    pub belief: Belief,
}

/// Published once per pass when energy tracking is on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnergyUpdate {
    /// Sequence index of the observation.
    pub sequence: u64,
    /// Energy of every iteration, in order.
    pub per_iteration: Vec<f64>,
    /// Arithmetic mean of `per_iteration`.
    pub averaged: f64,
    /// Energy of the last iteration.
    pub final_value: f64,
}

/// A per-event failure surfaced on the error channel.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineFault {
    /// Observation the failure belongs to, if any.
    pub sequence: Option<u64>,
    /// What went wrong.
    pub error: ExecutionError,
    /// When the failure was observed.
    pub at: DateTime<Utc>,
}

struct Entry<T> {
    id: ListenerId,
    label: Arc<str>,
    callback: Callback<T>,
}

/// A registry of callbacks for one payload type.
///
/// Callbacks are never invoked while the registry lock is held, so a
/// listener may register or remove listeners from inside its callback.
pub(crate) struct Registry<T> {
    kind: &'static str,
    entries: Mutex<Vec<Entry<T>>>,
}

impl<T> Registry<T> {
    pub(crate) fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn add<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&T) -> ListenerResult + Send + Sync + 'static,
    {
        let callback: Callback<T> = Arc::new(callback);
        let id = ListenerId::new();
        let label: Arc<str> = Arc::from(format!("{}#{id}", self.kind));
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Entry { id, label, callback });
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|e| e.id != id);
        entries.len() != before
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    pub(crate) fn snapshot(&self) -> Vec<(Arc<str>, Callback<T>)> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|e| (Arc::clone(&e.label), Arc::clone(&e.callback)))
            .collect()
    }
}

/// Run one callback, converting a panic into an error message.
pub(crate) fn invoke<T>(callback: &Callback<T>, payload: &T) -> ListenerResult {
    match catch_unwind(AssertUnwindSafe(|| callback(payload))) {
        Ok(result) => result,
        Err(panic) => Err(panic_message(panic.as_ref())),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}
