use std::sync::Mutex;

use parking_lot::ReentrantMutex;
use tracing::trace;

use crate::error::{poisoned, EngineResult};
use crate::observation::Observation;

use super::{ObservationListener, ObservationSource, SubscriptionId};

#[derive(Default)]
struct SubjectState {
    listeners: Vec<(SubscriptionId, ObservationListener)>,
    last: Option<Observation>,
    completed: bool,
}

/// A hot observation stream with an optional single-slot replay cache.
///
/// `next` broadcasts synchronously on the calling thread. When replay is
/// enabled, the most recent observation is kept and handed to every new
/// subscriber from inside `subscribe`, before any later observation.
///
/// Emission and replay share one re-entrant lock, so a listener may call
/// `next` on the same subject; nested values are delivered depth-first.
pub struct ReplaySubject {
    name: String,
    replay: bool,
    emit: ReentrantMutex<()>,
    state: Mutex<SubjectState>,
}

impl ReplaySubject {
    /// Creates a subject that replays its most recent value to new subscribers.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_replay(name, true)
    }

    /// Creates a subject with replay explicitly enabled or disabled.
    #[must_use]
    pub fn with_replay(name: impl Into<String>, replay: bool) -> Self {
        Self {
            name: name.into(),
            replay,
            emit: ReentrantMutex::new(()),
            state: Mutex::new(SubjectState::default()),
        }
    }

    /// The subject's name (used in logs).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Emit an observation to all current listeners.
    ///
    /// Returns the number of listeners notified. Values emitted after
    /// [`complete`](Self::complete) are ignored.
    pub fn next(&self, observation: Observation) -> EngineResult<usize> {
        let _emit = self.emit.lock();

        let listeners: Vec<ObservationListener> = {
            let mut state = self.state.lock().map_err(|_| poisoned("subject"))?;
            if state.completed {
                return Ok(0);
            }
            if self.replay {
                state.last = Some(observation.clone());
            }
            state.listeners.iter().map(|(_, l)| l.clone()).collect()
        };

        trace!(subject = %self.name, listeners = listeners.len(), "emitting observation");
        for listener in &listeners {
            listener(&observation);
        }
        Ok(listeners.len())
    }

    /// Stop accepting new values. The replay slot is kept.
    pub fn complete(&self) {
        let _emit = self.emit.lock();
        if let Ok(mut state) = self.state.lock() {
            state.completed = true;
        }
    }

    /// True once [`complete`](Self::complete) has been called.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.state.lock().map(|s| s.completed).unwrap_or(true)
    }

    /// The cached most recent observation, if replay is enabled.
    #[must_use]
    pub fn last(&self) -> Option<Observation> {
        self.state.lock().ok().and_then(|s| s.last.clone())
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.state.lock().map(|s| s.listeners.len()).unwrap_or(0)
    }
}

impl std::fmt::Debug for ReplaySubject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplaySubject")
            .field("name", &self.name)
            .field("replay", &self.replay)
            .field("listeners", &self.listener_count())
            .finish_non_exhaustive()
    }
}

impl ObservationSource for ReplaySubject {
    fn subscribe(&self, listener: ObservationListener) -> EngineResult<SubscriptionId> {
        let _emit = self.emit.lock();

        let id = SubscriptionId::new();
        let replayed = {
            let mut state = self.state.lock().map_err(|_| poisoned("subject"))?;
            state.listeners.push((id, listener.clone()));
            state.last.clone()
        };

        if let Some(observation) = replayed {
            trace!(subject = %self.name, subscription = %id, "replaying last observation");
            listener(&observation);
        }
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        let before = state.listeners.len();
        state.listeners.retain(|(sid, _)| *sid != id);
        state.listeners.len() != before
    }
}
