use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::Receiver;
use tracing::{debug, warn};

use crate::error::{poisoned, EngineError, EngineResult, ExecutionError};
use crate::observation::Observation;

use super::{ObservationListener, ObservationSource, ReplaySubject, SubscriptionId};

/// Adapts an external channel producer into an [`ObservationSource`].
///
/// A named pump thread forwards every received observation into an internal
/// [`ReplaySubject`], so listeners run on the pump thread. The pump exits and
/// completes the subject once every sender is dropped.
#[derive(Debug)]
pub struct ChannelSource {
    subject: Arc<ReplaySubject>,
    pump: Mutex<Option<JoinHandle<u64>>>,
}

impl ChannelSource {
    /// Start pumping `rx` into a new subject.
    pub fn spawn(name: &str, rx: Receiver<Observation>, replay: bool) -> EngineResult<Self> {
        let subject = Arc::new(ReplaySubject::with_replay(name, replay));
        let pump_subject = Arc::clone(&subject);

        let pump = thread::Builder::new()
            .name(format!("beliefstream-source-{name}"))
            .spawn(move || {
                let mut forwarded = 0u64;
                for observation in &rx {
                    if let Err(e) = pump_subject.next(observation) {
                        warn!(source = pump_subject.name(), error = %e, "source pump stopped");
                        break;
                    }
                    forwarded += 1;
                }
                pump_subject.complete();
                debug!(source = pump_subject.name(), forwarded, "source channel closed");
                forwarded
            })
            .map_err(|e| EngineError::internal(format!("failed to spawn source pump: {e}")))?;

        Ok(Self {
            subject,
            pump: Mutex::new(Some(pump)),
        })
    }

    /// The subject observations are forwarded into.
    #[must_use]
    pub fn subject(&self) -> &ReplaySubject {
        &self.subject
    }

    /// Wait for the producer to disconnect and every observation to be delivered.
    ///
    /// Returns the number of observations forwarded. Calling it again after
    /// the pump has been joined fails with `Disconnected`.
    pub fn join(&self) -> EngineResult<u64> {
        let handle = self
            .pump
            .lock()
            .map_err(|_| poisoned("source pump"))?
            .take()
            .ok_or_else(|| {
                EngineError::from(ExecutionError::Disconnected {
                    path: format!("source/{}", self.subject.name()),
                })
            })?;
        handle
            .join()
            .map_err(|_| EngineError::internal("source pump panicked"))
    }
}

impl ObservationSource for ChannelSource {
    fn subscribe(&self, listener: ObservationListener) -> EngineResult<SubscriptionId> {
        self.subject.subscribe(listener)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subject.unsubscribe(id)
    }
}
