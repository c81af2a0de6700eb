//! Observation sources.
//!
//! The engine consumes observations through the [`ObservationSource`] trait.
//! Two implementations ship with the crate: [`ReplaySubject`], a hot stream
//! with a single-slot last-value cache, and [`ChannelSource`], which pumps an
//! external crossbeam channel into a subject on a dedicated thread.

mod channel;
mod subject;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineResult;
use crate::observation::Observation;

pub use channel::ChannelSource;
pub use subject::ReplaySubject;

/// Callback invoked for every observation delivered to a subscription.
pub type ObservationListener = Arc<dyn Fn(&Observation) + Send + Sync>;

/// Unique identifier for a source subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// Create a new random subscription id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A producer of observation events supporting multiple listeners.
///
/// Each listener receives every observation from its own subscription point
/// forward. Replay-capable sources may deliver one buffered observation
/// synchronously from inside `subscribe`.
pub trait ObservationSource: Send + Sync {
    /// Register a listener. May deliver a buffered observation before returning.
    fn subscribe(&self, listener: ObservationListener) -> EngineResult<SubscriptionId>;

    /// Remove a listener. Returns false if the id was unknown.
    fn unsubscribe(&self, id: SubscriptionId) -> bool;
}
