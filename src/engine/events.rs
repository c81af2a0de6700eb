//! Lifecycle and pipeline events for host instrumentation.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Points in the engine's lifecycle and in each pass.
///
/// Pass events carry the observation's sequence index; iteration events
/// also carry the zero-based iteration index.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    BeforeStart,
    AfterStart,
    BeforeStop,
    AfterStop,
    OnNewData { sequence: u64 },
    BeforeAutoUpdate { sequence: u64 },
    AfterAutoUpdate { sequence: u64 },
    BeforeIteration { sequence: u64, iteration: u32 },
    AfterIteration { sequence: u64, iteration: u32 },
    BeforeHistorySave { sequence: u64 },
    AfterHistorySave { sequence: u64 },
}

impl EngineEvent {
    /// Stable snake_case name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::BeforeStart => "before_start",
            Self::AfterStart => "after_start",
            Self::BeforeStop => "before_stop",
            Self::AfterStop => "after_stop",
            Self::OnNewData { .. } => "on_new_data",
            Self::BeforeAutoUpdate { .. } => "before_auto_update",
            Self::AfterAutoUpdate { .. } => "after_auto_update",
            Self::BeforeIteration { .. } => "before_iteration",
            Self::AfterIteration { .. } => "after_iteration",
            Self::BeforeHistorySave { .. } => "before_history_save",
            Self::AfterHistorySave { .. } => "after_history_save",
        }
    }

    /// Sequence index for pass events.
    #[must_use]
    pub const fn sequence(&self) -> Option<u64> {
        match self {
            Self::OnNewData { sequence }
            | Self::BeforeAutoUpdate { sequence }
            | Self::AfterAutoUpdate { sequence }
            | Self::BeforeIteration { sequence, .. }
            | Self::AfterIteration { sequence, .. }
            | Self::BeforeHistorySave { sequence }
            | Self::AfterHistorySave { sequence } => Some(*sequence),
            Self::BeforeStart | Self::AfterStart | Self::BeforeStop | Self::AfterStop => None,
        }
    }
}

impl fmt::Display for EngineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
