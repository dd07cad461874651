//! Lifecycle supervision.
//!
//! ```text
//! DISCONNECTED --connect ok--> STANDBY --outputs live--> ACTIVE
//!      ^                          ^                        |
//!      |                          +----outputs stopped-----+
//!      +------------ link lost (any phase) ----------------+
//! ```
//!
//! The phase is owned by the manager and published read-only through `PhaseHandle`
//! and an optional `LifecycleEvent` channel.

mod backoff;
mod detection;
mod mailbox;
mod manager;
mod stop;

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::control::{ControlPlane, OutputState};
use crate::error::ControlPlaneError;
use crate::Transition;

pub use backoff::{reconnect_log_level, Backoff, BackoffPolicy};
pub use mailbox::LatestSlot;
pub use manager::{LifecycleManager, LifecycleSettings};
pub use stop::StopSignal;

/// Opens control-plane sessions. The manager is the only caller.
pub trait Connector: Send {
    type Client: ControlPlane;

    /// Human-readable endpoint for logs.
    fn describe(&self) -> String;

    fn connect(&mut self) -> Result<Self::Client, ControlPlaneError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LifecyclePhase {
    Disconnected,
    Standby,
    Active,
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecyclePhase::Disconnected => "DISCONNECTED",
            LifecyclePhase::Standby => "STANDBY",
            LifecyclePhase::Active => "ACTIVE",
        };
        f.write_str(name)
    }
}

/// When a connected controller runs detection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    /// Only while streaming or recording.
    #[default]
    Live,
    /// Whenever the control plane is reachable.
    Connected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhaseInput {
    Connected,
    LinkLost,
    Outputs(OutputState),
}

pub fn next_phase(
    phase: LifecyclePhase,
    input: PhaseInput,
    activation: Activation,
) -> LifecyclePhase {
    match (phase, input) {
        (_, PhaseInput::LinkLost) => LifecyclePhase::Disconnected,
        (LifecyclePhase::Disconnected, PhaseInput::Connected) => LifecyclePhase::Standby,
        (phase, PhaseInput::Connected) => phase,
        (LifecyclePhase::Disconnected, PhaseInput::Outputs(_)) => LifecyclePhase::Disconnected,
        (_, PhaseInput::Outputs(outputs)) => {
            if activation == Activation::Connected || outputs.is_live() {
                LifecyclePhase::Active
            } else {
                LifecyclePhase::Standby
            }
        }
    }
}

/// Read-only view of the manager's current phase.
#[derive(Clone, Debug)]
pub struct PhaseHandle {
    inner: Arc<Mutex<LifecyclePhase>>,
}

impl PhaseHandle {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(LifecyclePhase::Disconnected)),
        }
    }

    pub fn current(&self) -> LifecyclePhase {
        *self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns the previous phase.
    pub(crate) fn set(&self, phase: LifecyclePhase) -> LifecyclePhase {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *guard, phase)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LifecycleEvent {
    PhaseChanged {
        from: LifecyclePhase,
        to: LifecyclePhase,
    },
    Connected {
        endpoint: String,
    },
    ConnectionLost {
        reason: String,
    },
    ReconnectScheduled {
        attempt: u32,
        delay: Duration,
    },
    TransitionApplied {
        transition: Transition,
        applied: usize,
        /// Scenes that could not be set, plus rejected scene-graph refreshes.
        failed: usize,
    },
    /// The presence feed ended; it is re-acquired after the retry delay.
    FeedEnded,
    Stopped,
}
