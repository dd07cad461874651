//! Presence Switch
//!
//! Drives the visibility of OBS overlay sources from a face-presence signal.
//!
//! # Architecture
//!
//! - `feed`: presence feeds (frame source + face detector, or an external signal process)
//! - `debounce`: noisy per-frame confidence -> stable present/absent transitions
//! - `control`: the control-plane boundary (obs-websocket client, in-memory double)
//! - `topology`: cached scene -> source snapshot with a revision counter
//! - `sync`: cross-scene visibility synchronizer
//! - `lifecycle`: DISCONNECTED / STANDBY / ACTIVE supervisor and reconnect policy
//!
//! The lifecycle manager is the only component that opens or closes the control-plane
//! link. The synchronizer and the topology snapshot borrow it per call, and are only
//! driven while the phase is ACTIVE.

use std::collections::BTreeSet;
use std::time::Instant;

use serde::{Deserialize, Serialize};

pub mod config;
pub mod control;
pub mod debounce;
pub mod error;
pub mod feed;
pub mod lifecycle;
pub mod sync;
pub mod topology;

pub use config::ControllerConfig;
pub use control::{ControlPlane, InMemoryControlPlane, Notification, ObsClient, ObsConnector};
pub use debounce::{DebounceConfig, PresenceDebouncer, PresenceState};
pub use error::{ConfigurationError, ControlPlaneError};
pub use feed::{FeedPull, PresenceFeed};
pub use lifecycle::{
    Backoff, Connector, LifecycleEvent, LifecycleManager, LifecyclePhase, PhaseHandle,
    StopSignal,
};
pub use sync::{SyncResult, VisibilitySynchronizer};
pub use topology::{SceneTopology, TopologySnapshot};

// -------------------- Presence Samples --------------------

/// One processed frame's face-presence confidence.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PresenceSample {
    /// Clamped to 0..=1. NaN is treated as 0.
    pub confidence: f32,
    pub timestamp: Instant,
}

impl PresenceSample {
    pub fn new(confidence: f32, timestamp: Instant) -> Self {
        let confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };
        Self {
            confidence,
            timestamp,
        }
    }

    /// Substitute for a bad or missing frame.
    pub fn zero(timestamp: Instant) -> Self {
        Self {
            confidence: 0.0,
            timestamp,
        }
    }
}

/// Debounced presence edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Transition {
    BecamePresent,
    BecameAbsent,
}

impl Transition {
    pub fn is_present(self) -> bool {
        matches!(self, Transition::BecamePresent)
    }
}

// -------------------- Source Targets --------------------

/// What a target does when a face appears.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetMode {
    /// Visible while present, hidden while absent.
    #[default]
    Show,
    /// Hidden while present, visible while absent.
    Hide,
}

/// An overlay source driven by presence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceTarget {
    pub source_name: String,
    /// Scenes that are never mutated for this source (detection/monitoring scenes).
    pub excluded_scene_names: BTreeSet<String>,
    pub mode: TargetMode,
}

impl SourceTarget {
    pub fn new(source_name: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            excluded_scene_names: BTreeSet::new(),
            mode: TargetMode::Show,
        }
    }

    pub fn excluding<I, S>(mut self, scenes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded_scene_names
            .extend(scenes.into_iter().map(Into::into));
        self
    }

    pub fn with_mode(mut self, mode: TargetMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn is_excluded(&self, scene: &str) -> bool {
        self.excluded_scene_names.contains(scene)
    }

    /// Visibility this target should have after `transition`.
    pub fn desired_visibility(&self, transition: Transition) -> bool {
        match self.mode {
            TargetMode::Show => transition.is_present(),
            TargetMode::Hide => !transition.is_present(),
        }
    }
}
