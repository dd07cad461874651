//! Control-plane boundary.
//!
//! `ControlPlane` is everything the core needs from the production application:
//! scene enumeration, per-scene source visibility, output (stream/record) state, and a
//! notification capability. Some transports push state changes, others must be polled;
//! both sit behind `next_notification`, and the lifecycle manager additionally polls
//! output state on a fixed interval so a push-less transport still converges.
//!
//! Implementations:
//! - `ObsClient`: obs-websocket 5.x over a blocking WebSocket
//! - `InMemoryControlPlane`: scripted double with fault injection (tests, demo)

mod memory;
pub mod obs;

use std::time::Duration;

use crate::error::ControlPlaneError;

pub use memory::{Call, CallKind, InMemoryConnector, InMemoryControlPlane};
pub use obs::{ObsClient, ObsConnector, ObsEndpoint};

/// One placement of a source inside a scene.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SceneItem {
    pub id: i64,
    pub source_name: String,
    pub enabled: bool,
}

/// Streaming / recording state of the production application.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OutputState {
    pub streaming: bool,
    pub recording: bool,
}

impl OutputState {
    /// Live means the operator is streaming or recording.
    pub fn is_live(&self) -> bool {
        self.streaming || self.recording
    }
}

/// Asynchronous change reported by the control plane.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    StreamingChanged(bool),
    RecordingChanged(bool),
    /// Scenes or scene items were added, removed, or renamed.
    TopologyChanged,
    /// The application is shutting down; the link is about to drop.
    Closing,
}

pub trait ControlPlane: Send {
    fn list_scenes(&mut self) -> Result<Vec<String>, ControlPlaneError>;

    fn list_sources_in_scene(&mut self, scene: &str) -> Result<Vec<SceneItem>, ControlPlaneError>;

    /// Enumerate several scenes at once. Scenes that vanished since `list_scenes` are
    /// skipped. Transports with batch support should override this.
    fn list_sources_in_scenes(
        &mut self,
        scenes: &[String],
    ) -> Result<Vec<(String, Vec<SceneItem>)>, ControlPlaneError> {
        let mut listings = Vec::with_capacity(scenes.len());
        for scene in scenes {
            match self.list_sources_in_scene(scene) {
                Ok(items) => listings.push((scene.clone(), items)),
                Err(e) if e.is_not_found() => {
                    log::debug!("scene '{}' disappeared during enumeration", scene);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(listings)
    }

    /// Set every placement of `source` in `scene`. Setting the current value is a no-op
    /// on the application side.
    fn set_source_visible(
        &mut self,
        scene: &str,
        source: &str,
        visible: bool,
    ) -> Result<(), ControlPlaneError>;

    /// Set the given placements of `source` in `scene`, using item ids from an earlier
    /// listing. Stale ids fail with `NotFound`. An empty id list falls back to
    /// `set_source_visible`.
    fn set_items_enabled(
        &mut self,
        scene: &str,
        source: &str,
        item_ids: &[i64],
        visible: bool,
    ) -> Result<(), ControlPlaneError> {
        let _ = item_ids;
        self.set_source_visible(scene, source, visible)
    }

    fn streaming_state(&mut self) -> Result<bool, ControlPlaneError>;

    fn recording_state(&mut self) -> Result<bool, ControlPlaneError>;

    fn output_state(&mut self) -> Result<OutputState, ControlPlaneError> {
        Ok(OutputState {
            streaming: self.streaming_state()?,
            recording: self.recording_state()?,
        })
    }

    /// Wait up to `wait` for a pushed notification. Poll-only transports return
    /// `Ok(None)` after the wait.
    fn next_notification(
        &mut self,
        wait: Duration,
    ) -> Result<Option<Notification>, ControlPlaneError> {
        std::thread::sleep(wait);
        Ok(None)
    }

    /// Best-effort close. Only the lifecycle manager calls this.
    fn close(&mut self) {}
}
