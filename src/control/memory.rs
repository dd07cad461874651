//! In-memory control plane.
//!
//! A scene graph held in process, with scripted faults and a call log. Clones share
//! state, so a test can keep one handle while the lifecycle manager owns another.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::control::{ControlPlane, Notification, SceneItem};
use crate::error::ControlPlaneError;
use crate::lifecycle::Connector;

/// A recorded control-plane call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    ListScenes,
    ListSourcesInScene(String),
    ListSourcesInScenes(Vec<String>),
    SetSourceVisible {
        scene: String,
        source: String,
        visible: bool,
    },
    StreamingState,
    RecordingState,
}

impl Call {
    fn kind(&self) -> CallKind {
        match self {
            Call::ListScenes => CallKind::ListScenes,
            Call::ListSourcesInScene(_) | Call::ListSourcesInScenes(_) => CallKind::ListSources,
            Call::SetSourceVisible { .. } => CallKind::SetSourceVisible,
            Call::StreamingState | Call::RecordingState => CallKind::OutputState,
        }
    }
}

/// Which calls a scripted fault applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallKind {
    ListScenes,
    ListSources,
    SetSourceVisible,
    OutputState,
    Any,
}

#[derive(Debug)]
struct Fault {
    kind: CallKind,
    error: ControlPlaneError,
}

#[derive(Debug, Default)]
struct MemoryState {
    scenes: Vec<(String, Vec<SceneItem>)>,
    next_item_id: i64,
    streaming: bool,
    recording: bool,
    notifications: VecDeque<Notification>,
    faults: VecDeque<Fault>,
    calls: Vec<Call>,
    /// Once set, every call fails with a connection error until `restore_link`.
    link_down: bool,
}

impl MemoryState {
    fn scene_mut(&mut self, scene: &str) -> Option<&mut Vec<SceneItem>> {
        self.scenes
            .iter_mut()
            .find(|(name, _)| name == scene)
            .map(|(_, items)| items)
    }

    fn record(&mut self, call: Call) -> Result<(), ControlPlaneError> {
        let kind = call.kind();
        self.calls.push(call);
        if self.link_down {
            return Err(ControlPlaneError::Connection("link down".to_string()));
        }
        if let Some(pos) = self
            .faults
            .iter()
            .position(|f| f.kind == kind || f.kind == CallKind::Any)
        {
            if let Some(fault) = self.faults.remove(pos) {
                if fault.error.is_connection_level() {
                    self.link_down = true;
                }
                return Err(fault.error);
            }
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryControlPlane {
    inner: Arc<(Mutex<MemoryState>, Condvar)>,
}

impl InMemoryControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.inner.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self, notification: Notification) {
        self.state().notifications.push_back(notification);
        self.inner.1.notify_all();
    }

    /// Add a scene containing one visible placement per source.
    pub fn with_scene(self, scene: &str, sources: &[&str]) -> Self {
        self.add_scene(scene, sources);
        self
    }

    pub fn add_scene(&self, scene: &str, sources: &[&str]) {
        {
            let mut state = self.state();
            let mut items = Vec::with_capacity(sources.len());
            for source in sources {
                state.next_item_id += 1;
                items.push(SceneItem {
                    id: state.next_item_id,
                    source_name: source.to_string(),
                    enabled: true,
                });
            }
            state.scenes.push((scene.to_string(), items));
        }
        self.notify(Notification::TopologyChanged);
    }

    pub fn remove_scene(&self, scene: &str) {
        self.state().scenes.retain(|(name, _)| name != scene);
        self.notify(Notification::TopologyChanged);
    }

    /// Change a source's visibility out of band, as an operator would.
    pub fn set_visibility(&self, scene: &str, source: &str, visible: bool) {
        if let Some(items) = self.state().scene_mut(scene) {
            for item in items.iter_mut().filter(|i| i.source_name == source) {
                item.enabled = visible;
            }
        }
    }

    /// `None` when the scene or source does not exist.
    pub fn visibility(&self, scene: &str, source: &str) -> Option<bool> {
        let mut state = self.state();
        let items = state.scene_mut(scene)?;
        items
            .iter()
            .find(|i| i.source_name == source)
            .map(|i| i.enabled)
    }

    pub fn set_streaming(&self, active: bool) {
        self.state().streaming = active;
        self.notify(Notification::StreamingChanged(active));
    }

    pub fn set_recording(&self, active: bool) {
        self.state().recording = active;
        self.notify(Notification::RecordingChanged(active));
    }

    /// Change output state without pushing a notification (poll-only transports).
    pub fn set_outputs_silently(&self, streaming: bool, recording: bool) {
        let mut state = self.state();
        state.streaming = streaming;
        state.recording = recording;
    }

    /// The next call of `kind` fails with `error`. Connection-level errors also take
    /// the link down.
    pub fn fail_next(&self, kind: CallKind, error: ControlPlaneError) {
        self.state().faults.push_back(Fault { kind, error });
    }

    pub fn drop_link(&self) {
        self.state().link_down = true;
        self.inner.1.notify_all();
    }

    pub fn restore_link(&self) {
        self.state().link_down = false;
    }

    pub fn is_link_down(&self) -> bool {
        self.state().link_down
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Visibility commands issued so far, in order.
    pub fn mutations(&self) -> Vec<(String, String, bool)> {
        self.state()
            .calls
            .iter()
            .filter_map(|call| match call {
                Call::SetSourceVisible {
                    scene,
                    source,
                    visible,
                } => Some((scene.clone(), source.clone(), *visible)),
                _ => None,
            })
            .collect()
    }

    /// Number of topology reads (`list_scenes` calls).
    pub fn refresh_count(&self) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| matches!(c, Call::ListScenes))
            .count()
    }
}

impl ControlPlane for InMemoryControlPlane {
    fn list_scenes(&mut self) -> Result<Vec<String>, ControlPlaneError> {
        let mut state = self.state();
        state.record(Call::ListScenes)?;
        Ok(state.scenes.iter().map(|(name, _)| name.clone()).collect())
    }

    fn list_sources_in_scene(&mut self, scene: &str) -> Result<Vec<SceneItem>, ControlPlaneError> {
        let mut state = self.state();
        state.record(Call::ListSourcesInScene(scene.to_string()))?;
        state
            .scene_mut(scene)
            .map(|items| items.clone())
            .ok_or_else(|| ControlPlaneError::NotFound {
                request: "GetSceneItemList".to_string(),
                detail: format!("no scene named '{}'", scene),
            })
    }

    fn list_sources_in_scenes(
        &mut self,
        scenes: &[String],
    ) -> Result<Vec<(String, Vec<SceneItem>)>, ControlPlaneError> {
        let mut state = self.state();
        state.record(Call::ListSourcesInScenes(scenes.to_vec()))?;
        Ok(scenes
            .iter()
            .filter_map(|scene| {
                state
                    .scene_mut(scene)
                    .map(|items| (scene.clone(), items.clone()))
            })
            .collect())
    }

    fn set_source_visible(
        &mut self,
        scene: &str,
        source: &str,
        visible: bool,
    ) -> Result<(), ControlPlaneError> {
        let mut state = self.state();
        state.record(Call::SetSourceVisible {
            scene: scene.to_string(),
            source: source.to_string(),
            visible,
        })?;
        let not_found = |detail: String| ControlPlaneError::NotFound {
            request: "SetSceneItemEnabled".to_string(),
            detail,
        };
        let items = state
            .scene_mut(scene)
            .ok_or_else(|| not_found(format!("no scene named '{}'", scene)))?;
        let mut matched = false;
        for item in items.iter_mut().filter(|i| i.source_name == source) {
            item.enabled = visible;
            matched = true;
        }
        if !matched {
            return Err(not_found(format!(
                "source '{}' is not in scene '{}'",
                source, scene
            )));
        }
        Ok(())
    }

    fn set_items_enabled(
        &mut self,
        scene: &str,
        source: &str,
        item_ids: &[i64],
        visible: bool,
    ) -> Result<(), ControlPlaneError> {
        if item_ids.is_empty() {
            return self.set_source_visible(scene, source, visible);
        }
        let mut state = self.state();
        state.record(Call::SetSourceVisible {
            scene: scene.to_string(),
            source: source.to_string(),
            visible,
        })?;
        let stale = |detail: String| ControlPlaneError::NotFound {
            request: "SetSceneItemEnabled".to_string(),
            detail,
        };
        let items = state
            .scene_mut(scene)
            .ok_or_else(|| stale(format!("no scene named '{}'", scene)))?;
        if let Some(id) = item_ids.iter().find(|id| {
            !items
                .iter()
                .any(|item| item.id == **id && item.source_name == source)
        }) {
            return Err(stale(format!("no item {} for '{}' in scene '{}'", id, source, scene)));
        }
        for item in items.iter_mut().filter(|i| item_ids.contains(&i.id)) {
            item.enabled = visible;
        }
        Ok(())
    }

    fn streaming_state(&mut self) -> Result<bool, ControlPlaneError> {
        let mut state = self.state();
        state.record(Call::StreamingState)?;
        Ok(state.streaming)
    }

    fn recording_state(&mut self) -> Result<bool, ControlPlaneError> {
        let mut state = self.state();
        state.record(Call::RecordingState)?;
        Ok(state.recording)
    }

    fn next_notification(
        &mut self,
        wait: Duration,
    ) -> Result<Option<Notification>, ControlPlaneError> {
        let deadline = Instant::now() + wait;
        let mut state = self.state();
        loop {
            if state.link_down {
                return Err(ControlPlaneError::Connection("link down".to_string()));
            }
            if let Some(notification) = state.notifications.pop_front() {
                return Ok(Some(notification));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            state = self
                .inner
                .1
                .wait_timeout(state, remaining)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }
}

/// Hands out clones of one in-memory plane; can refuse a number of attempts first.
#[derive(Clone)]
pub struct InMemoryConnector {
    plane: InMemoryControlPlane,
    refusals: Arc<Mutex<u32>>,
    attempts: Arc<Mutex<Vec<Instant>>>,
}

impl InMemoryConnector {
    pub fn new(plane: InMemoryControlPlane) -> Self {
        Self {
            plane,
            refusals: Arc::new(Mutex::new(0)),
            attempts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Refuse the next `count` connection attempts.
    pub fn refuse_next(&self, count: u32) {
        *self.refusals.lock().unwrap_or_else(|e| e.into_inner()) = count;
    }

    /// When each connection attempt was made.
    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Connector for InMemoryConnector {
    type Client = InMemoryControlPlane;

    fn describe(&self) -> String {
        "memory://".to_string()
    }

    fn connect(&mut self) -> Result<InMemoryControlPlane, ControlPlaneError> {
        self.attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Instant::now());
        let mut refusals = self.refusals.lock().unwrap_or_else(|e| e.into_inner());
        if *refusals > 0 {
            *refusals -= 1;
            return Err(ControlPlaneError::Connection("connection refused".to_string()));
        }
        if self.plane.is_link_down() {
            return Err(ControlPlaneError::Connection("link down".to_string()));
        }
        // A fresh session starts with no stale notifications.
        self.plane.state().notifications.clear();
        Ok(self.plane.clone())
    }
}
