//! Cross-scene visibility synchronizer.
//!
//! Turns a presence transition into the minimal set of `set_source_visible` calls:
//! every scene of the current snapshot that contains the source and is not excluded
//! for it. The last known visibility of each (scene, source) pair is tracked, seeded
//! from the snapshot on every refresh, so re-applying a transition that already holds
//! issues nothing.
//!
//! Failure handling per call:
//! - NotFound: the snapshot is stale. Refresh once, retry each such scene once; a scene
//!   that no longer holds the source is dropped.
//! - other request failures: reported in `SyncResult::failed` and left pending for the
//!   next transition or `reconcile` pass.
//! - connection-level failures: returned as `Err`; the rest of the batch is abandoned.
//!
//! A refresh rejected at the request level leaves the snapshot invalid and is reported
//! in `SyncResult::refresh_error`; nothing is commanded from a stale graph.
//!
//! Commands carry the scene item ids recorded in the snapshot, so a stale id surfaces
//! as NotFound and takes the refresh path above.

use std::collections::BTreeMap;

use crate::control::ControlPlane;
use crate::error::ControlPlaneError;
use crate::topology::{SceneTopology, TopologySnapshot};
use crate::{SourceTarget, Transition};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SceneFailure {
    pub scene: String,
    pub error: ControlPlaneError,
}

/// Outcome of one synchronizer pass for one source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncResult {
    /// `None` for reconciliation passes.
    pub transition: Option<Transition>,
    pub source: String,
    pub desired: bool,
    pub applied: Vec<String>,
    pub unchanged: Vec<String>,
    pub excluded: Vec<String>,
    /// Scenes that lost the source between snapshot and command.
    pub vanished: Vec<String>,
    pub failed: Vec<SceneFailure>,
    pub refreshed: bool,
    /// Request-level failure of the topology refresh this pass needed.
    pub refresh_error: Option<ControlPlaneError>,
}

impl SyncResult {
    fn new(source: &str, desired: bool) -> Self {
        Self {
            transition: None,
            source: source.to_string(),
            desired,
            applied: Vec::new(),
            unchanged: Vec::new(),
            excluded: Vec::new(),
            vanished: Vec::new(),
            failed: Vec::new(),
            refreshed: false,
            refresh_error: None,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.refresh_error.is_none()
    }
}

pub struct VisibilitySynchronizer {
    targets: Vec<SourceTarget>,
    topology: SceneTopology,
    known: BTreeMap<(String, String), bool>,
    /// Last commanded visibility per source.
    commanded: BTreeMap<String, (SourceTarget, bool)>,
}

impl VisibilitySynchronizer {
    pub fn new(targets: Vec<SourceTarget>) -> Self {
        Self {
            targets,
            topology: SceneTopology::new(),
            known: BTreeMap::new(),
            commanded: BTreeMap::new(),
        }
    }

    pub fn targets(&self) -> &[SourceTarget] {
        &self.targets
    }

    pub fn snapshot(&self) -> &TopologySnapshot {
        self.topology.snapshot()
    }

    pub fn is_valid(&self) -> bool {
        self.topology.is_valid()
    }

    /// Force a refetch before the next command.
    pub fn invalidate(&mut self) {
        self.topology.invalidate();
    }

    /// Forget earlier commands so `reconcile` has nothing to re-drive.
    pub fn clear_commands(&mut self) {
        self.commanded.clear();
    }

    fn tracked_sources(&self) -> Vec<String> {
        let mut sources: Vec<String> = self
            .targets
            .iter()
            .map(|t| t.source_name.clone())
            .chain(self.commanded.keys().cloned())
            .collect();
        sources.sort();
        sources.dedup();
        sources
    }

    pub fn refresh<C: ControlPlane + ?Sized>(
        &mut self,
        cp: &mut C,
    ) -> Result<&TopologySnapshot, ControlPlaneError> {
        let sources = self.tracked_sources();
        self.topology.refresh(cp, &sources)?;
        self.known.clear();
        for (scene, sources) in &self.topology.snapshot().scenes {
            for (source, placement) in sources {
                self.known
                    .insert((scene.clone(), source.clone()), placement.enabled);
            }
        }
        Ok(self.topology.snapshot())
    }

    /// Targets that appear in no scene of the current snapshot.
    pub fn missing_targets(&self) -> Vec<&str> {
        let snapshot = self.topology.snapshot();
        self.targets
            .iter()
            .filter(|t| snapshot.scenes_containing(&t.source_name).next().is_none())
            .map(|t| t.source_name.as_str())
            .collect()
    }

    pub fn apply<C: ControlPlane + ?Sized>(
        &mut self,
        cp: &mut C,
        transition: Transition,
        target: &SourceTarget,
    ) -> Result<SyncResult, ControlPlaneError> {
        let desired = target.desired_visibility(transition);
        self.commanded
            .insert(target.source_name.clone(), (target.clone(), desired));
        let mut result = self.converge(cp, target, desired)?;
        result.transition = Some(transition);
        log_outcome(&result);
        Ok(result)
    }

    pub fn apply_all<C: ControlPlane + ?Sized>(
        &mut self,
        cp: &mut C,
        transition: Transition,
    ) -> Result<Vec<SyncResult>, ControlPlaneError> {
        let targets = self.targets.clone();
        targets
            .iter()
            .map(|target| self.apply(cp, transition, target))
            .collect()
    }

    /// Re-drive every commanded source toward its last commanded visibility. Picks up
    /// earlier failures and scenes that appeared since.
    pub fn reconcile<C: ControlPlane + ?Sized>(
        &mut self,
        cp: &mut C,
    ) -> Result<Vec<SyncResult>, ControlPlaneError> {
        let commanded: Vec<(SourceTarget, bool)> = self.commanded.values().cloned().collect();
        let mut results = Vec::with_capacity(commanded.len());
        for (target, desired) in commanded {
            let result = self.converge(cp, &target, desired)?;
            if !result.applied.is_empty() || !result.is_clean() {
                log_outcome(&result);
            }
            results.push(result);
        }
        Ok(results)
    }

    /// (scene, source, desired) pairs whose known visibility still differs from the
    /// last command.
    pub fn pending(&self) -> Vec<(String, String, bool)> {
        let snapshot = self.topology.snapshot();
        let mut pending = Vec::new();
        for (source, (target, desired)) in &self.commanded {
            for scene in snapshot.scenes_containing(source) {
                if target.is_excluded(scene) {
                    continue;
                }
                let key = (scene.to_string(), source.clone());
                if self.known.get(&key) != Some(desired) {
                    pending.push((scene.to_string(), source.clone(), *desired));
                }
            }
        }
        pending
    }

    fn converge<C: ControlPlane + ?Sized>(
        &mut self,
        cp: &mut C,
        target: &SourceTarget,
        desired: bool,
    ) -> Result<SyncResult, ControlPlaneError> {
        let source = target.source_name.as_str();
        let mut result = SyncResult::new(source, desired);
        if !self.topology.is_valid() && !self.try_refresh(cp, &mut result)? {
            return Ok(result);
        }

        let scenes: Vec<String> = self
            .topology
            .snapshot()
            .scenes_containing(source)
            .map(str::to_string)
            .collect();
        let mut stale = Vec::new();
        for scene in scenes {
            if target.is_excluded(&scene) {
                result.excluded.push(scene);
                continue;
            }
            if self.is_known(&scene, source, desired) {
                result.unchanged.push(scene);
                continue;
            }
            match self.issue(cp, &scene, source, desired) {
                Ok(()) => result.applied.push(scene),
                Err(e) if e.is_connection_level() => {
                    self.topology.invalidate();
                    return Err(e);
                }
                Err(e) if e.is_not_found() && !result.refreshed => stale.push((scene, e)),
                Err(error) => result.failed.push(SceneFailure { scene, error }),
            }
        }

        if stale.is_empty() {
            return Ok(result);
        }
        log::info!(
            "scene graph changed under '{}' ({} scenes); refreshing",
            source,
            stale.len()
        );
        if !self.try_refresh(cp, &mut result)? {
            result.failed.extend(
                stale
                    .into_iter()
                    .map(|(scene, error)| SceneFailure { scene, error }),
            );
            return Ok(result);
        }
        for (scene, _) in stale {
            if !self.topology.snapshot().contains(&scene, source) {
                result.vanished.push(scene);
                continue;
            }
            if self.is_known(&scene, source, desired) {
                result.unchanged.push(scene);
                continue;
            }
            match self.issue(cp, &scene, source, desired) {
                Ok(()) => result.applied.push(scene),
                Err(e) if e.is_connection_level() => {
                    self.topology.invalidate();
                    return Err(e);
                }
                Err(error) => result.failed.push(SceneFailure { scene, error }),
            }
        }
        Ok(result)
    }

    /// Refresh for `result`. `Ok(false)` when the refresh was rejected at the request
    /// level; the snapshot stays invalid and the error is recorded.
    fn try_refresh<C: ControlPlane + ?Sized>(
        &mut self,
        cp: &mut C,
        result: &mut SyncResult,
    ) -> Result<bool, ControlPlaneError> {
        match self.refresh(cp) {
            Ok(_) => {
                result.refreshed = true;
                Ok(true)
            }
            Err(e) => {
                self.topology.invalidate();
                if e.is_connection_level() {
                    return Err(e);
                }
                result.refresh_error = Some(e);
                Ok(false)
            }
        }
    }

    fn is_known(&self, scene: &str, source: &str, visible: bool) -> bool {
        self.known.get(&(scene.to_string(), source.to_string())) == Some(&visible)
    }

    fn issue<C: ControlPlane + ?Sized>(
        &mut self,
        cp: &mut C,
        scene: &str,
        source: &str,
        visible: bool,
    ) -> Result<(), ControlPlaneError> {
        let item_ids = self
            .topology
            .snapshot()
            .placement(scene, source)
            .map(|p| p.item_ids.clone())
            .unwrap_or_default();
        cp.set_items_enabled(scene, source, &item_ids, visible)?;
        log::debug!(
            "{} '{}' in scene '{}'",
            if visible { "showed" } else { "hid" },
            source,
            scene
        );
        self.known
            .insert((scene.to_string(), source.to_string()), visible);
        Ok(())
    }
}

fn log_outcome(result: &SyncResult) {
    if let Some(error) = &result.refresh_error {
        log::warn!(
            "scene refresh for '{}' failed, nothing changed: {}",
            result.source,
            error
        );
    }
    for failure in &result.failed {
        log::warn!(
            "could not set '{}' in scene '{}': {}",
            result.source,
            failure.scene,
            failure.error
        );
    }
    if !result.applied.is_empty() {
        log::info!(
            "{} '{}' in {} scene(s)",
            if result.desired { "showing" } else { "hiding" },
            result.source,
            result.applied.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{CallKind, InMemoryControlPlane};

    fn not_found() -> ControlPlaneError {
        ControlPlaneError::NotFound {
            request: "SetSceneItemEnabled".to_string(),
            detail: "No scene items were found".to_string(),
        }
    }

    #[test]
    fn first_apply_refreshes_and_mutates_every_scene() {
        let mut plane = InMemoryControlPlane::new()
            .with_scene("Main", &["Cam"])
            .with_scene("Break", &["Cam"]);
        let target = SourceTarget::new("Cam");
        let mut sync = VisibilitySynchronizer::new(vec![target.clone()]);

        let result = sync
            .apply(&mut plane, Transition::BecameAbsent, &target)
            .unwrap();
        assert!(result.refreshed);
        assert_eq!(result.applied, vec!["Main", "Break"]);
        assert_eq!(plane.visibility("Main", "Cam"), Some(false));
        assert_eq!(plane.visibility("Break", "Cam"), Some(false));
    }

    #[test]
    fn reapplying_same_transition_issues_nothing() {
        let mut plane = InMemoryControlPlane::new()
            .with_scene("Main", &["Cam"])
            .with_scene("Break", &["Cam"]);
        let target = SourceTarget::new("Cam");
        let mut sync = VisibilitySynchronizer::new(vec![target.clone()]);
        sync.apply(&mut plane, Transition::BecameAbsent, &target)
            .unwrap();
        plane.clear_calls();

        let result = sync
            .apply(&mut plane, Transition::BecameAbsent, &target)
            .unwrap();
        assert!(result.applied.is_empty());
        assert_eq!(result.unchanged.len(), 2);
        assert!(plane.calls().is_empty());
    }

    #[test]
    fn visibility_already_matching_snapshot_is_not_reissued() {
        let mut plane = InMemoryControlPlane::new().with_scene("Main", &["Cam"]);
        let target = SourceTarget::new("Cam");
        let mut sync = VisibilitySynchronizer::new(vec![target.clone()]);
        let result = sync
            .apply(&mut plane, Transition::BecamePresent, &target)
            .unwrap();
        assert_eq!(result.unchanged, vec!["Main"]);
        assert!(plane.mutations().is_empty());
    }

    #[test]
    fn vanished_scene_is_refreshed_once_and_dropped() {
        let mut plane = InMemoryControlPlane::new()
            .with_scene("Main", &["Cam"])
            .with_scene("Break", &["Cam"]);
        let target = SourceTarget::new("Cam");
        let mut sync = VisibilitySynchronizer::new(vec![target.clone()]);
        sync.refresh(&mut plane).unwrap();
        plane.remove_scene("Break");

        let result = sync
            .apply(&mut plane, Transition::BecameAbsent, &target)
            .unwrap();
        assert!(result.refreshed);
        assert_eq!(result.applied, vec!["Main"]);
        assert_eq!(result.vanished, vec!["Break"]);
        assert!(result.is_clean());
        assert_eq!(plane.refresh_count(), 2);
        assert_eq!(plane.mutations().len(), 2);
    }

    #[test]
    fn persistent_not_found_retries_once_then_reports() {
        let mut plane = InMemoryControlPlane::new().with_scene("Main", &["Cam"]);
        let target = SourceTarget::new("Cam");
        let mut sync = VisibilitySynchronizer::new(vec![target.clone()]);
        sync.refresh(&mut plane).unwrap();
        plane.fail_next(CallKind::SetSourceVisible, not_found());
        plane.fail_next(CallKind::SetSourceVisible, not_found());

        let result = sync
            .apply(&mut plane, Transition::BecameAbsent, &target)
            .unwrap();
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].scene, "Main");
        assert_eq!(plane.refresh_count(), 2);
        assert_eq!(plane.mutations().len(), 2);
        assert_eq!(
            sync.pending(),
            vec![("Main".to_string(), "Cam".to_string(), false)]
        );

        let results = sync.reconcile(&mut plane).unwrap();
        assert_eq!(results[0].applied, vec!["Main"]);
        assert!(sync.pending().is_empty());
        assert_eq!(plane.visibility("Main", "Cam"), Some(false));
    }

    #[test]
    fn request_failure_does_not_abort_other_scenes() {
        let mut plane = InMemoryControlPlane::new()
            .with_scene("Main", &["Cam"])
            .with_scene("Break", &["Cam"]);
        let target = SourceTarget::new("Cam");
        let mut sync = VisibilitySynchronizer::new(vec![target.clone()]);
        sync.refresh(&mut plane).unwrap();
        plane.fail_next(
            CallKind::SetSourceVisible,
            ControlPlaneError::Request {
                request: "SetSceneItemEnabled".to_string(),
                code: 702,
                comment: "busy".to_string(),
            },
        );

        let result = sync
            .apply(&mut plane, Transition::BecameAbsent, &target)
            .unwrap();
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.applied, vec!["Break"]);
        assert!(!result.refreshed);
    }

    #[test]
    fn connection_failure_aborts_and_invalidates() {
        let mut plane = InMemoryControlPlane::new()
            .with_scene("Main", &["Cam"])
            .with_scene("Break", &["Cam"]);
        let target = SourceTarget::new("Cam");
        let mut sync = VisibilitySynchronizer::new(vec![target.clone()]);
        sync.refresh(&mut plane).unwrap();
        plane.fail_next(
            CallKind::SetSourceVisible,
            ControlPlaneError::Connection("reset by peer".to_string()),
        );

        let err = sync
            .apply(&mut plane, Transition::BecameAbsent, &target)
            .unwrap_err();
        assert!(err.is_connection_level());
        assert!(!sync.is_valid());
        assert_eq!(plane.mutations().len(), 1);
    }

    #[test]
    fn rejected_refresh_changes_nothing_and_is_retried() {
        let mut plane = InMemoryControlPlane::new().with_scene("Main", &["Cam"]);
        let target = SourceTarget::new("Cam");
        let mut sync = VisibilitySynchronizer::new(vec![target.clone()]);
        plane.fail_next(
            CallKind::ListScenes,
            ControlPlaneError::Request {
                request: "GetSceneList".to_string(),
                code: 702,
                comment: "busy".to_string(),
            },
        );

        let result = sync
            .apply(&mut plane, Transition::BecameAbsent, &target)
            .unwrap();
        assert!(result.refresh_error.is_some());
        assert!(!result.is_clean());
        assert!(result.applied.is_empty());
        assert!(!sync.is_valid());
        assert!(plane.mutations().is_empty());

        let results = sync.reconcile(&mut plane).unwrap();
        assert!(results[0].refreshed);
        assert_eq!(results[0].applied, vec!["Main"]);
        assert_eq!(plane.visibility("Main", "Cam"), Some(false));
    }

    #[test]
    fn refresh_on_a_dead_link_is_an_error() {
        let mut plane = InMemoryControlPlane::new().with_scene("Main", &["Cam"]);
        let target = SourceTarget::new("Cam");
        let mut sync = VisibilitySynchronizer::new(vec![target.clone()]);
        plane.fail_next(
            CallKind::ListScenes,
            ControlPlaneError::Connection("reset by peer".to_string()),
        );
        let err = sync
            .apply(&mut plane, Transition::BecameAbsent, &target)
            .unwrap_err();
        assert!(err.is_connection_level());
        assert!(!sync.is_valid());
    }

    #[test]
    fn stale_item_ids_take_the_refresh_path() {
        let mut plane = InMemoryControlPlane::new().with_scene("Main", &["Cam"]);
        let target = SourceTarget::new("Cam");
        let mut sync = VisibilitySynchronizer::new(vec![target.clone()]);
        sync.refresh(&mut plane).unwrap();
        // Same names, new scene item ids.
        plane.remove_scene("Main");
        plane.add_scene("Main", &["Cam"]);

        let result = sync
            .apply(&mut plane, Transition::BecameAbsent, &target)
            .unwrap();
        assert!(result.refreshed);
        assert_eq!(result.applied, vec!["Main"]);
        assert!(result.vanished.is_empty());
        assert_eq!(plane.refresh_count(), 2);
        assert_eq!(plane.mutations().len(), 2);
        assert_eq!(plane.visibility("Main", "Cam"), Some(false));
    }

    #[test]
    fn missing_targets_are_reported() {
        let mut plane = InMemoryControlPlane::new().with_scene("Main", &["Cam"]);
        let mut sync = VisibilitySynchronizer::new(vec![
            SourceTarget::new("Cam"),
            SourceTarget::new("Ghost"),
        ]);
        sync.refresh(&mut plane).unwrap();
        assert_eq!(sync.missing_targets(), vec!["Ghost"]);
    }
}
