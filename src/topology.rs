//! Cached scene -> source mapping.
//!
//! The snapshot is refetched whole, never patched. Each successful refresh bumps the
//! revision so callers can tell whether two reads saw the same graph.

use std::collections::BTreeMap;

use crate::control::ControlPlane;
use crate::error::ControlPlaneError;

/// Where a source sits inside one scene.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourcePlacement {
    pub item_ids: Vec<i64>,
    /// True if any placement is enabled.
    pub enabled: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TopologySnapshot {
    pub revision: u64,
    /// Scenes in the order the control plane lists them.
    pub scene_order: Vec<String>,
    pub scenes: BTreeMap<String, BTreeMap<String, SourcePlacement>>,
}

impl TopologySnapshot {
    pub fn contains(&self, scene: &str, source: &str) -> bool {
        self.scenes
            .get(scene)
            .map(|sources| sources.contains_key(source))
            .unwrap_or(false)
    }

    pub fn placement(&self, scene: &str, source: &str) -> Option<&SourcePlacement> {
        self.scenes.get(scene)?.get(source)
    }

    /// Scenes containing `source`, in control-plane order.
    pub fn scenes_containing<'a>(&'a self, source: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.scene_order
            .iter()
            .filter(move |scene| self.contains(scene, source))
            .map(String::as_str)
    }

    pub fn scene_count(&self) -> usize {
        self.scene_order.len()
    }
}

/// Snapshot holder with an explicit validity flag.
#[derive(Debug, Default)]
pub struct SceneTopology {
    snapshot: TopologySnapshot,
    valid: bool,
}

impl SceneTopology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refetch the whole graph. `sources` restricts which sources are recorded; an
    /// empty slice records every source.
    pub fn refresh<C: ControlPlane + ?Sized>(
        &mut self,
        cp: &mut C,
        sources: &[String],
    ) -> Result<&TopologySnapshot, ControlPlaneError> {
        let scene_order = cp.list_scenes()?;
        let listings = cp.list_sources_in_scenes(&scene_order)?;

        let mut scenes: BTreeMap<String, BTreeMap<String, SourcePlacement>> = BTreeMap::new();
        for (scene, items) in listings {
            let entry = scenes.entry(scene).or_default();
            for item in items {
                if !sources.is_empty() && !sources.iter().any(|s| *s == item.source_name) {
                    continue;
                }
                let placement = entry.entry(item.source_name).or_default();
                placement.item_ids.push(item.id);
                placement.enabled |= item.enabled;
            }
        }
        // Scenes that vanished between the two calls are not kept.
        let scene_order: Vec<String> = scene_order
            .into_iter()
            .filter(|scene| scenes.contains_key(scene))
            .collect();

        self.snapshot = TopologySnapshot {
            revision: self.snapshot.revision + 1,
            scene_order,
            scenes,
        };
        self.valid = true;
        log::debug!(
            "topology refreshed: revision {} with {} scenes",
            self.snapshot.revision,
            self.snapshot.scene_count()
        );
        Ok(&self.snapshot)
    }

    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn snapshot(&self) -> &TopologySnapshot {
        &self.snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{Call, InMemoryControlPlane};

    #[test]
    fn refresh_uses_one_batched_enumeration() {
        let mut plane = InMemoryControlPlane::new()
            .with_scene("Main", &["Cam", "Overlay"])
            .with_scene("Break", &["Overlay"])
            .with_scene("Detection", &["Cam"]);
        let mut topology = SceneTopology::new();
        let snapshot = topology.refresh(&mut plane, &[]).unwrap();

        assert_eq!(snapshot.revision, 1);
        assert!(snapshot.contains("Main", "Overlay"));
        assert!(!snapshot.contains("Detection", "Overlay"));
        assert_eq!(
            snapshot.scenes_containing("Overlay").collect::<Vec<_>>(),
            vec!["Main", "Break"]
        );
        let calls = plane.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], Call::ListScenes);
        assert!(matches!(calls[1], Call::ListSourcesInScenes(ref s) if s.len() == 3));
    }

    #[test]
    fn revision_increases_and_filter_applies() {
        let mut plane = InMemoryControlPlane::new().with_scene("Main", &["Cam", "Overlay"]);
        let mut topology = SceneTopology::new();
        topology.refresh(&mut plane, &["Overlay".to_string()]).unwrap();
        topology.invalidate();
        assert!(!topology.is_valid());

        let snapshot = topology.refresh(&mut plane, &["Overlay".to_string()]).unwrap();
        assert_eq!(snapshot.revision, 2);
        assert!(snapshot.contains("Main", "Overlay"));
        assert!(!snapshot.contains("Main", "Cam"));
        assert!(topology.is_valid());
    }

    #[test]
    fn failed_refresh_keeps_previous_snapshot() {
        let mut plane = InMemoryControlPlane::new().with_scene("Main", &["Overlay"]);
        let mut topology = SceneTopology::new();
        topology.refresh(&mut plane, &[]).unwrap();
        topology.invalidate();
        plane.drop_link();
        assert!(topology.refresh(&mut plane, &[]).is_err());
        assert_eq!(topology.snapshot().revision, 1);
        assert!(!topology.is_valid());
    }
}
