//! Presence debouncing.
//!
//! Turns a stream of per-frame confidence samples into a stable present/absent
//! transition stream. Counting is done in consecutive samples, not elapsed time:
//! `hit_count` hits in a row ascend to present, `grace_misses` misses in a row descend
//! to absent. A single hit inside the grace window cancels the descent.
//!
//! The debouncer has no I/O and no clock of its own. Given the same configuration and
//! sample sequence it always emits the same transitions.

use std::time::Instant;

use crate::error::ConfigurationError;
use crate::{PresenceSample, Transition};

/// Debouncer state. Only `Absent` and `Present` are externally observable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresenceState {
    Absent,
    Ascending,
    Present,
    Descending,
}

impl PresenceState {
    /// Observable presence: transient states report the level they came from.
    pub fn is_present(self) -> bool {
        matches!(self, PresenceState::Present | PresenceState::Descending)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DebounceConfig {
    /// Confidence at or above this counts as a hit.
    pub threshold: f32,
    /// Consecutive hits needed to become present.
    pub hit_count: u32,
    /// Consecutive misses needed to become absent.
    pub grace_misses: u32,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            threshold: 0.7,
            hit_count: 3,
            grace_misses: 5,
        }
    }
}

impl DebounceConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(ConfigurationError::Invalid {
                key: "face_detection_confidence",
                reason: format!("{} is outside 0.0..=1.0", self.threshold),
            });
        }
        if self.hit_count == 0 {
            return Err(ConfigurationError::Invalid {
                key: "hit_count",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.grace_misses == 0 {
            return Err(ConfigurationError::Invalid {
                key: "grace_misses",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

pub struct PresenceDebouncer {
    config: DebounceConfig,
    state: PresenceState,
    /// Length of the current run of hits (ascending) or misses (descending).
    run: u32,
    last_change: Option<Instant>,
}

impl PresenceDebouncer {
    pub fn new(config: DebounceConfig) -> Self {
        Self {
            config,
            state: PresenceState::Absent,
            run: 0,
            last_change: None,
        }
    }

    pub fn config(&self) -> &DebounceConfig {
        &self.config
    }

    pub fn state(&self) -> PresenceState {
        self.state
    }

    pub fn is_present(&self) -> bool {
        self.state.is_present()
    }

    /// Timestamp of the sample that produced the last emitted transition.
    pub fn last_change(&self) -> Option<Instant> {
        self.last_change
    }

    /// Back to `Absent` with no pending run.
    pub fn reset(&mut self) {
        self.state = PresenceState::Absent;
        self.run = 0;
        self.last_change = None;
    }

    /// Feed one sample. Returns a transition at most once per ascent or descent.
    pub fn observe(&mut self, sample: PresenceSample) -> Option<Transition> {
        let hit = sample.confidence >= self.config.threshold;

        let (next, transition) = match (self.state, hit) {
            (PresenceState::Absent, false) => (PresenceState::Absent, None),
            (PresenceState::Absent, true) => {
                self.run = 1;
                self.ascend()
            }
            (PresenceState::Ascending, true) => {
                self.run += 1;
                self.ascend()
            }
            (PresenceState::Ascending, false) => {
                self.run = 0;
                (PresenceState::Absent, None)
            }
            (PresenceState::Present, true) => (PresenceState::Present, None),
            (PresenceState::Present, false) => {
                self.run = 1;
                self.descend()
            }
            (PresenceState::Descending, false) => {
                self.run += 1;
                self.descend()
            }
            (PresenceState::Descending, true) => {
                // Blink or brief head turn: cancel, no re-emit.
                self.run = 0;
                (PresenceState::Present, None)
            }
        };

        if transition.is_some() {
            self.run = 0;
            self.last_change = Some(sample.timestamp);
            log::debug!(
                "presence {:?} -> {:?} (confidence {:.2})",
                self.state,
                next,
                sample.confidence
            );
        }
        self.state = next;
        transition
    }

    fn ascend(&self) -> (PresenceState, Option<Transition>) {
        if self.run >= self.config.hit_count {
            (PresenceState::Present, Some(Transition::BecamePresent))
        } else {
            (PresenceState::Ascending, None)
        }
    }

    fn descend(&self) -> (PresenceState, Option<Transition>) {
        if self.run >= self.config.grace_misses {
            (PresenceState::Absent, Some(Transition::BecameAbsent))
        } else {
            (PresenceState::Descending, None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn scenario_config() -> DebounceConfig {
        DebounceConfig {
            threshold: 0.7,
            hit_count: 3,
            grace_misses: 5,
        }
    }

    fn feed(debouncer: &mut PresenceDebouncer, confidences: &[f32]) -> Vec<(usize, Transition)> {
        confidences
            .iter()
            .enumerate()
            .filter_map(|(i, &c)| {
                debouncer
                    .observe(PresenceSample::new(c, Instant::now()))
                    .map(|t| (i, t))
            })
            .collect()
    }

    #[test]
    fn ascends_after_hit_count_then_descends_after_grace() {
        let mut d = PresenceDebouncer::new(scenario_config());

        let up = feed(&mut d, &[0.9, 0.9, 0.9]);
        assert_eq!(up, vec![(2, Transition::BecamePresent)]);
        assert_eq!(d.state(), PresenceState::Present);

        let down = feed(&mut d, &[0.2, 0.2, 0.2, 0.2]);
        assert!(down.is_empty());
        assert_eq!(d.state(), PresenceState::Descending);
        assert!(d.is_present());

        let down = feed(&mut d, &[0.2]);
        assert_eq!(down, vec![(0, Transition::BecameAbsent)]);
        assert_eq!(d.state(), PresenceState::Absent);
    }

    #[test]
    fn single_miss_inside_grace_does_not_pretrigger_absence() {
        let mut d = PresenceDebouncer::new(scenario_config());
        let emitted = feed(
            &mut d,
            &[0.9, 0.9, 0.9, 0.2, 0.9, 0.2, 0.2, 0.2, 0.2, 0.2],
        );
        assert_eq!(
            emitted,
            vec![(2, Transition::BecamePresent), (9, Transition::BecameAbsent)]
        );
    }

    #[test]
    fn miss_during_ascent_restarts_count() {
        let mut d = PresenceDebouncer::new(scenario_config());
        assert!(feed(&mut d, &[0.9, 0.9, 0.1, 0.9, 0.9]).is_empty());
        assert_eq!(d.state(), PresenceState::Ascending);
        assert_eq!(
            feed(&mut d, &[0.9]),
            vec![(0, Transition::BecamePresent)]
        );
    }

    #[test]
    fn threshold_is_inclusive() {
        let mut d = PresenceDebouncer::new(DebounceConfig {
            threshold: 0.7,
            hit_count: 1,
            grace_misses: 1,
        });
        assert_eq!(feed(&mut d, &[0.7]), vec![(0, Transition::BecamePresent)]);
        assert_eq!(feed(&mut d, &[0.69]), vec![(0, Transition::BecameAbsent)]);
    }

    #[test]
    fn reset_returns_to_absent() {
        let mut d = PresenceDebouncer::new(scenario_config());
        feed(&mut d, &[0.9, 0.9, 0.9]);
        assert!(d.last_change().is_some());
        d.reset();
        assert_eq!(d.state(), PresenceState::Absent);
        assert!(d.last_change().is_none());
        // A fresh ascent is needed to re-emit.
        assert!(feed(&mut d, &[0.9, 0.9]).is_empty());
    }

    #[test]
    fn rejects_zero_counts_and_bad_threshold() {
        let mut cfg = scenario_config();
        cfg.hit_count = 0;
        assert!(cfg.validate().is_err());
        let mut cfg = scenario_config();
        cfg.grace_misses = 0;
        assert!(cfg.validate().is_err());
        let mut cfg = scenario_config();
        cfg.threshold = 1.5;
        assert!(cfg.validate().is_err());
        assert!(scenario_config().validate().is_ok());
    }

    fn longest_hit_run(confidences: &[f32], threshold: f32) -> usize {
        let mut best = 0;
        let mut run = 0;
        for &c in confidences {
            if c >= threshold {
                run += 1;
                best = best.max(run);
            } else {
                run = 0;
            }
        }
        best
    }

    proptest! {
        #[test]
        fn never_present_without_enough_consecutive_hits(
            confidences in proptest::collection::vec(0.0f32..=1.0, 0..200),
        ) {
            let cfg = scenario_config();
            prop_assume!(longest_hit_run(&confidences, cfg.threshold) < cfg.hit_count as usize);
            let mut d = PresenceDebouncer::new(cfg);
            let emitted = feed(&mut d, &confidences);
            prop_assert!(emitted.iter().all(|(_, t)| *t != Transition::BecamePresent));
        }

        #[test]
        fn hit_inside_grace_cancels_descent(
            misses_before in 0u32..5,
            tail in proptest::collection::vec(0.0f32..=1.0, 0..4),
        ) {
            let cfg = scenario_config();
            let mut d = PresenceDebouncer::new(cfg);
            feed(&mut d, &[0.9, 0.9, 0.9]);

            let mut seq = vec![0.1f32; misses_before as usize];
            seq.push(0.95);
            seq.extend(tail.iter().copied());
            // The tail is shorter than the grace window, so no descent may complete.
            let emitted = feed(&mut d, &seq);
            prop_assert!(emitted.is_empty());
            prop_assert!(d.is_present());
        }

        #[test]
        fn transitions_alternate(
            confidences in proptest::collection::vec(0.0f32..=1.0, 0..300),
        ) {
            let mut d = PresenceDebouncer::new(scenario_config());
            let emitted = feed(&mut d, &confidences);
            for pair in emitted.windows(2) {
                prop_assert_ne!(pair[0].1, pair[1].1);
            }
            if let Some((_, first)) = emitted.first() {
                prop_assert_eq!(*first, Transition::BecamePresent);
            }
        }
    }
}
