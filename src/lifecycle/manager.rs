use std::sync::mpsc::Sender;
use std::time::{Duration, Instant};

use anyhow::Result;

use super::detection::DetectionTask;
use super::{
    next_phase, reconnect_log_level, Activation, Backoff, BackoffPolicy, Connector, LatestSlot,
    LifecycleEvent, LifecyclePhase, PhaseHandle, PhaseInput, StopSignal,
};
use crate::control::{ControlPlane, Notification, OutputState};
use crate::debounce::DebounceConfig;
use crate::error::ConfigurationError;
use crate::feed::PresenceFeed;
use crate::sync::VisibilitySynchronizer;
use crate::{SourceTarget, Transition};

#[derive(Clone, Debug, PartialEq)]
pub struct LifecycleSettings {
    pub activation: Activation,
    pub debounce: DebounceConfig,
    /// Detection pacing and the manager's notification wait.
    pub check_interval: Duration,
    /// How often output state is polled regardless of notifications.
    pub standby_check_interval: Duration,
    pub reconcile_interval: Duration,
    /// Delay before re-acquiring a feed that ended while ACTIVE.
    pub feed_retry: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            activation: Activation::Live,
            debounce: DebounceConfig::default(),
            check_interval: Duration::from_millis(100),
            standby_check_interval: Duration::from_secs(5),
            reconcile_interval: Duration::from_secs(10),
            feed_retry: Duration::from_secs(5),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug)]
enum SessionEnd {
    Stopped,
    LinkLost(String),
}

/// Owns the control-plane link, the synchronizer, and the detection thread.
///
/// `run` blocks until the stop signal fires or a fatal configuration error is found
/// at the first successful connect. Connection failures are never fatal.
pub struct LifecycleManager<C, F> {
    connector: C,
    sync: VisibilitySynchronizer,
    settings: LifecycleSettings,
    open_feed: F,
    stop: StopSignal,
    phase: PhaseHandle,
    events: Option<Sender<LifecycleEvent>>,
    validated: bool,
}

impl<C, F> LifecycleManager<C, F>
where
    C: Connector,
    F: FnMut() -> Result<Box<dyn PresenceFeed>>,
{
    pub fn new(
        connector: C,
        targets: Vec<SourceTarget>,
        settings: LifecycleSettings,
        open_feed: F,
    ) -> Self {
        Self {
            connector,
            sync: VisibilitySynchronizer::new(targets),
            settings,
            open_feed,
            stop: StopSignal::new(),
            phase: PhaseHandle::new(),
            events: None,
            validated: false,
        }
    }

    pub fn with_events(mut self, events: Sender<LifecycleEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn phase_handle(&self) -> PhaseHandle {
        self.phase.clone()
    }

    pub fn synchronizer(&self) -> &VisibilitySynchronizer {
        &self.sync
    }

    fn emit(&self, event: LifecycleEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn set_phase(&self, phase: LifecyclePhase) {
        let previous = self.phase.set(phase);
        if previous != phase {
            log::info!("phase {} -> {}", previous, phase);
            self.emit(LifecycleEvent::PhaseChanged {
                from: previous,
                to: phase,
            });
        }
    }

    fn schedule_reconnect(&self, backoff: &mut Backoff) {
        let delay = backoff.next_delay();
        let attempt = backoff.attempts();
        self.emit(LifecycleEvent::ReconnectScheduled { attempt, delay });
        self.stop.wait(delay);
    }

    pub fn run(&mut self) -> Result<()> {
        log::info!(
            "presence controller starting against {}",
            self.connector.describe()
        );
        let mut backoff = Backoff::new(self.settings.backoff.clone());
        let result = self.run_loop(&mut backoff);
        self.set_phase(LifecyclePhase::Disconnected);
        self.emit(LifecycleEvent::Stopped);
        log::info!("presence controller stopped");
        result
    }

    fn run_loop(&mut self, backoff: &mut Backoff) -> Result<()> {
        while !self.stop.is_stopped() {
            let mut client = match self.connector.connect() {
                Ok(client) => client,
                Err(err) => {
                    let attempt = backoff.attempts() + 1;
                    log::log!(
                        reconnect_log_level(attempt),
                        "connect to {} failed (attempt {}): {}",
                        self.connector.describe(),
                        attempt,
                        err
                    );
                    self.schedule_reconnect(backoff);
                    continue;
                }
            };
            backoff.reset();
            let endpoint = self.connector.describe();
            log::info!("connected to {}", endpoint);
            self.emit(LifecycleEvent::Connected { endpoint });
            self.set_phase(next_phase(
                self.phase.current(),
                PhaseInput::Connected,
                self.settings.activation,
            ));

            let outcome = self.supervise(&mut client);
            client.close();
            match outcome? {
                SessionEnd::Stopped => break,
                SessionEnd::LinkLost(reason) => {
                    log::warn!("control plane connection lost: {}", reason);
                    self.set_phase(next_phase(
                        self.phase.current(),
                        PhaseInput::LinkLost,
                        self.settings.activation,
                    ));
                    self.emit(LifecycleEvent::ConnectionLost { reason });
                    self.schedule_reconnect(backoff);
                }
            }
        }
        Ok(())
    }

    /// Refetch the scene graph. Only a dead link ends the session; a rejected refresh
    /// is logged and leaves the snapshot invalid. The first refresh that succeeds
    /// checks that every target exists somewhere.
    fn refresh_topology(&mut self, client: &mut C::Client) -> Result<Option<SessionEnd>> {
        match self.sync.refresh(client) {
            Ok(_) => {}
            Err(err) if err.is_connection_level() => {
                return Ok(Some(SessionEnd::LinkLost(err.to_string())))
            }
            Err(err) => {
                self.sync.invalidate();
                log::warn!("scene refresh failed: {}", err);
                return Ok(None);
            }
        }
        let missing = self.sync.missing_targets();
        if !self.validated {
            if !missing.is_empty() {
                return Err(ConfigurationError::UnknownSource(missing.join(", ")).into());
            }
            self.validated = true;
        } else {
            for name in missing {
                log::warn!("target source '{}' is not in any scene", name);
            }
        }
        Ok(None)
    }

    fn supervise(&mut self, client: &mut C::Client) -> Result<SessionEnd> {
        // A new session never trusts the previous snapshot.
        self.sync.invalidate();
        if let Some(end) = self.refresh_topology(client)? {
            return Ok(end);
        }
        let mut outputs = match client.output_state() {
            Ok(outputs) => outputs,
            Err(err) if err.is_connection_level() => {
                return Ok(SessionEnd::LinkLost(err.to_string()))
            }
            Err(err) => {
                // Assume not live until the next poll says otherwise.
                log::warn!("output state read failed: {}", err);
                OutputState::default()
            }
        };

        let mailbox = LatestSlot::new();
        let mut active = ActiveState::default();
        let mut last_poll = Instant::now();

        let end = loop {
            if self.stop.is_stopped() {
                break SessionEnd::Stopped;
            }

            let phase = self.phase.current();
            let next = next_phase(phase, PhaseInput::Outputs(outputs), self.settings.activation);
            if next != phase {
                if next == LifecyclePhase::Active {
                    self.sync.clear_commands();
                    self.sync.invalidate();
                    if let Some(end) = self.refresh_topology(client)? {
                        break end;
                    }
                    mailbox.take();
                    active = ActiveState::default();
                } else {
                    // Leaving ACTIVE only stops detection; overlays keep their state.
                    active.stop_detection();
                    mailbox.take();
                }
                self.set_phase(next);
            }

            // Nothing runs against targets that were never seen in the scene graph.
            if next == LifecyclePhase::Active && self.validated {
                if let Some(end) = self.drive_active(client, &mailbox, &mut active) {
                    break end;
                }
            }

            match client.next_notification(self.settings.check_interval) {
                Ok(Some(Notification::StreamingChanged(live))) => outputs.streaming = live,
                Ok(Some(Notification::RecordingChanged(live))) => outputs.recording = live,
                Ok(Some(Notification::TopologyChanged)) => {
                    self.sync.invalidate();
                    active.refresh_failing = false;
                }
                Ok(Some(Notification::Closing)) => {
                    break SessionEnd::LinkLost("application is shutting down".to_string())
                }
                Ok(None) => {}
                Err(err) if err.is_connection_level() => {
                    break SessionEnd::LinkLost(err.to_string())
                }
                Err(err) => log::warn!("notification read failed: {}", err),
            }

            if last_poll.elapsed() >= self.settings.standby_check_interval {
                last_poll = Instant::now();
                if !self.validated {
                    if let Some(end) = self.refresh_topology(client)? {
                        break end;
                    }
                }
                match client.output_state() {
                    Ok(state) => outputs = state,
                    Err(err) if err.is_connection_level() => {
                        break SessionEnd::LinkLost(err.to_string())
                    }
                    Err(err) => log::warn!("output state poll failed: {}", err),
                }
            }
        };
        active.stop_detection();
        Ok(end)
    }

    fn drive_active(
        &mut self,
        client: &mut C::Client,
        mailbox: &LatestSlot<Transition>,
        active: &mut ActiveState,
    ) -> Option<SessionEnd> {
        if active.detection.as_ref().is_some_and(DetectionTask::is_finished) {
            active.stop_detection();
            log::warn!(
                "presence feed ended; retrying in {:?}",
                self.settings.feed_retry
            );
            self.emit(LifecycleEvent::FeedEnded);
            active.feed_retry_at = Some(Instant::now() + self.settings.feed_retry);
        }
        let retry_due = active
            .feed_retry_at
            .map_or(true, |at| Instant::now() >= at);
        if active.detection.is_none() && retry_due {
            active.feed_retry_at = None;
            let spawned = (self.open_feed)().and_then(|feed| {
                DetectionTask::spawn(
                    feed,
                    self.settings.debounce,
                    self.settings.check_interval,
                    mailbox.clone(),
                )
            });
            match spawned {
                Ok(task) => active.detection = Some(task),
                Err(err) => {
                    log::warn!(
                        "presence feed unavailable: {:#}; retrying in {:?}",
                        err,
                        self.settings.feed_retry
                    );
                    active.feed_retry_at = Some(Instant::now() + self.settings.feed_retry);
                }
            }
        }

        if let Some(transition) = mailbox.take() {
            match self.sync.apply_all(client, transition) {
                Ok(results) => {
                    active.refresh_failing = results.iter().any(|r| r.refresh_error.is_some());
                    self.emit(LifecycleEvent::TransitionApplied {
                        transition,
                        applied: results.iter().map(|r| r.applied.len()).sum(),
                        failed: results
                            .iter()
                            .map(|r| r.failed.len() + usize::from(r.refresh_error.is_some()))
                            .sum(),
                    });
                }
                Err(err) if err.is_connection_level() => {
                    return Some(SessionEnd::LinkLost(err.to_string()))
                }
                Err(err) => log::warn!("applying {:?} failed: {}", transition, err),
            }
            active.last_reconcile = Instant::now();
        }

        // A rejected refresh waits for the reconcile timer or the next topology event.
        let invalid = !self.sync.is_valid() && !active.refresh_failing;
        if invalid || active.last_reconcile.elapsed() >= self.settings.reconcile_interval {
            active.last_reconcile = Instant::now();
            match self.sync.reconcile(client) {
                Ok(results) => {
                    active.refresh_failing = results.iter().any(|r| r.refresh_error.is_some());
                }
                Err(err) if err.is_connection_level() => {
                    return Some(SessionEnd::LinkLost(err.to_string()))
                }
                Err(err) => log::warn!("reconcile failed: {}", err),
            }
        }
        None
    }
}

/// Per-ACTIVE-period bookkeeping.
struct ActiveState {
    detection: Option<DetectionTask>,
    feed_retry_at: Option<Instant>,
    last_reconcile: Instant,
    /// The last synchronizer pass could not refresh the scene graph.
    refresh_failing: bool,
}

impl Default for ActiveState {
    fn default() -> Self {
        Self {
            detection: None,
            feed_retry_at: None,
            last_reconcile: Instant::now(),
            refresh_failing: false,
        }
    }
}

impl ActiveState {
    fn stop_detection(&mut self) {
        if let Some(task) = self.detection.take() {
            if let Err(err) = task.stop() {
                log::error!("{:#}", err);
            }
        }
    }
}
