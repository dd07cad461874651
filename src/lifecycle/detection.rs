use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};

use super::{LatestSlot, StopSignal};
use crate::debounce::{DebounceConfig, PresenceDebouncer};
use crate::feed::{FeedGuard, FeedPull, PresenceFeed};
use crate::Transition;

/// Detection thread: feed -> debouncer -> mailbox.
///
/// Each task starts from a fresh debouncer (ABSENT). The feed is acquired on the
/// thread and released when the thread exits, whatever the reason.
#[derive(Debug)]
pub(crate) struct DetectionTask {
    stop: StopSignal,
    finished: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl DetectionTask {
    pub(crate) fn spawn(
        feed: Box<dyn PresenceFeed>,
        debounce: DebounceConfig,
        check_interval: Duration,
        mailbox: LatestSlot<Transition>,
    ) -> Result<Self> {
        let stop = StopSignal::new();
        let finished = Arc::new(AtomicBool::new(false));
        let stop_thread = stop.clone();
        let finished_thread = finished.clone();
        let join = std::thread::Builder::new()
            .name("presence-detect".to_string())
            .spawn(move || {
                if let Err(err) =
                    run_detection(feed, debounce, check_interval, &mailbox, &stop_thread)
                {
                    log::warn!("detection stopped: {:#}", err);
                }
                finished_thread.store(true, Ordering::SeqCst);
            })
            .context("spawn detection thread")?;
        Ok(Self {
            stop,
            finished,
            join: Some(join),
        })
    }

    /// True once the thread has exited on its own (end of stream or acquire failure).
    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub(crate) fn stop(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        self.stop.stop();
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("detection thread panicked"))?;
        }
        Ok(())
    }
}

impl Drop for DetectionTask {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            log::error!("{}", err);
        }
    }
}

fn run_detection(
    feed: Box<dyn PresenceFeed>,
    debounce: DebounceConfig,
    check_interval: Duration,
    mailbox: &LatestSlot<Transition>,
    stop: &StopSignal,
) -> Result<()> {
    let mut guard = FeedGuard::acquire(feed)?;
    let mut debouncer = PresenceDebouncer::new(debounce);
    while !stop.is_stopped() {
        let started = Instant::now();
        match guard.next(check_interval) {
            FeedPull::Sample(sample) => {
                if let Some(transition) = debouncer.observe(sample) {
                    log::info!("presence: {:?} (confidence {:.2})", transition, sample.confidence);
                    if let Some(dropped) = mailbox.post(transition) {
                        log::debug!("superseded pending {:?}", dropped);
                    }
                }
            }
            FeedPull::Idle => continue,
            FeedPull::EndOfStream => {
                log::info!("presence feed '{}' ended", guard.name());
                break;
            }
        }
        if !guard.self_paced() {
            let remaining = check_interval.saturating_sub(started.elapsed());
            if stop.wait(remaining) {
                break;
            }
        }
    }
    Ok(())
}
