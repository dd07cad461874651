//! Presence feeds.
//!
//! A feed yields one `PresenceSample` per processed frame. Two kinds exist:
//! - `DetectionAdapter`: pulls frames from a `FrameSource` and scores them with a
//!   `FaceDetector`
//! - `SignalFeed`: reads confidences printed by an external detector process
//!
//! Bad frames never propagate as errors. They become zero-confidence samples, and a
//! run of them ends the stream so the lifecycle manager can re-acquire the feed.

mod adapter;
mod detector;
mod frame;
mod signal;
mod synthetic;

use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::PresenceSample;

pub use adapter::DetectionAdapter;
pub use detector::{FaceDetector, StubFaceDetector};
pub use frame::{Frame, FrameSource};
pub use signal::{parse_signal_line, SignalFeed};
pub use synthetic::{SyntheticConfig, SyntheticSource};

/// Default number of bad frames in a row that ends a stream.
pub const DEFAULT_MAX_CONSECUTIVE_FRAME_ERRORS: u32 = 30;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FeedPull {
    Sample(PresenceSample),
    /// Nothing arrived within the wait.
    Idle,
    EndOfStream,
}

pub trait PresenceFeed: Send {
    fn name(&self) -> &str;

    fn acquire(&mut self) -> Result<()>;

    /// Produce the next sample, waiting at most `wait` for push-style feeds.
    fn next(&mut self, wait: Duration) -> FeedPull;

    fn release(&mut self);

    /// Push-style feeds set their own rate; pull-style feeds are paced by the caller.
    fn self_paced(&self) -> bool {
        false
    }
}

/// Holds an acquired feed and releases it on drop.
pub struct FeedGuard {
    feed: Box<dyn PresenceFeed>,
}

impl FeedGuard {
    pub fn acquire(mut feed: Box<dyn PresenceFeed>) -> Result<Self> {
        feed.acquire()?;
        log::info!("presence feed '{}' acquired", feed.name());
        Ok(Self { feed })
    }

    pub fn name(&self) -> &str {
        self.feed.name()
    }

    pub fn next(&mut self, wait: Duration) -> FeedPull {
        self.feed.next(wait)
    }

    pub fn self_paced(&self) -> bool {
        self.feed.self_paced()
    }
}

impl Drop for FeedGuard {
    fn drop(&mut self) {
        self.feed.release();
        log::info!("presence feed '{}' released", self.feed.name());
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FeedSettings {
    /// Frame source URL. Only `stub://` is built in.
    pub url: Option<String>,
    /// External detector helper (argv); takes precedence over `url`.
    pub command: Option<Vec<String>>,
    pub max_consecutive_frame_errors: u32,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            url: None,
            command: None,
            max_consecutive_frame_errors: DEFAULT_MAX_CONSECUTIVE_FRAME_ERRORS,
        }
    }
}

pub fn open_feed(settings: &FeedSettings) -> Result<Box<dyn PresenceFeed>> {
    if let Some(command) = settings.command.as_ref().filter(|c| !c.is_empty()) {
        return Ok(Box::new(SignalFeed::command(
            command.clone(),
            settings.max_consecutive_frame_errors,
        )));
    }
    let url = settings
        .url
        .as_deref()
        .ok_or_else(|| anyhow!("no presence feed configured (set feed.url or feed.command)"))?;
    if url.starts_with("stub://") {
        let source = SyntheticSource::new(SyntheticConfig::from_url(url)?);
        return Ok(Box::new(DetectionAdapter::new(
            Box::new(source),
            Box::new(StubFaceDetector::default()),
            settings.max_consecutive_frame_errors,
        )));
    }
    Err(anyhow!(
        "unsupported feed url '{}'; use stub:// or feed.command",
        url
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_takes_precedence_over_url() -> Result<()> {
        let settings = FeedSettings {
            url: Some("stub://present".to_string()),
            command: Some(vec!["detector-helper".to_string()]),
            ..FeedSettings::default()
        };
        let feed = open_feed(&settings)?;
        assert_eq!(feed.name(), "detector-helper");
        Ok(())
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        let settings = FeedSettings {
            url: Some("rtsp://camera.local/stream".to_string()),
            ..FeedSettings::default()
        };
        assert!(open_feed(&settings).is_err());
        assert!(open_feed(&FeedSettings::default()).is_err());
    }

    #[test]
    fn guard_releases_on_drop() -> Result<()> {
        let settings = FeedSettings {
            url: Some("stub://present".to_string()),
            ..FeedSettings::default()
        };
        let mut guard = FeedGuard::acquire(open_feed(&settings)?)?;
        assert!(matches!(
            guard.next(Duration::from_millis(1)),
            FeedPull::Sample(_)
        ));
        drop(guard);
        Ok(())
    }
}
