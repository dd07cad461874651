use std::time::{Duration, Instant};

use anyhow::Result;

use super::detector::FaceDetector;
use super::frame::FrameSource;
use super::{FeedPull, PresenceFeed};
use crate::PresenceSample;

/// Frame source + face detector as a pull-style presence feed.
pub struct DetectionAdapter {
    source: Box<dyn FrameSource>,
    detector: Box<dyn FaceDetector>,
    max_consecutive_errors: u32,
    consecutive_errors: u32,
}

impl DetectionAdapter {
    pub fn new(
        source: Box<dyn FrameSource>,
        detector: Box<dyn FaceDetector>,
        max_consecutive_errors: u32,
    ) -> Self {
        Self {
            source,
            detector,
            max_consecutive_errors: max_consecutive_errors.max(1),
            consecutive_errors: 0,
        }
    }

    fn score(&mut self) -> Result<f32> {
        let frame = self.source.next_frame()?;
        self.detector.detect(&frame)
    }
}

impl PresenceFeed for DetectionAdapter {
    fn name(&self) -> &str {
        self.source.name()
    }

    fn acquire(&mut self) -> Result<()> {
        self.consecutive_errors = 0;
        self.source.connect()?;
        self.detector.warm_up()
    }

    fn next(&mut self, _wait: Duration) -> FeedPull {
        let now = Instant::now();
        match self.score() {
            Ok(confidence) => {
                self.consecutive_errors = 0;
                FeedPull::Sample(PresenceSample::new(confidence, now))
            }
            Err(err) => {
                self.consecutive_errors += 1;
                if self.consecutive_errors >= self.max_consecutive_errors {
                    log::warn!(
                        "{}: {} bad frames in a row, ending stream: {}",
                        self.source.name(),
                        self.consecutive_errors,
                        err
                    );
                    return FeedPull::EndOfStream;
                }
                if self.consecutive_errors == 1 {
                    log::warn!("{}: bad frame: {}", self.source.name(), err);
                } else {
                    log::debug!("{}: bad frame: {}", self.source.name(), err);
                }
                FeedPull::Sample(PresenceSample::zero(now))
            }
        }
    }

    fn release(&mut self) {
        self.source.disconnect();
    }
}
