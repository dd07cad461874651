// ----------------------------------------------------------------------------
// Synthetic frame source (stub://) for demos and tests
// ----------------------------------------------------------------------------

use anyhow::{anyhow, Context, Result};

use super::frame::{Frame, FrameSource};

const BACKGROUND: u8 = 40;
const FACE: u8 = 200;

/// Parameters of the synthetic pattern: `present` face frames, then `absent` empty
/// frames, repeating. Every `dropout`-th frame fails to capture (0 = never).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyntheticConfig {
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub present: u32,
    pub absent: u32,
    pub dropout: u32,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            url: "stub://pattern".to_string(),
            width: 64,
            height: 48,
            present: 40,
            absent: 60,
            dropout: 0,
        }
    }
}

impl SyntheticConfig {
    /// `stub://present`, `stub://absent`, or `stub://<name>?present=N&absent=M&dropout=K`.
    pub fn from_url(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix("stub://")
            .ok_or_else(|| anyhow!("not a stub:// url: {}", url))?;
        let (name, query) = rest.split_once('?').unwrap_or((rest, ""));
        let mut config = Self {
            url: url.to_string(),
            ..Self::default()
        };
        match name {
            "present" => config.absent = 0,
            "absent" => config.present = 0,
            _ => {}
        }
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("malformed stub parameter '{}'", pair))?;
            let value: u32 = value
                .parse()
                .with_context(|| format!("stub parameter '{}'", key))?;
            match key {
                "present" => config.present = value,
                "absent" => config.absent = value,
                "dropout" => config.dropout = value,
                "width" => config.width = value,
                "height" => config.height = value,
                other => return Err(anyhow!("unknown stub parameter '{}'", other)),
            }
        }
        if config.present == 0 && config.absent == 0 {
            return Err(anyhow!("stub pattern needs present or absent frames"));
        }
        if config.width < 4 || config.height < 4 {
            return Err(anyhow!("stub frames must be at least 4x4"));
        }
        Ok(config)
    }
}

pub struct SyntheticSource {
    config: SyntheticConfig,
    frame_count: u64,
    connected: bool,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            frame_count: 0,
            connected: false,
        }
    }

    pub fn frames_captured(&self) -> u64 {
        self.frame_count
    }

    fn face_in_frame(&self, index: u64) -> bool {
        let cycle = u64::from(self.config.present) + u64::from(self.config.absent);
        index % cycle < u64::from(self.config.present)
    }

    fn render(&self, face: bool) -> Vec<u8> {
        let (w, h) = (self.config.width, self.config.height);
        let mut luma = vec![BACKGROUND; (w as usize) * (h as usize)];
        if face {
            for y in h / 4..h * 3 / 4 {
                for x in w / 4..w * 3 / 4 {
                    luma[(y * w + x) as usize] = FACE;
                }
            }
        }
        luma
    }
}

impl FrameSource for SyntheticSource {
    fn name(&self) -> &str {
        &self.config.url
    }

    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        log::info!("SyntheticSource: connected to {}", self.config.url);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        if !self.connected {
            return Err(anyhow!("synthetic source not connected"));
        }
        let index = self.frame_count;
        self.frame_count += 1;
        if self.config.dropout > 0 && self.frame_count % u64::from(self.config.dropout) == 0 {
            return Err(anyhow!("synthetic dropout at frame {}", self.frame_count));
        }
        let face = self.face_in_frame(index);
        Frame::new(self.render(face), self.config.width, self.config.height)
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_named_patterns_and_parameters() -> Result<()> {
        assert_eq!(SyntheticConfig::from_url("stub://present")?.absent, 0);
        assert_eq!(SyntheticConfig::from_url("stub://absent")?.present, 0);

        let config = SyntheticConfig::from_url("stub://desk?present=5&absent=7&dropout=3")?;
        assert_eq!((config.present, config.absent, config.dropout), (5, 7, 3));
        Ok(())
    }

    #[test]
    fn rejects_bad_parameters() {
        assert!(SyntheticConfig::from_url("stub://x?present=abc").is_err());
        assert!(SyntheticConfig::from_url("stub://x?speed=2").is_err());
        assert!(SyntheticConfig::from_url("stub://x?present=0&absent=0").is_err());
        assert!(SyntheticConfig::from_url("file:///tmp/video.mp4").is_err());
    }

    #[test]
    fn pattern_alternates_and_drops_frames() -> Result<()> {
        let mut source = SyntheticSource::new(SyntheticConfig::from_url(
            "stub://t?present=2&absent=1&dropout=4",
        )?);
        assert!(source.next_frame().is_err());
        source.connect()?;

        let center = |f: &Frame| f.pixel(f.width / 2, f.height / 2);
        assert_eq!(center(&source.next_frame()?), Some(FACE));
        assert_eq!(center(&source.next_frame()?), Some(FACE));
        assert_eq!(center(&source.next_frame()?), Some(BACKGROUND));
        assert!(source.next_frame().is_err());
        assert_eq!(source.frames_captured(), 4);
        Ok(())
    }
}
