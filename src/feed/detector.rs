use anyhow::Result;

use super::frame::Frame;

/// Face-detection capability.
///
/// Implementations return the confidence that a subject faces the camera, in 0..=1.
/// They must not keep the frame beyond the call.
pub trait FaceDetector: Send {
    fn name(&self) -> &'static str;

    fn detect(&mut self, frame: &Frame) -> Result<f32>;

    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Scores the contrast between the central region and the border. A bright central
/// blob on a dark background reads as a face. Pairs with the synthetic source.
#[derive(Clone, Debug)]
pub struct StubFaceDetector {
    /// Luma difference that maps to confidence 1.0.
    pub full_scale: f32,
}

impl Default for StubFaceDetector {
    fn default() -> Self {
        Self { full_scale: 160.0 }
    }
}

impl FaceDetector for StubFaceDetector {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, frame: &Frame) -> Result<f32> {
        let (w, h) = (frame.width, frame.height);
        let (mut center_sum, mut center_n) = (0u64, 0u64);
        let (mut border_sum, mut border_n) = (0u64, 0u64);
        for (i, value) in frame.luma().iter().enumerate() {
            let (x, y) = ((i as u32) % w, (i as u32) / w);
            let inside = x >= w / 4 && x < w * 3 / 4 && y >= h / 4 && y < h * 3 / 4;
            if inside {
                center_sum += u64::from(*value);
                center_n += 1;
            } else {
                border_sum += u64::from(*value);
                border_n += 1;
            }
        }
        if center_n == 0 || border_n == 0 {
            return Ok(0.0);
        }
        let contrast = center_sum as f32 / center_n as f32 - border_sum as f32 / border_n as f32;
        Ok((contrast / self.full_scale).clamp(0.0, 1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with_center(center: u8, border: u8) -> Result<Frame> {
        let (w, h) = (8u32, 8u32);
        let luma = (0..w * h)
            .map(|i| {
                let (x, y) = (i % w, i / w);
                if (2..6).contains(&x) && (2..6).contains(&y) {
                    center
                } else {
                    border
                }
            })
            .collect();
        Frame::new(luma, w, h)
    }

    #[test]
    fn bright_center_scores_high() -> Result<()> {
        let mut detector = StubFaceDetector::default();
        assert_eq!(detector.detect(&frame_with_center(200, 40)?)?, 1.0);
        assert_eq!(detector.detect(&frame_with_center(40, 40)?)?, 0.0);
        let partial = detector.detect(&frame_with_center(120, 40)?)?;
        assert!((partial - 0.5).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn dark_center_is_not_a_face() -> Result<()> {
        let mut detector = StubFaceDetector::default();
        assert_eq!(detector.detect(&frame_with_center(10, 200)?)?, 0.0);
        Ok(())
    }
}
