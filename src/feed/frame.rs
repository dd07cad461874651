use std::time::Instant;

use anyhow::{anyhow, Result};

/// Single-channel (luma) frame.
#[derive(Clone, Debug)]
pub struct Frame {
    luma: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub captured_at: Instant,
}

impl Frame {
    pub fn new(luma: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = (width as usize) * (height as usize);
        if expected == 0 || luma.len() != expected {
            return Err(anyhow!(
                "frame buffer holds {} bytes, expected {}x{}",
                luma.len(),
                width,
                height
            ));
        }
        Ok(Self {
            luma,
            width,
            height,
            captured_at: Instant::now(),
        })
    }

    pub fn luma(&self) -> &[u8] {
        &self.luma
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<u8> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.luma
            .get((y as usize) * (self.width as usize) + x as usize)
            .copied()
    }
}

pub trait FrameSource: Send {
    fn name(&self) -> &str;

    fn connect(&mut self) -> Result<()>;

    fn next_frame(&mut self) -> Result<Frame>;

    fn disconnect(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_mismatched_buffer() {
        assert!(Frame::new(vec![0; 10], 4, 4).is_err());
        assert!(Frame::new(Vec::new(), 0, 0).is_err());
    }

    #[test]
    fn pixel_lookup_is_row_major() -> Result<()> {
        let frame = Frame::new((0..6).collect(), 3, 2)?;
        assert_eq!(frame.pixel(2, 0), Some(2));
        assert_eq!(frame.pixel(0, 1), Some(3));
        assert_eq!(frame.pixel(3, 0), None);
        Ok(())
    }
}
