//! In-process test-pattern source.
//!
//! Renders a gradient background with a bright block sweeping left to right,
//! which gives downstream stages something that moves: the block crosses any
//! vertical line and wanders in and out of centered polygons. Used by demos
//! and tests so the default build needs no camera stack.

use std::{thread, time::Duration};

use crate::{CaptureError, SourceFrame, VideoSource};

pub struct SyntheticSource {
    width: u32,
    height: u32,
    frame_interval: Duration,
    tick: u64,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32, frame_interval: Duration) -> Self {
        Self {
            width,
            height,
            frame_interval,
            tick: 0,
        }
    }
}

impl VideoSource for SyntheticSource {
    fn read_frame(&mut self) -> Result<SourceFrame, CaptureError> {
        thread::sleep(self.frame_interval);

        let (w, h) = (self.width as usize, self.height as usize);
        let mut data = vec![0u8; w * h * 3];
        for y in 0..h {
            let g = (y * 255 / h.max(1)) as u8;
            for x in 0..w {
                let b = (x * 255 / w.max(1)) as u8;
                let idx = (y * w + x) * 3;
                data[idx] = b;
                data[idx + 1] = g;
                data[idx + 2] = 32;
            }
        }

        // Sweeping block, one-eighth of the frame wide.
        let side = (w / 8).max(1);
        let span = w.saturating_sub(side).max(1);
        let block_x = (self.tick as usize * 4) % span;
        let block_y = h / 2 - (side / 2).min(h / 2);
        for y in block_y..(block_y + side).min(h) {
            for x in block_x..(block_x + side).min(w) {
                let idx = (y * w + x) * 3;
                data[idx] = 255;
                data[idx + 1] = 255;
                data[idx + 2] = 255;
            }
        }

        self.tick += 1;
        Ok(SourceFrame {
            data,
            width: self.width,
            height: self.height,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produces_full_frames_of_the_requested_size() {
        let mut source = SyntheticSource::new(64, 48, Duration::from_millis(0));
        let frame = source.read_frame().unwrap();
        assert_eq!(frame.width, 64);
        assert_eq!(frame.height, 48);
        assert_eq!(frame.data.len(), 64 * 48 * 3);
    }

    #[test]
    fn block_moves_between_consecutive_frames() {
        let mut source = SyntheticSource::new(64, 48, Duration::from_millis(0));
        let first = source.read_frame().unwrap();
        let second = source.read_frame().unwrap();
        assert_ne!(first.data, second.data);
    }
}
