//! Animated-image encoding collaborators.
//!
//! The engine hands ordered [`CaptureBlock`]s plus a per-frame duration to
//! anything implementing [`AnimationEncoder`]; the bundled implementation
//! writes an animated GIF through the `image` crate.

use crate::capture::{CaptureBlock, RingBuffer};
use anyhow::{anyhow, Context, Result};
use image::codecs::gif::{GifEncoder, Repeat};
use image::{Delay, Frame, RgbaImage};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use tracing::info;

/// Encoder contract: `init`, a stream of `encode_frame` calls, `release`.
pub trait AnimationEncoder: Send {
    fn init(&mut self, width: u32, height: u32, path: &Path) -> Result<()>;
    fn encode_frame(&mut self, block: &CaptureBlock, duration_ms: u32) -> Result<()>;
    fn release(&mut self) -> Result<()>;
}

/// GIF encoder backed by `image::codecs::gif`.
pub struct GifAnimationEncoder {
    encoder: Option<GifEncoder<BufWriter<File>>>,
    width: u32,
    height: u32,
}

impl GifAnimationEncoder {
    pub fn new() -> Self {
        Self {
            encoder: None,
            width: 0,
            height: 0,
        }
    }
}

impl Default for GifAnimationEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl AnimationEncoder for GifAnimationEncoder {
    fn init(&mut self, width: u32, height: u32, path: &Path) -> Result<()> {
        let file = File::create(path)
            .with_context(|| format!("creating capture output {:?}", path))?;
        let mut encoder = GifEncoder::new_with_speed(BufWriter::new(file), 10);
        encoder.set_repeat(Repeat::Infinite)?;
        self.encoder = Some(encoder);
        self.width = width;
        self.height = height;
        info!("GIF encoder ready ({}x{}) -> {:?}", width, height, path);
        Ok(())
    }

    fn encode_frame(&mut self, block: &CaptureBlock, duration_ms: u32) -> Result<()> {
        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| anyhow!("encoder used before init"))?;
        let image = RgbaImage::from_raw(block.width, block.height, block.data.clone())
            .ok_or_else(|| anyhow!("capture block does not match encoder dimensions"))?;
        let frame = Frame::from_parts(image, 0, 0, Delay::from_numer_denom_ms(duration_ms, 1));
        encoder.encode_frame(frame)?;
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        // Dropping the encoder finalizes the file
        self.encoder = None;
        Ok(())
    }
}

/// Drain the capture ring through an encoder, forward then backward, so the
/// exported animation plays out and back ("boomerang"). The backward pass
/// skips the first and last frame to avoid doubled endpoints.
pub fn encode_boomerang(
    ring: &RingBuffer<CaptureBlock>,
    encoder: &mut dyn AnimationEncoder,
    frame_duration_ms: u32,
) -> Result<()> {
    let mut frames = Vec::with_capacity(ring.num_items());
    while let Some(block) = ring.get() {
        frames.push(block);
    }

    for block in &frames {
        encoder.encode_frame(block, frame_duration_ms)?;
    }
    for block in frames.iter().rev().skip(1).take(frames.len().saturating_sub(2)) {
        encoder.encode_frame(block, frame_duration_ms)?;
    }

    encoder.release()?;
    info!("encoded {} captured frames (boomerang)", frames.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingEncoder {
        labels: Vec<u8>,
        released: bool,
    }

    impl AnimationEncoder for RecordingEncoder {
        fn init(&mut self, _width: u32, _height: u32, _path: &Path) -> Result<()> {
            Ok(())
        }
        fn encode_frame(&mut self, block: &CaptureBlock, _duration_ms: u32) -> Result<()> {
            self.labels.push(block.data[0]);
            Ok(())
        }
        fn release(&mut self) -> Result<()> {
            self.released = true;
            Ok(())
        }
    }

    fn labeled_block(label: u8) -> CaptureBlock {
        let mut block = CaptureBlock::new(2, 2);
        block.data[0] = label;
        block
    }

    #[test]
    fn boomerang_plays_forward_then_back_without_doubled_endpoints() {
        let ring = RingBuffer::new(8);
        for label in 0..4 {
            ring.put(labeled_block(label));
        }
        let mut encoder = RecordingEncoder {
            labels: Vec::new(),
            released: false,
        };
        encode_boomerang(&ring, &mut encoder, 250).unwrap();
        assert_eq!(encoder.labels, vec![0, 1, 2, 3, 2, 1]);
        assert!(encoder.released);
        assert!(ring.is_empty());
    }

    #[test]
    fn boomerang_of_one_frame_encodes_it_once() {
        let ring = RingBuffer::new(4);
        ring.put(labeled_block(9));
        let mut encoder = RecordingEncoder {
            labels: Vec::new(),
            released: false,
        };
        encode_boomerang(&ring, &mut encoder, 100).unwrap();
        assert_eq!(encoder.labels, vec![9]);
    }

    #[test]
    fn gif_encoder_rejects_frames_before_init() {
        let mut encoder = GifAnimationEncoder::new();
        let block = CaptureBlock::new(2, 2);
        assert!(encoder.encode_frame(&block, 250).is_err());
    }
}
