//! Timestamped image frames and the sources that supply them.
//!
//! The processing loop only ever looks at the most recent frame: a
//! [`FrameSlot`] is a single-entry mailbox where publishing over an unread
//! frame discards the older one.

mod synthetic;

use std::sync::{Arc, Mutex, MutexGuard};

use image::{GrayImage, Luma, RgbImage};

use crate::{Result, SonifierError};

pub use synthetic::{AngularTexture, Harmonic, SyntheticFeed, SyntheticTurntable};

/// One captured image, owned by a single processing cycle.
#[derive(Debug, Clone)]
pub struct Frame {
    timestamp: f64,
    luma: GrayImage,
    color: Option<RgbImage>,
}

impl Frame {
    /// Wraps an already converted brightness image.
    pub fn new(timestamp: f64, luma: GrayImage) -> Self {
        Self {
            timestamp,
            luma,
            color: None,
        }
    }

    /// Builds a frame from a color image, deriving brightness with the
    /// ITU-R BT.601 weights.
    pub fn from_rgb(timestamp: f64, color: RgbImage) -> Self {
        let luma = GrayImage::from_fn(color.width(), color.height(), |x, y| {
            let [r, g, b] = color.get_pixel(x, y).0;
            let value = 0.299 * f32::from(r) + 0.587 * f32::from(g) + 0.114 * f32::from(b);
            Luma([value.round().clamp(0.0, 255.0) as u8])
        });
        Self {
            timestamp,
            luma,
            color: Some(color),
        }
    }

    /// Builds a frame from a row-major brightness buffer.
    pub fn from_luma_bytes(timestamp: f64, width: u32, height: u32, bytes: Vec<u8>) -> Result<Self> {
        let luma = GrayImage::from_raw(width, height, bytes)
            .ok_or(SonifierError::InvalidInput("brightness buffer does not match frame size"))?;
        Ok(Self::new(timestamp, luma))
    }

    /// Capture time in seconds.
    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    pub fn width(&self) -> u32 {
        self.luma.width()
    }

    pub fn height(&self) -> u32 {
        self.luma.height()
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    pub fn luma(&self) -> &GrayImage {
        &self.luma
    }

    pub fn color(&self) -> Option<&RgbImage> {
        self.color.as_ref()
    }

    /// Center of the frame in pixel coordinates.
    pub fn center(&self) -> (f32, f32) {
        (
            (self.width() as f32 - 1.0) * 0.5,
            (self.height() as f32 - 1.0) * 0.5,
        )
    }

    /// Brightness at `(x, y)` interpolated between the four surrounding pixel
    /// centers. Coordinates outside the frame are clamped to its border.
    pub fn sample_bilinear(&self, x: f32, y: f32) -> f32 {
        if self.is_empty() || !x.is_finite() || !y.is_finite() {
            return 0.0;
        }

        let max_x = (self.width() - 1) as f32;
        let max_y = (self.height() - 1) as f32;
        let x = x.clamp(0.0, max_x);
        let y = y.clamp(0.0, max_y);

        let x0 = x.floor();
        let y0 = y.floor();
        let fx = x - x0;
        let fy = y - y0;
        let x0 = x0 as u32;
        let y0 = y0 as u32;
        let x1 = (x0 + 1).min(self.width() - 1);
        let y1 = (y0 + 1).min(self.height() - 1);

        let p = |px: u32, py: u32| f32::from(self.luma.get_pixel(px, py).0[0]);
        let top = p(x0, y0) * (1.0 - fx) + p(x1, y0) * fx;
        let bottom = p(x0, y1) * (1.0 - fx) + p(x1, y1) * fx;
        top * (1.0 - fy) + bottom * fy
    }
}

/// Anything that can hand the loop its next frame.
pub trait FrameSource {
    /// Returns the next frame to process, or `None` when no new frame is
    /// available (or the source is exhausted).
    fn next_frame(&mut self) -> Result<Option<Frame>>;
}

/// Latest-frame-wins mailbox shared between a capture thread and the loop.
#[derive(Clone, Default)]
pub struct FrameSlot {
    shared: Arc<Mutex<SlotState>>,
}

#[derive(Default)]
struct SlotState {
    frame: Option<Frame>,
    published: u64,
    dropped: u64,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `frame`, replacing (and counting) any frame nobody consumed yet.
    pub fn publish(&self, frame: Frame) -> Result<()> {
        let mut slot = self.lock()?;
        if slot.frame.replace(frame).is_some() {
            slot.dropped += 1;
        }
        slot.published += 1;
        Ok(())
    }

    /// Takes the most recent frame, leaving the slot empty.
    pub fn take_latest(&self) -> Result<Option<Frame>> {
        let mut slot = self.lock()?;
        Ok(slot.frame.take())
    }

    /// Number of frames discarded because a newer one arrived first.
    pub fn dropped(&self) -> Result<u64> {
        Ok(self.lock()?.dropped)
    }

    pub fn published(&self) -> Result<u64> {
        Ok(self.lock()?.published)
    }

    fn lock(&self) -> Result<MutexGuard<'_, SlotState>> {
        self.shared
            .lock()
            .map_err(|_| SonifierError::msg("frame slot has been poisoned"))
    }
}

impl FrameSource for FrameSlot {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        self.take_latest()
    }
}

impl std::fmt::Debug for FrameSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSlot").finish()
    }
}
