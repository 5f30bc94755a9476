use image::{GrayImage, Luma};

use super::{Frame, FrameSource};
use crate::Result;

/// One sinusoidal component of an angular texture.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Harmonic {
    /// Cycles per revolution.
    pub order: u32,
    pub amplitude: f32,
    /// Phase offset in radians.
    pub phase: f32,
}

/// Brightness pattern painted around the disc, as a function of angle.
#[derive(Debug, Clone, PartialEq)]
pub struct AngularTexture {
    harmonics: Vec<Harmonic>,
    norm: f32,
}

impl AngularTexture {
    pub fn new(harmonics: Vec<Harmonic>) -> Self {
        let norm = harmonics
            .iter()
            .map(|h| h.amplitude.abs())
            .sum::<f32>()
            .max(f32::EPSILON);
        Self { harmonics, norm }
    }

    /// Orders 1, 2 and 5: aperiodic within one revolution.
    pub fn primary() -> Self {
        Self::new(vec![
            Harmonic { order: 1, amplitude: 1.0, phase: 0.0 },
            Harmonic { order: 2, amplitude: 0.6, phase: 1.0 },
            Harmonic { order: 5, amplitude: 0.35, phase: 2.2 },
        ])
    }

    /// Orders 3, 4 and 7: orthogonal to [`AngularTexture::primary`].
    pub fn alternate() -> Self {
        Self::new(vec![
            Harmonic { order: 3, amplitude: 1.0, phase: 0.4 },
            Harmonic { order: 4, amplitude: 0.7, phase: 2.0 },
            Harmonic { order: 7, amplitude: 0.3, phase: 0.9 },
        ])
    }

    /// A texture with no angular structure at all.
    pub fn flat() -> Self {
        Self::new(Vec::new())
    }

    /// Pattern value in `[-1, 1]` at `degrees`.
    pub fn value(&self, degrees: f32) -> f32 {
        let theta = degrees.to_radians();
        let sum: f32 = self
            .harmonics
            .iter()
            .map(|h| h.amplitude * (h.order as f32 * theta + h.phase).sin())
            .sum();
        sum / self.norm
    }
}

/// Renders a textured disc spinning under a fixed camera, with a bright
/// spindle marker at its center.
#[derive(Debug, Clone)]
pub struct SyntheticTurntable {
    width: u32,
    height: u32,
    center: (f32, f32),
    disc_radius: f32,
    marker_radius: f32,
    rpm: f64,
    start_angle: f64,
    texture: AngularTexture,
    base: f32,
    contrast: f32,
    ripple: f32,
}

impl SyntheticTurntable {
    /// A disc filling most of a `width` x `height` frame, not rotating.
    pub fn new(width: u32, height: u32) -> Self {
        let center = ((width as f32 - 1.0) * 0.5, (height as f32 - 1.0) * 0.5);
        let disc_radius = width.min(height) as f32 * 0.45;
        Self {
            width,
            height,
            center,
            disc_radius,
            marker_radius: 5.0,
            rpm: 0.0,
            start_angle: 0.0,
            texture: AngularTexture::primary(),
            base: 128.0,
            contrast: 85.0,
            ripple: 20.0,
        }
    }

    #[must_use]
    pub fn with_rpm(mut self, rpm: f64) -> Self {
        self.rpm = rpm;
        self
    }

    #[must_use]
    pub fn with_center(mut self, center: (f32, f32)) -> Self {
        self.center = center;
        self
    }

    #[must_use]
    pub fn with_texture(mut self, texture: AngularTexture) -> Self {
        self.texture = texture;
        self
    }

    #[must_use]
    pub fn without_marker(mut self) -> Self {
        self.marker_radius = 0.0;
        self
    }

    pub fn set_texture(&mut self, texture: AngularTexture) {
        self.texture = texture;
    }

    pub fn center(&self) -> (f32, f32) {
        self.center
    }

    pub fn marker_radius(&self) -> f32 {
        self.marker_radius
    }

    /// Disc rotation in degrees at `timestamp`.
    pub fn angle_at(&self, timestamp: f64) -> f64 {
        (self.start_angle + self.rpm * 6.0 * timestamp).rem_euclid(360.0)
    }

    pub fn render(&self, timestamp: f64) -> Frame {
        let rotation = self.angle_at(timestamp) as f32;
        let (cx, cy) = self.center;
        let luma = GrayImage::from_fn(self.width, self.height, |x, y| {
            let dx = x as f32 - cx;
            let dy = y as f32 - cy;
            let r = (dx * dx + dy * dy).sqrt();
            if r <= self.marker_radius {
                return Luma([255]);
            }
            if r > self.disc_radius {
                return Luma([0]);
            }
            let theta = dy.atan2(dx).to_degrees();
            let value = self.base
                + self.contrast * self.texture.value(theta - rotation)
                + self.ripple * (r / 6.0).sin();
            Luma([value.round().clamp(0.0, 235.0) as u8])
        });
        Frame::new(timestamp, luma)
    }

    /// A frame source producing `count` frames at `fps`.
    pub fn feed(self, fps: f64, count: usize) -> SyntheticFeed {
        SyntheticFeed {
            turntable: self,
            fps,
            index: 0,
            count,
        }
    }
}

/// Fixed-rate frame source over a [`SyntheticTurntable`].
#[derive(Debug, Clone)]
pub struct SyntheticFeed {
    turntable: SyntheticTurntable,
    fps: f64,
    index: usize,
    count: usize,
}

impl SyntheticFeed {
    pub fn turntable_mut(&mut self) -> &mut SyntheticTurntable {
        &mut self.turntable
    }

    pub fn frames_emitted(&self) -> usize {
        self.index
    }
}

impl FrameSource for SyntheticFeed {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.index >= self.count {
            return Ok(None);
        }
        let timestamp = self.index as f64 / self.fps;
        self.index += 1;
        Ok(Some(self.turntable.render(timestamp)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_is_the_brightest_region() {
        let table = SyntheticTurntable::new(64, 48);
        let frame = table.render(0.0);
        let (cx, cy) = table.center();
        assert_eq!(frame.luma().get_pixel(cx.round() as u32, cy.round() as u32).0[0], 255);
        let max_disc = frame
            .luma()
            .enumerate_pixels()
            .filter(|(x, y, _)| {
                let dx = *x as f32 - cx;
                let dy = *y as f32 - cy;
                (dx * dx + dy * dy).sqrt() > table.marker_radius() + 1.0
            })
            .map(|(_, _, p)| p.0[0])
            .max()
            .unwrap();
        assert!(max_disc <= 235);
    }

    #[test]
    fn feed_stops_after_count() {
        let mut feed = SyntheticTurntable::new(16, 16).feed(10.0, 2);
        assert!((feed.next_frame().unwrap().unwrap().timestamp() - 0.0).abs() < 1e-12);
        assert!((feed.next_frame().unwrap().unwrap().timestamp() - 0.1).abs() < 1e-12);
        assert!(feed.next_frame().unwrap().is_none());
    }

    #[test]
    fn textures_stay_normalised() {
        let texture = AngularTexture::primary();
        for degree in 0..360 {
            assert!(texture.value(degree as f32).abs() <= 1.0 + 1e-6);
        }
        assert_eq!(AngularTexture::flat().value(42.0), 0.0);
    }
}
