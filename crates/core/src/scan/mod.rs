//! Scanline sampling and Zodiac sectioning.
//!
//! Each ROI variant implements [`ScanGeometry`], so the rest of the pipeline
//! never branches on the ROI mode.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    config::ScanConfig,
    frame::Frame,
    roi::{CircleGeometry, RectGeometry, Roi},
    rotation::RotationState,
};

pub const ZODIAC_SECTIONS: u8 = 12;

/// Brightness values along the scan path, in path order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SampleSequence(Vec<u8>);

impl SampleSequence {
    pub fn new(values: Vec<u8>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

/// One of twelve angular or time partitions of a revolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ZodiacSection(u8);

impl ZodiacSection {
    pub fn new(index: u8) -> Self {
        Self(index % ZODIAC_SECTIONS)
    }

    pub fn index(self) -> u8 {
        self.0
    }

    /// `floor(angle / 30) mod 12`.
    pub fn from_angle(degrees: f64) -> Self {
        let sector = (degrees.rem_euclid(360.0) / 30.0).floor() as u8;
        Self::new(sector.min(ZODIAC_SECTIONS - 1))
    }

    /// `floor((elapsed mod period) / (period / 12))`.
    pub fn from_time(elapsed: f64, period: f64) -> Self {
        if !(period > 0.0) || !elapsed.is_finite() {
            return Self(0);
        }
        let phase = elapsed.rem_euclid(period);
        let sector = (phase / (period / f64::from(ZODIAC_SECTIONS))).floor() as u8;
        Self::new(sector.min(ZODIAC_SECTIONS - 1))
    }
}

/// Mode-specific sampling behavior.
pub trait ScanGeometry: Send + fmt::Debug {
    fn sample(&self, frame: &Frame, rotation: &RotationState) -> SampleSequence;

    /// Zodiac section for the current cycle. `elapsed` is the time since the
    /// run started and only matters when the geometry is not rotation aware.
    fn section_index(&self, rotation: &RotationState, elapsed: f64) -> ZodiacSection;

    /// Whether sections and lap boundaries follow the rotation angle.
    fn rotation_aware(&self) -> bool;

    fn sample_count(&self) -> usize;
}

/// Builds the scan geometry for `roi`. The sample count stays fixed for the
/// lifetime of the returned value.
pub fn build_scan(roi: &Roi, config: &ScanConfig, period: f64) -> Box<dyn ScanGeometry> {
    match roi {
        Roi::Circular(circle) => Box::new(CircularScan::new(*circle, config.sample_count)),
        Roi::Rectangular(rect) => Box::new(RectangularScan {
            rect: *rect,
            count: config.sample_count.max(2),
            window: config.rectangular_window,
            rotation_aware: config.rectangular_rotation_aware,
            period,
        }),
    }
}

/// Radial scanline from the inner to the outer radius, pointing along the
/// rotation angle.
#[derive(Debug, Clone)]
pub struct CircularScan {
    circle: CircleGeometry,
    count: usize,
}

impl CircularScan {
    pub fn new(circle: CircleGeometry, count: usize) -> Self {
        Self {
            circle,
            count: count.max(2),
        }
    }
}

impl ScanGeometry for CircularScan {
    fn sample(&self, frame: &Frame, rotation: &RotationState) -> SampleSequence {
        let (cx, cy) = self.circle.center;
        let theta = rotation.angle.to_radians();
        let (sin, cos) = (theta.sin() as f32, theta.cos() as f32);
        let span = self.circle.radius_max - self.circle.radius_min;
        let last = (self.count - 1) as f32;

        let values = (0..self.count)
            .map(|index| {
                let r = self.circle.radius_min + span * index as f32 / last;
                to_byte(frame.sample_bilinear(cx + r * cos, cy + r * sin))
            })
            .collect();
        SampleSequence(values)
    }

    fn section_index(&self, rotation: &RotationState, _elapsed: f64) -> ZodiacSection {
        ZodiacSection::from_angle(rotation.angle)
    }

    fn rotation_aware(&self) -> bool {
        true
    }

    fn sample_count(&self) -> usize {
        self.count
    }
}

/// Vertical scanline through the middle column of the rectangle.
#[derive(Debug, Clone)]
pub struct RectangularScan {
    rect: RectGeometry,
    count: usize,
    /// Height of a band that sweeps from top to bottom once per revolution.
    window: Option<u32>,
    rotation_aware: bool,
    period: f64,
}

impl RectangularScan {
    /// Vertical extent `(top, bottom)` scanned for the given rotation.
    fn span(&self, rotation: &RotationState) -> (f32, f32) {
        let top = self.rect.y as f32;
        let bottom = top + self.rect.height.saturating_sub(1) as f32;
        match self.window {
            Some(band) if band > 0 && band < self.rect.height => {
                let travel = (self.rect.height - band) as f32;
                let phase = (rotation.angle.rem_euclid(360.0) / 360.0) as f32;
                let start = top + travel * phase;
                (start, start + (band - 1) as f32)
            }
            _ => (top, bottom),
        }
    }
}

impl ScanGeometry for RectangularScan {
    fn sample(&self, frame: &Frame, rotation: &RotationState) -> SampleSequence {
        let x = self.rect.x as f32 + (self.rect.width as f32 - 1.0) * 0.5;
        let (top, bottom) = self.span(rotation);
        let last = (self.count - 1) as f32;

        let values = (0..self.count)
            .map(|index| {
                let y = top + (bottom - top) * index as f32 / last;
                to_byte(frame.sample_bilinear(x, y))
            })
            .collect();
        SampleSequence(values)
    }

    fn section_index(&self, rotation: &RotationState, elapsed: f64) -> ZodiacSection {
        if self.rotation_aware {
            ZodiacSection::from_angle(rotation.angle)
        } else {
            ZodiacSection::from_time(elapsed, self.period)
        }
    }

    fn rotation_aware(&self) -> bool {
        self.rotation_aware
    }

    fn sample_count(&self) -> usize {
        self.count
    }
}

fn to_byte(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}
