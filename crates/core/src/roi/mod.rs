//! Region-of-interest acquisition and tracking.
//!
//! Circular mode looks for a small bright marker (the spindle) near the
//! middle of the frame and only accepts it once it has been seen at the same
//! spot for a short warm-up window. Rectangular mode uses a configured
//! rectangle or a centered horizontal band.

use std::collections::BTreeMap;

use image::{GrayImage, Luma};
use imageproc::region_labelling::{connected_components, Connectivity};
use serde::{Deserialize, Serialize};

use crate::{config::RoiConfig, frame::Frame, SonifierError};

/// Blobs filling less of their bounding box than this are not markers.
const MIN_COMPACTNESS: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoiMode {
    #[default]
    Circular,
    Rectangular,
}

impl RoiMode {
    /// Human readable name, also used in session directory names.
    pub fn label(self) -> &'static str {
        match self {
            Self::Circular => "Circular",
            Self::Rectangular => "Rectangular",
        }
    }
}

/// Annulus around a rotational center.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CircleGeometry {
    pub center: (f32, f32),
    pub radius_min: f32,
    pub radius_max: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RectGeometry {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl RectGeometry {
    pub fn center(&self) -> (f32, f32) {
        (
            self.x as f32 + (self.width as f32 - 1.0) * 0.5,
            self.y as f32 + (self.height as f32 - 1.0) * 0.5,
        )
    }
}

/// Active sampling geometry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Roi {
    Circular(CircleGeometry),
    Rectangular(RectGeometry),
}

impl Roi {
    pub fn mode(&self) -> RoiMode {
        match self {
            Self::Circular(_) => RoiMode::Circular,
            Self::Rectangular(_) => RoiMode::Rectangular,
        }
    }

    /// Pulls the geometry inside a `width` x `height` frame. Radii and sizes
    /// never go negative and centers/origins stay within bounds.
    pub fn clamped(self, width: u32, height: u32) -> Self {
        let max_x = width.saturating_sub(1);
        let max_y = height.saturating_sub(1);
        match self {
            Self::Circular(circle) => {
                let center = (
                    circle.center.0.clamp(0.0, max_x as f32),
                    circle.center.1.clamp(0.0, max_y as f32),
                );
                let radius_min = circle.radius_min.max(0.0);
                let radius_max = circle.radius_max.max(radius_min);
                Self::Circular(CircleGeometry {
                    center,
                    radius_min,
                    radius_max,
                })
            }
            Self::Rectangular(rect) => {
                let x = rect.x.min(max_x);
                let y = rect.y.min(max_y);
                Self::Rectangular(RectGeometry {
                    x,
                    y,
                    width: rect.width.min(width - x).max(1),
                    height: rect.height.min(height - y).max(1),
                })
            }
        }
    }

    /// Annulus used for rotation estimation. Rectangles contribute the ring
    /// inscribed in them.
    pub fn ring(&self) -> CircleGeometry {
        match self {
            Self::Circular(circle) => *circle,
            Self::Rectangular(rect) => {
                let radius_max = (rect.width.min(rect.height) as f32 * 0.5 - 1.0).max(1.0);
                CircleGeometry {
                    center: rect.center(),
                    radius_min: radius_max * 0.25,
                    radius_max,
                }
            }
        }
    }
}

/// Outcome of feeding one frame to the tracker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrackerStatus {
    Tracking(Roi),
    /// A marker is being observed but the warm-up window is not complete.
    WarmingUp { observed: usize, required: usize },
    /// No center could be established from this frame and no manual
    /// geometry is available.
    NoCenter,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Marker {
    center: (f32, f32),
    area: u32,
}

#[derive(Debug, Default, Clone, Copy)]
struct Blob {
    area: u32,
    sum_x: u64,
    sum_y: u64,
    min_x: u32,
    min_y: u32,
    max_x: u32,
    max_y: u32,
}

/// Maintains the active ROI and the detection state behind it.
#[derive(Debug, Clone)]
pub struct RoiTracker {
    config: RoiConfig,
    mode: RoiMode,
    roi: Option<Roi>,
    frame_size: Option<(u32, u32)>,
    window: Vec<Marker>,
    retracking: bool,
    generation: u64,
}

impl RoiTracker {
    pub fn new(config: RoiConfig) -> Self {
        Self {
            mode: config.mode,
            config,
            roi: None,
            frame_size: None,
            window: Vec::new(),
            retracking: false,
            generation: 0,
        }
    }

    pub fn mode(&self) -> RoiMode {
        self.mode
    }

    pub fn roi(&self) -> Option<Roi> {
        self.roi
    }

    /// Incremented every time the active ROI is replaced or discarded.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_retracking(&self) -> bool {
        self.retracking
    }

    /// Discards any previous geometry and starts acquiring in `mode`.
    ///
    /// Fails with [`SonifierError::NoCenter`] when the frame shows no usable
    /// marker and no manual geometry is configured. The tracker stays in
    /// `mode` and later frames keep retrying.
    pub fn initialize(&mut self, mode: RoiMode, frame: &Frame) -> crate::Result<TrackerStatus> {
        self.mode = mode;
        self.discard();
        match self.observe(frame) {
            TrackerStatus::NoCenter => Err(SonifierError::NoCenter(format!(
                "{} acquisition on a {}x{} frame",
                mode.label(),
                frame.width(),
                frame.height()
            ))),
            status => Ok(status),
        }
    }

    /// Feeds one frame. Once an ROI is established it is kept until a
    /// retrack, mode switch or manual override, or until the frame size
    /// changes, which forces a full re-initialization.
    pub fn observe(&mut self, frame: &Frame) -> TrackerStatus {
        let size = (frame.width(), frame.height());
        match (self.frame_size, self.roi) {
            (Some(known), Some(_)) if known != size => {
                tracing::info!(width = size.0, height = size.1, "frame size changed, re-initializing ROI");
                self.discard();
            }
            // Installed before any frame was seen.
            (None, Some(roi)) => {
                let clamped = roi.clamped(size.0, size.1);
                if clamped != roi {
                    tracing::info!(?clamped, "manual ROI clamped to the first frame");
                    self.replace(clamped);
                }
            }
            _ => {}
        }
        self.frame_size = Some(size);

        if frame.is_empty() {
            return self.roi.map_or(TrackerStatus::NoCenter, TrackerStatus::Tracking);
        }

        if self.retracking {
            return self.continue_retrack(frame);
        }

        if let Some(roi) = self.roi {
            return TrackerStatus::Tracking(roi);
        }

        match self.mode {
            RoiMode::Rectangular => {
                let roi = self.rectangle_for(frame);
                self.replace(roi);
                TrackerStatus::Tracking(roi)
            }
            RoiMode::Circular => self.acquire_circle(frame),
        }
    }

    /// Re-runs detection. The current ROI stays active until the new one is
    /// confirmed; if detection fails the previous ROI is kept.
    pub fn retrack(&mut self, frame: &Frame) -> TrackerStatus {
        self.window.clear();
        if self.roi.is_none() {
            return self.observe(frame);
        }
        self.retracking = true;
        tracing::info!(mode = self.mode.label(), "retracking ROI");
        self.observe(frame)
    }

    /// Switches geometry type. The current ROI is dropped; the next frame
    /// acquires a new one.
    pub fn switch_mode(&mut self, mode: RoiMode) {
        tracing::info!(from = self.mode.label(), to = mode.label(), "switching ROI mode");
        self.mode = mode;
        self.discard();
    }

    /// Installs a caller-supplied geometry, which also becomes the fallback
    /// for later detection failures.
    pub fn set_manual(&mut self, roi: Roi) {
        match roi {
            Roi::Circular(circle) => self.config.manual_circle = Some(circle),
            Roi::Rectangular(rect) => self.config.manual_rect = Some(rect),
        }
        self.mode = roi.mode();
        self.window.clear();
        self.retracking = false;
        let roi = match self.frame_size {
            Some((width, height)) => roi.clamped(width, height),
            None => roi,
        };
        self.replace(roi);
        tracing::info!(?roi, "manual ROI installed");
    }

    fn discard(&mut self) {
        if self.roi.take().is_some() {
            self.generation += 1;
        }
        self.window.clear();
        self.retracking = false;
    }

    fn replace(&mut self, roi: Roi) {
        self.roi = Some(roi);
        self.generation += 1;
    }

    fn rectangle_for(&self, frame: &Frame) -> Roi {
        let rect = self.config.manual_rect.unwrap_or_else(|| {
            let band = (frame.height() / 3).max(1);
            RectGeometry {
                x: 0,
                y: (frame.height() - band) / 2,
                width: frame.width(),
                height: band,
            }
        });
        Roi::Rectangular(rect).clamped(frame.width(), frame.height())
    }

    fn manual_circle(&self, frame: &Frame) -> Option<Roi> {
        self.config
            .manual_circle
            .map(|circle| Roi::Circular(circle).clamped(frame.width(), frame.height()))
    }

    fn acquire_circle(&mut self, frame: &Frame) -> TrackerStatus {
        if self.config.prefer_manual {
            if let Some(roi) = self.manual_circle(frame) {
                self.replace(roi);
                tracing::info!(?roi, "using manual circular ROI");
                return TrackerStatus::Tracking(roi);
            }
        }

        match self.warm_up(frame) {
            Some(Ok(circle)) => {
                let roi = Roi::Circular(circle);
                self.replace(roi);
                tracing::info!(?circle, "rotational center acquired");
                TrackerStatus::Tracking(roi)
            }
            None => TrackerStatus::WarmingUp {
                observed: self.window.len(),
                required: self.config.warmup_frames,
            },
            Some(Err(reason)) => match self.manual_circle(frame) {
                Some(roi) => {
                    self.replace(roi);
                    tracing::info!(reason, ?roi, "detection failed, falling back to manual ROI");
                    TrackerStatus::Tracking(roi)
                }
                None => {
                    tracing::debug!(reason, "no rotational center");
                    TrackerStatus::NoCenter
                }
            },
        }
    }

    fn continue_retrack(&mut self, frame: &Frame) -> TrackerStatus {
        let current = self.roi;
        if self.mode == RoiMode::Rectangular {
            self.retracking = false;
            let roi = self.rectangle_for(frame);
            self.replace(roi);
            return TrackerStatus::Tracking(roi);
        }

        match self.warm_up(frame) {
            Some(Ok(circle)) => {
                self.retracking = false;
                let roi = Roi::Circular(circle);
                self.replace(roi);
                tracing::info!(?circle, "retrack complete");
                TrackerStatus::Tracking(roi)
            }
            Some(Err(reason)) => {
                self.retracking = false;
                tracing::warn!(reason, "retrack failed, keeping previous ROI");
                current.map_or(TrackerStatus::NoCenter, TrackerStatus::Tracking)
            }
            None => current.map_or(TrackerStatus::NoCenter, TrackerStatus::Tracking),
        }
    }

    /// Adds this frame's marker to the warm-up window. Returns `None` while
    /// the window is still filling, otherwise the detection outcome. Any
    /// failure empties the window.
    fn warm_up(&mut self, frame: &Frame) -> Option<Result<CircleGeometry, &'static str>> {
        let Some(marker) = self.detect_marker(frame) else {
            self.window.clear();
            return Some(Err("no marker in search window"));
        };
        self.window.push(marker);
        if self.window.len() < self.config.warmup_frames {
            return None;
        }

        let count = self.window.len() as f32;
        let mean_x = self.window.iter().map(|m| m.center.0).sum::<f32>() / count;
        let mean_y = self.window.iter().map(|m| m.center.1).sum::<f32>() / count;
        let stable = self.window.iter().all(|m| {
            let dx = m.center.0 - mean_x;
            let dy = m.center.1 - mean_y;
            (dx * dx + dy * dy).sqrt() <= self.config.stability_tolerance
        });
        let area = self.window.iter().map(|m| m.area as f32).sum::<f32>() / count;
        self.window.clear();
        if !stable {
            return Some(Err("marker unstable during warm-up"));
        }

        let marker_radius = (area / std::f32::consts::PI).sqrt();
        let edge = mean_x
            .min(mean_y)
            .min(frame.width() as f32 - 1.0 - mean_x)
            .min(frame.height() as f32 - 1.0 - mean_y);
        let radius_min = marker_radius + self.config.inner_margin;
        let radius_max = edge - 1.0;
        if radius_max <= radius_min {
            return Some(Err("marker too close to the frame edge"));
        }

        Some(Ok(CircleGeometry {
            center: (mean_x, mean_y),
            radius_min,
            radius_max,
        }))
    }

    fn detect_marker(&self, frame: &Frame) -> Option<Marker> {
        let width = frame.width();
        let height = frame.height();
        let fraction = self.config.search_fraction.clamp(0.05, 1.0);
        let search_w = ((width as f32 * fraction) as u32).max(1);
        let search_h = ((height as f32 * fraction) as u32).max(1);
        let x0 = (width - search_w) / 2;
        let y0 = (height - search_h) / 2;
        let threshold = self.config.marker_threshold;
        let luma = frame.luma();

        let mask = GrayImage::from_fn(width, height, |x, y| {
            let inside = x >= x0 && x < x0 + search_w && y >= y0 && y < y0 + search_h;
            Luma([u8::from(inside && luma.get_pixel(x, y).0[0] >= threshold)])
        });
        let labels = connected_components(&mask, Connectivity::Eight, Luma([0u8]));

        let mut blobs: BTreeMap<u32, Blob> = BTreeMap::new();
        for (x, y, pixel) in labels.enumerate_pixels() {
            let label = pixel.0[0];
            if label == 0 {
                continue;
            }
            let blob = blobs.entry(label).or_insert(Blob {
                min_x: x,
                min_y: y,
                max_x: x,
                max_y: y,
                ..Blob::default()
            });
            blob.area += 1;
            blob.sum_x += u64::from(x);
            blob.sum_y += u64::from(y);
            blob.min_x = blob.min_x.min(x);
            blob.min_y = blob.min_y.min(y);
            blob.max_x = blob.max_x.max(x);
            blob.max_y = blob.max_y.max(y);
        }

        let (cx, cy) = frame.center();
        blobs
            .into_values()
            .filter(|blob| {
                (self.config.marker_min_area..=self.config.marker_max_area).contains(&blob.area)
            })
            .filter(|blob| {
                let box_area = (blob.max_x - blob.min_x + 1) * (blob.max_y - blob.min_y + 1);
                blob.area as f32 / box_area as f32 >= MIN_COMPACTNESS
            })
            .map(|blob| Marker {
                center: (
                    blob.sum_x as f32 / blob.area as f32,
                    blob.sum_y as f32 / blob.area as f32,
                ),
                area: blob.area,
            })
            .min_by(|a, b| {
                let da = (a.center.0 - cx).powi(2) + (a.center.1 - cy).powi(2);
                let db = (b.center.0 - cx).powi(2) + (b.center.1 - cy).powi(2);
                da.total_cmp(&db).then(b.area.cmp(&a.area))
            })
    }
}
