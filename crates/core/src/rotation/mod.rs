//! Rotation angle and speed estimation.
//!
//! `Fixed` mode integrates the configured RPM. `Detected` mode captures an
//! angular ring profile as a reference and measures how far the current
//! frame's profile has turned relative to it.

mod correlation;

use serde::{Deserialize, Serialize};

use crate::{config::RotationConfig, frame::Frame, roi::CircleGeometry, Result};

use correlation::{RingCorrelator, RingProfile};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RotationMode {
    #[default]
    Fixed,
    Detected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Confidence {
    Confident,
    /// The similarity search found no convincing match; the angle was dead
    /// reckoned from the last good RPM.
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RotationState {
    /// Degrees in `[0, 360)`.
    pub angle: f64,
    pub rpm: f64,
    pub timestamp: f64,
    pub source: RotationMode,
    pub confidence: Confidence,
    /// Peak similarity of the last measurement; `1.0` in Fixed mode.
    pub correlation: f64,
}

/// Result of one estimator step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RotationUpdate {
    pub state: RotationState,
    /// Signed angle change since the previous step, in degrees.
    pub advance: f64,
    /// The reference was re-captured automatically during this step.
    pub auto_reset: bool,
}

#[derive(Debug)]
struct Reference {
    profile: RingProfile,
    /// Estimator angle when the reference was captured.
    origin: f64,
    last_offset: f64,
    last_confident: f64,
    /// Dead-reckoned advance not yet confirmed by a measurement.
    pending: f64,
}

#[derive(Debug)]
pub struct RotationEstimator {
    config: RotationConfig,
    mode: RotationMode,
    state: RotationState,
    started: bool,
    correlator: RingCorrelator,
    reference: Option<Reference>,
    low_streak: u32,
    rpm_measured: bool,
}

impl RotationEstimator {
    pub fn new(config: RotationConfig) -> Self {
        let correlator = RingCorrelator::new(config.angular_bins, config.ring_samples);
        let mode = config.mode;
        let mut estimator = Self {
            state: initial_state(&config, mode),
            config,
            mode,
            started: false,
            correlator,
            reference: None,
            low_streak: 0,
            rpm_measured: false,
        };
        estimator.reset();
        estimator
    }

    pub fn mode(&self) -> RotationMode {
        self.mode
    }

    pub fn state(&self) -> &RotationState {
        &self.state
    }

    /// Returns to the configured initial angle and RPM and forgets any
    /// reference.
    pub fn reset(&mut self) {
        self.state = initial_state(&self.config, self.mode);
        self.started = false;
        self.reference = None;
        self.low_streak = 0;
        self.rpm_measured = false;
    }

    /// Re-captures the reference on the next frame, with the angle at that
    /// moment as its origin. The RPM estimate restarts from the new reference.
    pub fn reset_reference(&mut self) {
        self.reference = None;
        self.low_streak = 0;
        self.rpm_measured = false;
        tracing::info!(angle = self.state.angle, "rotation reference reset requested");
    }

    /// Advances the estimate to `frame`. `ring` is the annulus sampled in
    /// Detected mode; without one the angle is dead reckoned.
    pub fn update(&mut self, frame: &Frame, ring: Option<&CircleGeometry>) -> Result<RotationUpdate> {
        let timestamp = frame.timestamp();
        let dt = if self.started {
            (timestamp - self.state.timestamp).max(0.0)
        } else {
            0.0
        };
        self.started = true;
        self.state.timestamp = timestamp;

        match (self.mode, ring) {
            (RotationMode::Fixed, _) => Ok(self.dead_reckon(dt, Confidence::Confident, 1.0)),
            (RotationMode::Detected, None) => {
                Ok(self.dead_reckon(dt, Confidence::Low, self.state.correlation))
            }
            (RotationMode::Detected, Some(ring)) => self.detect(frame, ring, dt),
        }
    }

    fn dead_reckon(&mut self, dt: f64, confidence: Confidence, correlation: f64) -> RotationUpdate {
        let advance = self.state.rpm * 6.0 * dt;
        self.state.angle = (self.state.angle + advance).rem_euclid(360.0);
        self.state.confidence = confidence;
        self.state.correlation = correlation;
        RotationUpdate {
            state: self.state,
            advance,
            auto_reset: false,
        }
    }

    fn detect(&mut self, frame: &Frame, ring: &CircleGeometry, dt: f64) -> Result<RotationUpdate> {
        let profile = self.correlator.profile(frame, ring)?;
        let Some(reference) = self.reference.as_mut() else {
            let update = self.dead_reckon(dt, Confidence::Confident, 1.0);
            self.capture(profile);
            return Ok(update);
        };

        let alignment = self.correlator.align(&profile, &reference.profile)?;
        if alignment.peak >= self.config.confidence_threshold {
            let delta = wrap_signed(alignment.offset - reference.last_offset);
            let elapsed = self.state.timestamp - reference.last_confident;
            let advance = delta - reference.pending;
            reference.last_offset = alignment.offset;
            reference.last_confident = self.state.timestamp;
            reference.pending = 0.0;
            self.state.angle = (reference.origin + alignment.offset).rem_euclid(360.0);

            if elapsed > f64::EPSILON {
                let measured = delta / elapsed / 6.0;
                self.state.rpm = if self.rpm_measured {
                    self.config.smoothing * measured + (1.0 - self.config.smoothing) * self.state.rpm
                } else {
                    measured
                };
                self.rpm_measured = true;
            }
            self.low_streak = 0;
            self.state.confidence = Confidence::Confident;
            self.state.correlation = alignment.peak;
            return Ok(RotationUpdate {
                state: self.state,
                advance,
                auto_reset: false,
            });
        }

        let mut update = self.dead_reckon(dt, Confidence::Low, alignment.peak);
        if let Some(reference) = self.reference.as_mut() {
            reference.pending += update.advance;
        }
        self.low_streak += 1;
        tracing::warn!(
            correlation = alignment.peak,
            streak = self.low_streak,
            "low-confidence rotation estimate"
        );

        if self.low_streak >= self.config.low_confidence_limit {
            tracing::warn!(angle = self.state.angle, "re-capturing rotation reference");
            self.capture(profile);
            self.low_streak = 0;
            self.rpm_measured = false;
            update.auto_reset = true;
        }
        Ok(update)
    }

    fn capture(&mut self, profile: RingProfile) {
        self.reference = Some(Reference {
            profile,
            origin: self.state.angle,
            last_offset: 0.0,
            last_confident: self.state.timestamp,
            pending: 0.0,
        });
        tracing::debug!(angle = self.state.angle, "rotation reference captured");
    }
}

fn initial_state(config: &RotationConfig, mode: RotationMode) -> RotationState {
    RotationState {
        angle: config.initial_angle.rem_euclid(360.0),
        rpm: config.rpm,
        timestamp: 0.0,
        source: mode,
        confidence: Confidence::Confident,
        correlation: 1.0,
    }
}

/// Maps an angle difference into `[-180, 180)`.
pub fn wrap_signed(degrees: f64) -> f64 {
    (degrees + 180.0).rem_euclid(360.0) - 180.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{AngularTexture, SyntheticTurntable};

    fn ring() -> CircleGeometry {
        CircleGeometry {
            center: (59.5, 59.5),
            radius_min: 12.0,
            radius_max: 48.0,
        }
    }

    fn detected(rpm_prior: f64) -> RotationEstimator {
        RotationEstimator::new(RotationConfig {
            mode: RotationMode::Detected,
            rpm: rpm_prior,
            ..RotationConfig::default()
        })
    }

    #[test]
    fn fixed_mode_advances_at_rpm_times_six() {
        let mut estimator = RotationEstimator::new(RotationConfig {
            rpm: 4.0,
            ..RotationConfig::default()
        });
        let table = SyntheticTurntable::new(8, 8);
        let mut previous = 0.0;
        for step in 0..40 {
            let update = estimator.update(&table.render(step as f64 * 0.5), None).unwrap();
            let expected = (step as f64 * 0.5 * 24.0).rem_euclid(360.0);
            assert!((update.state.angle - expected).abs() < 1e-9);
            assert!(update.state.angle < 360.0);
            if step > 0 {
                assert!((update.advance - 12.0).abs() < 1e-9);
                assert!(update.state.angle > previous || update.state.angle < 12.0);
            }
            previous = update.state.angle;
        }
    }

    #[test]
    fn detected_mode_tracks_a_spinning_disc() {
        let table = SyntheticTurntable::new(120, 120).with_rpm(5.0);
        let mut estimator = detected(1.0);
        for step in 0..60 {
            let t = step as f64 / 20.0;
            let update = estimator.update(&table.render(t), Some(&ring())).unwrap();
            assert_eq!(update.state.confidence, Confidence::Confident);
            assert!(!update.auto_reset);
            let error = wrap_signed(update.state.angle - table.angle_at(t));
            assert!(error.abs() < 1.0, "step {step}: angle error {error}");
        }
        assert!((estimator.state().rpm - 5.0).abs() < 0.4);
    }

    #[test]
    fn low_confidence_holds_rpm_and_resets_on_the_third_cycle() {
        let mut table = SyntheticTurntable::new(120, 120).with_rpm(4.0);
        let mut estimator = detected(4.0);
        for step in 0..10 {
            estimator.update(&table.render(step as f64 * 0.1), Some(&ring())).unwrap();
        }
        let rpm_before = estimator.state().rpm;

        table.set_texture(AngularTexture::alternate());
        let first = estimator.update(&table.render(1.0), Some(&ring())).unwrap();
        let second = estimator.update(&table.render(1.1), Some(&ring())).unwrap();
        let third = estimator.update(&table.render(1.2), Some(&ring())).unwrap();

        for update in [first, second, third] {
            assert_eq!(update.state.confidence, Confidence::Low);
            assert_eq!(update.state.rpm, rpm_before);
        }
        assert!(!first.auto_reset && !second.auto_reset);
        assert!(third.auto_reset);

        let after = estimator.update(&table.render(1.3), Some(&ring())).unwrap();
        assert_eq!(after.state.confidence, Confidence::Confident);
        assert!((after.state.rpm - 4.0).abs() < 0.3);
    }

    #[test]
    fn reset_reference_recaptures_at_current_angle() {
        let table = SyntheticTurntable::new(120, 120).with_rpm(6.0);
        let mut estimator = detected(6.0);
        for step in 0..5 {
            estimator.update(&table.render(step as f64 * 0.1), Some(&ring())).unwrap();
        }
        let angle = estimator.state().angle;
        estimator.reset_reference();
        let update = estimator.update(&table.render(0.5), Some(&ring())).unwrap();
        assert!((update.state.angle - (angle + 3.6)).abs() < 0.5);
        let next = estimator.update(&table.render(0.6), Some(&ring())).unwrap();
        assert!((next.advance - 3.6).abs() < 0.5);
    }

    #[test]
    fn wraps_signed_differences() {
        assert_eq!(wrap_signed(350.0), -10.0);
        assert_eq!(wrap_signed(-190.0), 170.0);
        assert_eq!(wrap_signed(10.0), 10.0);
    }
}
