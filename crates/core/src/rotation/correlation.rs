use std::{fmt, sync::Arc};

use realfft::{num_complex::Complex64, ComplexToReal, RealFftPlanner, RealToComplex};

use crate::{frame::Frame, roi::CircleGeometry, Result};

/// Below this norm a profile carries no angular structure to match.
const MIN_PROFILE_NORM: f64 = 1e-6;

/// Zero-mean angular profile, stored in the frequency domain.
#[derive(Clone)]
pub(crate) struct RingProfile {
    spectrum: Vec<Complex64>,
    norm: f64,
}

impl fmt::Debug for RingProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingProfile")
            .field("bins", &self.spectrum.len())
            .field("norm", &self.norm)
            .finish()
    }
}

/// Best circular alignment between two profiles.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Alignment {
    /// Rotation of the current profile relative to the reference, in degrees
    /// within `[0, 360)`.
    pub offset: f64,
    /// Normalized correlation at the best offset, in `[-1, 1]`.
    pub peak: f64,
}

/// Samples ring profiles and cross-correlates them for every angular offset
/// at once. FFT plans and buffers are built once per bin count.
pub(crate) struct RingCorrelator {
    bins: usize,
    ring_samples: usize,
    forward: Arc<dyn RealToComplex<f64>>,
    inverse: Arc<dyn ComplexToReal<f64>>,
    input: Vec<f64>,
    spectrum: Vec<Complex64>,
    output: Vec<f64>,
    forward_scratch: Vec<Complex64>,
    inverse_scratch: Vec<Complex64>,
}

impl RingCorrelator {
    pub fn new(bins: usize, ring_samples: usize) -> Self {
        let mut planner = RealFftPlanner::<f64>::new();
        let forward = planner.plan_fft_forward(bins);
        let inverse = planner.plan_fft_inverse(bins);
        Self {
            bins,
            ring_samples: ring_samples.max(1),
            input: forward.make_input_vec(),
            spectrum: forward.make_output_vec(),
            output: inverse.make_output_vec(),
            forward_scratch: forward.make_scratch_vec(),
            inverse_scratch: inverse.make_scratch_vec(),
            forward,
            inverse,
        }
    }

    /// Mean brightness across the annulus at each of `bins` evenly spaced
    /// angles, starting at 0 degrees.
    pub fn sample(&self, frame: &Frame, ring: &CircleGeometry) -> Vec<f64> {
        let (cx, cy) = ring.center;
        let span = ring.radius_max - ring.radius_min;
        let step = std::f64::consts::TAU / self.bins as f64;
        (0..self.bins)
            .map(|bin| {
                let theta = bin as f64 * step;
                let (sin, cos) = (theta.sin() as f32, theta.cos() as f32);
                let total: f32 = (0..self.ring_samples)
                    .map(|j| {
                        let r = ring.radius_min + span * (j as f32 + 0.5) / self.ring_samples as f32;
                        frame.sample_bilinear(cx + r * cos, cy + r * sin)
                    })
                    .sum();
                f64::from(total) / self.ring_samples as f64
            })
            .collect()
    }

    pub fn profile(&mut self, frame: &Frame, ring: &CircleGeometry) -> Result<RingProfile> {
        let values = self.sample(frame, ring);
        self.transform(&values)
    }

    pub fn transform(&mut self, values: &[f64]) -> Result<RingProfile> {
        let mean = values.iter().sum::<f64>() / values.len().max(1) as f64;
        let mut norm = 0.0;
        for (slot, value) in self.input.iter_mut().zip(values) {
            *slot = value - mean;
            norm += *slot * *slot;
        }

        self.forward.process_with_scratch(
            &mut self.input,
            &mut self.spectrum,
            &mut self.forward_scratch,
        )?;

        Ok(RingProfile {
            spectrum: self.spectrum.clone(),
            norm: norm.sqrt(),
        })
    }

    /// Finds `offset` such that `current(theta) ~= reference(theta - offset)`.
    pub fn align(&mut self, current: &RingProfile, reference: &RingProfile) -> Result<Alignment> {
        let denominator = current.norm * reference.norm;
        if denominator < MIN_PROFILE_NORM {
            return Ok(Alignment {
                offset: 0.0,
                peak: 0.0,
            });
        }

        for ((slot, a), b) in self
            .spectrum
            .iter_mut()
            .zip(&current.spectrum)
            .zip(&reference.spectrum)
        {
            *slot = a * b.conj();
        }
        // The inverse real transform requires purely real DC and Nyquist bins.
        if let Some(first) = self.spectrum.first_mut() {
            first.im = 0.0;
        }
        if self.bins % 2 == 0 {
            if let Some(last) = self.spectrum.last_mut() {
                last.im = 0.0;
            }
        }

        self.inverse.process_with_scratch(
            &mut self.spectrum,
            &mut self.output,
            &mut self.inverse_scratch,
        )?;

        let scale = 1.0 / (self.bins as f64 * denominator);
        let (best, peak) = self
            .output
            .iter()
            .enumerate()
            .map(|(index, value)| (index, value * scale))
            .fold((0, f64::MIN), |best, candidate| {
                if candidate.1 > best.1 {
                    candidate
                } else {
                    best
                }
            });

        let previous = self.output[(best + self.bins - 1) % self.bins] * scale;
        let next = self.output[(best + 1) % self.bins] * scale;
        let curvature = previous - 2.0 * peak + next;
        let refinement = if curvature < 0.0 {
            (0.5 * (previous - next) / curvature).clamp(-0.5, 0.5)
        } else {
            0.0
        };

        let degrees_per_bin = 360.0 / self.bins as f64;
        Ok(Alignment {
            offset: ((best as f64 + refinement) * degrees_per_bin).rem_euclid(360.0),
            peak: peak.clamp(-1.0, 1.0),
        })
    }
}

impl fmt::Debug for RingCorrelator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingCorrelator")
            .field("bins", &self.bins)
            .field("ring_samples", &self.ring_samples)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(bins: usize, shift_degrees: f64) -> Vec<f64> {
        (0..bins)
            .map(|bin| {
                let theta = (bin as f64 * 360.0 / bins as f64 - shift_degrees).to_radians();
                100.0 + 40.0 * theta.sin() + 25.0 * (2.0 * theta + 1.0).sin() + 10.0 * (5.0 * theta).cos()
            })
            .collect()
    }

    #[test]
    fn recovers_fractional_offsets() {
        let mut correlator = RingCorrelator::new(360, 4);
        let reference = correlator.transform(&pattern(360, 0.0)).unwrap();
        for shift in [0.0, 12.4, 181.0, 359.5] {
            let current = correlator.transform(&pattern(360, shift)).unwrap();
            let alignment = correlator.align(&current, &reference).unwrap();
            let error = (alignment.offset - shift + 180.0).rem_euclid(360.0) - 180.0;
            assert!(error.abs() < 0.2, "shift {shift} gave {}", alignment.offset);
            assert!(alignment.peak > 0.99);
        }
    }

    #[test]
    fn flat_profiles_have_no_confidence() {
        let mut correlator = RingCorrelator::new(64, 1);
        let flat = correlator.transform(&[7.0; 64]).unwrap();
        let textured = correlator.transform(&pattern(64, 0.0)).unwrap();
        assert_eq!(correlator.align(&flat, &textured).unwrap().peak, 0.0);
    }

    #[test]
    fn unrelated_patterns_correlate_weakly() {
        let mut correlator = RingCorrelator::new(360, 1);
        let reference = correlator.transform(&pattern(360, 0.0)).unwrap();
        let other: Vec<f64> = (0..360)
            .map(|bin| 50.0 * (3.0 * (bin as f64).to_radians()).sin())
            .collect();
        let current = correlator.transform(&other).unwrap();
        assert!(correlator.align(&current, &reference).unwrap().peak < 0.1);
    }
}
