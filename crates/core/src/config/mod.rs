use std::{collections::BTreeMap, path::Path, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
    mapping::{DurationPolicy, NoteSpec, ScaleTable, ThresholdBehavior},
    playback::PlaybackSource,
    record::{RearmPolicy, RecordStart},
    roi::{CircleGeometry, RectGeometry, RoiMode},
    rotation::RotationMode,
    Result, SonifierError,
};

/// Top-level configuration structure for the application.
///
/// Every section falls back to its defaults, so a partial TOML file (or none
/// at all) yields a runnable configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub roi: RoiConfig,
    pub rotation: RotationConfig,
    pub scan: ScanConfig,
    pub mapping: MappingConfig,
    pub recording: RecordingConfig,
    pub playback: PlaybackConfig,
    pub transmit: TransmitConfig,
}

impl AppConfig {
    /// Reads and validates a TOML configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        tracing::info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Duration of one full revolution at the configured RPM, in seconds.
    pub fn rotation_period(&self) -> f64 {
        60.0 / self.rotation.rpm
    }

    /// Checks cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let rotation = &self.rotation;
        if !rotation.rpm.is_finite() || rotation.rpm <= 0.0 {
            return Err(invalid(format!("rpm must be positive, got {}", rotation.rpm)));
        }
        if !(rotation.smoothing > 0.0 && rotation.smoothing <= 1.0) {
            return Err(invalid("rotation.smoothing must be in (0, 1]".to_string()));
        }
        if !(0.0..=1.0).contains(&rotation.confidence_threshold) {
            return Err(invalid(
                "rotation.confidence_threshold must be in [0, 1]".to_string(),
            ));
        }
        if rotation.low_confidence_limit == 0 {
            return Err(invalid("rotation.low_confidence_limit must be at least 1".to_string()));
        }
        if rotation.angular_bins < 8 || rotation.ring_samples == 0 {
            return Err(invalid(
                "rotation.angular_bins must be >= 8 and ring_samples >= 1".to_string(),
            ));
        }

        if self.scan.sample_count < 2 {
            return Err(invalid("scan.sample_count must be at least 2".to_string()));
        }

        if self.roi.warmup_frames == 0 {
            return Err(invalid("roi.warmup_frames must be at least 1".to_string()));
        }
        if self.roi.marker_min_area > self.roi.marker_max_area {
            return Err(invalid("roi.marker_min_area exceeds marker_max_area".to_string()));
        }

        let mapping = &self.mapping;
        if mapping.velocity_min > mapping.velocity_max || mapping.velocity_max > 127 {
            return Err(invalid(format!(
                "velocity range [{}, {}] must be ordered and within 0..=127",
                mapping.velocity_min, mapping.velocity_max
            )));
        }
        if !(mapping.duration_min >= 0.0 && mapping.duration_min <= mapping.duration_max) {
            return Err(invalid(format!(
                "duration range [{}, {}] must be ordered and non-negative",
                mapping.duration_min, mapping.duration_max
            )));
        }
        ScaleTable::resolve(&mapping.scale, &mapping.custom_scales)?;

        if let Some(window) = self.recording.window_seconds {
            if !window.is_finite() || window <= 0.0 {
                return Err(invalid("recording.window_seconds must be positive".to_string()));
            }
        }

        if self.transmit.every_n_cycles == 0 {
            return Err(invalid("transmit.every_n_cycles must be at least 1".to_string()));
        }

        Ok(())
    }
}

fn invalid(message: String) -> SonifierError {
    SonifierError::InvalidConfig(message)
}

/// Region-of-interest acquisition settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoiConfig {
    pub mode: RoiMode,
    pub manual_circle: Option<CircleGeometry>,
    pub manual_rect: Option<RectGeometry>,
    /// Skip detection and use the manual geometry straight away.
    pub prefer_manual: bool,
    /// Consecutive frames a marker must be seen in before the center is accepted.
    pub warmup_frames: usize,
    pub marker_threshold: u8,
    pub marker_min_area: u32,
    pub marker_max_area: u32,
    /// Fraction of each frame dimension, centered, searched for the marker.
    pub search_fraction: f32,
    /// Maximum distance in pixels between a warm-up candidate and the mean.
    pub stability_tolerance: f32,
    /// Gap in pixels between the marker edge and the first radial sample.
    pub inner_margin: f32,
}

impl Default for RoiConfig {
    fn default() -> Self {
        Self {
            mode: RoiMode::Circular,
            manual_circle: None,
            manual_rect: None,
            prefer_manual: false,
            warmup_frames: 5,
            marker_threshold: 240,
            marker_min_area: 4,
            marker_max_area: 2_500,
            search_fraction: 0.5,
            stability_tolerance: 3.0,
            inner_margin: 4.0,
        }
    }
}

/// Rotation estimation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    pub mode: RotationMode,
    pub rpm: f64,
    /// Weight of the newest RPM measurement in the moving average.
    pub smoothing: f64,
    pub confidence_threshold: f64,
    pub low_confidence_limit: u32,
    pub angular_bins: usize,
    pub ring_samples: usize,
    pub initial_angle: f64,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            mode: RotationMode::Fixed,
            rpm: 2.5,
            smoothing: 0.3,
            confidence_threshold: 0.6,
            low_confidence_limit: 3,
            angular_bins: 360,
            ring_samples: 8,
            initial_angle: 0.0,
        }
    }
}

/// Scanline sampling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub sample_count: usize,
    /// Derive rectangular Zodiac sections from the rotation angle instead of time.
    pub rectangular_rotation_aware: bool,
    /// Height in pixels of a band that sweeps down the rectangle once per
    /// revolution. `None` scans the full height every cycle.
    pub rectangular_window: Option<u32>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            sample_count: 88,
            rectangular_rotation_aware: false,
            rectangular_window: None,
        }
    }
}

/// Brightness-to-note mapping settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MappingConfig {
    pub scale: String,
    pub custom_scales: BTreeMap<String, Vec<NoteSpec>>,
    pub invert: bool,
    pub velocity_min: u8,
    pub velocity_max: u8,
    pub duration_min: f32,
    pub duration_max: f32,
    pub duration_policy: DurationPolicy,
    pub activation_threshold: u8,
    pub below_threshold: ThresholdBehavior,
    pub merge_duplicate_pitches: bool,
    pub max_notes: Option<usize>,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            scale: "pentatonic".to_string(),
            custom_scales: BTreeMap::new(),
            invert: false,
            velocity_min: 32,
            velocity_max: 127,
            duration_min: 0.8,
            duration_max: 1.8,
            duration_policy: DurationPolicy::Linear,
            activation_threshold: 8,
            below_threshold: ThresholdBehavior::Drop,
            merge_duplicate_pitches: true,
            max_notes: None,
        }
    }
}

/// Score recording settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Arm the recorder when a run starts.
    pub enabled: bool,
    pub start: RecordStart,
    pub rearm: RearmPolicy,
    pub session_root: PathBuf,
    /// Recording window for time-based sections; defaults to one rotation period.
    pub window_seconds: Option<f64>,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            start: RecordStart::Immediate,
            rearm: RearmPolicy::Manual,
            session_root: PathBuf::from("data"),
            window_seconds: None,
        }
    }
}

/// Session playback settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub source: PlaybackSource,
}

/// Note transmission settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransmitConfig {
    pub target: String,
    /// Map and transmit on every n-th cycle only.
    pub every_n_cycles: u32,
}

impl Default for TransmitConfig {
    fn default() -> Self {
        Self {
            target: "127.0.0.1:5555".to_string(),
            every_n_cycles: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert!((config.rotation_period() - 24.0).abs() < 1e-9);
        assert_eq!(config.scan.sample_count, 88);
    }

    #[test]
    fn parses_partial_toml() {
        let config: AppConfig = toml::from_str(
            r#"
            [rotation]
            mode = "detected"
            rpm = 4.0

            [mapping]
            scale = "piano"
            duration_policy = { fixed = 1.0 }
            below_threshold = "zero-velocity"

            [roi]
            mode = "rectangular"
            manual_rect = { x = 10, y = 20, width = 30, height = 40 }

            [playback]
            source = "samples"
            "#,
        )
        .unwrap();

        config.validate().unwrap();
        assert_eq!(config.rotation.mode, RotationMode::Detected);
        assert_eq!(config.roi.mode, RoiMode::Rectangular);
        assert_eq!(config.mapping.duration_policy, DurationPolicy::Fixed(1.0));
        assert_eq!(config.mapping.below_threshold, ThresholdBehavior::ZeroVelocity);
        assert_eq!(config.roi.manual_rect.unwrap().height, 40);
        assert_eq!(config.playback.source, PlaybackSource::Samples);
        assert_eq!(config.transmit.every_n_cycles, 1);
    }

    #[test]
    fn rejects_inverted_velocity_range() {
        let mut config = AppConfig::default();
        config.mapping.velocity_min = 100;
        config.mapping.velocity_max = 50;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, SonifierError::InvalidConfig(_)));
    }

    #[test]
    fn rejects_unknown_scale() {
        let mut config = AppConfig::default();
        config.mapping.scale = "bagpipe".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_non_positive_rpm() {
        let mut config = AppConfig::default();
        config.rotation.rpm = 0.0;
        assert!(config.validate().is_err());
    }
}
