use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{config::MappingConfig, scan::SampleSequence, Result, SonifierError};

/// How brightness turns into note length.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DurationPolicy {
    /// Effective brightness mapped linearly onto `[duration_min, duration_max]`.
    #[default]
    Linear,
    /// Constant length in seconds, clamped into the configured range.
    Fixed(f32),
}

/// What happens to samples darker than the activation threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ThresholdBehavior {
    /// No event is produced.
    #[default]
    Drop,
    /// An event is produced with velocity 0.
    ZeroVelocity,
}

/// Note written in a custom scale: a MIDI number or a name such as `"C#4"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NoteSpec {
    Midi(u8),
    Name(String),
}

impl NoteSpec {
    pub fn to_midi(&self) -> Result<u8> {
        match self {
            Self::Midi(number) if *number <= 127 => Ok(*number),
            Self::Midi(number) => Err(SonifierError::InvalidConfig(format!(
                "MIDI note {number} is out of range"
            ))),
            Self::Name(name) => parse_note_name(name),
        }
    }
}

/// Parses scientific pitch notation with C4 = 60 (so C-1 = 0). Accepts `#`
/// and `b` accidentals.
pub fn parse_note_name(name: &str) -> Result<u8> {
    let invalid = || SonifierError::InvalidConfig(format!("invalid note name `{name}`"));
    let mut chars = name.trim().chars();
    let letter = chars.next().ok_or_else(invalid)?;
    let base: i32 = match letter.to_ascii_uppercase() {
        'C' => 0,
        'D' => 2,
        'E' => 4,
        'F' => 5,
        'G' => 7,
        'A' => 9,
        'B' => 11,
        _ => return Err(invalid()),
    };

    let rest = chars.as_str();
    let (accidental, octave) = match rest.chars().next() {
        Some('#') => (1, &rest[1..]),
        Some('b') => (-1, &rest[1..]),
        _ => (0, rest),
    };
    let octave: i32 = octave.parse().map_err(|_| invalid())?;
    let midi = (octave + 1) * 12 + base + accidental;
    u8::try_from(midi)
        .ok()
        .filter(|value| *value <= 127)
        .ok_or_else(invalid)
}

const PENTATONIC_CLASSES: [u8; 5] = [0, 2, 4, 7, 9];
const MAJOR_CLASSES: [u8; 7] = [0, 2, 4, 5, 7, 9, 11];
const WHOLE_TONE_CLASSES: [u8; 6] = [0, 2, 4, 6, 8, 10];
const LYDIAN_VOICING: [u8; 23] = [
    24, 36, 43, 48, 52, 55, 57, 59, 62, 64, 67, 69, 71, 74, 76, 79, 81, 83, 86, 88, 90, 91, 93,
];
const PIANO_LOW: u8 = 21;
const PIANO_HIGH: u8 = 108;

/// Ordered note table used for pitch lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleTable {
    name: String,
    notes: Vec<u8>,
}

impl ScaleTable {
    pub fn new(name: impl Into<String>, notes: Vec<u8>) -> Result<Self> {
        let name = name.into();
        if notes.is_empty() {
            return Err(SonifierError::InvalidConfig(format!("scale `{name}` has no notes")));
        }
        Ok(Self { name, notes })
    }

    /// Names accepted by [`ScaleTable::named`].
    pub fn builtin_names() -> &'static [&'static str] {
        &["pentatonic", "piano", "c-major", "c-pentatonic", "c-lydian", "c-whole"]
    }

    /// Looks up a built-in table. Matching ignores case, `-`, `_` and spaces,
    /// so `CPentatonic` and `c_pentatonic` both work.
    pub fn named(name: &str) -> Option<Self> {
        let notes = match normalize(name).as_str() {
            "pentatonic" => keys_in_classes(PIANO_LOW, PIANO_HIGH, &PENTATONIC_CLASSES),
            "piano" | "chromatic" => (PIANO_LOW..=PIANO_HIGH).collect(),
            "cmajor" => keys_in_classes(36, 83, &MAJOR_CLASSES),
            "cpentatonic" => keys_in_classes(36, 81, &PENTATONIC_CLASSES),
            "clydian" => LYDIAN_VOICING.to_vec(),
            "cwhole" => keys_in_classes(36, 82, &WHOLE_TONE_CLASSES),
            _ => return None,
        };
        let canonical = Self::builtin_names()
            .iter()
            .find(|builtin| normalize(builtin) == normalize(name))
            .map_or_else(|| name.to_string(), |builtin| builtin.to_string());
        Some(Self {
            name: canonical,
            notes,
        })
    }

    /// Resolves `name` against the custom scales first, then the built-ins.
    pub fn resolve(name: &str, custom: &BTreeMap<String, Vec<NoteSpec>>) -> Result<Self> {
        if let Some(specs) = custom.get(name) {
            let notes = specs.iter().map(NoteSpec::to_midi).collect::<Result<Vec<_>>>()?;
            return Self::new(name, notes);
        }
        Self::named(name)
            .ok_or_else(|| SonifierError::InvalidConfig(format!("unknown scale `{name}`")))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn notes(&self) -> &[u8] {
        &self.notes
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    /// Pitch for sample `index` of `count`: `notes[floor(index / count * len)]`.
    pub fn pitch_for(&self, index: usize, count: usize) -> u8 {
        let slot = (index * self.notes.len()) / count.max(1);
        self.notes[slot.min(self.notes.len() - 1)]
    }
}

fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, '-' | '_' | ' '))
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn keys_in_classes(low: u8, high: u8, classes: &[u8]) -> Vec<u8> {
    (low..=high).filter(|note| classes.contains(&(note % 12))).collect()
}

/// A single note produced from one brightness sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NoteEvent {
    pub pitch: u8,
    pub velocity: u8,
    /// Seconds.
    pub duration: f32,
    pub timestamp: f64,
}

/// Converts sample sequences into note events.
#[derive(Debug, Clone)]
pub struct NoteMapper {
    config: MappingConfig,
    scale: ScaleTable,
}

impl NoteMapper {
    pub fn new(config: MappingConfig) -> Result<Self> {
        let scale = ScaleTable::resolve(&config.scale, &config.custom_scales)?;
        Ok(Self { config, scale })
    }

    pub fn scale(&self) -> &ScaleTable {
        &self.scale
    }

    /// Switches the active scale. An unknown name leaves the current one in place.
    pub fn set_scale(&mut self, name: &str) -> Result<()> {
        self.scale = ScaleTable::resolve(name, &self.config.custom_scales)?;
        self.config.scale = name.to_string();
        Ok(())
    }

    /// Brightness after the optional inversion.
    pub fn effective(&self, brightness: u8) -> u8 {
        if self.config.invert {
            255 - brightness
        } else {
            brightness
        }
    }

    /// Linear map of effective brightness onto `[velocity_min, velocity_max]`,
    /// truncated toward the minimum.
    pub fn velocity(&self, brightness: u8) -> u8 {
        let min = u32::from(self.config.velocity_min);
        let max = u32::from(self.config.velocity_max.max(self.config.velocity_min));
        let value = min + (max - min) * u32::from(self.effective(brightness)) / 255;
        value.clamp(min, max) as u8
    }

    pub fn duration(&self, brightness: u8) -> f32 {
        let min = self.config.duration_min;
        let max = self.config.duration_max.max(min);
        match self.config.duration_policy {
            DurationPolicy::Linear => {
                min + (max - min) * f32::from(self.effective(brightness)) / 255.0
            }
            DurationPolicy::Fixed(seconds) => seconds.clamp(min, max),
        }
    }

    /// Maps one cycle's samples to note events in pitch-table order.
    pub fn map(&self, samples: &SampleSequence, timestamp: f64) -> Vec<NoteEvent> {
        let count = samples.len();
        let mut events: Vec<NoteEvent> = Vec::with_capacity(count);
        for (index, &brightness) in samples.values().iter().enumerate() {
            let pitch = self.scale.pitch_for(index, count);
            let active = self.effective(brightness) >= self.config.activation_threshold;
            let velocity = match (active, self.config.below_threshold) {
                (true, _) => self.velocity(brightness),
                (false, ThresholdBehavior::Drop) => continue,
                (false, ThresholdBehavior::ZeroVelocity) => 0,
            };
            let event = NoteEvent {
                pitch,
                velocity,
                duration: self.duration(brightness),
                timestamp,
            };

            if self.config.merge_duplicate_pitches {
                if let Some(last) = events.last_mut().filter(|last| last.pitch == pitch) {
                    if event.velocity > last.velocity {
                        *last = event;
                    }
                    continue;
                }
            }
            events.push(event);
        }

        if let Some(limit) = self.config.max_notes {
            keep_loudest(&mut events, limit);
        }
        events
    }
}

/// Keeps the `limit` loudest events without reordering them. Ties favor the
/// earlier event.
fn keep_loudest(events: &mut Vec<NoteEvent>, limit: usize) {
    if events.len() <= limit {
        return;
    }
    let mut ranked: Vec<usize> = (0..events.len()).collect();
    ranked.sort_by(|a, b| events[*b].velocity.cmp(&events[*a].velocity).then(a.cmp(b)));
    let mut keep = vec![false; events.len()];
    for index in ranked.into_iter().take(limit) {
        keep[index] = true;
    }
    let mut flags = keep.into_iter();
    events.retain(|_| flags.next().unwrap_or(false));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper(config: MappingConfig) -> NoteMapper {
        NoteMapper::new(config).unwrap()
    }

    #[test]
    fn builtin_scales_have_expected_shapes() {
        let pentatonic = ScaleTable::named("pentatonic").unwrap();
        assert_eq!(pentatonic.len(), 37);
        assert_eq!(pentatonic.notes().first(), Some(&21));
        assert_eq!(pentatonic.notes().last(), Some(&108));

        let piano = ScaleTable::named("piano").unwrap();
        assert_eq!(piano.len(), 88);

        assert_eq!(ScaleTable::named("CMajor").unwrap().len(), 28);
        assert_eq!(ScaleTable::named("CMajor").unwrap().name(), "c-major");
        assert_eq!(ScaleTable::named("c_pentatonic").unwrap().len(), 20);
        assert_eq!(ScaleTable::named("CWhole").unwrap().len(), 24);
        assert_eq!(ScaleTable::named("c-lydian").unwrap().notes()[22], 93);
        assert!(ScaleTable::named("bagpipe").is_none());
    }

    #[test]
    fn parses_note_names() {
        assert_eq!(parse_note_name("C4").unwrap(), 60);
        assert_eq!(parse_note_name("C#4").unwrap(), 61);
        assert_eq!(parse_note_name("Db4").unwrap(), 61);
        assert_eq!(parse_note_name("A0").unwrap(), 21);
        assert_eq!(parse_note_name("F#6").unwrap(), 90);
        assert_eq!(parse_note_name("C-1").unwrap(), 0);
        assert!(parse_note_name("H2").is_err());
        assert!(parse_note_name("C").is_err());
        assert!(parse_note_name("A9").is_err());
    }

    #[test]
    fn resolves_custom_scales_before_builtins() {
        let mut custom = BTreeMap::new();
        custom.insert(
            "piano".to_string(),
            vec![NoteSpec::Name("C4".into()), NoteSpec::Midi(64)],
        );
        let scale = ScaleTable::resolve("piano", &custom).unwrap();
        assert_eq!(scale.notes(), &[60, 64]);
    }

    #[test]
    fn pitch_index_follows_sample_position() {
        let scale = ScaleTable::named("pentatonic").unwrap();
        assert_eq!(scale.pitch_for(0, 88), 21);
        assert_eq!(scale.pitch_for(87, 88), 108);
        // 44 / 88 * 37 = 18.5
        assert_eq!(scale.pitch_for(44, 88), scale.notes()[18]);
    }

    #[test]
    fn velocity_is_monotonic_and_clamped() {
        let mapper = mapper(MappingConfig::default());
        let mut previous = 0;
        for brightness in 0..=255u8 {
            let velocity = mapper.velocity(brightness);
            assert!((32..=127).contains(&velocity));
            assert!(velocity >= previous);
            previous = velocity;
        }
        assert_eq!(mapper.velocity(0), 32);
        assert_eq!(mapper.velocity(255), 127);

        let inverted = mapper_with(|config| config.invert = true);
        assert_eq!(inverted.velocity(0), 127);
        assert_eq!(inverted.velocity(255), 32);
    }

    fn mapper_with(edit: impl FnOnce(&mut MappingConfig)) -> NoteMapper {
        let mut config = MappingConfig::default();
        edit(&mut config);
        mapper(config)
    }

    #[test]
    fn linear_duration_spans_the_range() {
        let mapper = mapper(MappingConfig::default());
        assert!((mapper.duration(0) - 0.8).abs() < 1e-6);
        assert!((mapper.duration(255) - 1.8).abs() < 1e-6);
        assert!(mapper.duration(100) < mapper.duration(200));
    }

    #[test]
    fn fixed_duration_is_clamped_into_range() {
        let fixed = mapper_with(|config| config.duration_policy = DurationPolicy::Fixed(1.2));
        assert_eq!(fixed.duration(0), 1.2);
        assert_eq!(fixed.duration(255), 1.2);
        let too_long = mapper_with(|config| config.duration_policy = DurationPolicy::Fixed(9.0));
        assert_eq!(too_long.duration(10), 1.8);
    }

    #[test]
    fn threshold_drops_or_silences_dark_samples() {
        let samples = SampleSequence::new(vec![0, 200, 3, 90]);
        let dropping = mapper_with(|config| config.scale = "piano".into());
        let events = dropping.map(&samples, 1.0);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|event| event.velocity > 0 && event.timestamp == 1.0));

        let silencing = mapper_with(|config| {
            config.scale = "piano".into();
            config.below_threshold = ThresholdBehavior::ZeroVelocity;
        });
        let events = silencing.map(&samples, 1.0);
        assert_eq!(events.len(), 4);
        assert_eq!(events[0].velocity, 0);
        assert_eq!(events[2].velocity, 0);
    }

    #[test]
    fn merges_duplicate_pitches_keeping_the_loudest() {
        let samples = SampleSequence::new(vec![50, 200, 100, 90]);
        let mapper = mapper_with(|config| {
            config.scale = "two".into();
            config
                .custom_scales
                .insert("two".into(), vec![NoteSpec::Midi(60), NoteSpec::Midi(72)]);
        });
        let events = mapper.map(&samples, 0.0);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].pitch, 60);
        assert_eq!(events[0].velocity, mapper.velocity(200));
        assert_eq!(events[1].velocity, mapper.velocity(100));
    }

    #[test]
    fn note_cap_keeps_loudest_in_pitch_order() {
        let samples = SampleSequence::new(vec![40, 250, 60, 200, 100]);
        let mapper = mapper_with(|config| {
            config.scale = "piano".into();
            config.max_notes = Some(3);
        });
        let events = mapper.map(&samples, 0.0);
        let pitches: Vec<u8> = events.iter().map(|event| event.pitch).collect();
        let expected: Vec<u8> = [1, 3, 4]
            .iter()
            .map(|index| mapper.scale().pitch_for(*index, 5))
            .collect();
        assert_eq!(pitches, expected);
    }

    #[test]
    fn set_scale_rejects_unknown_names() {
        let mut mapper = mapper(MappingConfig::default());
        assert!(mapper.set_scale("bagpipe").is_err());
        assert_eq!(mapper.scale().name(), "pentatonic");
        mapper.set_scale("piano").unwrap();
        assert_eq!(mapper.scale().len(), 88);
    }
}
