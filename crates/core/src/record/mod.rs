//! First-revolution score recording.
//!
//! The recorder is a small state machine driven once per cycle. It never
//! touches the disk itself: a completed lap is handed back to the caller as
//! a [`ScoreSession`], which [`SessionStore`] persists.

mod store;

use chrono::{DateTime, Utc};
use image::{GrayImage, Luma};
use serde::{Deserialize, Serialize};

use crate::{
    mapping::NoteEvent,
    roi::RoiMode,
    scan::{SampleSequence, ZodiacSection},
    Result, SonifierError,
};

pub use store::{SamplesFile, SessionStore};

/// Tolerance on the accumulated angle when deciding a lap is complete.
const LAP_EPSILON: f64 = 1e-6;

/// When an armed recorder starts its lap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordStart {
    /// On the next processed cycle, at whatever angle the disc is at.
    #[default]
    Immediate,
    /// On the next revolution start (angle wrap or window start).
    NextLap,
}

/// What happens after a lap completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RearmPolicy {
    /// Stop in `Completed`; recording again needs an explicit arm.
    #[default]
    Manual,
    /// Start the next lap on the completing cycle.
    Automatic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecorderState {
    Idle,
    Armed,
    Recording,
    Completed,
}

impl RecorderState {
    pub fn label(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Armed => "armed",
            Self::Recording => "recording",
            Self::Completed => "completed",
        }
    }
}

/// How the end of a lap is decided.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LapMode {
    /// A full 360 degrees of accumulated rotation.
    Angle,
    /// A fixed window in seconds, for geometry that does not follow rotation.
    Window(f64),
}

/// Notes and position of one recorded cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreEntry {
    pub cycle: u64,
    /// Seconds since the lap started.
    pub elapsed: f64,
    pub angle: f64,
    pub section: ZodiacSection,
    pub events: Vec<NoteEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub started_at: DateTime<Utc>,
    pub roi_mode: RoiMode,
    pub scale: String,
    pub rpm: f64,
    /// Length of the recorded lap in seconds.
    pub duration_seconds: f64,
    pub sample_count: usize,
    pub cycles: usize,
}

/// A recorded lap. Immutable once persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreSession {
    pub metadata: SessionMetadata,
    pub entries: Vec<ScoreEntry>,
    /// Raw samples per cycle, stored separately in `samples.json`.
    #[serde(skip)]
    pub samples: Vec<Vec<u8>>,
}

impl ScoreSession {
    /// `<timestamp>_<Mode>_<Scale>_<rpm>rpm`, for humans browsing the
    /// session root.
    pub fn directory_name(&self) -> String {
        let scale: String = self
            .metadata
            .scale
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        format!(
            "{}_{}_{}_{:.1}rpm",
            self.metadata.started_at.format("%Y%m%d_%H%M%S"),
            self.metadata.roi_mode.label(),
            scale,
            self.metadata.rpm
        )
    }

    /// Lays the cycles' samples side by side: one column per cycle in
    /// capture order, first sample at the top.
    pub fn panorama(&self) -> GrayImage {
        let columns = self.samples.len().max(1) as u32;
        let rows = self.samples.iter().map(Vec::len).max().unwrap_or(0).max(1) as u32;
        GrayImage::from_fn(columns, rows, |x, y| {
            let value = self
                .samples
                .get(x as usize)
                .and_then(|column| column.get(y as usize))
                .copied()
                .unwrap_or(0);
            Luma([value])
        })
    }
}

/// Context recorded into the metadata when a lap starts.
#[derive(Debug, Clone, PartialEq)]
pub struct LapContext {
    pub roi_mode: RoiMode,
    pub scale: String,
    pub rpm: f64,
}

/// Everything the recorder needs to know about one processed cycle.
#[derive(Debug, Clone, Copy)]
pub struct CycleCapture<'a> {
    pub cycle: u64,
    pub timestamp: f64,
    pub angle: f64,
    /// Signed rotation since the previous cycle, in degrees.
    pub advance: f64,
    pub section: ZodiacSection,
    /// A new revolution (or recording window) starts on this cycle.
    pub wrapped: bool,
    /// The cycle went through the mapper; unmapped cycles only advance the lap.
    pub mapped: bool,
    pub events: &'a [NoteEvent],
    pub samples: &'a SampleSequence,
}

#[derive(Debug)]
struct Lap {
    started_at: DateTime<Utc>,
    start_timestamp: f64,
    accumulated: f64,
    context: LapContext,
    sample_count: usize,
    entries: Vec<ScoreEntry>,
    samples: Vec<Vec<u8>>,
}

#[derive(Debug)]
pub struct ScoreRecorder {
    start: RecordStart,
    rearm: RearmPolicy,
    lap_mode: LapMode,
    state: RecorderState,
    lap: Option<Lap>,
}

impl ScoreRecorder {
    pub fn new(start: RecordStart, rearm: RearmPolicy, lap_mode: LapMode) -> Self {
        Self {
            start,
            rearm,
            lap_mode,
            state: RecorderState::Idle,
            lap: None,
        }
    }

    pub fn state(&self) -> RecorderState {
        self.state
    }

    /// Armed or recording.
    pub fn is_active(&self) -> bool {
        matches!(self.state, RecorderState::Armed | RecorderState::Recording)
    }

    pub fn set_lap_mode(&mut self, lap_mode: LapMode) {
        self.lap_mode = lap_mode;
    }

    /// Cycles captured so far in the current lap.
    pub fn recorded_cycles(&self) -> usize {
        self.lap.as_ref().map_or(0, |lap| lap.entries.len())
    }

    /// Degrees accumulated in the current lap.
    pub fn progress(&self) -> f64 {
        self.lap.as_ref().map_or(0.0, |lap| lap.accumulated)
    }

    pub fn arm(&mut self) -> Result<()> {
        match self.state {
            RecorderState::Recording => Err(SonifierError::state("arm", "recording")),
            RecorderState::Armed => Ok(()),
            RecorderState::Idle | RecorderState::Completed => {
                self.state = RecorderState::Armed;
                tracing::info!(start = ?self.start, "recording armed");
                Ok(())
            }
        }
    }

    /// Returns to `Idle`, discarding any lap in progress. Returns whether a
    /// lap was discarded.
    pub fn abort(&mut self, reason: &str) -> bool {
        let discarded = self.lap.take();
        if self.state != RecorderState::Idle {
            tracing::info!(
                reason,
                from = self.state.label(),
                cycles = discarded.as_ref().map_or(0, |lap| lap.entries.len()),
                "recording aborted"
            );
        }
        self.state = RecorderState::Idle;
        discarded.is_some()
    }

    /// Feeds one cycle. Returns the finished session when this cycle
    /// completes a lap; the completing cycle itself is not part of it.
    pub fn observe(&mut self, capture: &CycleCapture<'_>, context: &LapContext) -> Option<ScoreSession> {
        match self.state {
            RecorderState::Idle | RecorderState::Completed => None,
            RecorderState::Armed => {
                if self.start == RecordStart::Immediate || capture.wrapped {
                    self.begin(capture, context);
                }
                None
            }
            RecorderState::Recording => {
                let lap = self.lap.as_mut()?;
                lap.accumulated += capture.advance;
                let complete = match self.lap_mode {
                    LapMode::Angle => lap.accumulated >= 360.0 - LAP_EPSILON,
                    LapMode::Window(seconds) => {
                        capture.timestamp - lap.start_timestamp >= seconds - LAP_EPSILON
                    }
                };
                if !complete {
                    lap.push(capture);
                    return None;
                }

                let session = self.lap.take().map(|lap| lap.finish(capture.timestamp));
                if let Some(session) = &session {
                    tracing::info!(
                        cycles = session.entries.len(),
                        duration = session.metadata.duration_seconds,
                        "recording completed"
                    );
                }
                match self.rearm {
                    RearmPolicy::Manual => self.state = RecorderState::Completed,
                    RearmPolicy::Automatic => self.begin(capture, context),
                }
                session
            }
        }
    }

    fn begin(&mut self, capture: &CycleCapture<'_>, context: &LapContext) {
        let mut lap = Lap {
            started_at: Utc::now(),
            start_timestamp: capture.timestamp,
            accumulated: 0.0,
            context: context.clone(),
            sample_count: capture.samples.len(),
            entries: Vec::new(),
            samples: Vec::new(),
        };
        lap.push(capture);
        self.lap = Some(lap);
        self.state = RecorderState::Recording;
        tracing::info!(angle = capture.angle, cycle = capture.cycle, "recording started");
    }
}

impl Lap {
    fn push(&mut self, capture: &CycleCapture<'_>) {
        if !capture.mapped {
            return;
        }
        self.entries.push(ScoreEntry {
            cycle: capture.cycle,
            elapsed: capture.timestamp - self.start_timestamp,
            angle: capture.angle,
            section: capture.section,
            events: capture.events.to_vec(),
        });
        self.samples.push(capture.samples.values().to_vec());
    }

    fn finish(self, end_timestamp: f64) -> ScoreSession {
        let cycles = self.entries.len();
        ScoreSession {
            metadata: SessionMetadata {
                started_at: self.started_at,
                roi_mode: self.context.roi_mode,
                scale: self.context.scale,
                rpm: self.context.rpm,
                duration_seconds: (end_timestamp - self.start_timestamp).max(0.0),
                sample_count: self.sample_count,
                cycles,
            },
            entries: self.entries,
            samples: self.samples,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> LapContext {
        LapContext {
            roi_mode: RoiMode::Circular,
            scale: "pentatonic".to_string(),
            rpm: 4.0,
        }
    }

    /// Drives `recorder` with cycles advancing `step` degrees, starting at
    /// `start_angle`, and returns the sessions it produced.
    fn drive(recorder: &mut ScoreRecorder, start_angle: f64, step: f64, cycles: u64) -> Vec<ScoreSession> {
        let samples = SampleSequence::new(vec![10, 20, 30]);
        let events = [NoteEvent {
            pitch: 60,
            velocity: 90,
            duration: 1.0,
            timestamp: 0.0,
        }];
        let mut sessions = Vec::new();
        let mut angle = start_angle;
        for cycle in 0..cycles {
            let advance = if cycle == 0 { 0.0 } else { step };
            let previous = angle;
            angle = (angle + advance).rem_euclid(360.0);
            let capture = CycleCapture {
                cycle,
                timestamp: cycle as f64 * 0.1,
                angle,
                advance,
                section: ZodiacSection::from_angle(angle),
                wrapped: cycle > 0 && angle < previous,
                mapped: true,
                events: &events,
                samples: &samples,
            };
            sessions.extend(recorder.observe(&capture, &context()));
        }
        sessions
    }

    #[test]
    fn completes_after_a_full_turn_from_any_start() {
        for start in [0.0, 95.0, 359.0] {
            let mut recorder = ScoreRecorder::new(RecordStart::Immediate, RearmPolicy::Manual, LapMode::Angle);
            recorder.arm().unwrap();
            let sessions = drive(&mut recorder, start, 10.0, 40);
            assert_eq!(sessions.len(), 1, "start {start}");
            let session = &sessions[0];
            assert_eq!(session.entries.len(), 36);
            assert!((session.metadata.duration_seconds - 3.6).abs() < 1e-9);
            assert_eq!(recorder.state(), RecorderState::Completed);
        }
    }

    #[test]
    fn next_lap_waits_for_the_wrap() {
        let mut recorder = ScoreRecorder::new(RecordStart::NextLap, RearmPolicy::Manual, LapMode::Angle);
        recorder.arm().unwrap();
        let sessions = drive(&mut recorder, 300.0, 10.0, 60);
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].entries[0].angle, 0.0);
        assert_eq!(sessions[0].entries[0].cycle, 6);
    }

    #[test]
    fn automatic_rearm_records_consecutive_laps() {
        let mut recorder = ScoreRecorder::new(RecordStart::Immediate, RearmPolicy::Automatic, LapMode::Angle);
        recorder.arm().unwrap();
        let sessions = drive(&mut recorder, 0.0, 10.0, 80);
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[1].entries[0].cycle, 36);
        assert_eq!(recorder.state(), RecorderState::Recording);
    }

    #[test]
    fn manual_rearm_needs_an_explicit_arm() {
        let mut recorder = ScoreRecorder::new(RecordStart::Immediate, RearmPolicy::Manual, LapMode::Angle);
        recorder.arm().unwrap();
        assert_eq!(drive(&mut recorder, 0.0, 10.0, 80).len(), 1);
        recorder.arm().unwrap();
        assert_eq!(drive(&mut recorder, 0.0, 10.0, 40).len(), 1);
    }

    #[test]
    fn window_mode_ends_on_elapsed_time() {
        let mut recorder = ScoreRecorder::new(RecordStart::Immediate, RearmPolicy::Manual, LapMode::Window(2.0));
        recorder.arm().unwrap();
        let sessions = drive(&mut recorder, 0.0, 0.0, 30);
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].entries.len(), 20);
    }

    #[test]
    fn abort_discards_the_partial_lap() {
        let mut recorder = ScoreRecorder::new(RecordStart::Immediate, RearmPolicy::Manual, LapMode::Angle);
        recorder.arm().unwrap();
        assert!(drive(&mut recorder, 0.0, 10.0, 10).is_empty());
        assert_eq!(recorder.state(), RecorderState::Recording);
        assert!(recorder.arm().is_err());
        assert!(recorder.abort("test"));
        assert_eq!(recorder.state(), RecorderState::Idle);
        assert_eq!(recorder.recorded_cycles(), 0);
    }

    #[test]
    fn panorama_has_one_column_per_cycle() {
        let session = ScoreSession {
            metadata: SessionMetadata {
                started_at: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
                roi_mode: RoiMode::Rectangular,
                scale: "c lydian".into(),
                rpm: 2.5,
                duration_seconds: 1.0,
                sample_count: 2,
                cycles: 3,
            },
            entries: Vec::new(),
            samples: vec![vec![1, 2], vec![3, 4], vec![5, 6]],
        };
        let panorama = session.panorama();
        assert_eq!(panorama.dimensions(), (3, 2));
        assert_eq!(panorama.get_pixel(1, 0).0[0], 3);
        assert_eq!(panorama.get_pixel(2, 1).0[0], 6);
        assert_eq!(session.directory_name(), "20231114_221320_Rectangular_c_lydian_2.5rpm");
    }
}
