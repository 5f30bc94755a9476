use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    mapping::{NoteEvent, NoteMapper},
    record::{ScoreEntry, ScoreSession},
    scan::SampleSequence,
    Result, SonifierError,
};

/// Slack when comparing entry offsets against the loop clock.
const CLOCK_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlaybackMode {
    /// Notes come from the live sampling pipeline.
    #[default]
    Live,
    /// Notes come from the loaded session.
    Playing,
}

/// Where replayed notes come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlaybackSource {
    /// The notes stored with each entry, exactly as they were sent live.
    #[default]
    Events,
    /// The entry's raw samples, mapped again through the current scale.
    /// Entries without samples fall back to their stored notes.
    Samples,
}

#[derive(Debug, Default, Clone)]
pub struct PlaybackClock {
    pub time_seconds: f64,
}

impl PlaybackClock {
    pub fn reset(&mut self) {
        self.time_seconds = 0.0;
    }

    pub fn advance(&mut self, delta: f64) {
        self.time_seconds = (self.time_seconds + delta).max(0.0);
    }
}

/// Loaded session plus the position within it.
#[derive(Debug, Default, Clone)]
pub struct PlaybackState {
    session: Option<Arc<ScoreSession>>,
    cursor: usize,
    enabled: bool,
}

impl PlaybackState {
    pub fn session(&self) -> Option<&Arc<ScoreSession>> {
        self.session.as_ref()
    }

    /// Index of the next entry to emit.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

/// Replays a recorded session in an endless loop, paced by the entries'
/// capture offsets.
#[derive(Debug, Default)]
pub struct ScorePlayer {
    state: PlaybackState,
    clock: PlaybackClock,
    last_timestamp: Option<f64>,
    loops: u64,
}

impl ScorePlayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &PlaybackState {
        &self.state
    }

    pub fn mode(&self) -> PlaybackMode {
        if self.state.enabled {
            PlaybackMode::Playing
        } else {
            PlaybackMode::Live
        }
    }

    /// Completed passes through the session since playback was enabled.
    pub fn loops(&self) -> u64 {
        self.loops
    }

    /// Replaces the loaded session. Playback stays disabled until toggled.
    pub fn load(&mut self, session: Arc<ScoreSession>) {
        tracing::info!(
            entries = session.entries.len(),
            scale = %session.metadata.scale,
            rpm = session.metadata.rpm,
            "session ready for playback"
        );
        self.state = PlaybackState {
            session: Some(session),
            cursor: 0,
            enabled: false,
        };
        self.rewind();
    }

    /// Switches between Live and Playing. Enabling always starts from the
    /// first entry.
    pub fn toggle(&mut self) -> Result<PlaybackMode> {
        if self.state.session.is_none() {
            return Err(SonifierError::state("toggle playback", "no session is loaded"));
        }
        self.state.enabled = !self.state.enabled;
        if self.state.enabled {
            self.rewind();
        }
        let mode = self.mode();
        tracing::info!(?mode, "playback toggled");
        Ok(mode)
    }

    pub fn rewind(&mut self) {
        self.state.cursor = 0;
        self.clock.reset();
        self.last_timestamp = None;
        self.loops = 0;
    }

    /// Moves the loop clock to `timestamp` and returns every entry that
    /// became due, in order.
    pub fn advance(&mut self, timestamp: f64) -> Vec<ScoreEntry> {
        let Some(session) = self.state.session.clone() else {
            return Vec::new();
        };
        self.advance_indices(timestamp)
            .into_iter()
            .filter_map(|index| session.entries.get(index).cloned())
            .collect()
    }

    /// Advances like [`ScorePlayer::advance`] and resolves the due entries
    /// into notes according to `source`.
    pub fn replay(&mut self, timestamp: f64, source: PlaybackSource, mapper: &NoteMapper) -> Vec<NoteEvent> {
        let Some(session) = self.state.session.clone() else {
            return Vec::new();
        };
        let mut events = Vec::new();
        for index in self.advance_indices(timestamp) {
            let Some(entry) = session.entries.get(index) else {
                continue;
            };
            match (source, session.samples.get(index)) {
                (PlaybackSource::Samples, Some(row)) => {
                    events.extend(mapper.map(&SampleSequence::new(row.clone()), timestamp));
                }
                _ => events.extend(entry.events.iter().cloned()),
            }
        }
        events
    }

    /// Indices of the entries that became due at `timestamp`. After the
    /// last entry the loop wraps once the session's recorded duration has
    /// elapsed; laps missed during a long gap are skipped rather than
    /// replayed.
    fn advance_indices(&mut self, timestamp: f64) -> Vec<usize> {
        let Some(session) = self.state.session.clone().filter(|_| self.state.enabled) else {
            return Vec::new();
        };
        if let Some(last) = self.last_timestamp {
            self.clock.advance(timestamp - last);
        }
        self.last_timestamp = Some(timestamp);

        let entries = &session.entries;
        let duration = session.metadata.duration_seconds;
        let mut due = Vec::new();
        loop {
            while let Some(entry) = entries.get(self.state.cursor) {
                if entry.elapsed > self.clock.time_seconds + CLOCK_EPSILON {
                    break;
                }
                due.push(self.state.cursor);
                self.state.cursor += 1;
            }
            if self.state.cursor < entries.len() {
                break;
            }
            if duration <= CLOCK_EPSILON {
                self.wrap(0.0);
                break;
            }
            if self.clock.time_seconds < duration - CLOCK_EPSILON {
                break;
            }
            let overshoot = (self.clock.time_seconds - duration).max(0.0);
            self.wrap(overshoot.rem_euclid(duration));
        }
        due
    }

    fn wrap(&mut self, clock: f64) {
        self.state.cursor = 0;
        self.clock.time_seconds = clock;
        self.loops += 1;
        tracing::debug!(loops = self.loops, "playback loop wrapped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::MappingConfig,
        record::SessionMetadata,
        roi::RoiMode,
        scan::ZodiacSection,
    };
    use chrono::Utc;

    fn session(entries: usize, step: f64) -> Arc<ScoreSession> {
        Arc::new(ScoreSession {
            metadata: SessionMetadata {
                started_at: Utc::now(),
                roi_mode: RoiMode::Circular,
                scale: "piano".into(),
                rpm: 4.0,
                duration_seconds: entries as f64 * step,
                sample_count: 1,
                cycles: entries,
            },
            entries: (0..entries)
                .map(|index| ScoreEntry {
                    cycle: index as u64,
                    elapsed: index as f64 * step,
                    angle: 0.0,
                    section: ZodiacSection::new(0),
                    events: vec![NoteEvent {
                        pitch: 40 + index as u8,
                        velocity: 64,
                        duration: 1.0,
                        timestamp: index as f64 * step,
                    }],
                })
                .collect(),
            samples: Vec::new(),
        })
    }

    fn cycles(entries: &[ScoreEntry]) -> Vec<u64> {
        entries.iter().map(|entry| entry.cycle).collect()
    }

    #[test]
    fn toggle_requires_a_session() {
        let mut player = ScorePlayer::new();
        assert!(matches!(
            player.toggle(),
            Err(SonifierError::StateViolation { .. })
        ));
        player.load(session(3, 0.5));
        assert_eq!(player.toggle().unwrap(), PlaybackMode::Playing);
        assert_eq!(player.toggle().unwrap(), PlaybackMode::Live);
    }

    #[test]
    fn plays_at_capture_pace_and_loops() {
        let mut player = ScorePlayer::new();
        player.load(session(3, 0.5));
        player.toggle().unwrap();

        let mut emitted = Vec::new();
        for tick in 0..12 {
            emitted.push(cycles(&player.advance(10.0 + tick as f64 * 0.25)));
        }
        assert_eq!(emitted[0], vec![0]);
        assert_eq!(emitted[1], Vec::<u64>::new());
        assert_eq!(emitted[2], vec![1]);
        assert_eq!(emitted[4], vec![2]);
        assert_eq!(emitted[6], vec![0]);
        assert_eq!(emitted[8], vec![1]);
        assert_eq!(player.loops(), 1);
    }

    #[test]
    fn consecutive_loops_are_identical() {
        let mut player = ScorePlayer::new();
        player.load(session(5, 1.0 / 30.0));
        player.toggle().unwrap();

        let mut laps: Vec<Vec<NoteEvent>> = vec![Vec::new(), Vec::new()];
        for frame in 0..10 {
            let due = player.advance(frame as f64 / 30.0);
            let lap = (frame / 5) as usize;
            laps[lap].extend(due.into_iter().flat_map(|entry| entry.events));
        }
        assert_eq!(laps[0].len(), 5);
        assert_eq!(laps[0], laps[1]);
    }

    #[test]
    fn long_gaps_skip_missed_laps() {
        let mut player = ScorePlayer::new();
        player.load(session(2, 1.0));
        player.toggle().unwrap();
        assert_eq!(cycles(&player.advance(0.0)), vec![0]);
        assert_eq!(cycles(&player.advance(1.0)), vec![1]);
        // 9.5 s later: several laps elapsed, clock lands half way into entry 0.
        assert_eq!(cycles(&player.advance(10.5)), vec![0]);
        assert_eq!(cycles(&player.advance(11.0)), vec![1]);
    }

    #[test]
    fn disabled_player_emits_nothing() {
        let mut player = ScorePlayer::new();
        player.load(session(2, 1.0));
        assert!(player.advance(0.0).is_empty());
        assert_eq!(player.mode(), PlaybackMode::Live);
    }

    #[test]
    fn sample_source_remaps_through_the_current_scale() {
        let rows = vec![vec![0, 90, 180, 255], vec![255, 255, 40, 10]];
        let mut recorded = (*session(2, 1.0)).clone();
        recorded.samples = rows.clone();
        recorded.metadata.sample_count = 4;
        let recorded = Arc::new(recorded);
        let mapper = NoteMapper::new(MappingConfig {
            scale: "c-major".into(),
            ..MappingConfig::default()
        })
        .unwrap();

        let mut player = ScorePlayer::new();
        player.load(recorded.clone());
        player.toggle().unwrap();
        let remapped = player.replay(0.0, PlaybackSource::Samples, &mapper);
        assert_eq!(remapped, mapper.map(&SampleSequence::new(rows[0].clone()), 0.0));
        assert_ne!(remapped, recorded.entries[0].events);

        player.toggle().unwrap();
        player.toggle().unwrap();
        assert_eq!(
            player.replay(0.0, PlaybackSource::Events, &mapper),
            recorded.entries[0].events
        );
    }

    #[test]
    fn sample_source_falls_back_to_stored_notes() {
        let mapper = NoteMapper::new(MappingConfig::default()).unwrap();
        let mut player = ScorePlayer::new();
        let recorded = session(2, 1.0);
        player.load(recorded.clone());
        player.toggle().unwrap();
        assert_eq!(
            player.replay(0.0, PlaybackSource::Samples, &mapper),
            recorded.entries[0].events
        );
    }

    #[test]
    fn re_enabling_rewinds() {
        let mut player = ScorePlayer::new();
        player.load(session(3, 1.0));
        player.toggle().unwrap();
        player.advance(0.0);
        player.advance(1.0);
        assert_eq!(player.state().cursor(), 2);
        player.toggle().unwrap();
        player.toggle().unwrap();
        assert_eq!(player.state().cursor(), 0);
        assert_eq!(cycles(&player.advance(50.0)), vec![0]);
    }
}
