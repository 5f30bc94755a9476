//! The processing loop and its control surface.
//!
//! [`Engine`] owns every component and the run-state machine. Control
//! commands either go through [`Engine::apply`] directly or through a
//! [`CommandSender`], in which case they are applied at the start of the next
//! cycle so a cycle never sees half-applied state.

use std::{fmt, path::PathBuf, sync::Arc};

use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};

use crate::{
    config::AppConfig,
    frame::{Frame, FrameSource},
    mapping::{NoteEvent, NoteMapper},
    playback::{PlaybackMode, PlaybackSource, ScorePlayer},
    record::{CycleCapture, LapContext, LapMode, RecorderState, ScoreRecorder, SessionStore},
    roi::{Roi, RoiMode, RoiTracker, TrackerStatus},
    rotation::{RotationEstimator, RotationMode, RotationState, RotationUpdate},
    scan::{build_scan, ScanGeometry, ZodiacSection},
    transmit::{NoteBatch, Transmitter},
    Result, SonifierError,
};

/// Start/stop state of the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Idle,
    Running,
    /// A stop was requested; the next cycle returns the engine to `Idle`.
    Stopping,
}

impl RunState {
    pub fn label(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Stopping => "stopping",
        }
    }

    /// Only `Idle -> Running -> Stopping -> Idle` is allowed.
    pub fn can_transition(self, next: RunState) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Running) | (Self::Running, Self::Stopping) | (Self::Stopping, Self::Idle)
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Start,
    Stop,
    SwitchMode(RoiMode),
    Retrack,
    ResetReference,
    ArmRecording,
    DisarmRecording,
    LoadSession(PathBuf),
    TogglePlayback,
    SetScale(String),
    SetManualRoi(Roi),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::SwitchMode(_) => "switch mode",
            Self::Retrack => "retrack",
            Self::ResetReference => "reset reference",
            Self::ArmRecording => "arm recording",
            Self::DisarmRecording => "disarm recording",
            Self::LoadSession(_) => "load session",
            Self::TogglePlayback => "toggle playback",
            Self::SetScale(_) => "set scale",
            Self::SetManualRoi(_) => "set manual roi",
        }
    }
}

/// Cloneable handle that queues commands for the next cycle boundary.
#[derive(Debug, Clone)]
pub struct CommandSender {
    sender: Sender<Command>,
}

impl CommandSender {
    pub fn send(&self, command: Command) -> Result<()> {
        self.sender
            .send(command)
            .map_err(|_| SonifierError::msg("engine command queue is closed"))
    }
}

/// Outcome of a queued command, reported with the cycle that applied it.
#[derive(Debug)]
pub struct CommandResult {
    pub command: &'static str,
    pub result: Result<()>,
}

/// What happened during one cycle.
#[derive(Debug)]
pub struct CycleReport {
    pub run_state: RunState,
    pub mode: PlaybackMode,
    /// Index of the cycle within the current run; `None` when not running.
    pub cycle: Option<u64>,
    pub roi: Option<TrackerStatus>,
    pub rotation: Option<RotationUpdate>,
    pub section: Option<ZodiacSection>,
    pub events: Vec<NoteEvent>,
    pub transmitted: bool,
    pub recorder: RecorderState,
    /// Degrees accumulated in the lap being recorded.
    pub lap_progress: f64,
    pub persisted: Option<PathBuf>,
    pub commands: Vec<CommandResult>,
}

/// Totals from [`Engine::drive`].
#[derive(Debug, Default, Clone)]
pub struct RunSummary {
    pub cycles: usize,
    pub batches: usize,
    pub no_center: usize,
    pub sessions: Vec<PathBuf>,
}

pub struct Engine {
    config: AppConfig,
    run_state: RunState,
    tracker: RoiTracker,
    rotation: RotationEstimator,
    scan: Option<Box<dyn ScanGeometry>>,
    scan_generation: u64,
    mapper: NoteMapper,
    recorder: ScoreRecorder,
    store: SessionStore,
    player: ScorePlayer,
    transmitter: Box<dyn Transmitter>,
    commands: Receiver<Command>,
    sender: Sender<Command>,
    cycle: u64,
    run_started: Option<f64>,
    previous_angle: Option<f64>,
    previous_phase: Option<f64>,
    pending_retrack: bool,
    /// Acquire a fresh ROI from the next frame.
    pending_init: bool,
    last_session: Option<PathBuf>,
}

impl Engine {
    pub fn new(config: AppConfig, transmitter: Box<dyn Transmitter>) -> Result<Self> {
        config.validate()?;
        let mapper = NoteMapper::new(config.mapping.clone())?;
        let (sender, commands) = crossbeam_channel::unbounded();
        let recording = &config.recording;
        Ok(Self {
            run_state: RunState::Idle,
            tracker: RoiTracker::new(config.roi.clone()),
            rotation: RotationEstimator::new(config.rotation.clone()),
            scan: None,
            scan_generation: 0,
            mapper,
            recorder: ScoreRecorder::new(recording.start, recording.rearm, LapMode::Angle),
            store: SessionStore::new(recording.session_root.clone()),
            player: ScorePlayer::new(),
            transmitter,
            commands,
            sender,
            cycle: 0,
            run_started: None,
            previous_angle: None,
            previous_phase: None,
            pending_retrack: false,
            pending_init: false,
            last_session: None,
            config,
        })
    }

    pub fn handle(&self) -> CommandSender {
        CommandSender {
            sender: self.sender.clone(),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn run_state(&self) -> RunState {
        self.run_state
    }

    pub fn playback_mode(&self) -> PlaybackMode {
        self.player.mode()
    }

    pub fn recorder_state(&self) -> RecorderState {
        self.recorder.state()
    }

    pub fn rotation_state(&self) -> &RotationState {
        self.rotation.state()
    }

    pub fn roi(&self) -> Option<Roi> {
        self.tracker.roi()
    }

    pub fn roi_mode(&self) -> RoiMode {
        self.tracker.mode()
    }

    pub fn scale_name(&self) -> &str {
        self.mapper.scale().name()
    }

    pub fn player(&self) -> &ScorePlayer {
        &self.player
    }

    /// Directory of the most recently persisted session.
    pub fn last_session(&self) -> Option<&PathBuf> {
        self.last_session.as_ref()
    }

    /// Validates and applies one command. A rejected command has no effect.
    pub fn apply(&mut self, command: Command) -> Result<()> {
        let name = command.name();
        let result = self.apply_inner(command);
        if let Err(err) = &result {
            tracing::warn!(command = name, error = %err, "command rejected");
        }
        result
    }

    fn apply_inner(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Start => {
                self.transition(RunState::Running, "start")?;
                self.rotation.reset();
                self.cycle = 0;
                self.run_started = None;
                self.previous_angle = None;
                self.previous_phase = None;
                self.pending_init = self.tracker.roi().is_none();
                if self.config.recording.enabled && self.player.mode() == PlaybackMode::Live {
                    self.recorder.arm()?;
                }
                tracing::info!(mode = self.tracker.mode().label(), scale = self.scale_name(), "run started");
                Ok(())
            }
            Command::Stop => {
                self.transition(RunState::Stopping, "stop")?;
                // A partial lap is dropped, never persisted.
                self.recorder.abort("stop requested");
                tracing::info!("stop requested");
                Ok(())
            }
            Command::SwitchMode(mode) => {
                if mode == self.tracker.mode() {
                    return Ok(());
                }
                self.abort_recording("ROI mode switched");
                self.tracker.switch_mode(mode);
                self.discard_geometry();
                self.pending_init = true;
                Ok(())
            }
            Command::Retrack => {
                self.abort_recording("retrack requested");
                self.pending_retrack = true;
                Ok(())
            }
            Command::ResetReference => {
                if self.rotation.mode() == RotationMode::Fixed {
                    return Err(SonifierError::state("reset reference", "rotation speed is fixed"));
                }
                self.rotation.reset_reference();
                Ok(())
            }
            Command::ArmRecording => {
                if self.player.mode() == PlaybackMode::Playing {
                    return Err(SonifierError::state("arm recording", "playing back a session"));
                }
                self.recorder.arm()
            }
            Command::DisarmRecording => {
                if !self.recorder.is_active() {
                    return Err(SonifierError::state(
                        "disarm recording",
                        format!("recorder is {}", self.recorder.state().label()),
                    ));
                }
                self.recorder.abort("disarmed");
                Ok(())
            }
            Command::LoadSession(path) => {
                if self.run_state != RunState::Idle {
                    return Err(SonifierError::state("load session", self.run_state.label()));
                }
                let session = SessionStore::load(&path)?;
                if self.config.playback.source == PlaybackSource::Samples
                    && session.samples.len() != session.entries.len()
                {
                    tracing::warn!(
                        entries = session.entries.len(),
                        samples = session.samples.len(),
                        "session lacks samples for some entries, those replay their stored notes"
                    );
                }
                self.player.load(Arc::new(session));
                Ok(())
            }
            Command::TogglePlayback => {
                if self.player.mode() == PlaybackMode::Live && self.recorder.is_active() {
                    return Err(SonifierError::state(
                        "toggle playback",
                        format!("recorder is {}", self.recorder.state().label()),
                    ));
                }
                self.player.toggle()?;
                Ok(())
            }
            Command::SetScale(name) => {
                if self.recorder.state() == RecorderState::Recording {
                    return Err(SonifierError::state("set scale", "recording"));
                }
                self.mapper.set_scale(&name)?;
                tracing::info!(scale = self.scale_name(), "scale changed");
                Ok(())
            }
            Command::SetManualRoi(roi) => {
                self.abort_recording("manual ROI installed");
                self.pending_init = false;
                self.tracker.set_manual(roi);
                Ok(())
            }
        }
    }

    fn transition(&mut self, next: RunState, command: &'static str) -> Result<()> {
        if !self.run_state.can_transition(next) {
            return Err(SonifierError::state(command, self.run_state.label()));
        }
        tracing::debug!(from = self.run_state.label(), to = next.label(), "run state transition");
        self.run_state = next;
        Ok(())
    }

    /// Drops straight to Idle. Only a persistence failure does this; every
    /// other stop goes through Stopping.
    fn force_idle(&mut self, reason: &str) {
        self.recorder.abort(reason);
        self.pending_retrack = false;
        self.pending_init = false;
        tracing::debug!(from = self.run_state.label(), reason, "forced to idle");
        self.run_state = RunState::Idle;
    }

    fn abort_recording(&mut self, reason: &str) {
        if self.recorder.state() == RecorderState::Recording {
            self.recorder.abort(reason);
        }
    }

    fn discard_geometry(&mut self) {
        self.scan = None;
        self.previous_angle = None;
        self.previous_phase = None;
        if self.rotation.mode() == RotationMode::Detected {
            self.rotation.reset_reference();
        }
    }

    /// Applies every queued command, in order.
    fn drain_commands(&mut self) -> Vec<CommandResult> {
        let mut results = Vec::new();
        while let Ok(command) = self.commands.try_recv() {
            let name = command.name();
            results.push(CommandResult {
                command: name,
                result: self.apply(command),
            });
        }
        results
    }

    /// Applies queued commands and finishes a pending stop without a frame.
    pub fn settle(&mut self) -> Vec<CommandResult> {
        let results = self.drain_commands();
        if self.run_state == RunState::Stopping {
            self.finish_stop();
        }
        results
    }

    fn finish_stop(&mut self) {
        self.recorder.abort("stopped");
        self.pending_retrack = false;
        self.pending_init = false;
        if self.transition(RunState::Idle, "stop").is_ok() {
            tracing::info!(cycles = self.cycle, "run stopped");
        }
    }

    /// Runs one processing cycle on `frame`.
    pub fn cycle(&mut self, frame: &Frame) -> Result<CycleReport> {
        let commands = self.drain_commands();
        let mut report = CycleReport {
            run_state: self.run_state,
            mode: self.player.mode(),
            cycle: None,
            roi: None,
            rotation: None,
            section: None,
            events: Vec::new(),
            transmitted: false,
            recorder: self.recorder.state(),
            lap_progress: self.recorder.progress(),
            persisted: None,
            commands,
        };

        match self.run_state {
            RunState::Idle => return Ok(report),
            RunState::Stopping => {
                self.finish_stop();
                report.run_state = self.run_state;
                report.recorder = self.recorder.state();
                report.lap_progress = self.recorder.progress();
                return Ok(report);
            }
            RunState::Running => {}
        }

        let cycle = self.cycle;
        self.cycle += 1;
        report.cycle = Some(cycle);
        let timestamp = frame.timestamp();
        let run_started = *self.run_started.get_or_insert(timestamp);

        if self.player.mode() == PlaybackMode::Playing {
            report.events = self
                .player
                .replay(timestamp, self.config.playback.source, &self.mapper);
            report.transmitted = self.transmit(&report.events);
            return Ok(report);
        }

        let initialize = std::mem::take(&mut self.pending_init);
        let status = if std::mem::take(&mut self.pending_retrack) {
            self.tracker.retrack(frame)
        } else if initialize {
            match self.tracker.initialize(self.tracker.mode(), frame) {
                Ok(status) => status,
                Err(err) => {
                    tracing::warn!(error = %err, "ROI initialization failed, retrying on later frames");
                    TrackerStatus::NoCenter
                }
            }
        } else {
            self.tracker.observe(frame)
        };
        report.roi = Some(status);
        self.refresh_geometry();

        let ring = match (self.rotation.mode(), self.tracker.roi()) {
            (RotationMode::Detected, Some(roi)) => Some(roi.ring()),
            _ => None,
        };
        let update = self.rotation.update(frame, ring.as_ref())?;
        report.rotation = Some(update);

        let Some(scan) = self.scan.as_ref() else {
            tracing::debug!(cycle, ?status, "no ROI yet");
            return Ok(report);
        };

        let elapsed = timestamp - run_started;
        let samples = scan.sample(frame, &update.state);
        let section = scan.section_index(&update.state, elapsed);
        let wrapped = if scan.rotation_aware() {
            let wrapped = update.advance > 0.0
                && self.previous_angle.is_some_and(|previous| update.state.angle < previous);
            self.previous_angle = Some(update.state.angle);
            wrapped
        } else {
            let phase = elapsed.rem_euclid(self.recording_window());
            let wrapped = self.previous_phase.is_some_and(|previous| phase < previous);
            self.previous_phase = Some(phase);
            wrapped
        };
        report.section = Some(section);

        let every = u64::from(self.config.transmit.every_n_cycles.max(1));
        let mapped = cycle % every == 0;
        if mapped {
            report.events = self.mapper.map(&samples, timestamp);
            report.transmitted = self.transmit(&report.events);
        }

        if self.recorder.is_active() {
            let context = LapContext {
                roi_mode: self.tracker.mode(),
                scale: self.mapper.scale().name().to_string(),
                rpm: update.state.rpm,
            };
            let capture = CycleCapture {
                cycle,
                timestamp,
                angle: update.state.angle,
                advance: update.advance,
                section,
                wrapped,
                mapped,
                events: &report.events,
                samples: &samples,
            };
            if let Some(session) = self.recorder.observe(&capture, &context) {
                match self.store.persist(&session) {
                    Ok(path) => {
                        self.last_session = Some(path.clone());
                        report.persisted = Some(path);
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "session persistence failed, returning to idle");
                        self.force_idle("persistence failed");
                        return Err(err);
                    }
                }
            }
        }
        report.recorder = self.recorder.state();
        report.lap_progress = self.recorder.progress();

        tracing::debug!(
            cycle,
            angle = update.state.angle,
            rpm = update.state.rpm,
            section = section.index(),
            notes = report.events.len(),
            recorder = report.recorder.label(),
            "cycle complete"
        );
        Ok(report)
    }

    /// Pulls frames from `source` until it runs dry or `limit` cycles ran.
    pub fn drive(&mut self, source: &mut dyn FrameSource, limit: usize) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        while summary.cycles < limit {
            let Some(frame) = source.next_frame()? else {
                break;
            };
            let report = self.cycle(&frame)?;
            summary.cycles += 1;
            summary.batches += usize::from(report.transmitted);
            if report.roi == Some(TrackerStatus::NoCenter) {
                summary.no_center += 1;
            }
            summary.sessions.extend(report.persisted);
        }
        Ok(summary)
    }

    /// Rebuilds the scan geometry when the tracker replaced the ROI.
    fn refresh_geometry(&mut self) {
        let generation = self.tracker.generation();
        if generation == self.scan_generation {
            return;
        }
        self.scan_generation = generation;
        self.abort_recording("ROI replaced");
        self.discard_geometry();

        if let Some(roi) = self.tracker.roi() {
            let scan = build_scan(&roi, &self.config.scan, self.config.rotation_period());
            let lap_mode = if scan.rotation_aware() {
                LapMode::Angle
            } else {
                LapMode::Window(self.recording_window())
            };
            self.recorder.set_lap_mode(lap_mode);
            tracing::info!(?roi, samples = scan.sample_count(), "scan geometry ready");
            self.scan = Some(scan);
        }
    }

    fn recording_window(&self) -> f64 {
        self.config
            .recording
            .window_seconds
            .unwrap_or_else(|| self.config.rotation_period())
    }

    fn transmit(&mut self, events: &[NoteEvent]) -> bool {
        let Some(batch) = NoteBatch::from_events(events) else {
            return false;
        };
        match self.transmitter.send(&batch) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(error = %err, notes = batch.len(), "transmit failed");
                false
            }
        }
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("run_state", &self.run_state)
            .field("mode", &self.player.mode())
            .field("roi", &self.tracker.roi())
            .field("rotation", self.rotation.state())
            .field("recorder", &self.recorder.state())
            .field("scale", &self.mapper.scale().name())
            .field("cycle", &self.cycle)
            .finish()
    }
}
