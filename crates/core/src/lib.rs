//! Core library for the Turntable Sonifier.
//!
//! Camera frames of a rotating turntable go in, note batches come out. Each
//! module owns one stage of that path: ROI acquisition, rotation estimation,
//! scanline sampling, note mapping, score recording and playback, and
//! transmission. [`Engine`] ties the stages together behind a small command
//! surface.

pub mod config;
pub mod engine;
pub mod error;
pub mod frame;
pub mod mapping;
pub mod playback;
pub mod record;
pub mod roi;
pub mod rotation;
pub mod scan;
pub mod transmit;

pub use config::AppConfig;
pub use engine::{Command, CommandSender, CycleReport, Engine, RunState, RunSummary};
pub use error::{Result, SonifierError};
pub use frame::{Frame, FrameSlot, FrameSource, SyntheticFeed, SyntheticTurntable};
pub use mapping::{NoteEvent, NoteMapper, ScaleTable};
pub use playback::{PlaybackMode, PlaybackSource, ScorePlayer};
pub use record::{RecorderState, ScoreRecorder, ScoreSession, SessionStore};
pub use roi::{CircleGeometry, RectGeometry, Roi, RoiMode, RoiTracker, TrackerStatus};
pub use rotation::{RotationEstimator, RotationMode, RotationState};
pub use scan::{SampleSequence, ScanGeometry, ZodiacSection};
pub use transmit::{MemoryTransmitter, NoteBatch, Transmitter, UdpTransmitter};
