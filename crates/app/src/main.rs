use std::{
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use clap::{Parser, Subcommand, ValueEnum};
use turntable_sonifier_core::{
    frame::FrameSource, AppConfig, Command, Engine, Frame, FrameSlot, MemoryTransmitter,
    PlaybackSource, RoiMode, RotationMode, ScaleTable, SessionStore, SonifierError,
    SyntheticTurntable, Transmitter, UdpTransmitter,
};
use tracing_subscriber::EnvFilter;

fn main() -> turntable_sonifier_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            config,
            seconds,
            fps,
            rpm,
            size,
            mode,
            detect,
            record,
            scale,
            target,
            dry_run,
            realtime,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(rpm) = rpm {
                config.rotation.rpm = rpm;
            }
            if let Some(mode) = mode {
                config.roi.mode = mode.into();
            }
            if detect {
                config.rotation.mode = RotationMode::Detected;
            }
            if record {
                config.recording.enabled = true;
            }
            if let Some(scale) = scale {
                config.mapping.scale = scale;
            }
            if let Some(target) = target {
                config.transmit.target = target;
            }
            let options = SimulateOptions {
                frames: (seconds * fps).ceil() as usize,
                fps,
                size,
                dry_run,
                realtime,
            };
            run_simulate(config, &options)
        }
        Commands::Play {
            session,
            config,
            seconds,
            fps,
            scale,
            from_samples,
            dry_run,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(scale) = scale {
                config.mapping.scale = scale;
            }
            if from_samples {
                config.playback.source = PlaybackSource::Samples;
            }
            run_play(config, &session, seconds, fps, dry_run)
        }
        Commands::Inspect { session } => run_inspect(&session),
        Commands::Scales => {
            run_scales();
            Ok(())
        }
    }
}

struct SimulateOptions {
    frames: usize,
    fps: f64,
    size: u32,
    dry_run: bool,
    realtime: bool,
}

fn run_simulate(config: AppConfig, options: &SimulateOptions) -> turntable_sonifier_core::Result<()> {
    tracing::info!(
        frames = options.frames,
        fps = options.fps,
        rpm = config.rotation.rpm,
        "starting simulated turntable"
    );

    let table = SyntheticTurntable::new(options.size, options.size).with_rpm(config.rotation.rpm);
    let transmitter = transmitter_for(&config, options.dry_run)?;
    let mut engine = Engine::new(config, transmitter)?;
    engine.apply(Command::Start)?;

    let mut batches = 0usize;
    let mut sessions = Vec::new();
    let mut process = |engine: &mut Engine, frame: &Frame| -> turntable_sonifier_core::Result<()> {
        let report = engine.cycle(frame)?;
        batches += usize::from(report.transmitted);
        sessions.extend(report.persisted);
        Ok(())
    };

    if options.realtime {
        // Frames are rendered on their own thread at the requested rate; the
        // loop always works on the newest one.
        let slot = FrameSlot::new();
        let producer = {
            let slot = slot.clone();
            let mut feed = table.feed(options.fps, options.frames);
            let pause = Duration::from_secs_f64(1.0 / options.fps);
            thread::spawn(move || -> turntable_sonifier_core::Result<()> {
                while let Some(frame) = feed.next_frame()? {
                    slot.publish(frame)?;
                    thread::sleep(pause);
                }
                Ok(())
            })
        };
        loop {
            let finished = producer.is_finished();
            match slot.take_latest()? {
                Some(frame) => process(&mut engine, &frame)?,
                None if finished => break,
                None => thread::sleep(Duration::from_millis(1)),
            }
        }
        producer
            .join()
            .map_err(|_| SonifierError::msg("frame producer panicked"))??;
        tracing::info!(dropped = slot.dropped()?, published = slot.published()?, "frame slot drained");
    } else {
        let mut feed = table.feed(options.fps, options.frames);
        while let Some(frame) = feed.next_frame()? {
            process(&mut engine, &frame)?;
        }
    }

    engine.apply(Command::Stop)?;
    engine.settle();
    let rotation = engine.rotation_state();
    tracing::info!(
        batches,
        sessions = sessions.len(),
        angle = rotation.angle,
        rpm = rotation.rpm,
        "simulation finished"
    );
    for path in sessions {
        println!("{}", path.display());
    }
    Ok(())
}

fn run_play(
    config: AppConfig,
    session: &Path,
    seconds: f64,
    fps: f64,
    dry_run: bool,
) -> turntable_sonifier_core::Result<()> {
    let transmitter = transmitter_for(&config, dry_run)?;
    let mut engine = Engine::new(config, transmitter)?;
    engine.apply(Command::LoadSession(session.to_path_buf()))?;
    engine.apply(Command::TogglePlayback)?;
    engine.apply(Command::Start)?;

    // Playback ignores image content; a blank disc only provides the clock.
    let frames = (seconds * fps).ceil() as usize;
    let mut feed = SyntheticTurntable::new(32, 32).feed(fps, frames);
    let pause = Duration::from_secs_f64(1.0 / fps);
    let mut notes = 0usize;
    while let Some(frame) = feed.next_frame()? {
        let report = engine.cycle(&frame)?;
        notes += report.events.len();
        thread::sleep(pause);
    }

    tracing::info!(notes, loops = engine.player().loops(), "playback finished");
    engine.apply(Command::Stop)?;
    engine.settle();
    Ok(())
}

fn run_inspect(session: &Path) -> turntable_sonifier_core::Result<()> {
    let session = SessionStore::load(session)?;
    let metadata = &session.metadata;
    let notes: usize = session.entries.iter().map(|entry| entry.events.len()).sum();
    println!("started    {}", metadata.started_at.to_rfc3339());
    println!("roi mode   {}", metadata.roi_mode.label());
    println!("scale      {}", metadata.scale);
    println!("rpm        {:.2}", metadata.rpm);
    println!("duration   {:.2}s", metadata.duration_seconds);
    println!("cycles     {}", session.entries.len());
    println!("notes      {notes}");
    println!("samples    {} x {}", session.samples.len(), metadata.sample_count);
    Ok(())
}

fn run_scales() {
    for name in ScaleTable::builtin_names() {
        if let Some(table) = ScaleTable::named(name) {
            let notes = table.notes();
            println!(
                "{name:<14} {:>3} notes  {}..={}",
                notes.len(),
                notes.first().copied().unwrap_or_default(),
                notes.last().copied().unwrap_or_default()
            );
        }
    }
}

fn load_config(path: Option<&Path>) -> turntable_sonifier_core::Result<AppConfig> {
    match path {
        Some(path) => AppConfig::load(path),
        None => Ok(AppConfig::default()),
    }
}

fn transmitter_for(config: &AppConfig, dry_run: bool) -> turntable_sonifier_core::Result<Box<dyn Transmitter>> {
    if dry_run {
        return Ok(Box::new(MemoryTransmitter::new()));
    }
    Ok(Box::new(UdpTransmitter::connect(&config.transmit.target)?))
}

/// Frame rates and run lengths must be finite and above zero.
fn positive_number(value: &str) -> Result<f64, String> {
    let number: f64 = value.parse().map_err(|err| format!("`{value}` is not a number: {err}"))?;
    if number.is_finite() && number > 0.0 {
        Ok(number)
    } else {
        Err(format!("`{value}` must be a positive number"))
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Turns a spinning turntable into notes", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    Circular,
    Rectangular,
}

impl From<ModeArg> for RoiMode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::Circular => RoiMode::Circular,
            ModeArg::Rectangular => RoiMode::Rectangular,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the engine against a rendered turntable.
    Simulate {
        /// TOML configuration file.
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(long, default_value_t = 30.0, value_parser = positive_number)]
        seconds: f64,
        #[arg(long, default_value_t = 30.0, value_parser = positive_number)]
        fps: f64,
        /// Turntable speed; also the speed of the rendered disc.
        #[arg(long)]
        rpm: Option<f64>,
        /// Edge length of the square frames, in pixels.
        #[arg(long, default_value_t = 240)]
        size: u32,
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,
        /// Measure the rotation from the image instead of trusting the RPM.
        #[arg(long)]
        detect: bool,
        /// Record one revolution and persist it.
        #[arg(long)]
        record: bool,
        #[arg(long)]
        scale: Option<String>,
        /// UDP address notes are sent to.
        #[arg(long)]
        target: Option<String>,
        /// Keep notes in memory instead of sending them.
        #[arg(long)]
        dry_run: bool,
        /// Render frames on a separate thread at the requested rate.
        #[arg(long)]
        realtime: bool,
    },
    /// Loop a recorded session to the configured target.
    Play {
        /// Session directory produced by a recording.
        session: PathBuf,
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(long, default_value_t = 30.0, value_parser = positive_number)]
        seconds: f64,
        #[arg(long, default_value_t = 30.0, value_parser = positive_number)]
        fps: f64,
        #[arg(long)]
        scale: Option<String>,
        /// Map the recorded samples again instead of replaying stored notes.
        #[arg(long)]
        from_samples: bool,
        #[arg(long)]
        dry_run: bool,
    },
    /// Print a recorded session's metadata.
    Inspect {
        session: PathBuf,
    },
    /// List the built-in scales.
    Scales,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_or_negative_rates_are_rejected() {
        assert!(Cli::try_parse_from(["turntable-sonifier", "simulate", "--fps", "0"]).is_err());
        assert!(Cli::try_parse_from(["turntable-sonifier", "simulate", "--seconds=-2"]).is_err());
        assert!(Cli::try_parse_from(["turntable-sonifier", "play", "take", "--fps", "inf"]).is_err());
        assert!(Cli::try_parse_from(["turntable-sonifier", "play", "take", "--fps", "nan"]).is_err());
    }

    #[test]
    fn play_can_remap_samples() {
        let cli = Cli::try_parse_from([
            "turntable-sonifier",
            "play",
            "take",
            "--scale",
            "piano",
            "--from-samples",
        ])
        .unwrap();
        let Commands::Play { scale, from_samples, .. } = cli.command else {
            panic!("expected play");
        };
        assert_eq!(scale.as_deref(), Some("piano"));
        assert!(from_samples);
    }

    #[test]
    fn positive_rates_parse() {
        let cli = Cli::try_parse_from(["turntable-sonifier", "simulate", "--fps", "12.5"]).unwrap();
        let Commands::Simulate { fps, seconds, .. } = cli.command else {
            panic!("expected simulate");
        };
        assert_eq!(fps, 12.5);
        assert_eq!(seconds, 30.0);
        assert_eq!(positive_number("0.25"), Ok(0.25));
    }
}
