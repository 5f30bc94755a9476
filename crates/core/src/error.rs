use std::path::PathBuf;

/// Result alias that carries the custom [`SonifierError`] type.
pub type Result<T> = std::result::Result<T, SonifierError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum SonifierError {
    /// No ROI could be established. Recoverable: supply a manual geometry or
    /// keep feeding frames so detection can retry.
    #[error("no rotational center found: {0}")]
    NoCenter(String),
    /// A control command was issued in a state that does not allow it. The
    /// command had no side effect.
    #[error("`{command}` rejected while {state}")]
    StateViolation {
        command: &'static str,
        state: String,
    },
    /// Writing a session failed. Nothing was left behind on disk.
    #[error("failed to persist session at {}: {reason}", path.display())]
    Persistence { path: PathBuf, reason: String },
    /// A session could not be loaded for playback.
    #[error("failed to load session from {}: {reason}", path.display())]
    PlaybackLoad { path: PathBuf, reason: String },
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Free-form message for conditions without a dedicated variant.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
    #[error(transparent)]
    Image(#[from] image::ImageError),
    #[error(transparent)]
    Fft(#[from] realfft::FftError),
}

impl SonifierError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    pub(crate) fn state(command: &'static str, state: impl Into<String>) -> Self {
        Self::StateViolation {
            command,
            state: state.into(),
        }
    }

    /// True for errors the processing loop is expected to survive.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NoCenter(_) | Self::StateViolation { .. } | Self::PlaybackLoad { .. }
        )
    }
}

impl From<&str> for SonifierError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for SonifierError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
