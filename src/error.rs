use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Diagnostic, Error)]
pub enum DeterrentError {
    #[error("Detection loop is already running")]
    #[diagnostic(help("stop the running loop before starting a new one"))]
    AlreadyRunning,

    #[error("Camera device {index} unavailable: {reason}")]
    #[diagnostic(help("check the camera index or the [camera] source_url setting"))]
    DeviceUnavailable { index: u32, reason: String },

    #[error("Could not read frame: {0}")]
    FrameRead(String),

    #[error("Could not load model {path}: {reason}")]
    #[diagnostic(help("make sure the model file exists and the classifier backend is reachable"))]
    ModelLoad { path: String, reason: String },

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Invalid detection: {0}")]
    InvalidDetection(String),

    #[error("{channel} channel timed out after {seconds}s")]
    ChannelTimeout { channel: &'static str, seconds: u64 },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    FFmpegError(#[from] ffmpeg_next::Error),

    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    ImageError(#[from] image::ImageError),

    #[error(transparent)]
    FontError(#[from] ab_glyph::InvalidFont),

    #[error(transparent)]
    JsonError(#[from] serde_json::Error),

    #[error(transparent)]
    TomlError(#[from] toml::de::Error),

    #[error(transparent)]
    ReqwestError(#[from] reqwest::Error),

    #[error(transparent)]
    SqliteError(#[from] rusqlite::Error),

    #[error(transparent)]
    EmailError(#[from] lettre::error::Error),

    #[error(transparent)]
    SmtpError(#[from] lettre::transport::smtp::Error),

    #[error(transparent)]
    AddressError(#[from] lettre::address::AddressError),

    #[error("Some other error: {0}")]
    Other(String),
}

impl DeterrentError {
    /// Errors that keep the loop from ever reaching `Running`.
    pub fn is_startup(&self) -> bool {
        matches!(
            self,
            DeterrentError::ModelLoad { .. }
                | DeterrentError::DeviceUnavailable { .. }
                | DeterrentError::Config(_)
        )
    }
}
