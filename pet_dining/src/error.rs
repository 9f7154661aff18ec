// THEORY:
// Every failure the dining loop can meet is named here. The orchestrator decides
// what to do with an error by asking it one question, `is_cycle_recoverable`: a
// recoverable error abandons the current cycle and the loop carries on; anything
// else unwinds to the outermost boundary and ends the session. Resource
// exhaustion (out of memory on host or device) is never recoverable.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiningError {
    /// No pet reference image could be found under the asset root.
    #[error("No pet images available: {0}")]
    AssetNotFound(String),

    /// The heavy synthesis model failed to initialize.
    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    /// A video file exists but could not be opened for playback.
    #[error("Failed to open video: {}", .0.display())]
    PlaybackOpen(PathBuf),

    /// A playback session is already running; only one may be active.
    #[error("Playback already active for: {}", .0.display())]
    PlaybackBusy(PathBuf),

    /// The generation call itself failed.
    #[error("Video generation failed: {0}")]
    Synthesis(String),

    #[error("File not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The camera or the classifier misbehaved during a detection pass.
    #[error("Food detection failed: {0}")]
    Classification(String),

    /// Out of memory (host or device) while running the heavy model.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

impl DiningError {
    /// Whether the per-cycle boundary may swallow this error and start the next cycle.
    pub fn is_cycle_recoverable(&self) -> bool {
        match self {
            DiningError::AssetNotFound(_)
            | DiningError::ModelLoad(_)
            | DiningError::PlaybackOpen(_)
            | DiningError::PlaybackBusy(_)
            | DiningError::Synthesis(_)
            | DiningError::NotFound(_)
            | DiningError::Classification(_)
            | DiningError::Image(_) => true,
            DiningError::Io(e) => e.kind() != std::io::ErrorKind::OutOfMemory,
            DiningError::ResourceExhausted(_) | DiningError::Config(_) => false,
        }
    }
}

pub type DiningResult<T> = Result<T, DiningError>;
