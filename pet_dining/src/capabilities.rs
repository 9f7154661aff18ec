// THEORY:
// The dining loop leans on three heavy collaborators it does not implement itself:
// something that looks at a camera and names the food, something that picks a pet
// picture, and something that turns a picture plus a food name into a video. Each
// is a trait here, so the orchestrator only ever sees the capability and never
// the camera, the disk layout or the diffusion model behind it.
//
// The data that flows between them is equally small: a label string, an immutable
// `SynthesisRequest`, and a `VideoArtifact` that the orchestrator owns until it is
// discarded.

use crate::error::DiningResult;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Names the food currently in front of the camera.
#[async_trait]
pub trait FoodClassifier: Send + Sync {
    /// Blocks (asynchronously) until a label is settled on. Falls back to a
    /// default label when nothing food-like was observed.
    async fn detect(&self) -> DiningResult<String>;
}

/// Chooses a reference image of a pet.
pub trait AssetPicker: Send + Sync {
    fn pick(&self, root: &Path) -> DiningResult<PathBuf>;
}

/// Produces a short clip from a reference image and a food label.
#[async_trait]
pub trait VideoSynthesizer: Send + Sync {
    /// Loads the heavy model. Idempotent: only the first call does any work.
    async fn ensure_loaded(&self) -> DiningResult<()>;

    async fn synthesize(&self, request: &SynthesisRequest) -> DiningResult<VideoArtifact>;
}

/// Everything a single synthesis call depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesisRequest {
    reference_image: PathBuf,
    food_label: String,
    duration_secs: u32,
}

impl SynthesisRequest {
    pub fn new(reference_image: impl Into<PathBuf>, food_label: impl Into<String>, duration_secs: u32) -> Self {
        Self {
            reference_image: reference_image.into(),
            food_label: food_label.into(),
            duration_secs,
        }
    }

    pub fn reference_image(&self) -> &Path {
        &self.reference_image
    }

    pub fn food_label(&self) -> &str {
        &self.food_label
    }

    pub fn duration_secs(&self) -> u32 {
        self.duration_secs
    }

    /// The pet type, taken from the folder the reference image lives in.
    pub fn subject_type(&self, fallback: &str) -> String {
        self.reference_image
            .parent()
            .and_then(|p| p.file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| fallback.to_string())
    }
}

/// A generated clip on disk. Whoever holds it owns the file.
#[derive(Debug, PartialEq, Eq)]
pub struct VideoArtifact {
    path: PathBuf,
}

impl VideoArtifact {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Deletes the file if it is still there. Returns whether anything was removed.
    pub fn discard(self) -> std::io::Result<bool> {
        if !self.path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&self.path)?;
        Ok(true)
    }

    /// Gives up ownership without touching the file.
    pub fn keep(self) -> PathBuf {
        self.path
    }
}
