// THEORY:
// All tunables of the dining loop live in one immutable `DiningConfig`. It is read
// once at startup (from a TOML file, falling back to defaults) and then handed by
// value or reference to whatever needs it. Nothing reads configuration from
// globals after that point.

use crate::error::{DiningError, DiningResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_PROMPT_TEMPLATE: &str = "A cute {animal_type} happily eating {food_name}, \
in a cozy home environment, soft lighting, detailed fur, cinematic animation, 4k resolution";
pub const DEFAULT_NEGATIVE_PROMPT: &str =
    "bad quality, worse quality, deformed, distorted, text, watermark";

/// Top-level configuration for a dining session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiningConfig {
    /// Root folder holding one subfolder of reference images per pet type.
    pub asset_dir: PathBuf,
    /// Where generated clips are written.
    pub output_dir: PathBuf,
    pub synthesis: SynthesisConfig,
    pub detection: DetectionConfig,
    pub playback: PlaybackConfig,
    pub session: SessionConfig,
}

/// Parameters of the video-diffusion generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    pub fps: u32,
    pub duration_secs: u32,
    pub steps: u32,
    pub guidance_scale: f64,
    /// How far the generator may drift from the reference image (0, 1].
    pub strength: f64,
    pub seed: u64,
    /// Must contain `{food_name}`; `{animal_type}` is optional.
    pub prompt_template: String,
    pub negative_prompt: String,
    pub base_model: String,
    pub adapter_model: String,
    pub model_cache_dir: PathBuf,
    /// Generator worker executable and its leading arguments.
    pub generator_program: PathBuf,
    pub generator_args: Vec<String>,
    /// Subject name used when the reference image has no parent folder.
    pub default_subject: String,
}

/// Parameters of the camera food detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub camera_index: i32,
    /// Run the classifier on every Nth camera frame.
    pub sample_every_n_frames: u32,
    pub food_keywords: Vec<String>,
    /// Returned when nothing food-like was seen before the preview was closed.
    pub default_label: String,
    pub labels_path: PathBuf,
    pub model_path: PathBuf,
    pub top_k: usize,
    pub preview_window: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub window_name: String,
    /// How often the orchestrator checks whether playback has ended.
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub inter_cycle_secs: f64,
    /// Delete each generated clip once its playback has ended.
    pub delete_artifacts: bool,
    /// Stop after this many cycles; `None` runs until interrupted.
    pub max_cycles: Option<u32>,
}

impl Default for DiningConfig {
    fn default() -> Self {
        Self {
            asset_dir: PathBuf::from("animal_images"),
            output_dir: PathBuf::from("output_videos"),
            synthesis: SynthesisConfig::default(),
            detection: DetectionConfig::default(),
            playback: PlaybackConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            fps: 24,
            duration_secs: 5,
            steps: 30,
            guidance_scale: 7.5,
            strength: 0.7,
            seed: 42,
            prompt_template: DEFAULT_PROMPT_TEMPLATE.to_string(),
            negative_prompt: DEFAULT_NEGATIVE_PROMPT.to_string(),
            base_model: "emilianJR/epiCRealism".to_string(),
            adapter_model: "guoyww/animatediff-motion-adapter-v1-5-2".to_string(),
            model_cache_dir: PathBuf::from("models"),
            generator_program: PathBuf::from("pet-dining-generator"),
            generator_args: Vec::new(),
            default_subject: "animal".to_string(),
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        let food_keywords = [
            "sandwich", "burger", "cake", "ice cream", "pizza", "noodle", "pasta", "salad",
            "food", "sushi", "hotdog", "coffee", "tea", "fries", "apple", "banana",
        ];
        Self {
            camera_index: 0,
            sample_every_n_frames: 30,
            food_keywords: food_keywords.iter().map(|k| k.to_string()).collect(),
            default_label: "food".to_string(),
            labels_path: PathBuf::from("imagenet_classes.json"),
            model_path: PathBuf::from("models/resnet50.onnx"),
            top_k: 5,
            preview_window: "Food Detection".to_string(),
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            window_name: "Pet Dining Experience".to_string(),
            poll_interval_ms: 500,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            inter_cycle_secs: 3.0,
            delete_artifacts: true,
            max_cycles: None,
        }
    }
}

impl SynthesisConfig {
    /// Frames requested from the generator for a clip of `duration_secs`.
    pub fn frame_count(&self, duration_secs: u32) -> u32 {
        self.fps.saturating_mul(duration_secs)
    }
}

impl PlaybackConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl SessionConfig {
    /// Zero for values `validate` rejects.
    pub fn inter_cycle(&self) -> Duration {
        Duration::try_from_secs_f64(self.inter_cycle_secs).unwrap_or_default()
    }
}

impl DiningConfig {
    /// Loads a TOML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> DiningResult<Self> {
        let config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str(&contents)
                .map_err(|e| DiningError::Config(format!("{}: {}", path.display(), e)))?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> DiningResult<String> {
        toml::to_string_pretty(self).map_err(|e| DiningError::Config(e.to_string()))
    }

    pub fn validate(&self) -> DiningResult<()> {
        let s = &self.synthesis;
        if s.fps == 0 {
            return Err(DiningError::Config("synthesis.fps must be positive".into()));
        }
        if s.duration_secs == 0 {
            return Err(DiningError::Config("synthesis.duration_secs must be positive".into()));
        }
        if s.fps.checked_mul(s.duration_secs).is_none() {
            return Err(DiningError::Config(format!(
                "synthesis.fps x synthesis.duration_secs is too many frames ({} x {})",
                s.fps, s.duration_secs
            )));
        }
        if s.steps == 0 {
            return Err(DiningError::Config("synthesis.steps must be positive".into()));
        }
        if !(s.strength > 0.0 && s.strength <= 1.0) {
            return Err(DiningError::Config(format!(
                "synthesis.strength must be in (0, 1], got {}",
                s.strength
            )));
        }
        if !s.prompt_template.contains("{food_name}") {
            return Err(DiningError::Config(
                "synthesis.prompt_template must contain {food_name}".into(),
            ));
        }
        if self.detection.sample_every_n_frames == 0 {
            return Err(DiningError::Config(
                "detection.sample_every_n_frames must be positive".into(),
            ));
        }
        if self.detection.top_k == 0 {
            return Err(DiningError::Config("detection.top_k must be positive".into()));
        }
        if self.playback.poll_interval_ms == 0 {
            return Err(DiningError::Config("playback.poll_interval_ms must be positive".into()));
        }
        let gap = self.session.inter_cycle_secs;
        if Duration::try_from_secs_f64(gap).is_err() {
            return Err(DiningError::Config(format!(
                "session.inter_cycle_secs must be a non-negative number, got {}",
                gap
            )));
        }
        Ok(())
    }

    /// Creates the output directory if it does not exist yet.
    pub fn ensure_directories(&self) -> DiningResult<()> {
        std::fs::create_dir_all(&self.output_dir)?;
        Ok(())
    }
}
