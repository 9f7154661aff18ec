// THEORY:
// A `GenerationPlan` is the fully resolved form of a `SynthesisRequest`: the
// request says *what* to make, the plan adds every knob the generator needs
// (prompt text, frame count, seed, output path). Building a plan is pure. Given the
// same request, the same configuration and the same clock reading it always
// produces the same plan, which keeps the seeded generator reproducible.

use crate::capabilities::SynthesisRequest;
use crate::config::SynthesisConfig;
use chrono::NaiveDateTime;
use serde::Serialize;
use std::path::{Path, PathBuf};

const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// The complete set of inputs for one generator run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationPlan {
    pub prompt: String,
    pub negative_prompt: String,
    /// RGB-normalised copy of the reference image handed to the generator.
    pub image: PathBuf,
    pub strength: f64,
    pub num_inference_steps: u32,
    pub guidance_scale: f64,
    pub num_frames: u32,
    pub fps: u32,
    pub seed: u64,
    pub output_path: PathBuf,
}

impl GenerationPlan {
    pub fn build(
        request: &SynthesisRequest,
        config: &SynthesisConfig,
        output_dir: &Path,
        now: NaiveDateTime,
    ) -> Self {
        let subject = request.subject_type(&config.default_subject);
        Self {
            prompt: render_prompt(&config.prompt_template, &subject, request.food_label()),
            negative_prompt: config.negative_prompt.clone(),
            image: request.reference_image().to_path_buf(),
            strength: config.strength,
            num_inference_steps: config.steps,
            guidance_scale: config.guidance_scale,
            num_frames: config.frame_count(request.duration_secs()),
            fps: config.fps,
            seed: config.seed,
            output_path: output_dir.join(output_file_name(&subject, request.food_label(), now)),
        }
    }

    pub fn with_image(mut self, image: PathBuf) -> Self {
        self.image = image;
        self
    }
}

pub fn render_prompt(template: &str, animal_type: &str, food_name: &str) -> String {
    template
        .replace("{animal_type}", animal_type)
        .replace("{food_name}", food_name)
}

/// `{subject}_{food}_{YYYYmmdd_HHMMSS}.mp4`, lowercased with spaces as underscores.
pub fn output_file_name(subject: &str, food: &str, now: NaiveDateTime) -> String {
    let stem = format!("{}_{}_{}", subject, food, now.format(TIMESTAMP_FORMAT))
        .to_lowercase()
        .replace(' ', "_");
    format!("{}.mp4", stem)
}
