use crate::classifier::{cv_error, DnnImageClassifier};
use async_trait::async_trait;
use opencv::{
    core::{Mat, Point, Scalar},
    highgui, imgproc,
    prelude::*,
    videoio::{self, VideoCapture},
};
use pet_dining::config::DetectionConfig;
use pet_dining::core_modules::labels::match_food_label;
use pet_dining::{DiningError, DiningResult, FoodClassifier, Shutdown};
use std::sync::Arc;
use tracing::{info, warn};

const QUIT_KEY: i32 = b'q' as i32;

/// Watches the live camera until the user presses `q` in the preview window.
pub struct CameraFoodClassifier {
    config: DetectionConfig,
    classifier: Arc<DnnImageClassifier>,
    shutdown: Shutdown,
}

impl CameraFoodClassifier {
    pub fn new(config: DetectionConfig, classifier: Arc<DnnImageClassifier>, shutdown: Shutdown) -> Self {
        Self {
            config,
            classifier,
            shutdown,
        }
    }
}

#[async_trait]
impl FoodClassifier for CameraFoodClassifier {
    async fn detect(&self) -> DiningResult<String> {
        let config = self.config.clone();
        let classifier = Arc::clone(&self.classifier);
        let shutdown = self.shutdown.clone();
        tokio::task::spawn_blocking(move || watch_camera(&config, &classifier, &shutdown))
            .await
            .map_err(|e| DiningError::Classification(format!("camera task failed: {}", e)))?
    }
}

fn watch_camera(
    config: &DetectionConfig,
    classifier: &DnnImageClassifier,
    shutdown: &Shutdown,
) -> DiningResult<String> {
    info!("Starting real-time food detection (press 'q' to exit)...");

    // --- 1. Camera Initialization ---
    let mut cap = VideoCapture::new(config.camera_index, videoio::CAP_ANY).map_err(cv_error)?;
    if !cap.is_opened().map_err(cv_error)? {
        return Err(DiningError::Classification(format!(
            "Unable to open camera {}",
            config.camera_index
        )));
    }

    // --- 2. Preview Loop ---
    let sample_every = config.sample_every_n_frames.max(1) as u64;
    let mut frame = Mat::default();
    let mut frame_count: u64 = 0;
    let mut last_detected = config.default_label.clone();

    let result = loop {
        if shutdown.is_triggered() {
            break Ok(());
        }
        match cap.read(&mut frame) {
            Ok(true) if !frame.empty() => {}
            Ok(_) => {
                warn!("Camera stopped delivering frames");
                break Ok(());
            }
            Err(e) => break Err(cv_error(e)),
        }

        // --- 3. Periodic Classification ---
        if frame_count % sample_every == 0 {
            match classifier.top_labels(&frame, config.top_k) {
                Ok(candidates) => {
                    if let Some(food) = match_food_label(&candidates, &config.food_keywords) {
                        last_detected = food.to_string();
                    }
                }
                Err(e) => warn!("Classification failed on frame {}: {}", frame_count, e),
            }
        }

        // --- 4. Overlay & Display ---
        if let Err(e) = show_preview(&frame, &last_detected, &config.preview_window) {
            break Err(e);
        }
        match highgui::wait_key(1) {
            Ok(key) if key & 0xFF == QUIT_KEY => break Ok(()),
            Ok(_) => {}
            Err(e) => break Err(cv_error(e)),
        }
        frame_count += 1;
    };

    cap.release().ok();
    highgui::destroy_window(&config.preview_window).ok();
    result?;

    info!("Final food detected: {}", last_detected);
    Ok(last_detected)
}

fn show_preview(frame: &Mat, label: &str, window: &str) -> DiningResult<()> {
    let mut display = frame.try_clone().map_err(cv_error)?;
    imgproc::put_text(
        &mut display,
        &format!("Detected: {}", label),
        Point::new(10, 30),
        imgproc::FONT_HERSHEY_SIMPLEX,
        1.0,
        Scalar::new(255.0, 255.0, 0.0, 0.0),
        2,
        imgproc::LINE_AA,
        false,
    )
    .map_err(cv_error)?;
    highgui::imshow(window, &display).map_err(cv_error)
}
