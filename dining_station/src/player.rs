use opencv::{
    core::Mat,
    highgui,
    prelude::*,
    videoio::{self, VideoCapture},
};
use pet_dining::{DiningError, DiningResult, PlaybackBackend, PlaybackSurface};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

/// Plays clips in an OpenCV highgui window.
#[derive(Debug, Default, Clone, Copy)]
pub struct HighGuiBackend;

struct HighGuiSurface {
    cap: VideoCapture,
    frame: Mat,
    window: String,
    fps: f64,
}

impl PlaybackBackend for HighGuiBackend {
    fn open(&self, path: &Path, window_name: &str) -> DiningResult<Box<dyn PlaybackSurface>> {
        let open_failed = |_| DiningError::PlaybackOpen(path.to_path_buf());

        let cap = VideoCapture::from_file(&path.to_string_lossy(), videoio::CAP_ANY).map_err(open_failed)?;
        if !cap.is_opened().map_err(open_failed)? {
            return Err(DiningError::PlaybackOpen(path.to_path_buf()));
        }

        let fps = cap.get(videoio::CAP_PROP_FPS).unwrap_or(0.0);
        let width = cap.get(videoio::CAP_PROP_FRAME_WIDTH).unwrap_or(0.0) as i32;
        let height = cap.get(videoio::CAP_PROP_FRAME_HEIGHT).unwrap_or(0.0) as i32;
        debug!("Opened {} ({}x{} @ {:.1} fps)", path.display(), width, height, fps);

        highgui::named_window(window_name, highgui::WINDOW_NORMAL).map_err(open_failed)?;
        if width > 0 && height > 0 {
            if let Err(e) = highgui::resize_window(window_name, width, height) {
                warn!("Could not size the playback window: {}", e);
            }
        }

        Ok(Box::new(HighGuiSurface {
            cap,
            frame: Mat::default(),
            window: window_name.to_string(),
            fps,
        }))
    }
}

impl PlaybackSurface for HighGuiSurface {
    fn fps(&self) -> f64 {
        self.fps
    }

    fn present_next(&mut self) -> DiningResult<bool> {
        let read = self
            .cap
            .read(&mut self.frame)
            .map_err(|e| DiningError::Io(std::io::Error::other(format!("frame read failed: {}", e))))?;
        if !read || self.frame.empty() {
            return Ok(false);
        }
        highgui::imshow(&self.window, &self.frame)
            .map_err(|e| DiningError::Io(std::io::Error::other(format!("frame display failed: {}", e))))?;
        Ok(true)
    }

    fn wait_key(&mut self, delay: Duration) -> Option<i32> {
        let millis = delay.as_millis().clamp(1, i32::MAX as u128) as i32;
        match highgui::wait_key(millis) {
            Ok(key) if key >= 0 => Some(key & 0xFF),
            _ => None,
        }
    }

    fn release(&mut self) {
        self.cap.release().ok();
        highgui::destroy_window(&self.window).ok();
    }
}
