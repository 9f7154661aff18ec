// THEORY:
// The `PlaybackController` plays one clip at a time on a background task, so the
// orchestrator stays free to notice an interrupt and ask playback to stop.
//
// Key architectural principles:
// 1.  **One Session**: at most one `PlaybackSession` exists. `play` refuses to start
//     a second one while the first is still running.
// 2.  **Cooperative Stop**: the stop request travels over a single-slot `watch`
//     channel. Only the controller writes it; only the playback task reads it, once
//     per frame interval. Stopping is therefore eventual, bounded by one frame.
// 3.  **State Flows Back**: the task reports `Playing` / `Finished(..)` over a second
//     `watch` channel. `Finished` is sent only after the video source and the display
//     surface have been released.
// 4.  **Pluggable Surface**: decoding and drawing sit behind `PlaybackBackend`, so
//     the control logic runs the same against OpenCV highgui or a test double.

use crate::error::{DiningError, DiningResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Key codes that cancel playback: Esc, `q` and `Q`.
pub const CANCEL_KEYS: [i32; 3] = [27, 'q' as i32, 'Q' as i32];
/// Used when a video reports no usable frame rate.
const FALLBACK_FPS: f64 = 24.0;

/// Opens videos onto a display surface.
pub trait PlaybackBackend: Send + Sync + 'static {
    fn open(&self, path: &Path, window_name: &str) -> DiningResult<Box<dyn PlaybackSurface>>;
}

/// An open video source bound to a visible window.
pub trait PlaybackSurface: Send {
    /// Native frame rate of the source.
    fn fps(&self) -> f64;
    /// Reads and shows the next frame. `Ok(false)` marks the end of the stream.
    fn present_next(&mut self) -> DiningResult<bool>;
    /// Waits up to `delay` for a key press.
    fn wait_key(&mut self, delay: Duration) -> Option<i32>;
    /// Releases the source and closes the window.
    fn release(&mut self);
}

/// Why a playback session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEnd {
    EndOfStream,
    StopRequested,
    UserCancelled,
    OpenFailed,
    /// The playback task panicked before reporting how it ended.
    Crashed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Playing,
    Finished(PlaybackEnd),
}

/// Frame delay for a given rate: `1000ms / fps`, never below 1ms.
pub fn frame_delay(fps: f64) -> Duration {
    let fps = if fps.is_finite() && fps > 0.0 { fps } else { FALLBACK_FPS };
    let millis = (1000.0 / fps) as u64;
    Duration::from_millis(millis.max(1))
}

/// A single running (or just finished) playback.
pub struct PlaybackSession {
    path: PathBuf,
    stop_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<PlaybackState>,
    task: JoinHandle<()>,
}

impl PlaybackSession {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> PlaybackState {
        *self.state_rx.borrow()
    }

    pub fn is_playing(&self) -> bool {
        self.state() == PlaybackState::Playing && !self.task.is_finished()
    }

    pub fn stop_requested(&self) -> bool {
        *self.stop_tx.borrow()
    }
}

pub struct PlaybackController {
    backend: Arc<dyn PlaybackBackend>,
    window_name: String,
    session: Option<PlaybackSession>,
}

impl PlaybackController {
    pub fn new(backend: Arc<dyn PlaybackBackend>, window_name: impl Into<String>) -> Self {
        Self {
            backend,
            window_name: window_name.into(),
            session: None,
        }
    }

    /// Starts playing `path` on a background task.
    ///
    /// A missing file is reported and nothing is started. Failing to open an
    /// existing file is not an error here: the task logs it and ends at once.
    pub fn play(&mut self, path: &Path) -> DiningResult<()> {
        if !path.exists() {
            error!("[Error] Video file not found: {}", path.display());
            return Err(DiningError::NotFound(path.to_path_buf()));
        }

        if let Some(active) = self.session.as_ref().filter(|s| s.is_playing()) {
            warn!("[Playing] Refusing to start a second session; {} is still playing", active.path().display());
            return Err(DiningError::PlaybackBusy(active.path().to_path_buf()));
        }

        info!("[Playing] {}", path.display());
        let (stop_tx, stop_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(PlaybackState::Playing);

        let backend = Arc::clone(&self.backend);
        let window_name = self.window_name.clone();
        let video = path.to_path_buf();
        let task = tokio::task::spawn_blocking(move || {
            run_playback(backend.as_ref(), &video, &window_name, stop_rx, state_tx);
        });

        self.session = Some(PlaybackSession {
            path: path.to_path_buf(),
            stop_tx,
            state_rx,
            task,
        });
        Ok(())
    }

    /// Asks the running session to stop at its next frame boundary.
    ///
    /// Returns whether a stop request was actually issued; calling this while
    /// nothing is playing (or after a stop was already requested) does nothing.
    pub fn stop(&self) -> bool {
        match &self.session {
            Some(session) if session.is_playing() && !session.stop_requested() => {
                session.stop_tx.send_replace(true);
                info!("[Stopping] Stopping video...");
                true
            }
            _ => false,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.session.as_ref().map(|s| s.is_playing()).unwrap_or(false)
    }

    pub fn session(&self) -> Option<&PlaybackSession> {
        self.session.as_ref()
    }

    /// Discards a finished session once its task has fully exited.
    ///
    /// Returns `None` while a session is still playing or when there is none.
    pub async fn reap(&mut self) -> Option<PlaybackEnd> {
        let session = self.session.as_ref()?;
        // Read the task flag first: a finished task has already published its last state.
        let task_done = session.task.is_finished();
        let end = match session.state() {
            PlaybackState::Finished(end) => end,
            PlaybackState::Playing if task_done => PlaybackEnd::Crashed,
            PlaybackState::Playing => return None,
        };
        let session = self.session.take()?;
        if let Err(e) = session.task.await {
            error!("[Error] Playback of {} crashed: {}", session.path.display(), e);
        }
        Some(end)
    }
}

/// Releases the surface however the playback loop exits, unwinding included.
struct ReleaseOnDrop(Box<dyn PlaybackSurface>);

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        self.0.release();
    }
}

fn run_playback(
    backend: &dyn PlaybackBackend,
    path: &Path,
    window_name: &str,
    stop_rx: watch::Receiver<bool>,
    state_tx: watch::Sender<PlaybackState>,
) {
    let mut surface = match backend.open(path, window_name) {
        Ok(surface) => ReleaseOnDrop(surface),
        Err(e) => {
            error!("[Error] {}", e);
            state_tx.send_replace(PlaybackState::Finished(PlaybackEnd::OpenFailed));
            return;
        }
    };

    let delay = frame_delay(surface.0.fps());
    let end = loop {
        if *stop_rx.borrow() {
            break PlaybackEnd::StopRequested;
        }
        match surface.0.present_next() {
            Ok(true) => {}
            Ok(false) => break PlaybackEnd::EndOfStream,
            Err(e) => {
                warn!("Error reading frame: {}", e);
                break PlaybackEnd::EndOfStream;
            }
        }
        if let Some(key) = surface.0.wait_key(delay) {
            if CANCEL_KEYS.contains(&key) {
                break PlaybackEnd::UserCancelled;
            }
        }
    };

    drop(surface);
    info!("[Stopped] Video playback finished.");
    state_tx.send_replace(PlaybackState::Finished(end));
}
