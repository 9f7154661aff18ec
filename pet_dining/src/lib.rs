// THEORY:
// This file is the main entry point for the `pet_dining` library crate.
// It defines the public API consumed by the `dining_station` binary, which
// supplies the camera, the neural classifier and the on-screen player.
//
// The primary export is the `SessionOrchestrator` and its associated data
// structures (`DiningConfig`, `SessionReport`, `SessionEvent`), the high-level
// interface to the whole detect -> synthesize -> play -> clean up loop. The
// capability traits in `capabilities` and `core_modules::playback` are the
// seams where hardware-bound implementations plug in, so everything in this
// crate can be driven by fakes in tests.

pub mod capabilities;
pub mod config;
pub mod core_modules;
pub mod error;
pub mod session;

pub use capabilities::{AssetPicker, FoodClassifier, SynthesisRequest, VideoArtifact, VideoSynthesizer};
pub use config::DiningConfig;
pub use core_modules::playback::{PlaybackBackend, PlaybackController, PlaybackEnd, PlaybackSurface};
pub use error::{DiningError, DiningResult};
pub use session::{SessionEvent, SessionExit, SessionOrchestrator, SessionReport, Shutdown, ShutdownTrigger, shutdown_channel};
