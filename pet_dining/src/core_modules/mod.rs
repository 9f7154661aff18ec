// The building blocks the session orchestrates. None of these know about each
// other's lifecycles; `session` wires them together.

pub mod assets;
pub mod labels;
pub mod playback;
pub mod prompt;
pub mod synthesizer;
