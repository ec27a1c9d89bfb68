//! Talkover application wiring: settings, logging, the playback orchestrator,
//! and the runtime that connects barge-in detection to it.

pub mod config;
pub mod logging;
pub mod orchestrator;
pub mod runtime;

pub use config::{AppSettings, PlaybackSettings};
pub use orchestrator::PlaybackManager;
pub use runtime::{start, AppHandle};
