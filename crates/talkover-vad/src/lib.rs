//! Energy-based voice activity detection.
//!
//! Watches the microphone while synthesized speech is playing and reports
//! when the user starts talking over it. Detection is RMS-vs-threshold with
//! onset debouncing; the end of speech is decided by a periodic silence
//! checker rather than per-window.

pub mod config;
pub mod energy;
pub mod gate;
pub mod monitor;
pub mod types;

pub use config::VadConfig;
pub use energy::EnergyMeter;
pub use gate::SpeechGate;
pub use monitor::VoiceMonitor;
pub use types::{GatePhase, VadEvent, VoiceActivity};
