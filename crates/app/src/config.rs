use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

use talkover_synth::SynthesisSettings;
use talkover_vad::VadConfig;

/// Playback-side knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackSettings {
    /// Preferred output device; substring match, `None` for the default.
    pub output_device: Option<String>,
    /// Buffered audio required before the sink starts, in milliseconds of
    /// source audio.
    pub prebuffer_ms: u64,
    /// Ring buffer capacity in milliseconds.
    pub buffer_ms: u64,
    /// Cancel playback the moment the user starts talking.
    pub barge_in: bool,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            output_device: None,
            prebuffer_ms: 500,
            buffer_ms: 3_000,
            barge_in: true,
        }
    }
}

/// Everything the application needs, layered from a TOML file, environment,
/// and CLI flags. The bearer credential never appears here; it arrives via
/// CLI or environment only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub synthesis: SynthesisSettings,
    pub vad: VadConfig,
    pub playback: PlaybackSettings,
}

impl AppSettings {
    /// Load settings from a TOML file, or defaults when no file was given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file {}", path.display()))?;
        let settings = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse settings file {}", path.display()))?;
        Ok(settings)
    }
}
