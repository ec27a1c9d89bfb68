use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// RMS threshold in dBFS; windows at or above count as voice.
    pub threshold_db: f32,
    /// Energy must stay above the threshold this long before voice is
    /// reported. Filters out coughs and bumped microphones.
    pub min_voice_ms: u32,
    /// Continuous silence required before voice is considered over.
    pub silence_timeout_ms: u64,
    /// Cadence of the silence checker.
    pub check_interval_ms: u64,
    /// Analysis window length.
    pub window_ms: u32,
    /// Preferred input device; substring match, `None` for the default.
    pub device: Option<String>,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold_db: -40.0,
            min_voice_ms: 250,
            silence_timeout_ms: 1200,
            check_interval_ms: 100,
            window_ms: 50,
            device: None,
        }
    }
}

impl VadConfig {
    /// Consecutive loud windows required before `VoiceStart` fires.
    pub fn onset_windows(&self) -> u32 {
        let window_ms = self.window_ms.max(1);
        (self.min_voice_ms.div_ceil(window_ms)).max(1)
    }
}
