use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which wire dialect drives the session. Selectable at runtime so the same
/// build can talk to either service generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProtocolKind {
    /// Task-oriented dialect: run-task / continue-task / finish-task, audio
    /// as raw binary frames.
    Task,
    /// Session-oriented realtime dialect: session.update / append / finish,
    /// audio as base64 deltas inside JSON events.
    Realtime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    pub voice_id: String,
    pub model: String,
    pub language: String,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            voice_id: String::new(),
            model: "sonic-3".to_string(),
            language: "en".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisSettings {
    pub endpoint: String,
    pub protocol: ProtocolKind,
    pub voice: VoiceConfig,
    /// PCM rate the remote is asked to produce.
    pub sample_rate: u32,
    pub connect_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    /// Whole-session ceiling; a session with no completion signal by then is
    /// failed rather than left hanging.
    pub session_timeout_ms: u64,
    /// Supplied via CLI or environment at startup, never read from or
    /// written to config files.
    #[serde(skip)]
    pub bearer_token: Option<String>,
}

impl Default for SynthesisSettings {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            protocol: ProtocolKind::Task,
            voice: VoiceConfig::default(),
            sample_rate: 24_000,
            connect_timeout_ms: 2_500,
            handshake_timeout_ms: 3_000,
            session_timeout_ms: 45_000,
            bearer_token: None,
        }
    }
}

impl SynthesisSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }
}
