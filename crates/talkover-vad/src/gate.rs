use std::time::{Duration, Instant};

use crate::config::VadConfig;
use crate::energy::EnergyMeter;
use crate::types::{GatePhase, VadEvent, VoiceActivity};

/// Two-phase speech gate with onset debouncing.
///
/// Windows drive the Armed -> Voice transition; the Voice -> Armed transition
/// is driven by `poll_silence`, called from a separate checker at its own
/// cadence. A single quiet window while armed resets the onset count, so only
/// consecutive loud windows can trigger voice.
pub struct SpeechGate {
    phase: GatePhase,
    loud_windows: u32,
    onset_windows: u32,
    threshold_db: f32,
    silence_timeout: Duration,
    voice_since: Option<Instant>,
    last_loud_at: Option<Instant>,
    last_db: f32,
    meter: EnergyMeter,
}

impl SpeechGate {
    pub fn new(config: &VadConfig) -> Self {
        Self {
            phase: GatePhase::Armed,
            loud_windows: 0,
            onset_windows: config.onset_windows(),
            threshold_db: config.threshold_db,
            silence_timeout: Duration::from_millis(config.silence_timeout_ms),
            voice_since: None,
            last_loud_at: None,
            last_db: -100.0,
            meter: EnergyMeter::new(),
        }
    }

    /// Feed one analysis window. Returns `VoiceStart` when sustained energy
    /// crosses the onset requirement.
    pub fn on_window(&mut self, window: &[i16], now: Instant) -> Option<VadEvent> {
        let db = self.meter.dbfs(window);
        self.last_db = db;
        let loud = db >= self.threshold_db;

        match self.phase {
            GatePhase::Armed => {
                if loud {
                    self.loud_windows += 1;
                    if self.loud_windows >= self.onset_windows {
                        self.phase = GatePhase::Voice;
                        self.voice_since = Some(now);
                        self.last_loud_at = Some(now);
                        self.loud_windows = 0;
                        return Some(VadEvent::VoiceStart { energy_db: db });
                    }
                } else {
                    self.loud_windows = 0;
                }
            }
            GatePhase::Voice => {
                if loud {
                    self.last_loud_at = Some(now);
                }
            }
        }

        None
    }

    /// Evaluate the silence timeout. Returns `VoiceStop` once silence has
    /// lasted the configured timeout, then re-arms the gate.
    pub fn poll_silence(&mut self, now: Instant) -> Option<VadEvent> {
        if self.phase != GatePhase::Voice {
            return None;
        }
        let last_loud = self.last_loud_at?;
        if now.duration_since(last_loud) < self.silence_timeout {
            return None;
        }

        let voiced_ms = self
            .voice_since
            .map(|start| now.duration_since(start).as_millis() as u64)
            .unwrap_or(0)
            .max(1);
        self.phase = GatePhase::Armed;
        self.voice_since = None;
        self.last_loud_at = None;
        self.loud_windows = 0;
        Some(VadEvent::VoiceStop { voiced_ms })
    }

    /// Back to Armed without emitting anything.
    pub fn reset(&mut self) {
        self.phase = GatePhase::Armed;
        self.loud_windows = 0;
        self.voice_since = None;
        self.last_loud_at = None;
    }

    pub fn phase(&self) -> GatePhase {
        self.phase
    }

    pub fn snapshot(&self) -> VoiceActivity {
        VoiceActivity {
            voiced: self.phase == GatePhase::Voice,
            rms_db: self.last_db,
        }
    }
}
