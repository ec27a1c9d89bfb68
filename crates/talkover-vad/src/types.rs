/// Detection phase of the speech gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatePhase {
    /// Listening for sustained energy above the threshold.
    Armed,
    /// Sustained speech confirmed; waiting for the silence timeout.
    Voice,
}

/// Events emitted by the monitor. `VoiceStart` is the barge-in trigger.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VadEvent {
    VoiceStart { energy_db: f32 },
    VoiceStop { voiced_ms: u64 },
}

/// Point-in-time view of the gate, for status displays and logs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoiceActivity {
    pub voiced: bool,
    pub rms_db: f32,
}
