use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use talkover_audio::CaptureStream;
use talkover_foundation::AudioError;

use crate::config::VadConfig;
use crate::gate::SpeechGate;
use crate::types::{VadEvent, VoiceActivity};

/// Owns the microphone stream, the gate, and the silence checker.
///
/// `pause` releases the capture stream but keeps the checker and the
/// configuration, so `resume` only has to re-attach the input device. `stop`
/// releases everything; the configuration survives and `start` brings the
/// monitor back.
pub struct VoiceMonitor {
    config: VadConfig,
    shared: Arc<MonitorShared>,
    events: broadcast::Sender<VadEvent>,
    capture: Option<CaptureStream>,
    checker: Option<JoinHandle<()>>,
}

struct MonitorShared {
    gate: Mutex<SpeechGate>,
    paused: AtomicBool,
}

impl VoiceMonitor {
    pub fn new(config: VadConfig) -> Self {
        let (events, _) = broadcast::channel(32);
        let shared = Arc::new(MonitorShared {
            gate: Mutex::new(SpeechGate::new(&config)),
            paused: AtomicBool::new(false),
        });
        Self {
            config,
            shared,
            events,
            capture: None,
            checker: None,
        }
    }

    /// Open the input device and start monitoring. Idempotent. Must be
    /// called from within a Tokio runtime; the silence checker runs there.
    pub fn start(&mut self) -> Result<(), AudioError> {
        if self.checker.is_some() {
            return Ok(());
        }
        self.shared.gate.lock().reset();
        self.shared.paused.store(false, Ordering::SeqCst);
        self.attach_capture()?;

        let checker_shared = Arc::clone(&self.shared);
        let checker_events = self.events.clone();
        let interval = Duration::from_millis(self.config.check_interval_ms.max(10));
        self.checker = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if checker_shared.paused.load(Ordering::SeqCst) {
                    continue;
                }
                let event = checker_shared.gate.lock().poll_silence(Instant::now());
                if let Some(event) = event {
                    let _ = checker_events.send(event);
                }
            }
        }));

        tracing::info!(
            threshold_db = self.config.threshold_db,
            min_voice_ms = self.config.min_voice_ms,
            silence_timeout_ms = self.config.silence_timeout_ms,
            "Voice monitor started"
        );
        Ok(())
    }

    /// Suspend detection and release the input device. The checker keeps
    /// ticking but sees a paused, re-armed gate, so nothing fires until
    /// `resume`.
    pub fn pause(&mut self) {
        if self.shared.paused.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.gate.lock().reset();
        if let Some(capture) = self.capture.take() {
            capture.stop();
        }
        tracing::debug!("Voice monitor paused");
    }

    /// Re-attach the input device after a `pause`. The monitor itself is not
    /// rebuilt; gate state and subscriptions carry over.
    pub fn resume(&mut self) -> Result<(), AudioError> {
        if !self.is_running() {
            return Ok(());
        }
        if self.capture.is_none() {
            self.attach_capture()?;
        }
        self.shared.paused.store(false, Ordering::SeqCst);
        tracing::debug!("Voice monitor resumed");
        Ok(())
    }

    fn attach_capture(&mut self) -> Result<(), AudioError> {
        let window_shared = Arc::clone(&self.shared);
        let window_events = self.events.clone();
        let capture = CaptureStream::open(
            self.config.device.as_deref(),
            self.config.window_ms,
            Box::new(move |window| {
                if window_shared.paused.load(Ordering::SeqCst) {
                    return;
                }
                let event = window_shared.gate.lock().on_window(window, Instant::now());
                if let Some(event) = event {
                    let _ = window_events.send(event);
                }
            }),
        )?;
        tracing::debug!(device = ?capture.info().device_name, "Capture attached");
        self.capture = Some(capture);
        Ok(())
    }

    /// Release the input device and stop the checker. Configuration is kept.
    pub fn stop(&mut self) {
        if let Some(checker) = self.checker.take() {
            checker.abort();
        }
        if let Some(capture) = self.capture.take() {
            capture.stop();
            tracing::info!("Voice monitor stopped");
        }
        self.shared.gate.lock().reset();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VadEvent> {
        self.events.subscribe()
    }

    pub fn activity(&self) -> VoiceActivity {
        self.shared.gate.lock().snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.checker.is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &VadConfig {
        &self.config
    }
}

impl Drop for VoiceMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
