//! Playback orchestration: at most one live utterance, superseded or
//! interrupted explicitly, never resumed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use talkover_audio::{
    DeviceSinkFactory, FrameRing, OutputSink, SinkConfig, SinkFactory, StreamResampler,
};
use talkover_foundation::AudioError;
use talkover_synth::{
    PcmTee, ProtocolFactory, SessionControl, SessionOutcome, SynthesisError, SynthesisSession,
    SynthesisSettings, WireProtocolFactory,
};
use talkover_telemetry::PlaybackMetrics;

use crate::config::PlaybackSettings;

/// Cadence of the tail-drain wait after a completed session.
const DRAIN_POLL: Duration = Duration::from_millis(25);

type StartHook = Arc<dyn Fn() + Send + Sync>;
type FinishHook = Arc<dyn Fn(&SessionOutcome) + Send + Sync>;
type ErrorHook = Arc<dyn Fn(&SynthesisError) + Send + Sync>;

struct LivePlayback {
    id: u64,
    control: SessionControl,
    sink: Arc<dyn OutputSink>,
}

/// Owns the one live playback. `speak` supersedes whatever is playing;
/// `interrupt` cuts it without starting anything new and is safe to call
/// from the capture thread that detected the user's voice.
pub struct PlaybackManager {
    synthesis: SynthesisSettings,
    playback: PlaybackSettings,
    protocol_factory: Arc<dyn ProtocolFactory>,
    sink_factory: Arc<dyn SinkFactory>,
    metrics: PlaybackMetrics,
    live: Mutex<Option<LivePlayback>>,
    next_id: AtomicU64,
    // Serializes the setup phase of concurrent speak calls; released before
    // awaiting the outcome so a later speak can supersede this one.
    speak_gate: tokio::sync::Mutex<()>,
    playing_tx: watch::Sender<bool>,
    on_start: Mutex<Option<StartHook>>,
    on_finish: Mutex<Option<FinishHook>>,
    on_error: Mutex<Option<ErrorHook>>,
    tee: Mutex<Option<PcmTee>>,
}

impl PlaybackManager {
    pub fn new(synthesis: SynthesisSettings, playback: PlaybackSettings) -> Self {
        Self::with_factories(
            synthesis,
            playback,
            Arc::new(WireProtocolFactory::new()),
            Arc::new(DeviceSinkFactory),
        )
    }

    /// Tests substitute scripted factories here.
    pub fn with_factories(
        synthesis: SynthesisSettings,
        playback: PlaybackSettings,
        protocol_factory: Arc<dyn ProtocolFactory>,
        sink_factory: Arc<dyn SinkFactory>,
    ) -> Self {
        let (playing_tx, _) = watch::channel(false);
        Self {
            synthesis,
            playback,
            protocol_factory,
            sink_factory,
            metrics: PlaybackMetrics::default(),
            live: Mutex::new(None),
            next_id: AtomicU64::new(1),
            speak_gate: tokio::sync::Mutex::new(()),
            playing_tx,
            on_start: Mutex::new(None),
            on_finish: Mutex::new(None),
            on_error: Mutex::new(None),
            tee: Mutex::new(None),
        }
    }

    pub fn metrics(&self) -> PlaybackMetrics {
        self.metrics.clone()
    }

    /// Observable speaking state; flips false the moment an interrupt lands.
    pub fn playing(&self) -> watch::Receiver<bool> {
        self.playing_tx.subscribe()
    }

    pub fn is_playing(&self) -> bool {
        *self.playing_tx.borrow()
    }

    pub fn set_on_start(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.on_start.lock() = Some(Arc::new(hook));
    }

    pub fn set_on_finish(&self, hook: impl Fn(&SessionOutcome) + Send + Sync + 'static) {
        *self.on_finish.lock() = Some(Arc::new(hook));
    }

    /// Called with the error when a session fails; the UI shows its "voice
    /// reply failed" state from here. Cancellation is not an error and does
    /// not reach this hook.
    pub fn set_on_error(&self, hook: impl Fn(&SynthesisError) + Send + Sync + 'static) {
        *self.on_error.lock() = Some(Arc::new(hook));
    }

    /// Route a copy of every decoded stream out of band, e.g. for WAV capture.
    pub fn set_tee(&self, tee: Option<PcmTee>) {
        *self.tee.lock() = tee;
    }

    /// Synthesize and play one utterance. Whatever is still live is stopped
    /// first. Resolves once the session reaches a terminal outcome and, on
    /// completion, the buffered tail has played out. `Err` means playback
    /// never started; cancellation and remote failures arrive as `Ok` with
    /// the corresponding outcome.
    pub async fn speak(&self, text: &str) -> Result<SessionOutcome, AudioError> {
        let gate = self.speak_gate.lock().await;
        self.stop();

        let source_rate = self.synthesis.sample_rate;
        let sink_cfg = SinkConfig {
            device: self.playback.output_device.clone(),
            prebuffer_samples: ms_to_samples(self.playback.prebuffer_ms, source_rate),
            source_rate,
        };
        let plan = self.sink_factory.negotiate(&sink_cfg)?;

        // Ring and sink run at the negotiated device rate; the session
        // converts on the write side when that differs from the source.
        let capacity = ms_to_samples(self.playback.buffer_ms, plan.sample_rate).max(1);
        let (ring, writer, reader) = FrameRing::with_capacity(capacity);
        let ring_stats = ring.clone();
        let resampler = if plan.sample_rate == source_rate {
            None
        } else {
            Some(StreamResampler::new(source_rate, plan.sample_rate)?)
        };

        let sink = self.sink_factory.open(reader, &plan, &sink_cfg)?;

        let handle = SynthesisSession::spawn(
            Arc::clone(&self.protocol_factory),
            self.synthesis.clone(),
            text.to_string(),
            ring,
            writer,
            resampler,
            self.metrics.clone(),
            self.tee.lock().clone(),
        );

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        *self.live.lock() = Some(LivePlayback {
            id,
            control: handle.control(),
            sink: Arc::clone(&sink),
        });
        self.playing_tx.send_replace(true);
        self.metrics.set_playing(true);
        if let Some(hook) = self.on_start.lock().clone() {
            hook();
        }
        drop(gate);

        let outcome = handle.outcome().await;

        if let SessionOutcome::Completed(_) = &outcome {
            self.wait_for_drain(sink.as_ref()).await;
        }
        self.release(id, &sink);
        self.metrics.record_played(ring_stats.total_read());
        self.metrics.record_underruns(ring_stats.underruns());
        if let SessionOutcome::Failed(err) = &outcome {
            if let Some(hook) = self.on_error.lock().clone() {
                hook(err);
            }
        }
        if let Some(hook) = self.on_finish.lock().clone() {
            hook(&outcome);
        }
        Ok(outcome)
    }

    /// Cut the live playback now: resolve its session as cancelled and
    /// silence the sink from the next render quantum. Idempotent,
    /// non-blocking, callable from any thread.
    pub fn interrupt(&self) {
        let live = {
            let guard = self.live.lock();
            guard
                .as_ref()
                .map(|l| (l.control.clone(), Arc::clone(&l.sink)))
        };
        let Some((control, sink)) = live else {
            return;
        };
        debug!("Interrupting live playback");
        control.stop();
        sink.halt();
        self.playing_tx.send_replace(false);
        self.metrics.set_playing(false);
    }

    /// Stop and fully release whatever is live, including the device. Blocks
    /// briefly on teardown; never call from a real-time callback.
    pub fn stop(&self) {
        let previous = self.live.lock().take();
        if let Some(live) = previous {
            info!("Stopping live playback");
            live.control.stop();
            live.sink.halt();
            live.sink.close();
            self.playing_tx.send_replace(false);
            self.metrics.set_playing(false);
        }
    }

    /// Let the buffered tail play out. Returns early when the sink halts or
    /// dies; capped so a wedged device cannot hang the caller.
    async fn wait_for_drain(&self, sink: &dyn OutputSink) {
        let cap = Duration::from_millis(self.playback.buffer_ms + 2_000);
        let drained = tokio::time::timeout(cap, async {
            while !sink.is_drained() && !sink.is_halted() {
                tokio::time::sleep(DRAIN_POLL).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!("Output sink did not drain in time");
        }
    }

    fn release(&self, id: u64, sink: &Arc<dyn OutputSink>) {
        let ours = {
            let mut live = self.live.lock();
            if live.as_ref().map(|l| l.id) == Some(id) {
                live.take();
                true
            } else {
                false
            }
        };
        // Idempotent; a superseding speak may have closed it already.
        sink.close();
        if ours {
            self.playing_tx.send_replace(false);
            self.metrics.set_playing(false);
        }
    }
}

fn ms_to_samples(ms: u64, rate: u32) -> usize {
    (ms as u128 * rate as u128 / 1_000) as usize
}
