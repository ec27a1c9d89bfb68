//! Session lifecycle for one streaming synthesis exchange.
//!
//! A session drives a [`SynthesisProtocol`] from connect through drain and
//! resolves exactly one [`SessionOutcome`]. Cancellation can race normal
//! completion from any thread; whichever path reaches the resolver first
//! wins and every later attempt is a no-op. Stopping always marks the ring
//! end-of-stream so the render side drains out instead of waiting forever.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, error, info, trace};

use talkover_audio::{AudioFrame, FrameRing, FrameWriter, StreamResampler};
use talkover_telemetry::PlaybackMetrics;

use crate::config::SynthesisSettings;
use crate::error::{SynthesisError, TransportError};
use crate::protocol::{ProtocolEvent, ProtocolFactory, SynthesisProtocol};

/// Backoff between write attempts while the ring is full.
const WRITE_RETRY: Duration = Duration::from_millis(25);

/// Where a session is in its life. Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Negotiated,
    Streaming,
    Draining,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Cancelled
        )
    }
}

/// Counters accumulated while audio flows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Audio payloads decoded into samples.
    pub frames_decoded: u64,
    /// Total mono samples decoded.
    pub samples_decoded: u64,
    /// Audio payloads dropped because they would not decode.
    pub decode_errors: u64,
    /// Milliseconds from session start to the first decoded sample.
    pub first_audio_ms: Option<u64>,
    /// Milliseconds from session start to completion.
    pub elapsed_ms: u64,
}

/// The single resolution of a session.
#[derive(Debug)]
pub enum SessionOutcome {
    /// The remote finished and every decoded sample reached the ring.
    Completed(SessionStats),
    /// Stopped locally before completion. Not an error.
    Cancelled,
    Failed(SynthesisError),
}

struct SessionShared {
    state: Mutex<SessionState>,
    cancel: AtomicBool,
    cancelled: Notify,
    resolver: Mutex<Option<oneshot::Sender<SessionOutcome>>>,
    ring: FrameRing,
    metrics: PlaybackMetrics,
}

impl SessionShared {
    fn new(ring: FrameRing, metrics: PlaybackMetrics) -> (Arc<Self>, oneshot::Receiver<SessionOutcome>) {
        let (tx, rx) = oneshot::channel();
        let shared = Arc::new(Self {
            state: Mutex::new(SessionState::Idle),
            cancel: AtomicBool::new(false),
            cancelled: Notify::new(),
            resolver: Mutex::new(Some(tx)),
            ring,
            metrics,
        });
        (shared, rx)
    }

    fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Move forward one lifecycle step. Refuses to leave a terminal state and
    /// refuses transitions that skip a phase.
    fn advance(&self, to: SessionState) -> bool {
        let mut state = self.state.lock();
        if state.is_terminal() {
            return false;
        }
        let valid = matches!(
            (*state, to),
            (SessionState::Idle, SessionState::Connecting)
                | (SessionState::Connecting, SessionState::Negotiated)
                | (SessionState::Negotiated, SessionState::Streaming)
                | (SessionState::Streaming, SessionState::Draining)
        );
        if valid {
            trace!(from = ?*state, to = ?to, "session state");
            *state = to;
        }
        valid
    }

    /// Resolve the session. The first caller wins; everyone after gets
    /// `false` and changes nothing. Always marks the ring end-of-stream so
    /// the sink drains whatever audio already landed.
    fn try_finish(&self, outcome: SessionOutcome) -> bool {
        let Some(tx) = self.resolver.lock().take() else {
            return false;
        };
        let terminal = match &outcome {
            SessionOutcome::Completed(_) => SessionState::Completed,
            SessionOutcome::Cancelled => SessionState::Cancelled,
            SessionOutcome::Failed(_) => SessionState::Failed,
        };
        *self.state.lock() = terminal;
        self.ring.mark_eos();
        match &outcome {
            SessionOutcome::Completed(stats) => {
                info!(
                    samples = stats.samples_decoded,
                    frames = stats.frames_decoded,
                    dropped = stats.decode_errors,
                    elapsed_ms = stats.elapsed_ms,
                    "Synthesis session completed"
                );
                self.metrics.record_session_completed(stats.elapsed_ms);
            }
            SessionOutcome::Cancelled => {
                info!("Synthesis session cancelled");
                self.metrics.record_session_interrupted();
            }
            SessionOutcome::Failed(err) => {
                error!(error = %err, "Synthesis session failed");
                self.metrics.record_session_failed();
            }
        }
        let _ = tx.send(outcome);
        true
    }
}

/// Cheap cloneable handle used to stop or observe a running session from any
/// thread, including audio callbacks.
#[derive(Clone)]
pub struct SessionControl {
    shared: Arc<SessionShared>,
}

impl SessionControl {
    /// Stop the session. Synchronous, idempotent, safe to call from any
    /// thread and any state. If the session has not resolved yet this call
    /// resolves it as `Cancelled` before returning; the driver task notices
    /// and tears the connection down on its own time.
    pub fn stop(&self) {
        if !self.shared.cancel.swap(true, Ordering::SeqCst) {
            debug!("Session stop requested");
        }
        self.shared.cancelled.notify_waiters();
        self.shared.ring.mark_eos();
        self.shared.try_finish(SessionOutcome::Cancelled);
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn is_terminal(&self) -> bool {
        self.shared.state().is_terminal()
    }
}

/// Owner's view of a spawned session: a control handle plus the future
/// outcome.
pub struct SessionHandle {
    control: SessionControl,
    outcome: oneshot::Receiver<SessionOutcome>,
}

impl SessionHandle {
    pub fn control(&self) -> SessionControl {
        self.control.clone()
    }

    pub fn state(&self) -> SessionState {
        self.control.state()
    }

    /// Wait for the session to resolve. If the driver task vanished without
    /// resolving (runtime shutdown), reports `Cancelled`.
    pub async fn outcome(self) -> SessionOutcome {
        match self.outcome.await {
            Ok(outcome) => outcome,
            Err(_) => SessionOutcome::Cancelled,
        }
    }
}

/// Copies decoded PCM out of the session as a side channel, e.g. for writing
/// a WAV capture of everything synthesized.
#[derive(Clone)]
pub struct PcmTee {
    tx: mpsc::UnboundedSender<Vec<i16>>,
}

impl PcmTee {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Vec<i16>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn push(&self, samples: &[i16]) {
        let _ = self.tx.send(samples.to_vec());
    }
}

/// One streaming synthesis exchange, driven on a spawned task.
pub struct SynthesisSession;

impl SynthesisSession {
    /// Start synthesizing `text` into the ring. Must be called from within a
    /// Tokio runtime. The returned handle resolves exactly once, whether the
    /// session completes, fails, or is stopped.
    ///
    /// When the ring runs at a different rate than the decoded stream, pass a
    /// resampler; decoded samples are converted before they enter the ring
    /// and all totals are accounted post-conversion.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        factory: Arc<dyn ProtocolFactory>,
        settings: SynthesisSettings,
        text: String,
        ring: FrameRing,
        writer: FrameWriter,
        resampler: Option<StreamResampler>,
        metrics: PlaybackMetrics,
        tee: Option<PcmTee>,
    ) -> SessionHandle {
        let (shared, outcome) = SessionShared::new(ring, metrics);
        shared.metrics.record_session_start();
        let control = SessionControl {
            shared: Arc::clone(&shared),
        };

        tokio::spawn(run(shared, factory, settings, text, writer, resampler, tee));

        SessionHandle { control, outcome }
    }
}

enum DriveEnd {
    Completed(SessionStats),
    Failed(SynthesisError),
}

async fn run(
    shared: Arc<SessionShared>,
    factory: Arc<dyn ProtocolFactory>,
    settings: SynthesisSettings,
    text: String,
    mut writer: FrameWriter,
    resampler: Option<StreamResampler>,
    tee: Option<PcmTee>,
) {
    // Register interest in cancellation before checking the flag, so a stop()
    // that lands between the check and the select cannot be missed.
    let cancelled = shared.cancelled.notified();
    tokio::pin!(cancelled);
    cancelled.as_mut().enable();
    if shared.cancel.load(Ordering::SeqCst) {
        shared.try_finish(SessionOutcome::Cancelled);
        return;
    }

    let mut resampler = resampler;
    let end = tokio::select! {
        biased;
        _ = &mut cancelled => {
            // Dropping the drive future drops the protocol and its transport.
            shared.try_finish(SessionOutcome::Cancelled);
            return;
        }
        end = drive(
            &shared,
            factory.as_ref(),
            &settings,
            &text,
            &mut writer,
            &mut resampler,
            tee.as_ref(),
        ) => end,
    };

    match end {
        DriveEnd::Completed(stats) => {
            shared.try_finish(SessionOutcome::Completed(stats));
        }
        DriveEnd::Failed(err) => {
            shared.try_finish(SessionOutcome::Failed(err));
        }
    }
}

async fn drive(
    shared: &SessionShared,
    factory: &dyn ProtocolFactory,
    settings: &SynthesisSettings,
    text: &str,
    writer: &mut FrameWriter,
    resampler: &mut Option<StreamResampler>,
    tee: Option<&PcmTee>,
) -> DriveEnd {
    let started = Instant::now();
    let deadline = tokio::time::Instant::now() + settings.session_timeout();
    shared.advance(SessionState::Connecting);

    let ceiling = settings.session_timeout();

    let mut protocol = match factory.connect(settings).await {
        Ok(protocol) => protocol,
        Err(err) => return DriveEnd::Failed(err),
    };
    if let Err(err) = send_bounded(deadline, ceiling, protocol.begin()).await {
        protocol.shutdown().await;
        return DriveEnd::Failed(err);
    }

    let mut stats = SessionStats::default();
    let bound = settings.handshake_timeout();
    let ready = tokio::time::timeout(
        bound,
        wait_ready(
            protocol.as_mut(),
            shared,
            writer,
            resampler,
            tee,
            &mut stats,
            started,
        ),
    )
    .await;
    match ready {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            protocol.shutdown().await;
            return DriveEnd::Failed(err);
        }
        Err(_) => {
            protocol.shutdown().await;
            return DriveEnd::Failed(SynthesisError::HandshakeTimeout(bound));
        }
    }
    shared.advance(SessionState::Negotiated);

    shared.advance(SessionState::Streaming);
    if let Err(err) = send_bounded(deadline, ceiling, protocol.submit_text(text)).await {
        protocol.shutdown().await;
        return DriveEnd::Failed(err);
    }
    if let Err(err) = send_bounded(deadline, ceiling, protocol.finish()).await {
        protocol.shutdown().await;
        return DriveEnd::Failed(err);
    }
    shared.advance(SessionState::Draining);

    let drained = tokio::time::timeout_at(
        deadline,
        drain(
            protocol.as_mut(),
            shared,
            writer,
            resampler,
            tee,
            &mut stats,
            started,
        ),
    )
    .await;
    let end = match drained {
        Ok(Ok(())) => {
            stats.elapsed_ms = started.elapsed().as_millis() as u64;
            DriveEnd::Completed(stats)
        }
        Ok(Err(err)) => DriveEnd::Failed(err),
        Err(_) => DriveEnd::Failed(SynthesisError::Timeout(settings.session_timeout())),
    };
    protocol.shutdown().await;
    end
}

/// Run a send-side protocol call under the whole-session deadline. A transport
/// wedged on write otherwise hangs the session past its ceiling.
async fn send_bounded<F>(
    deadline: tokio::time::Instant,
    ceiling: Duration,
    call: F,
) -> Result<(), SynthesisError>
where
    F: std::future::Future<Output = Result<(), SynthesisError>>,
{
    match tokio::time::timeout_at(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(SynthesisError::Timeout(ceiling)),
    }
}

/// Consume events until the remote acknowledges readiness. Some servers start
/// streaming audio before the acknowledgment; those samples are kept.
#[allow(clippy::too_many_arguments)]
async fn wait_ready(
    protocol: &mut dyn SynthesisProtocol,
    shared: &SessionShared,
    writer: &mut FrameWriter,
    resampler: &mut Option<StreamResampler>,
    tee: Option<&PcmTee>,
    stats: &mut SessionStats,
    started: Instant,
) -> Result<(), SynthesisError> {
    loop {
        match protocol.next_event().await? {
            ProtocolEvent::Ready => return Ok(()),
            ProtocolEvent::Audio(frame) => {
                deliver(shared, writer, resampler, tee, stats, started, &frame).await;
            }
            ProtocolEvent::PayloadDropped => {
                stats.decode_errors += 1;
                shared.metrics.record_decode_errors(1);
            }
            ProtocolEvent::Finished => {
                return Err(SynthesisError::Protocol(
                    "Remote finished before acknowledging readiness".into(),
                ));
            }
            ProtocolEvent::Closed => {
                return Err(SynthesisError::Connection(TransportError::Closed));
            }
        }
    }
}

/// Consume events until the remote declares completion.
#[allow(clippy::too_many_arguments)]
async fn drain(
    protocol: &mut dyn SynthesisProtocol,
    shared: &SessionShared,
    writer: &mut FrameWriter,
    resampler: &mut Option<StreamResampler>,
    tee: Option<&PcmTee>,
    stats: &mut SessionStats,
    started: Instant,
) -> Result<(), SynthesisError> {
    loop {
        match protocol.next_event().await? {
            ProtocolEvent::Audio(frame) => {
                deliver(shared, writer, resampler, tee, stats, started, &frame).await;
            }
            ProtocolEvent::PayloadDropped => {
                stats.decode_errors += 1;
                shared.metrics.record_decode_errors(1);
            }
            ProtocolEvent::Finished => {
                // The converter may still hold a partial chunk.
                if let Some(rs) = resampler.as_mut() {
                    let tail = rs.flush();
                    if !tail.is_empty() {
                        stats.samples_decoded += tail.len() as u64;
                        shared.metrics.record_decoded(0, tail.len() as u64);
                        write_all(writer, &tail).await;
                    }
                }
                return Ok(());
            }
            // A duplicate readiness ack after the first is harmless.
            ProtocolEvent::Ready => {}
            ProtocolEvent::Closed => {
                return Err(SynthesisError::Connection(TransportError::Closed));
            }
        }
    }
}

/// Push one decoded frame into the ring, converting first when the ring
/// runs at a different rate.
#[allow(clippy::too_many_arguments)]
async fn deliver(
    shared: &SessionShared,
    writer: &mut FrameWriter,
    resampler: &mut Option<StreamResampler>,
    tee: Option<&PcmTee>,
    stats: &mut SessionStats,
    started: Instant,
    frame: &AudioFrame,
) {
    // The tee carries the pristine decoded stream at the synthesis rate.
    if let Some(tee) = tee {
        tee.push(&frame.samples);
    }
    let converted;
    let samples: &[i16] = match resampler.as_mut() {
        Some(rs) => {
            converted = rs.process(&frame.samples);
            &converted
        }
        None => &frame.samples,
    };
    // The converter buffers until it has a full chunk.
    if samples.is_empty() {
        return;
    }

    if stats.first_audio_ms.is_none() {
        let latency = started.elapsed().as_millis() as u64;
        stats.first_audio_ms = Some(latency);
        shared.metrics.record_first_audio(latency);
        debug!(latency_ms = latency, seq = frame.seq, "First audio");
    }
    stats.frames_decoded += 1;
    stats.samples_decoded += samples.len() as u64;
    shared.metrics.record_decoded(1, samples.len() as u64);

    write_all(writer, samples).await;
    shared
        .metrics
        .update_ring_fill((shared.ring.level() * 100.0) as usize);
}

/// Write every sample, backing off while the ring is full. Writes stop
/// silently once end-of-stream is marked, which is how a stop racing a slow
/// consumer resolves without blocking.
async fn write_all(writer: &mut FrameWriter, samples: &[i16]) {
    let mut offset = 0;
    while offset < samples.len() {
        let accepted = writer.write(&samples[offset..]);
        offset += accepted;
        if accepted == 0 {
            if writer.is_eos() {
                return;
            }
            tokio::time::sleep(WRITE_RETRY).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared() -> (Arc<SessionShared>, oneshot::Receiver<SessionOutcome>) {
        let (ring, _writer, _reader) = FrameRing::with_capacity(64);
        SessionShared::new(ring, PlaybackMetrics::default())
    }

    #[test]
    fn advance_walks_the_lifecycle_in_order() {
        let (shared, _rx) = shared();
        assert!(shared.advance(SessionState::Connecting));
        assert!(shared.advance(SessionState::Negotiated));
        assert!(shared.advance(SessionState::Streaming));
        assert!(shared.advance(SessionState::Draining));
        assert_eq!(shared.state(), SessionState::Draining);
    }

    #[test]
    fn advance_rejects_phase_skips() {
        let (shared, _rx) = shared();
        assert!(!shared.advance(SessionState::Streaming));
        assert_eq!(shared.state(), SessionState::Idle);
    }

    #[test]
    fn terminal_state_is_absorbing() {
        let (shared, _rx) = shared();
        assert!(shared.try_finish(SessionOutcome::Cancelled));
        assert!(!shared.advance(SessionState::Connecting));
        assert_eq!(shared.state(), SessionState::Cancelled);
    }

    #[test]
    fn first_finish_wins_and_marks_eos() {
        let (ring, _writer, _reader) = FrameRing::with_capacity(64);
        let (shared, mut rx) = SessionShared::new(ring.clone(), PlaybackMetrics::default());

        assert!(shared.try_finish(SessionOutcome::Cancelled));
        assert!(!shared.try_finish(SessionOutcome::Completed(SessionStats::default())));

        assert_eq!(shared.state(), SessionState::Cancelled);
        assert!(ring.is_eos(), "finishing must release the render side");
        assert!(matches!(rx.try_recv(), Ok(SessionOutcome::Cancelled)));
    }

    #[test]
    fn stop_is_idempotent() {
        let (shared, mut rx) = shared();
        let control = SessionControl {
            shared: Arc::clone(&shared),
        };
        control.stop();
        control.stop();
        assert_eq!(control.state(), SessionState::Cancelled);
        assert!(matches!(rx.try_recv(), Ok(SessionOutcome::Cancelled)));
        assert!(matches!(
            rx.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
    }
}
