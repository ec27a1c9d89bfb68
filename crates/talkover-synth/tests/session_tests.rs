//! Integration tests for the synthesis session lifecycle.
//!
//! Tests cover:
//! - Happy paths for both wire dialects, end to end into the ring buffer
//! - Connect, handshake, and whole-session timeout failures
//! - Idempotent stop from a foreign thread and first-writer-wins resolution
//! - Undecodable audio payloads dropped without failing the session
//! - Unknown and malformed control messages ignored

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{json, Value};

use talkover_audio::{FrameReader, FrameRing, ReadStatus, StreamResampler};
use talkover_synth::{
    DuplexTransport, ProtocolKind, SessionHandle, SessionOutcome, SessionState, SynthesisError,
    SynthesisSession, SynthesisSettings, TransportConnector, TransportError, WireMessage,
    WireProtocolFactory,
};
use talkover_telemetry::PlaybackMetrics;

// ─── Test doubles ───────────────────────────────────────────────────────────

/// Transport that replays a fixed inbound script and records outbound text.
struct ScriptedTransport {
    script: VecDeque<WireMessage>,
    hang_when_empty: bool,
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl DuplexTransport for ScriptedTransport {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.sent.lock().push(text);
        Ok(())
    }

    async fn send_binary(&mut self, _data: Bytes) -> Result<(), TransportError> {
        Ok(())
    }

    async fn next_message(&mut self) -> Option<Result<WireMessage, TransportError>> {
        match self.script.pop_front() {
            Some(message) => Some(Ok(message)),
            None if self.hang_when_empty => std::future::pending().await,
            None => None,
        }
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct ScriptedConnector {
    script: Mutex<VecDeque<WireMessage>>,
    hang_when_empty: bool,
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
}

impl ScriptedConnector {
    fn new(script: Vec<WireMessage>) -> Arc<Self> {
        Self::build(script, false)
    }

    /// Script that never ends: after the last message the transport pends
    /// instead of reporting a close.
    fn stalling(script: Vec<WireMessage>) -> Arc<Self> {
        Self::build(script, true)
    }

    fn build(script: Vec<WireMessage>, hang_when_empty: bool) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            hang_when_empty,
            sent: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    fn sent_frames(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.sent)
    }

    fn closed_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closed)
    }
}

#[async_trait]
impl TransportConnector for ScriptedConnector {
    async fn connect(
        &self,
        _endpoint: &str,
        _bearer: Option<&str>,
    ) -> Result<Box<dyn DuplexTransport>, TransportError> {
        Ok(Box::new(ScriptedTransport {
            script: std::mem::take(&mut *self.script.lock()),
            hang_when_empty: self.hang_when_empty,
            sent: Arc::clone(&self.sent),
            closed: Arc::clone(&self.closed),
        }))
    }
}

/// Transport whose writes wedge after a budget of successful sends. The
/// inbound side replays its script and then pends, so only the whole-session
/// ceiling can end the session.
struct WedgedSendTransport {
    sends_left: usize,
    script: VecDeque<WireMessage>,
}

#[async_trait]
impl DuplexTransport for WedgedSendTransport {
    async fn send_text(&mut self, _text: String) -> Result<(), TransportError> {
        if self.sends_left == 0 {
            std::future::pending().await
        } else {
            self.sends_left -= 1;
            Ok(())
        }
    }

    async fn send_binary(&mut self, _data: Bytes) -> Result<(), TransportError> {
        Ok(())
    }

    async fn next_message(&mut self) -> Option<Result<WireMessage, TransportError>> {
        match self.script.pop_front() {
            Some(message) => Some(Ok(message)),
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) {}
}

struct WedgedSendConnector {
    allowed_sends: usize,
    script: Mutex<VecDeque<WireMessage>>,
}

impl WedgedSendConnector {
    fn new(allowed_sends: usize, script: Vec<WireMessage>) -> Arc<Self> {
        Arc::new(Self {
            allowed_sends,
            script: Mutex::new(script.into()),
        })
    }
}

#[async_trait]
impl TransportConnector for WedgedSendConnector {
    async fn connect(
        &self,
        _endpoint: &str,
        _bearer: Option<&str>,
    ) -> Result<Box<dyn DuplexTransport>, TransportError> {
        Ok(Box::new(WedgedSendTransport {
            sends_left: self.allowed_sends,
            script: std::mem::take(&mut *self.script.lock()),
        }))
    }
}

struct RefusingConnector;

#[async_trait]
impl TransportConnector for RefusingConnector {
    async fn connect(
        &self,
        _endpoint: &str,
        _bearer: Option<&str>,
    ) -> Result<Box<dyn DuplexTransport>, TransportError> {
        Err(TransportError::Connect("connection refused".into()))
    }
}

struct PendingConnector;

#[async_trait]
impl TransportConnector for PendingConnector {
    async fn connect(
        &self,
        _endpoint: &str,
        _bearer: Option<&str>,
    ) -> Result<Box<dyn DuplexTransport>, TransportError> {
        std::future::pending().await
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────────

fn pcm_bytes(samples: &[i16]) -> Bytes {
    let mut raw = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        raw.extend_from_slice(&sample.to_le_bytes());
    }
    Bytes::from(raw)
}

fn text(value: Value) -> WireMessage {
    WireMessage::Text(value.to_string())
}

fn settings(protocol: ProtocolKind) -> SynthesisSettings {
    SynthesisSettings {
        endpoint: "wss://synth.test/stream".into(),
        protocol,
        voice: talkover_synth::VoiceConfig {
            voice_id: "calm-counselor".into(),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn spawn_session(
    connector: Arc<dyn TransportConnector>,
    settings: SynthesisSettings,
    utterance: &str,
) -> (SessionHandle, FrameRing, FrameReader) {
    let (ring, writer, reader) = FrameRing::with_capacity(72_000);
    let factory = Arc::new(WireProtocolFactory::with_connector(connector));
    let handle = SynthesisSession::spawn(
        factory,
        settings,
        utterance.to_string(),
        ring.clone(),
        writer,
        None,
        PlaybackMetrics::default(),
        None,
    );
    (handle, ring, reader)
}

/// Read everything buffered. Only valid once end-of-stream is marked,
/// otherwise an empty ring pads forever instead of draining.
fn drain_ring(reader: &mut FrameReader) -> Vec<i16> {
    let mut out = Vec::new();
    let mut buf = [0i16; 256];
    loop {
        match reader.read_into(&mut buf) {
            ReadStatus::Filled { samples } | ReadStatus::Padded { samples, .. } => {
                out.extend_from_slice(&buf[..samples]);
            }
            ReadStatus::Drained => return out,
        }
    }
}

fn expect_completed(outcome: SessionOutcome) -> talkover_synth::SessionStats {
    match outcome {
        SessionOutcome::Completed(stats) => stats,
        other => panic!("expected a completed session, got {:?}", other),
    }
}

// ─── Happy paths ────────────────────────────────────────────────────────────

#[tokio::test]
async fn task_dialect_streams_pcm_into_the_ring() {
    let samples: Vec<i16> = (0i16..480).map(|n| (n % 311) - 150).collect();
    let connector = ScriptedConnector::new(vec![
        text(json!({"type": "task-started"})),
        WireMessage::Binary(pcm_bytes(&samples[..240])),
        WireMessage::Binary(pcm_bytes(&samples[240..])),
        text(json!({"type": "task-finished"})),
    ]);
    let sent = connector.sent_frames();
    let closed = connector.closed_flag();

    let (handle, ring, mut reader) = spawn_session(
        connector,
        settings(ProtocolKind::Task),
        "Take two tablets with water.",
    );
    let stats = expect_completed(handle.outcome().await);

    assert_eq!(stats.frames_decoded, 2);
    assert_eq!(stats.samples_decoded, 480);
    assert_eq!(stats.decode_errors, 0);
    assert!(stats.first_audio_ms.is_some());

    assert!(ring.is_eos(), "completion must mark end-of-stream");
    assert_eq!(ring.total_written(), 480);
    assert_eq!(drain_ring(&mut reader), samples);
    assert!(closed.load(Ordering::SeqCst), "transport should be closed");

    let sent = sent.lock();
    assert_eq!(sent.len(), 3);
    let run: Value = serde_json::from_str(&sent[0]).unwrap();
    assert_eq!(run["type"], "run-task");
    assert_eq!(run["voice"], "calm-counselor");
    assert_eq!(run["model"], "sonic-3");
    assert_eq!(run["output_format"]["encoding"], "pcm_s16le");
    assert_eq!(run["output_format"]["sample_rate"], 24_000);
    let append: Value = serde_json::from_str(&sent[1]).unwrap();
    assert_eq!(append["type"], "continue-task");
    assert_eq!(append["text"], "Take two tablets with water.");
    let finish: Value = serde_json::from_str(&sent[2]).unwrap();
    assert_eq!(finish["type"], "finish-task");
}

#[tokio::test]
async fn realtime_dialect_decodes_base64_audio_deltas() {
    let samples: Vec<i16> = vec![120, -4_800, 31_000, i16::MIN, 7];
    let delta = BASE64.encode(pcm_bytes(&samples));
    let connector = ScriptedConnector::new(vec![
        text(json!({"type": "session.created"})),
        // A redundant readiness ack after the first must be harmless.
        text(json!({"type": "session.updated"})),
        text(json!({"type": "response.audio.delta", "delta": delta})),
        text(json!({"type": "session.finished"})),
    ]);
    let sent = connector.sent_frames();

    let (handle, _ring, mut reader) = spawn_session(
        connector,
        settings(ProtocolKind::Realtime),
        "Your refill is ready for pickup.",
    );
    let stats = expect_completed(handle.outcome().await);

    assert_eq!(stats.samples_decoded, 5);
    assert_eq!(drain_ring(&mut reader), samples);

    let sent = sent.lock();
    assert_eq!(sent.len(), 3);
    let update: Value = serde_json::from_str(&sent[0]).unwrap();
    assert_eq!(update["type"], "session.update");
    assert_eq!(update["session"]["voice"], "calm-counselor");
    let append: Value = serde_json::from_str(&sent[1]).unwrap();
    assert_eq!(append["type"], "input_text_buffer.append");
    assert_eq!(append["text"], "Your refill is ready for pickup.");
    let finish: Value = serde_json::from_str(&sent[2]).unwrap();
    assert_eq!(finish["type"], "session.finish");
}

#[tokio::test]
async fn resampled_session_accounts_totals_at_the_ring_rate() {
    let decoded = vec![1_000i16; 1_200];
    let connector = ScriptedConnector::new(vec![
        text(json!({"type": "task-started"})),
        WireMessage::Binary(pcm_bytes(&decoded)),
        text(json!({"type": "task-finished"})),
    ]);

    // Ring at 48 kHz while the stream decodes at 24 kHz.
    let (ring, writer, _reader) = FrameRing::with_capacity(200_000);
    let factory = Arc::new(WireProtocolFactory::with_connector(connector));
    let resampler = StreamResampler::new(24_000, 48_000).expect("resampler");
    let handle = SynthesisSession::spawn(
        factory,
        settings(ProtocolKind::Task),
        "Hello.".to_string(),
        ring.clone(),
        writer,
        Some(resampler),
        PlaybackMetrics::default(),
        None,
    );
    let stats = expect_completed(handle.outcome().await);

    assert_eq!(
        stats.samples_decoded,
        ring.total_written(),
        "totals must be accounted after conversion"
    );
    // 1200 input samples at a 2x ratio, flushed to the chunk boundary.
    assert!(
        (2_400..=3_600).contains(&stats.samples_decoded),
        "unexpected converted total: {}",
        stats.samples_decoded
    );
}

#[tokio::test]
async fn audio_arriving_before_the_readiness_ack_is_kept() {
    let samples: Vec<i16> = vec![11, -22, 33, -44];
    let connector = ScriptedConnector::new(vec![
        WireMessage::Binary(pcm_bytes(&samples)),
        text(json!({"type": "task-started"})),
        text(json!({"type": "task-finished"})),
    ]);

    let (handle, _ring, mut reader) =
        spawn_session(connector, settings(ProtocolKind::Task), "Hello.");
    let stats = expect_completed(handle.outcome().await);

    assert_eq!(stats.samples_decoded, 4);
    assert_eq!(drain_ring(&mut reader), samples);
}

// ─── Failure modes ──────────────────────────────────────────────────────────

#[tokio::test]
async fn connect_refusal_fails_the_session() {
    let (handle, ring, _reader) = spawn_session(
        Arc::new(RefusingConnector),
        settings(ProtocolKind::Task),
        "Hello.",
    );
    let outcome = handle.outcome().await;
    assert!(matches!(
        outcome,
        SessionOutcome::Failed(SynthesisError::Connection(_))
    ));
    assert!(ring.is_eos(), "failure must still release the render side");
}

#[tokio::test(start_paused = true)]
async fn connect_timeout_fails_the_session() {
    let (handle, ring, _reader) = spawn_session(
        Arc::new(PendingConnector),
        settings(ProtocolKind::Task),
        "Hello.",
    );
    match handle.outcome().await {
        SessionOutcome::Failed(SynthesisError::Connection(TransportError::Connect(msg))) => {
            assert!(msg.contains("timed out"), "unexpected message: {msg}");
        }
        other => panic!("expected a connect timeout, got {:?}", other),
    }
    assert!(ring.is_eos());
}

#[tokio::test(start_paused = true)]
async fn handshake_timeout_fails_the_session() {
    let connector = ScriptedConnector::stalling(vec![]);
    let closed = connector.closed_flag();

    let (handle, ring, _reader) = spawn_session(connector, settings(ProtocolKind::Task), "Hello.");
    let outcome = handle.outcome().await;

    assert!(matches!(
        outcome,
        SessionOutcome::Failed(SynthesisError::HandshakeTimeout(_))
    ));
    assert!(ring.is_eos());
    assert!(closed.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn whole_session_timeout_bounds_a_stalled_drain() {
    let connector = ScriptedConnector::stalling(vec![text(json!({"type": "task-started"}))]);
    let closed = connector.closed_flag();

    let (handle, ring, _reader) = spawn_session(connector, settings(ProtocolKind::Task), "Hello.");
    let outcome = handle.outcome().await;

    assert!(matches!(
        outcome,
        SessionOutcome::Failed(SynthesisError::Timeout(_))
    ));
    assert!(ring.is_eos());
    assert!(closed.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn whole_session_timeout_bounds_a_wedged_opening_send() {
    // The very first outbound frame never completes.
    let connector = WedgedSendConnector::new(0, vec![]);

    let (handle, ring, _reader) = spawn_session(connector, settings(ProtocolKind::Task), "Hello.");
    let outcome = handle.outcome().await;

    assert!(matches!(
        outcome,
        SessionOutcome::Failed(SynthesisError::Timeout(_))
    ));
    assert!(ring.is_eos());
}

#[tokio::test(start_paused = true)]
async fn whole_session_timeout_bounds_a_wedged_text_send() {
    // The opening frame goes out and the remote acknowledges, then the
    // text submission wedges mid-stream.
    let connector = WedgedSendConnector::new(1, vec![text(json!({"type": "task-started"}))]);

    let (handle, ring, _reader) = spawn_session(connector, settings(ProtocolKind::Task), "Hello.");
    let outcome = handle.outcome().await;

    assert!(matches!(
        outcome,
        SessionOutcome::Failed(SynthesisError::Timeout(_))
    ));
    assert!(ring.is_eos());
}

#[tokio::test]
async fn remote_failure_report_fails_the_session() {
    let connector = ScriptedConnector::new(vec![
        text(json!({"type": "task-started"})),
        text(json!({"type": "task-failed", "message": "voice not found"})),
    ]);

    let (handle, _ring, _reader) = spawn_session(connector, settings(ProtocolKind::Task), "Hello.");
    match handle.outcome().await {
        SessionOutcome::Failed(SynthesisError::Protocol(msg)) => {
            assert_eq!(msg, "voice not found");
        }
        other => panic!("expected a protocol failure, got {:?}", other),
    }
}

#[tokio::test]
async fn stream_closing_mid_drain_fails_the_session() {
    // Script ends without a task-finished, so the transport reports a close.
    let connector = ScriptedConnector::new(vec![
        text(json!({"type": "task-started"})),
        WireMessage::Binary(pcm_bytes(&[1, 2, 3])),
    ]);

    let (handle, ring, _reader) = spawn_session(connector, settings(ProtocolKind::Task), "Hello.");
    let outcome = handle.outcome().await;

    assert!(matches!(
        outcome,
        SessionOutcome::Failed(SynthesisError::Connection(TransportError::Closed))
    ));
    assert!(ring.is_eos());
}

// ─── Stop semantics ─────────────────────────────────────────────────────────

#[tokio::test]
async fn stop_from_a_foreign_thread_resolves_cancelled_exactly_once() {
    let connector = ScriptedConnector::stalling(vec![text(json!({"type": "task-started"}))]);

    let (handle, ring, _reader) = spawn_session(connector, settings(ProtocolKind::Task), "Hello.");
    let control = handle.control();

    // Let the driver reach the drain loop before stopping.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let stopper = control.clone();
    std::thread::spawn(move || {
        stopper.stop();
        stopper.stop();
    })
    .join()
    .unwrap();

    assert_eq!(control.state(), SessionState::Cancelled);
    assert!(ring.is_eos(), "stop must mark end-of-stream immediately");
    assert!(matches!(handle.outcome().await, SessionOutcome::Cancelled));

    // Stopping after resolution stays a no-op.
    control.stop();
    assert_eq!(control.state(), SessionState::Cancelled);
}

#[tokio::test]
async fn stop_before_the_driver_runs_still_resolves_cancelled() {
    let connector = ScriptedConnector::stalling(vec![]);
    let (handle, ring, _reader) = spawn_session(connector, settings(ProtocolKind::Task), "Hello.");

    // The driver task has not been polled yet on a current-thread runtime.
    handle.control().stop();

    assert!(matches!(handle.outcome().await, SessionOutcome::Cancelled));
    assert!(ring.is_eos());
}

#[tokio::test]
async fn stop_after_completion_does_not_change_the_outcome() {
    let connector = ScriptedConnector::new(vec![
        text(json!({"type": "task-started"})),
        text(json!({"type": "task-finished"})),
    ]);

    let (handle, _ring, _reader) = spawn_session(connector, settings(ProtocolKind::Task), "Hello.");
    let control = handle.control();

    expect_completed(handle.outcome().await);
    control.stop();
    assert_eq!(control.state(), SessionState::Completed);
}

// ─── Payload tolerance ──────────────────────────────────────────────────────

#[tokio::test]
async fn undecodable_audio_payloads_are_dropped_without_failing() {
    let good: Vec<i16> = vec![9, -9];
    let odd_payload = BASE64.encode([0x01u8, 0x02, 0x03]);
    let connector = ScriptedConnector::new(vec![
        text(json!({"type": "session.created"})),
        text(json!({"type": "response.audio.delta", "delta": "!!!not base64!!!"})),
        text(json!({"type": "response.audio.delta", "delta": odd_payload})),
        text(json!({"type": "response.audio.delta", "delta": BASE64.encode(pcm_bytes(&good))})),
        text(json!({"type": "session.finished"})),
    ]);

    let (handle, _ring, mut reader) =
        spawn_session(connector, settings(ProtocolKind::Realtime), "Hello.");
    let stats = expect_completed(handle.outcome().await);

    assert_eq!(stats.decode_errors, 2);
    assert_eq!(stats.samples_decoded, 2);
    assert_eq!(drain_ring(&mut reader), good);
}

#[tokio::test]
async fn unknown_and_malformed_control_messages_are_ignored() {
    let samples: Vec<i16> = vec![5, -5];
    let connector = ScriptedConnector::new(vec![
        text(json!({"type": "task-started"})),
        text(json!({"type": "latency-report", "p50_ms": 12})),
        WireMessage::Text("definitely not json".into()),
        WireMessage::Binary(pcm_bytes(&samples)),
        text(json!({"type": "task-finished"})),
    ]);

    let (handle, _ring, mut reader) = spawn_session(connector, settings(ProtocolKind::Task), "Hello.");
    let stats = expect_completed(handle.outcome().await);

    assert_eq!(stats.decode_errors, 0);
    assert_eq!(drain_ring(&mut reader), samples);
}
