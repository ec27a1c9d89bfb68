//! Speech gate debounce tests
//!
//! Tests cover:
//! - Short bursts below the minimum voice duration never report voice
//! - A realistic utterance produces exactly one start and one stop
//! - Checker cadence coarser than the timeout still stops eventually

use std::time::{Duration, Instant};
use talkover_vad::{GatePhase, SpeechGate, VadConfig, VadEvent};

const WINDOW_SAMPLES: usize = 1200; // 50ms at 24kHz

fn window(amplitude: i16) -> Vec<i16> {
    vec![amplitude; WINDOW_SAMPLES]
}

/// Runs a schedule of (amplitude, count) segments through the gate at the
/// configured window cadence, polling the silence checker every 100ms in
/// between, and collects every event.
fn run_schedule(gate: &mut SpeechGate, schedule: &[(i16, usize)]) -> Vec<VadEvent> {
    let t0 = Instant::now();
    let mut events = Vec::new();
    let mut elapsed_ms: u64 = 0;
    let mut next_check_ms: u64 = 0;

    for &(amplitude, count) in schedule {
        for _ in 0..count {
            let now = t0 + Duration::from_millis(elapsed_ms);
            if let Some(e) = gate.on_window(&window(amplitude), now) {
                events.push(e);
            }
            elapsed_ms += 50;
            while next_check_ms <= elapsed_ms {
                let check_at = t0 + Duration::from_millis(next_check_ms);
                if let Some(e) = gate.poll_silence(check_at) {
                    events.push(e);
                }
                next_check_ms += 100;
            }
        }
    }
    events
}

// ─── Debounce ───────────────────────────────────────────────────────

#[test]
fn cough_shorter_than_min_duration_is_ignored() {
    let mut gate = SpeechGate::new(&VadConfig::default());
    // 150ms of noise inside otherwise silent audio.
    let events = run_schedule(&mut gate, &[(10, 20), (8000, 3), (10, 40)]);
    assert!(events.is_empty(), "sub-threshold burst must not trigger: {:?}", events);
    assert_eq!(gate.phase(), GatePhase::Armed);
}

#[test]
fn repeated_short_bursts_with_gaps_never_trigger() {
    let mut gate = SpeechGate::new(&VadConfig::default());
    let mut schedule = Vec::new();
    for _ in 0..6 {
        schedule.push((8000i16, 4usize)); // 200ms loud
        schedule.push((10i16, 2usize)); // 100ms quiet resets the count
    }
    let events = run_schedule(&mut gate, &schedule);
    assert!(events.is_empty(), "gaps must reset the onset count: {:?}", events);
}

// ─── Full Utterance ─────────────────────────────────────────────────

#[test]
fn utterance_produces_one_start_then_one_stop() {
    let mut gate = SpeechGate::new(&VadConfig::default());
    // 2s of speech, then 2s of silence.
    let events = run_schedule(&mut gate, &[(10, 10), (8000, 40), (10, 40)]);

    let starts: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, VadEvent::VoiceStart { .. }))
        .collect();
    let stops: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, VadEvent::VoiceStop { .. }))
        .collect();
    assert_eq!(starts.len(), 1, "expected one VoiceStart: {:?}", events);
    assert_eq!(stops.len(), 1, "expected one VoiceStop: {:?}", events);
    assert!(
        matches!(events[0], VadEvent::VoiceStart { .. }),
        "start must precede stop"
    );

    if let VadEvent::VoiceStop { voiced_ms } = events[1] {
        // Voice began after 250ms of sustained speech and ended once 1200ms
        // of silence elapsed; total voiced span covers both.
        assert!(voiced_ms >= 1200, "voiced span too short: {}ms", voiced_ms);
    }
}

#[test]
fn speech_resuming_before_timeout_keeps_voice_open() {
    let mut gate = SpeechGate::new(&VadConfig::default());
    // Speech, 1s pause (below the 1.2s timeout), more speech, then silence.
    let events = run_schedule(
        &mut gate,
        &[(8000, 20), (10, 20), (8000, 20), (10, 40)],
    );

    let starts = events
        .iter()
        .filter(|e| matches!(e, VadEvent::VoiceStart { .. }))
        .count();
    let stops = events
        .iter()
        .filter(|e| matches!(e, VadEvent::VoiceStop { .. }))
        .count();
    assert_eq!(starts, 1, "pause below timeout must not split the utterance");
    assert_eq!(stops, 1);
}

// ─── Checker Cadence ────────────────────────────────────────────────

#[test]
fn coarse_checker_still_stops_after_timeout() {
    let config = VadConfig {
        check_interval_ms: 500,
        ..Default::default()
    };
    let mut gate = SpeechGate::new(&config);
    let t0 = Instant::now();

    for i in 0..10 {
        gate.on_window(&window(8000), t0 + Duration::from_millis(50 * i));
    }
    assert_eq!(gate.phase(), GatePhase::Voice);

    // Checker at 500ms cadence: first tick past the timeout fires the stop.
    let mut stop = None;
    for tick in 1..=8u64 {
        if let Some(e) = gate.poll_silence(t0 + Duration::from_millis(500 * tick)) {
            stop = Some((tick, e));
            break;
        }
    }
    let (tick, event) = stop.expect("silence timeout never fired");
    assert!(matches!(event, VadEvent::VoiceStop { .. }));
    // Last loud window was at 450ms; timeout lands at 1650ms, first
    // eligible tick is 2000ms.
    assert_eq!(tick, 4);
}
