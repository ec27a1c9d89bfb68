use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Shared metrics for cross-thread playback monitoring
#[derive(Clone)]
pub struct PlaybackMetrics {
    // Session counters
    pub sessions_started: Arc<AtomicU64>,
    pub sessions_completed: Arc<AtomicU64>,
    pub sessions_failed: Arc<AtomicU64>,
    pub sessions_interrupted: Arc<AtomicU64>,

    // Decode-side counters
    pub frames_decoded: Arc<AtomicU64>,
    pub samples_decoded: Arc<AtomicU64>,
    pub decode_errors: Arc<AtomicU64>,

    // Render-side counters
    pub samples_played: Arc<AtomicU64>,
    pub underruns: Arc<AtomicU64>,

    // Buffer monitoring
    pub ring_fill: Arc<AtomicUsize>, // Ring buffer fill %

    // Latency tracking
    pub first_audio_ms: Arc<AtomicU64>, // Connect to first decoded frame, last session
    pub session_elapsed_ms: Arc<AtomicU64>, // Wall time of last terminal session

    // Activity indicators
    pub is_playing: Arc<AtomicBool>,
    pub last_playback_time: Arc<RwLock<Option<Instant>>>,
}

impl Default for PlaybackMetrics {
    fn default() -> Self {
        Self {
            sessions_started: Arc::new(AtomicU64::new(0)),
            sessions_completed: Arc::new(AtomicU64::new(0)),
            sessions_failed: Arc::new(AtomicU64::new(0)),
            sessions_interrupted: Arc::new(AtomicU64::new(0)),

            frames_decoded: Arc::new(AtomicU64::new(0)),
            samples_decoded: Arc::new(AtomicU64::new(0)),
            decode_errors: Arc::new(AtomicU64::new(0)),

            samples_played: Arc::new(AtomicU64::new(0)),
            underruns: Arc::new(AtomicU64::new(0)),

            ring_fill: Arc::new(AtomicUsize::new(0)),

            first_audio_ms: Arc::new(AtomicU64::new(0)),
            session_elapsed_ms: Arc::new(AtomicU64::new(0)),

            is_playing: Arc::new(AtomicBool::new(false)),
            last_playback_time: Arc::new(RwLock::new(None)),
        }
    }
}

impl PlaybackMetrics {
    pub fn record_session_start(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_completed(&self, elapsed_ms: u64) {
        self.sessions_completed.fetch_add(1, Ordering::Relaxed);
        self.session_elapsed_ms.store(elapsed_ms, Ordering::Relaxed);
    }

    pub fn record_session_failed(&self) {
        self.sessions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_interrupted(&self) {
        self.sessions_interrupted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decoded(&self, frames: u64, samples: u64) {
        self.frames_decoded.fetch_add(frames, Ordering::Relaxed);
        self.samples_decoded.fetch_add(samples, Ordering::Relaxed);
    }

    pub fn record_decode_errors(&self, count: u64) {
        if count > 0 {
            self.decode_errors.fetch_add(count, Ordering::Relaxed);
        }
    }

    pub fn record_played(&self, samples: u64) {
        self.samples_played.fetch_add(samples, Ordering::Relaxed);
    }

    pub fn record_underruns(&self, count: u64) {
        if count > 0 {
            self.underruns.fetch_add(count, Ordering::Relaxed);
        }
    }

    pub fn record_first_audio(&self, latency_ms: u64) {
        self.first_audio_ms.store(latency_ms, Ordering::Relaxed);
    }

    pub fn update_ring_fill(&self, fill_percent: usize) {
        self.ring_fill.store(fill_percent.min(100), Ordering::Relaxed);
    }

    pub fn set_playing(&self, playing: bool) {
        self.is_playing.store(playing, Ordering::Relaxed);
        if playing {
            *self.last_playback_time.write() = Some(Instant::now());
        }
    }
}
