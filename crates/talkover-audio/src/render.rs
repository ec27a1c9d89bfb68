use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{BufferSize, SampleFormat, SampleRate, Stream, StreamConfig};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::device::{self, OutputPlan};
use crate::ring_buffer::{FrameReader, ReadStatus};
use talkover_foundation::AudioError;

/// Largest mono quantum pulled per iteration; callbacks bigger than this are
/// filled in chunks.
const MAX_QUANTUM_SAMPLES: usize = 4096;

#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub device: Option<String>,
    /// Prebuffer threshold in samples at `source_rate`; scaled to the device
    /// rate when the two differ.
    pub prebuffer_samples: usize,
    pub source_rate: u32,
}

/// Control surface of a running output sink. All methods except `close` are
/// callable from real-time contexts.
pub trait OutputSink: Send + Sync {
    /// Stop pulling audio; the device renders silence from the next quantum on.
    fn halt(&self);
    fn is_halted(&self) -> bool;
    /// True once the prebuffer threshold was reached and real audio started.
    fn is_started(&self) -> bool;
    /// True once end-of-stream was observed with an empty buffer.
    fn is_drained(&self) -> bool;
    fn sample_rate(&self) -> u32;
    /// Release the device. Blocking and idempotent; never call from a
    /// real-time callback.
    fn close(&self);
}

/// Builds sinks. The device-backed implementation lives here; tests plug in
/// scripted sinks.
pub trait SinkFactory: Send + Sync {
    fn negotiate(&self, cfg: &SinkConfig) -> Result<OutputPlan, AudioError>;
    fn open(
        &self,
        reader: FrameReader,
        plan: &OutputPlan,
        cfg: &SinkConfig,
    ) -> Result<Arc<dyn OutputSink>, AudioError>;
}

/// Shared flags between the render callback and the sink handle.
#[derive(Debug, Default)]
pub struct RenderFlags {
    halted: AtomicBool,
    started: AtomicBool,
    drained: AtomicBool,
}

impl RenderFlags {
    pub fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_drained(&self) -> bool {
        self.drained.load(Ordering::SeqCst)
    }

    fn mark_started(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    fn mark_drained(&self) {
        self.drained.store(true, Ordering::SeqCst);
    }

    /// Stream died; stop pulling and unblock anyone waiting for drain.
    fn fail(&self) {
        self.halt();
        self.mark_drained();
    }
}

/// Pull side of the playback path, driven by the device callback.
///
/// Holds no playback start until the ring has buffered the prebuffer
/// threshold, substitutes silence on underrun, and latches the drained flag
/// when end-of-stream is reached with nothing left to play. Everything here
/// runs on the render thread: no locks beyond the ring's cursor mutex, no
/// allocation, no logging.
pub struct RenderState {
    reader: FrameReader,
    channels: usize,
    prebuffer: usize,
    flags: Arc<RenderFlags>,
    scratch: Vec<i16>,
}

impl RenderState {
    pub fn new(
        reader: FrameReader,
        channels: u16,
        prebuffer: usize,
        flags: Arc<RenderFlags>,
    ) -> Self {
        Self {
            reader,
            channels: channels.max(1) as usize,
            prebuffer,
            flags,
            scratch: vec![0i16; MAX_QUANTUM_SAMPLES],
        }
    }

    pub fn fill_i16(&mut self, out: &mut [i16]) {
        if self.channels == 1 {
            Self::pull(&mut self.reader, &self.flags, self.prebuffer, out);
            return;
        }
        let channels = self.channels;
        let max_frames = self.scratch.len();
        let mut rest: &mut [i16] = out;
        while !rest.is_empty() {
            let frames = (rest.len() / channels).min(max_frames);
            if frames == 0 {
                rest.fill(0);
                break;
            }
            Self::pull(
                &mut self.reader,
                &self.flags,
                self.prebuffer,
                &mut self.scratch[..frames],
            );
            let (head, tail) = rest.split_at_mut(frames * channels);
            for (frame, &sample) in head.chunks_exact_mut(channels).zip(self.scratch[..frames].iter())
            {
                frame.fill(sample);
            }
            rest = tail;
        }
    }

    pub fn fill_f32(&mut self, out: &mut [f32]) {
        let channels = self.channels;
        let max_frames = self.scratch.len();
        let mut rest: &mut [f32] = out;
        while !rest.is_empty() {
            let frames = (rest.len() / channels).min(max_frames);
            if frames == 0 {
                for s in rest.iter_mut() {
                    *s = 0.0;
                }
                break;
            }
            Self::pull(
                &mut self.reader,
                &self.flags,
                self.prebuffer,
                &mut self.scratch[..frames],
            );
            let (head, tail) = rest.split_at_mut(frames * channels);
            for (frame, &sample) in head.chunks_exact_mut(channels).zip(self.scratch[..frames].iter())
            {
                let v = sample as f32 / 32768.0;
                for slot in frame.iter_mut() {
                    *slot = v;
                }
            }
            rest = tail;
        }
    }

    fn pull(reader: &mut FrameReader, flags: &RenderFlags, prebuffer: usize, out: &mut [i16]) {
        if flags.is_halted() {
            out.fill(0);
            return;
        }
        if !flags.is_started() {
            let avail = reader.available();
            let eos = reader.is_eos();
            // Short utterances that end below the threshold start on
            // end-of-stream instead of waiting forever.
            if avail >= prebuffer || (eos && avail > 0) {
                flags.mark_started();
            } else {
                if eos {
                    flags.mark_drained();
                }
                out.fill(0);
                return;
            }
        }
        if let ReadStatus::Drained = reader.read_into(out) {
            flags.mark_drained();
        }
    }
}

/// Output sink backed by a cpal stream on a dedicated render thread.
pub struct DeviceSink {
    flags: Arc<RenderFlags>,
    stop: Arc<AtomicBool>,
    sample_rate: u32,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl OutputSink for DeviceSink {
    fn halt(&self) {
        self.flags.halt();
    }

    fn is_halted(&self) -> bool {
        self.flags.is_halted()
    }

    fn is_started(&self) -> bool {
        self.flags.is_started()
    }

    fn is_drained(&self) -> bool {
        self.flags.is_drained()
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn close(&self) {
        self.flags.halt();
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.join.lock().take() {
            let _ = handle.join();
        }
    }
}

#[derive(Debug, Default)]
pub struct DeviceSinkFactory;

impl SinkFactory for DeviceSinkFactory {
    fn negotiate(&self, cfg: &SinkConfig) -> Result<OutputPlan, AudioError> {
        device::negotiate_output(cfg.device.as_deref(), cfg.source_rate)
    }

    fn open(
        &self,
        reader: FrameReader,
        plan: &OutputPlan,
        cfg: &SinkConfig,
    ) -> Result<Arc<dyn OutputSink>, AudioError> {
        let flags = Arc::new(RenderFlags::default());
        let stop = Arc::new(AtomicBool::new(false));
        let prebuffer = scale_samples(cfg.prebuffer_samples, cfg.source_rate, plan.sample_rate);
        let state = RenderState::new(reader, plan.channels, prebuffer, Arc::clone(&flags));

        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let thread_plan = plan.clone();
        let thread_stop = Arc::clone(&stop);
        let thread_flags = Arc::clone(&flags);
        let handle = thread::Builder::new()
            .name("audio-render".to_string())
            .spawn(move || {
                let stream = match build_output_stream(&thread_plan, state, thread_flags) {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::from(e)));
                    return;
                }
                let _ = ready_tx.send(Ok(()));
                while !thread_stop.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(50));
                }
                drop(stream);
                tracing::debug!("Audio render thread shutting down");
            })
            .map_err(|e| AudioError::WorkerStart(format!("Failed to spawn render thread: {}", e)))?;

        match ready_rx.recv_timeout(Duration::from_secs(3)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                stop.store(true, Ordering::SeqCst);
                return Err(AudioError::WorkerStart(
                    "Render thread did not report readiness".to_string(),
                ));
            }
        }

        tracing::info!(
            device = ?plan.device_name,
            rate = plan.sample_rate,
            channels = plan.channels,
            prebuffer,
            "Output sink started"
        );
        Ok(Arc::new(DeviceSink {
            flags,
            stop,
            sample_rate: plan.sample_rate,
            join: Mutex::new(Some(handle)),
        }))
    }
}

fn scale_samples(samples: usize, from_rate: u32, to_rate: u32) -> usize {
    if from_rate == to_rate || from_rate == 0 {
        return samples;
    }
    (samples as u64 * to_rate as u64 / from_rate as u64) as usize
}

fn build_output_stream(
    plan: &OutputPlan,
    mut state: RenderState,
    flags: Arc<RenderFlags>,
) -> Result<Stream, AudioError> {
    let device = device::resolve_output_device(plan.device_name.as_deref())?;
    let config = StreamConfig {
        channels: plan.channels,
        sample_rate: SampleRate(plan.sample_rate),
        buffer_size: BufferSize::Default,
    };
    let err_fn = move |err: cpal::StreamError| {
        tracing::error!("Audio output stream error: {}", err);
        flags.fail();
    };

    let stream = match plan.sample_format {
        SampleFormat::I16 => device.build_output_stream(
            &config,
            move |data: &mut [i16], _: &_| {
                state.fill_i16(data);
            },
            err_fn,
            None,
        )?,
        SampleFormat::F32 => device.build_output_stream(
            &config,
            move |data: &mut [f32], _: &_| {
                state.fill_f32(data);
            },
            err_fn,
            None,
        )?,
        other => {
            return Err(AudioError::FormatNotSupported {
                format: format!("{:?}", other),
            })
        }
    };
    Ok(stream)
}
