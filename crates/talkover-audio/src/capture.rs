use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::SampleFormat;
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::device;
use talkover_foundation::AudioError;

/// Callback invoked on the capture thread with each complete mono window.
pub type WindowFn = Box<dyn FnMut(&[i16]) + Send>;

thread_local! {
    static CONVERT_BUFFER: RefCell<Vec<i16>> = RefCell::new(Vec::with_capacity(8192));
}

#[derive(Debug, Clone)]
pub struct CaptureInfo {
    pub device_name: Option<String>,
    pub sample_rate: u32,
    pub channels: u16,
    pub window_samples: usize,
}

/// Microphone stream that downmixes to mono i16 and hands out fixed-size
/// analysis windows. The stream lives on a dedicated thread because cpal
/// streams are not `Send`.
pub struct CaptureStream {
    stop: Arc<AtomicBool>,
    info: CaptureInfo,
    join: Option<JoinHandle<()>>,
}

impl CaptureStream {
    /// Opens the preferred (or default) input device and starts delivering
    /// `window_ms`-sized windows to `on_window`. Blocks until the capture
    /// thread reports readiness or fails.
    pub fn open(
        preferred_device: Option<&str>,
        window_ms: u32,
        on_window: WindowFn,
    ) -> Result<Self, AudioError> {
        let device = device::resolve_input_device(preferred_device)?;
        let device_name = device.name().ok();
        let config = device
            .default_input_config()
            .map_err(|e| AudioError::FormatNotSupported {
                format: format!("No default input config: {}", e),
            })?;
        let sample_rate = config.sample_rate().0;
        let channels = config.channels();
        let sample_format = config.sample_format();
        let window_samples = ((sample_rate as u64 * window_ms as u64) / 1000).max(1) as usize;

        let info = CaptureInfo {
            device_name: device_name.clone(),
            sample_rate,
            channels,
            window_samples,
        };

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let stream_config: cpal::StreamConfig = config.clone().into();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        let join = thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                let stream = match build_input_stream(
                    &device,
                    &stream_config,
                    sample_format,
                    channels,
                    window_samples,
                    on_window,
                ) {
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
                tracing::debug!("Audio capture thread shutting down");
            })
            .map_err(|e| AudioError::WorkerStart(format!("Failed to spawn capture thread: {}", e)))?;

        match ready_rx.recv_timeout(Duration::from_secs(3)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = join.join();
                return Err(e);
            }
            Err(_) => {
                stop.store(true, Ordering::SeqCst);
                return Err(AudioError::WorkerStart(
                    "Capture thread did not report readiness".to_string(),
                ));
            }
        }

        tracing::info!(
            device = ?info.device_name,
            rate = info.sample_rate,
            channels = info.channels,
            window_samples = info.window_samples,
            "Capture stream started"
        );
        Ok(Self {
            stop,
            info,
            join: Some(join),
        })
    }

    pub fn info(&self) -> &CaptureInfo {
        &self.info
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.join.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CaptureStream {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Collects downmixed samples until a full window is ready for the callback.
struct WindowAccumulator {
    window: Vec<i16>,
    size: usize,
    on_window: WindowFn,
}

impl WindowAccumulator {
    fn new(size: usize, on_window: WindowFn) -> Self {
        Self {
            window: Vec::with_capacity(size),
            size,
            on_window,
        }
    }

    fn push_mono(&mut self, mono: &[i16]) {
        for &sample in mono {
            self.window.push(sample);
            if self.window.len() == self.size {
                (self.on_window)(&self.window);
                self.window.clear();
            }
        }
    }
}

fn build_input_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: SampleFormat,
    channels: u16,
    window_samples: usize,
    on_window: WindowFn,
) -> Result<cpal::Stream, AudioError> {
    let err_fn = |err: cpal::StreamError| {
        tracing::error!("Audio input stream error: {}", err);
    };

    let stream = match sample_format {
        SampleFormat::I16 => {
            let mut acc = WindowAccumulator::new(window_samples, on_window);
            device.build_input_stream(
                config,
                move |data: &[i16], _: &_| {
                    CONVERT_BUFFER.with(|buf| {
                        let mut mono = buf.borrow_mut();
                        downmix_i16(data, channels, &mut mono);
                        acc.push_mono(&mono);
                    });
                },
                err_fn,
                None,
            )?
        }
        SampleFormat::F32 => {
            let mut acc = WindowAccumulator::new(window_samples, on_window);
            device.build_input_stream(
                config,
                move |data: &[f32], _: &_| {
                    CONVERT_BUFFER.with(|buf| {
                        let mut mono = buf.borrow_mut();
                        downmix_f32(data, channels, &mut mono);
                        acc.push_mono(&mono);
                    });
                },
                err_fn,
                None,
            )?
        }
        SampleFormat::U16 => {
            let mut acc = WindowAccumulator::new(window_samples, on_window);
            device.build_input_stream(
                config,
                move |data: &[u16], _: &_| {
                    CONVERT_BUFFER.with(|buf| {
                        let mut mono = buf.borrow_mut();
                        downmix_u16(data, channels, &mut mono);
                        acc.push_mono(&mono);
                    });
                },
                err_fn,
                None,
            )?
        }
        other => {
            return Err(AudioError::FormatNotSupported {
                format: format!("{:?}", other),
            })
        }
    };
    Ok(stream)
}

fn downmix_i16(data: &[i16], channels: u16, mono: &mut Vec<i16>) {
    mono.clear();
    let channels = channels.max(1) as usize;
    if channels == 1 {
        mono.extend_from_slice(data);
        return;
    }
    for frame in data.chunks_exact(channels) {
        let sum: i32 = frame.iter().map(|&s| s as i32).sum();
        mono.push((sum / channels as i32) as i16);
    }
}

fn downmix_f32(data: &[f32], channels: u16, mono: &mut Vec<i16>) {
    mono.clear();
    let channels = channels.max(1) as usize;
    for frame in data.chunks_exact(channels) {
        let sum: f32 = frame.iter().sum();
        let avg = sum / channels as f32;
        mono.push((avg.clamp(-1.0, 1.0) * 32767.0) as i16);
    }
}

fn downmix_u16(data: &[u16], channels: u16, mono: &mut Vec<i16>) {
    mono.clear();
    let channels = channels.max(1) as usize;
    for frame in data.chunks_exact(channels) {
        let sum: i32 = frame.iter().map(|&s| s as i32 - 32768).sum();
        mono.push((sum / channels as i32) as i16);
    }
}
