use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

use talkover_foundation::AudioError;

/// Streaming mono i16 resampler used when the output device cannot run at the
/// synthesis rate.
///
/// Accepts arbitrary-sized input chunks and buffers internally around Rubato's
/// fixed input chunk requirement. Sinc parameters are tuned for speech.
pub struct StreamResampler {
    in_rate: u32,
    out_rate: u32,
    resampler: SincFixedIn<f32>,
    input_buffer: Vec<f32>,
    output_buffer: Vec<f32>,
    chunk_size: usize,
}

impl StreamResampler {
    pub fn new(in_rate: u32, out_rate: u32) -> Result<Self, AudioError> {
        // ~21ms of input per chunk at 24kHz keeps added latency small.
        let chunk_size = 512;
        let sinc_params = SincInterpolationParameters {
            sinc_len: 64,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Cubic,
            oversampling_factor: 128,
            window: WindowFunction::Blackman2,
        };

        let resampler = SincFixedIn::<f32>::new(
            out_rate as f64 / in_rate as f64,
            2.0,
            sinc_params,
            chunk_size,
            1,
        )
        .map_err(|e| AudioError::FormatNotSupported {
            format: format!("Resampler {} -> {} Hz: {}", in_rate, out_rate, e),
        })?;

        Ok(Self {
            in_rate,
            out_rate,
            resampler,
            input_buffer: Vec::with_capacity(chunk_size * 2),
            output_buffer: Vec::new(),
            chunk_size,
        })
    }

    /// Process an arbitrary chunk of mono i16 samples and return whatever
    /// resampled output is ready. Output may lag input by the filter latency.
    pub fn process(&mut self, input: &[i16]) -> Vec<i16> {
        if self.in_rate == self.out_rate {
            return input.to_vec();
        }

        for &sample in input {
            self.input_buffer.push(sample as f32 / 32768.0);
        }

        while self.input_buffer.len() >= self.chunk_size {
            let chunk: Vec<f32> = self.input_buffer.drain(..self.chunk_size).collect();
            let input_frames = vec![chunk];

            let output_frames = match self.resampler.process(&input_frames, None) {
                Ok(frames) => frames,
                Err(e) => {
                    tracing::warn!("Resampler error, dropping chunk: {}", e);
                    continue;
                }
            };

            if let Some(channel) = output_frames.first() {
                self.output_buffer.extend_from_slice(channel);
            }
        }

        let mut result = Vec::with_capacity(self.output_buffer.len());
        for &sample in &self.output_buffer {
            let clamped = sample.clamp(-1.0, 1.0);
            result.push((clamped * 32767.0).round() as i16);
        }
        self.output_buffer.clear();
        result
    }

    /// Pad the buffered tail with silence and emit it. Call once at
    /// end-of-stream so the final partial chunk is not swallowed.
    pub fn flush(&mut self) -> Vec<i16> {
        if self.in_rate == self.out_rate || self.input_buffer.is_empty() {
            return Vec::new();
        }
        let pad = self.chunk_size - self.input_buffer.len();
        self.process(&vec![0i16; pad])
    }

    /// Clear buffered samples and filter state, e.g. between utterances.
    pub fn reset(&mut self) {
        self.input_buffer.clear();
        self.output_buffer.clear();
        self.resampler.reset();
    }

    pub fn input_rate(&self) -> u32 {
        self.in_rate
    }

    pub fn output_rate(&self) -> u32 {
        self.out_rate
    }
}
