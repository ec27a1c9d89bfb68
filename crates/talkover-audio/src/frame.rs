use std::sync::Arc;

/// Immutable chunk of mono 16-bit PCM produced by a wire protocol decoder.
///
/// Frames carry a per-session sequence counter so dropped or reordered
/// payloads show up in logs; the ring buffer itself only ever sees samples.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Arc<[i16]>,
    pub seq: u64,
    pub sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>, seq: u64, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            seq,
            sample_rate,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.samples.len() as u64 * 1000) / self.sample_rate as u64
    }
}
