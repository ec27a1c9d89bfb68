pub mod realtime;
pub mod task;

use serde::Serialize;

use crate::error::SynthesisError;

/// Output format block sent in both dialects' initialization messages.
#[derive(Debug, Serialize)]
pub(crate) struct OutputFormat {
    pub encoding: &'static str,
    pub sample_rate: u32,
    pub container: &'static str,
}

impl OutputFormat {
    pub(crate) fn pcm(sample_rate: u32) -> Self {
        Self {
            encoding: "pcm_s16le",
            sample_rate,
            container: "raw",
        }
    }
}

/// Decode little-endian 16-bit PCM bytes into samples. Rejects odd-length
/// payloads whole rather than salvaging a truncated tail.
pub(crate) fn pcm16_from_le_bytes(bytes: &[u8]) -> Result<Vec<i16>, SynthesisError> {
    if bytes.len() % 2 != 0 {
        return Err(SynthesisError::Decode(format!(
            "Odd PCM payload length: {} bytes",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}
