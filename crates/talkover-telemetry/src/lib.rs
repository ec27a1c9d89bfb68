pub mod playback_metrics;

pub use playback_metrics::*;
