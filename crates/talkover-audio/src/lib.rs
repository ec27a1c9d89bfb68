pub mod capture;
pub mod device;
pub mod frame;
pub mod render;
pub mod resampler;
pub mod ring_buffer;

pub use capture::{CaptureInfo, CaptureStream, WindowFn};
pub use device::OutputPlan;
pub use frame::AudioFrame;
pub use render::{DeviceSinkFactory, OutputSink, RenderState, SinkConfig, SinkFactory};
pub use resampler::StreamResampler;
pub use ring_buffer::{FrameReader, FrameRing, FrameWriter, ReadStatus};
