//! Kernel side of the pipeline: device nodes, mapped buffers and the
//! capture thread

pub mod buffers;
pub mod device;
pub mod driver;
pub mod frame;
pub mod sampler;
pub mod sim;
pub mod v4l2;

pub use buffers::{BufferPool, DequeuedBuffer};
pub use device::{DeviceHandle, FrameInterval};
pub use driver::{CaptureDriver, DeviceProvider};
pub use frame::{FrameView, PixelFormat, Resolution, StreamFormat};
pub use sampler::{CaptureLoop, LoopOptions, SampleState};
pub use v4l2::V4l2Provider;
