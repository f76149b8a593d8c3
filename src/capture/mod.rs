//! Camera capture pipeline.
//!
//! A single producer thread pulls frames from the camera, encodes them as JPEG
//! and publishes them to the shared [`FrameSlot`](crate::frame::FrameSlot).
//! The loop heals itself when the camera stops delivering frames.

pub mod camera;
pub mod encode;
pub mod pipeline;

// Re-export commonly used items
pub use camera::{CameraDevice, CameraOpener, PixelLayout, RawFrame, TestPatternOpener};
pub use encode::FrameEncoder;
pub use pipeline::{CaptureLoop, CaptureStats};

#[cfg(feature = "v4l")]
pub use camera::V4lCameraOpener;
