//! Camera devices.
//!
//! The capture loop only needs two things from a camera: a way to (re)open it
//! and a way to pull one raw frame. Real hardware goes through V4L2 when the
//! `v4l` feature is enabled; a synthetic test pattern is always available for
//! development hosts without a camera.

use crate::config::CaptureSettings;
use crate::error::{GatewayError, Result};

/// Pixel layout of a raw frame as delivered by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelLayout {
    /// Packed 8-bit RGB
    Rgb24,
    /// Packed 8-bit BGR
    Bgr24,
    /// Packed YUV 4:2:2 (Y0 U Y1 V)
    Yuyv,
    /// Device-compressed JPEG
    Mjpeg,
}

/// One uncompressed (or device-compressed) frame straight from the camera.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub layout: PixelLayout,
    pub data: Vec<u8>,
}

/// An opened camera.
pub trait CameraDevice: Send {
    /// Pull the next frame. Errors are treated as transient by the caller.
    fn read_frame(&mut self) -> Result<RawFrame>;

    /// Resolution the device actually negotiated.
    fn resolution(&self) -> (u32, u32);
}

/// Something that can open (and reopen) a camera.
pub trait CameraOpener: Send + 'static {
    type Device: CameraDevice + 'static;

    /// Open the device and apply the requested resolution.
    fn open(&mut self, settings: &CaptureSettings) -> Result<Self::Device>;

    /// Human readable name for logs.
    fn describe(&self, settings: &CaptureSettings) -> String;
}

/// Synthetic camera producing a moving gradient.
pub struct TestPatternCamera {
    width: u32,
    height: u32,
    tick: u32,
}

impl CameraDevice for TestPatternCamera {
    fn read_frame(&mut self) -> Result<RawFrame> {
        self.tick = self.tick.wrapping_add(1);
        let offset = self.tick.wrapping_mul(4);
        let mut data = Vec::with_capacity((self.width * self.height * 3) as usize);
        for y in 0..self.height {
            for x in 0..self.width {
                data.push((x.wrapping_add(offset) & 0xff) as u8);
                data.push((y & 0xff) as u8);
                data.push(((x.wrapping_add(y) / 2) & 0xff) as u8);
            }
        }
        Ok(RawFrame {
            width: self.width,
            height: self.height,
            layout: PixelLayout::Rgb24,
            data,
        })
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// Opener for [`TestPatternCamera`].
#[derive(Debug, Default, Clone, Copy)]
pub struct TestPatternOpener;

impl CameraOpener for TestPatternOpener {
    type Device = TestPatternCamera;

    fn open(&mut self, settings: &CaptureSettings) -> Result<TestPatternCamera> {
        if settings.width == 0 || settings.height == 0 {
            return Err(GatewayError::camera_error("Test pattern needs a non-zero resolution"));
        }
        Ok(TestPatternCamera {
            width: settings.width,
            height: settings.height,
            tick: 0,
        })
    }

    fn describe(&self, settings: &CaptureSettings) -> String {
        format!("test pattern {}x{}", settings.width, settings.height)
    }
}

#[cfg(feature = "v4l")]
mod video4linux {
    use super::*;
    use v4l::buffer::Type;
    use v4l::io::mmap::Stream as MmapStream;
    use v4l::io::traits::CaptureStream;
    use v4l::prelude::*;
    use v4l::video::Capture;
    use v4l::FourCC;

    const BUFFER_COUNT: u32 = 4;

    /// V4L2 camera using memory-mapped streaming.
    pub struct V4lCamera {
        // Declared before the device so the buffers are unmapped first.
        stream: MmapStream<'static>,
        _device: Device,
        width: u32,
        height: u32,
        layout: PixelLayout,
    }

    /// Opens `/dev/video<N>` and negotiates YUYV at the target resolution.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct V4lCameraOpener;

    fn layout_for(fourcc: &FourCC) -> Option<PixelLayout> {
        match &fourcc.repr {
            b"YUYV" => Some(PixelLayout::Yuyv),
            b"MJPG" => Some(PixelLayout::Mjpeg),
            b"RGB3" => Some(PixelLayout::Rgb24),
            b"BGR3" => Some(PixelLayout::Bgr24),
            _ => None,
        }
    }

    impl CameraOpener for V4lCameraOpener {
        type Device = V4lCamera;

        fn open(&mut self, settings: &CaptureSettings) -> Result<V4lCamera> {
            let index = settings.camera_index;
            let device = Device::new(index as usize).map_err(|e| {
                GatewayError::camera_error(format!("Failed to open /dev/video{}: {}", index, e))
            })?;

            let mut format = device.format().map_err(|e| {
                GatewayError::camera_error(format!("Failed to query format: {}", e))
            })?;
            format.width = settings.width;
            format.height = settings.height;
            format.fourcc = FourCC::new(b"YUYV");
            let format = device.set_format(&format).map_err(|e| {
                GatewayError::camera_error(format!("Failed to set format: {}", e))
            })?;

            let layout = layout_for(&format.fourcc).ok_or_else(|| {
                GatewayError::camera_error(format!("Unsupported pixel format {}", format.fourcc))
            })?;

            let stream = MmapStream::with_buffers(&device, Type::VideoCapture, BUFFER_COUNT)
                .map_err(|e| {
                    GatewayError::camera_error(format!("Failed to start streaming: {}", e))
                })?;

            tracing::debug!(
                "Negotiated {}x{} {} on /dev/video{}",
                format.width,
                format.height,
                format.fourcc,
                index
            );

            Ok(V4lCamera {
                stream,
                _device: device,
                width: format.width,
                height: format.height,
                layout,
            })
        }

        fn describe(&self, settings: &CaptureSettings) -> String {
            format!("/dev/video{}", settings.camera_index)
        }
    }

    impl CameraDevice for V4lCamera {
        fn read_frame(&mut self) -> Result<RawFrame> {
            let (buf, meta) = self.stream.next()?;
            let used = match self.layout {
                PixelLayout::Mjpeg => (meta.bytesused as usize).min(buf.len()),
                _ => buf.len(),
            };
            if used == 0 {
                return Err(GatewayError::camera_error("Device returned an empty buffer"));
            }
            Ok(RawFrame {
                width: self.width,
                height: self.height,
                layout: self.layout,
                data: buf[..used].to_vec(),
            })
        }

        fn resolution(&self) -> (u32, u32) {
            (self.width, self.height)
        }
    }
}

#[cfg(feature = "v4l")]
pub use video4linux::{V4lCamera, V4lCameraOpener};
