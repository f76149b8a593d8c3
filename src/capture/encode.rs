//! Raw frame conversion and JPEG encoding.

use crate::capture::camera::{PixelLayout, RawFrame};
use crate::error::{GatewayError, Result};
use crate::frame::Frame;
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{ImageFormat, RgbImage};

/// Converts device frames to RGB, fits them to the output resolution and
/// encodes them as JPEG at a fixed quality.
#[derive(Debug, Clone, Copy)]
pub struct FrameEncoder {
    width: u32,
    height: u32,
    quality: u8,
}

impl FrameEncoder {
    pub fn new(width: u32, height: u32, quality: u8) -> Self {
        Self {
            width,
            height,
            quality: quality.clamp(1, 100),
        }
    }

    /// Turn one raw device frame into a publishable [`Frame`].
    pub fn encode(&self, raw: RawFrame) -> Result<Frame> {
        let rgb = to_rgb(raw)?;
        let rgb = self.fit(rgb);
        let jpeg = encode_jpeg(&rgb, self.quality)?;
        Ok(Frame::new(jpeg, rgb.width(), rgb.height()))
    }

    /// Resize to the output resolution when the device delivered another size.
    fn fit(&self, image: RgbImage) -> RgbImage {
        if image.dimensions() == (self.width, self.height) {
            image
        } else {
            imageops::resize(&image, self.width, self.height, FilterType::Lanczos3)
        }
    }
}

/// Convert a raw frame of any supported layout to packed RGB.
pub fn to_rgb(raw: RawFrame) -> Result<RgbImage> {
    let RawFrame {
        width,
        height,
        layout,
        data,
    } = raw;
    let pixels = width as usize * height as usize;

    match layout {
        PixelLayout::Rgb24 => {
            let data = truncate_to(data, pixels * 3, layout)?;
            buffer(width, height, data)
        }
        PixelLayout::Bgr24 => {
            let mut data = truncate_to(data, pixels * 3, layout)?;
            for px in data.chunks_exact_mut(3) {
                px.swap(0, 2);
            }
            buffer(width, height, data)
        }
        PixelLayout::Yuyv => {
            let data = truncate_to(data, pixels * 2, layout)?;
            buffer(width, height, yuyv_to_rgb(&data))
        }
        PixelLayout::Mjpeg => {
            let decoded = image::load_from_memory_with_format(&data, ImageFormat::Jpeg)
                .map_err(|e| GatewayError::encoding_error(format!("Bad MJPEG frame: {}", e)))?;
            Ok(decoded.to_rgb8())
        }
    }
}

fn truncate_to(mut data: Vec<u8>, expected: usize, layout: PixelLayout) -> Result<Vec<u8>> {
    if data.len() < expected {
        return Err(GatewayError::encoding_error(format!(
            "Short {:?} frame: {} bytes, expected {}",
            layout,
            data.len(),
            expected
        )));
    }
    data.truncate(expected);
    Ok(data)
}

fn buffer(width: u32, height: u32, data: Vec<u8>) -> Result<RgbImage> {
    RgbImage::from_raw(width, height, data)
        .ok_or_else(|| GatewayError::encoding_error("Pixel buffer does not match resolution"))
}

/// BT.601 YUYV (4:2:2) to RGB.
fn yuyv_to_rgb(yuyv: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(yuyv.len() / 2 * 3);
    for chunk in yuyv.chunks_exact(4) {
        let u = chunk[1] as f32 - 128.0;
        let v = chunk[3] as f32 - 128.0;
        for y in [chunk[0], chunk[2]] {
            let y = y as f32;
            rgb.push(clamp_channel(y + 1.402 * v));
            rgb.push(clamp_channel(y - 0.344_136 * u - 0.714_136 * v));
            rgb.push(clamp_channel(y + 1.772 * u));
        }
    }
    rgb
}

fn clamp_channel(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

/// Encode an RGB image as JPEG.
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Bytes> {
    let mut jpeg = Vec::with_capacity(image.as_raw().len() / 8);
    let mut encoder = JpegEncoder::new_with_quality(&mut jpeg, quality);
    encoder
        .encode_image(image)
        .map_err(|e| GatewayError::encoding_error(format!("JPEG encoding failed: {}", e)))?;
    Ok(Bytes::from(jpeg))
}
