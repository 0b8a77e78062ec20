//! JPEG frame encoder.
//!
//! Rasterizes the current `VideoFrame` into a reusable off-screen buffer
//! (optionally downscaled) and compresses it for transmission.

use anyhow::{anyhow, Context, Result};
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::{imageops, ExtendedColorType, ImageBuffer, Rgb};
use std::time::SystemTime;

use crate::camera::VideoFrame;

pub const DEFAULT_JPEG_QUALITY: u8 = 80;

/// A compressed still, ready to send. Not retained after send.
#[derive(Clone, Debug)]
pub struct EncodedFrame {
    bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub captured_at: SystemTime,
}

impl EncodedFrame {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// `data:image/jpeg;base64,...` form used on the telemetry socket.
    pub fn to_data_url(&self) -> String {
        format!(
            "data:image/jpeg;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(&self.bytes)
        )
    }
}

#[derive(Clone, Debug)]
pub struct EncoderSettings {
    /// JPEG quality, 1..=100.
    pub quality: u8,
    /// Downscale frames wider than this. `None` keeps the source size.
    pub max_width: Option<u32>,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            quality: DEFAULT_JPEG_QUALITY,
            max_width: None,
        }
    }
}

pub struct FrameEncoder {
    settings: EncoderSettings,
    raster: Vec<u8>,
    frames_encoded: u64,
}

impl FrameEncoder {
    pub fn new(settings: EncoderSettings) -> Result<Self> {
        if settings.quality == 0 || settings.quality > 100 {
            return Err(anyhow!(
                "jpeg quality must be within 1..=100, got {}",
                settings.quality
            ));
        }
        if settings.max_width == Some(0) {
            return Err(anyhow!("max_width must be greater than zero"));
        }
        Ok(Self {
            settings,
            raster: Vec::new(),
            frames_encoded: 0,
        })
    }

    pub fn frames_encoded(&self) -> u64 {
        self.frames_encoded
    }

    /// Encode one frame.
    ///
    /// Returns `Ok(None)` when the frame has no dimensions yet: the source has
    /// not decoded its first real frame and there is nothing to send.
    pub fn encode(&mut self, frame: &VideoFrame) -> Result<Option<EncodedFrame>> {
        if !frame.has_dimensions() {
            return Ok(None);
        }
        let expected = frame.width as usize * frame.height as usize * 3;
        if frame.pixels.len() != expected {
            return Err(anyhow!(
                "frame buffer holds {} bytes, expected {} for {}x{} rgb",
                frame.pixels.len(),
                expected,
                frame.width,
                frame.height
            ));
        }

        let (width, height) = self.rasterize(frame)?;

        let mut bytes = Vec::with_capacity(self.raster.len() / 8);
        JpegEncoder::new_with_quality(&mut bytes, self.settings.quality)
            .encode(&self.raster, width, height, ExtendedColorType::Rgb8)
            .context("encode jpeg frame")?;
        self.frames_encoded += 1;

        Ok(Some(EncodedFrame {
            bytes,
            width,
            height,
            captured_at: frame.captured_at,
        }))
    }

    fn rasterize(&mut self, frame: &VideoFrame) -> Result<(u32, u32)> {
        self.raster.clear();
        match self.settings.max_width {
            Some(max_width) if frame.width > max_width => {
                let scaled_height = ((frame.height as u64 * max_width as u64)
                    / frame.width as u64)
                    .max(1) as u32;
                let source: ImageBuffer<Rgb<u8>, &[u8]> =
                    ImageBuffer::from_raw(frame.width, frame.height, frame.pixels.as_slice())
                        .ok_or_else(|| anyhow!("frame buffer does not match its dimensions"))?;
                let scaled = imageops::resize(
                    &source,
                    max_width,
                    scaled_height,
                    imageops::FilterType::Triangle,
                );
                self.raster.extend_from_slice(scaled.as_raw());
                Ok((max_width, scaled_height))
            }
            _ => {
                self.raster.extend_from_slice(&frame.pixels);
                Ok((frame.width, frame.height))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> VideoFrame {
        let pixels = (0..width * height * 3).map(|i| (i % 251) as u8).collect();
        VideoFrame::new(width, height, pixels)
    }

    #[test]
    fn zero_dimension_frame_is_a_no_op() -> Result<()> {
        let mut encoder = FrameEncoder::new(EncoderSettings::default())?;
        let frame = VideoFrame::new(0, 0, Vec::new());
        assert!(encoder.encode(&frame)?.is_none());
        assert_eq!(encoder.frames_encoded(), 0);
        Ok(())
    }

    #[test]
    fn encodes_jpeg_with_soi_marker() -> Result<()> {
        let mut encoder = FrameEncoder::new(EncoderSettings::default())?;
        let encoded = encoder.encode(&gradient(32, 24))?.expect("encoded frame");
        assert_eq!(&encoded.bytes()[..2], &[0xFF, 0xD8]);
        assert_eq!((encoded.width, encoded.height), (32, 24));
        assert!(encoded.to_data_url().starts_with("data:image/jpeg;base64,/9j/"));
        Ok(())
    }

    #[test]
    fn downscales_wide_frames() -> Result<()> {
        let mut encoder = FrameEncoder::new(EncoderSettings {
            quality: 60,
            max_width: Some(16),
        })?;
        let encoded = encoder.encode(&gradient(64, 48))?.expect("encoded frame");
        assert_eq!((encoded.width, encoded.height), (16, 12));
        Ok(())
    }

    #[test]
    fn mismatched_buffer_is_an_error() -> Result<()> {
        let mut encoder = FrameEncoder::new(EncoderSettings::default())?;
        let frame = VideoFrame::new(10, 10, vec![0u8; 12]);
        assert!(encoder.encode(&frame).is_err());
        Ok(())
    }

    #[test]
    fn rejects_out_of_range_quality() {
        assert!(FrameEncoder::new(EncoderSettings {
            quality: 0,
            max_width: None
        })
        .is_err());
    }
}
