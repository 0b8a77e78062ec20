//! V4L2 capture device.
//!
//! Opens a local device node (e.g. /dev/video0) and exposes it as a single
//! video track. RGB3 is requested; devices that only offer YUYV are accepted
//! and converted per frame. Frames are memory-mapped and copied out per read.

use ouroboros::self_referencing;
use std::io::ErrorKind;
use super::{yuyv_to_rgb, CaptureConstraints, CaptureDevice, VideoFrame, VideoTrack};
use crate::error::CameraError;

pub struct V4l2Device {
    path: String,
}

impl V4l2Device {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
        }
    }
}

#[self_referencing]
struct V4l2StreamState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

fn classify_io_error(path: &str, err: std::io::Error) -> CameraError {
    match err.kind() {
        ErrorKind::PermissionDenied => CameraError::PermissionDenied(format!("{}: {}", path, err)),
        _ => CameraError::DeviceUnavailable(format!("{}: {}", path, err)),
    }
}

impl CaptureDevice for V4l2Device {
    fn name(&self) -> &str {
        &self.path
    }

    fn open(
        &mut self,
        constraints: &CaptureConstraints,
    ) -> Result<Vec<Box<dyn VideoTrack>>, CameraError> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let mut device =
            v4l::Device::with_path(&self.path).map_err(|e| classify_io_error(&self.path, e))?;
        let mut format = device
            .format()
            .map_err(|e| classify_io_error(&self.path, e))?;
        format.width = constraints.width;
        format.height = constraints.height;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "V4l2Device: failed to set format on {}: {}",
                    self.path,
                    err
                );
                device
                    .format()
                    .map_err(|e| classify_io_error(&self.path, e))?
            }
        };
        let pixel_format = if format.fourcc == v4l::FourCC::new(b"RGB3") {
            PixelFormat::Rgb3
        } else if format.fourcc == v4l::FourCC::new(b"YUYV") {
            PixelFormat::Yuyv
        } else {
            return Err(CameraError::DeviceUnavailable(format!(
                "{} offers neither RGB3 nor YUYV capture (got {})",
                self.path, format.fourcc
            )));
        };

        if constraints.frame_rate > 0 {
            let params = v4l::video::capture::Parameters::with_fps(constraints.frame_rate);
            if let Err(err) = device.set_params(&params) {
                log::warn!("V4l2Device: failed to set fps on {}: {}", self.path, err);
            }
        }

        let path = self.path.clone();
        let state = V4l2StreamStateTryBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|e| classify_io_error(&path, e))
            },
        }
        .try_build()?;

        log::info!(
            "V4l2Device: opened {} ({}x{} {})",
            self.path,
            format.width,
            format.height,
            format.fourcc
        );
        Ok(vec![Box::new(V4l2Track {
            label: format!("{} video", self.path),
            state: Some(state),
            width: format.width,
            height: format.height,
            pixel_format,
        })])
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PixelFormat {
    Rgb3,
    Yuyv,
}

impl PixelFormat {
    fn frame_len(self, width: u32, height: u32) -> usize {
        let bytes_per_pixel = match self {
            PixelFormat::Rgb3 => 3,
            PixelFormat::Yuyv => 2,
        };
        (width as usize) * (height as usize) * bytes_per_pixel
    }
}

struct V4l2Track {
    label: String,
    state: Option<V4l2StreamState>,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
}

impl VideoTrack for V4l2Track {
    fn label(&self) -> &str {
        &self.label
    }

    fn current_frame(&mut self) -> Option<VideoFrame> {
        use v4l::io::traits::CaptureStream;

        let state = self.state.as_mut()?;
        let expected = self.pixel_format.frame_len(self.width, self.height);
        let pixels = state.with_mut(|fields| match fields.stream.next() {
            Ok((buf, _meta)) if buf.len() >= expected => Some(buf[..expected].to_vec()),
            Ok((buf, _meta)) => {
                log::debug!(
                    "V4l2Track: short frame ({} of {} bytes)",
                    buf.len(),
                    expected
                );
                None
            }
            Err(err) => {
                log::warn!("V4l2Track: capture failed: {}", err);
                None
            }
        })?;
        let pixels = match self.pixel_format {
            PixelFormat::Rgb3 => pixels,
            PixelFormat::Yuyv => yuyv_to_rgb(self.width, self.height, &pixels)?,
        };
        Some(VideoFrame::new(self.width, self.height, pixels))
    }

    fn stop(&mut self) {
        if self.state.take().is_some() {
            log::info!("V4l2Track: stopped {}", self.label);
        }
    }

    fn is_live(&self) -> bool {
        self.state.is_some()
    }
}
