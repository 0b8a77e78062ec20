//! Camera source.
//!
//! This module owns the local capture device for the dashboard:
//! - `CaptureDevice` opens a device and yields its video tracks
//! - `CameraHandle` owns the tracks and stops them on release or drop
//! - `CameraSource` wraps acquisition with a fixed-delay retry
//!
//! Devices:
//! - `stub://<name>` synthetic device (tests, demos)
//! - `/dev/videoN` V4L2 devices (feature: camera-v4l2)
//!
//! The camera layer MUST NOT:
//! - Leave tracks running after release, mode switch, or a failed acquisition
//! - Treat a missing camera as fatal

pub mod synthetic;
#[cfg(feature = "camera-v4l2")]
pub mod v4l2;

use std::time::{Duration, Instant, SystemTime};

use crate::error::CameraError;
use crate::timer::Deadline;

pub use synthetic::SyntheticDevice;
#[cfg(feature = "camera-v4l2")]
pub use v4l2::V4l2Device;

/// Desired capture format. Devices treat these as hints.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            frame_rate: 30,
        }
    }
}

/// One decoded frame, RGB8.
///
/// Zero width or height means the track has not decoded a real frame yet.
#[derive(Clone, Debug)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
    pub captured_at: SystemTime,
}

impl VideoFrame {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        Self {
            width,
            height,
            pixels,
            captured_at: SystemTime::now(),
        }
    }

    pub fn has_dimensions(&self) -> bool {
        self.width > 0 && self.height > 0
    }
}

/// Convert packed YUYV 4:2:2 (BT.601, limited range) to RGB8.
///
/// Returns `None` when `data` is shorter than a `width` x `height` frame or
/// `width` is odd.
pub fn yuyv_to_rgb(width: u32, height: u32, data: &[u8]) -> Option<Vec<u8>> {
    if width % 2 != 0 {
        return None;
    }
    let pixels = (width as usize) * (height as usize);
    let data = data.get(..pixels * 2)?;
    let mut rgb = Vec::with_capacity(pixels * 3);
    for chunk in data.chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        push_rgb(&mut rgb, y0, u, v);
        push_rgb(&mut rgb, y1, u, v);
    }
    Some(rgb)
}

fn push_rgb(out: &mut Vec<u8>, y: u8, u: u8, v: u8) {
    let c = i32::from(y) - 16;
    let d = i32::from(u) - 128;
    let e = i32::from(v) - 128;
    let clamp = |x: i32| ((x + 128) >> 8).clamp(0, 255) as u8;
    out.push(clamp(298 * c + 409 * e));
    out.push(clamp(298 * c - 100 * d - 208 * e));
    out.push(clamp(298 * c + 516 * d));
}

/// A live track of an opened device.
pub trait VideoTrack {
    fn label(&self) -> &str;

    /// The current frame, or `None` when nothing has been decoded yet.
    fn current_frame(&mut self) -> Option<VideoFrame>;

    /// Stop the track. Must be idempotent.
    fn stop(&mut self);

    fn is_live(&self) -> bool;
}

/// A capture device that can be opened into tracks.
pub trait CaptureDevice {
    fn name(&self) -> &str;

    /// Open the device. Implementations stop any track they started before
    /// returning an error.
    fn open(
        &mut self,
        constraints: &CaptureConstraints,
    ) -> Result<Vec<Box<dyn VideoTrack>>, CameraError>;
}

/// Exclusive ownership of an opened device's tracks.
pub struct CameraHandle {
    device: String,
    tracks: Vec<Box<dyn VideoTrack>>,
    acquired_at: Instant,
    released: bool,
}

impl CameraHandle {
    fn new(device: String, tracks: Vec<Box<dyn VideoTrack>>) -> Self {
        Self {
            device,
            tracks,
            acquired_at: Instant::now(),
            released: false,
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Latest frame of the first live track.
    pub fn current_frame(&mut self) -> Option<VideoFrame> {
        if self.released {
            return None;
        }
        self.tracks
            .iter_mut()
            .find(|track| track.is_live())
            .and_then(|track| track.current_frame())
    }

    /// Stop every track. Safe to call repeatedly.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        for track in &mut self.tracks {
            track.stop();
        }
        self.released = true;
        log::info!("camera {} released", self.device);
    }
}

impl Drop for CameraHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// Camera acquisition with fixed-delay retry.
pub struct CameraSource {
    device: Box<dyn CaptureDevice>,
    constraints: CaptureConstraints,
    retry_delay: Duration,
    handle: Option<CameraHandle>,
    retry: Deadline,
    last_error: Option<CameraError>,
    attempts: u64,
}

impl CameraSource {
    pub fn new(
        device: Box<dyn CaptureDevice>,
        constraints: CaptureConstraints,
        retry_delay: Duration,
    ) -> Self {
        Self {
            device,
            constraints,
            retry_delay,
            handle: None,
            retry: Deadline::new(),
            last_error: None,
            attempts: 0,
        }
    }

    /// Acquire the device, releasing any handle held before.
    ///
    /// On failure a retry is armed `retry_delay` after `now`.
    pub fn acquire(&mut self, now: Instant) -> Result<(), CameraError> {
        self.release();
        self.retry.cancel();
        self.attempts += 1;

        let result = self.device.open(&self.constraints).and_then(|mut tracks| {
            if tracks.iter().any(|track| track.is_live()) {
                Ok(tracks)
            } else {
                for track in &mut tracks {
                    track.stop();
                }
                Err(CameraError::DeviceUnavailable(format!(
                    "{} opened without a live video track",
                    self.device.name()
                )))
            }
        });

        match result {
            Ok(tracks) => {
                log::info!(
                    "camera {} acquired ({} track(s), hint {}x{})",
                    self.device.name(),
                    tracks.len(),
                    self.constraints.width,
                    self.constraints.height
                );
                self.handle = Some(CameraHandle::new(self.device.name().to_string(), tracks));
                self.last_error = None;
                Ok(())
            }
            Err(err) => {
                log::warn!(
                    "camera {} acquisition failed: {}; retrying in {:?}",
                    self.device.name(),
                    err,
                    self.retry_delay
                );
                self.retry.arm(now, self.retry_delay);
                self.last_error = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Run the pending retry if it is due.
    pub fn poll_retry(&mut self, now: Instant) -> Option<Result<(), CameraError>> {
        if self.retry.fire(now) {
            Some(self.acquire(now))
        } else {
            None
        }
    }

    /// Release the current handle. Idempotent.
    pub fn release(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.release();
        }
    }

    /// Release the handle and cancel any pending retry.
    pub fn shutdown(&mut self) {
        self.release();
        self.retry.cancel();
    }

    pub fn is_acquired(&self) -> bool {
        self.handle.is_some()
    }

    pub fn retry_pending(&self) -> bool {
        self.retry.is_armed()
    }

    pub fn last_error(&self) -> Option<&CameraError> {
        self.last_error.as_ref()
    }

    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    /// Current frame, or `None` when not acquired or not yet decoding.
    pub fn current_frame(&mut self) -> Option<VideoFrame> {
        self.handle.as_mut().and_then(|handle| handle.current_frame())
    }
}

impl Drop for CameraSource {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Open a device by URI.
pub fn open_device(uri: &str) -> anyhow::Result<Box<dyn CaptureDevice>> {
    if uri.starts_with("stub://") {
        return Ok(Box::new(SyntheticDevice::new(uri)));
    }
    #[cfg(feature = "camera-v4l2")]
    {
        Ok(Box::new(V4l2Device::new(uri)))
    }
    #[cfg(not(feature = "camera-v4l2"))]
    {
        anyhow::bail!("camera device '{}' requires the camera-v4l2 feature", uri)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
