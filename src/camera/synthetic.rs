//! Synthetic capture device for `stub://` URIs.
//!
//! `stub://denied` fails with `PermissionDenied`, `stub://missing` with
//! `DeviceUnavailable`. Any other name opens one track that reports zero
//! dimensions on its first read (nothing decoded yet) and a moving test
//! pattern afterwards.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::{CaptureConstraints, CaptureDevice, VideoFrame, VideoTrack};
use crate::error::CameraError;

pub struct SyntheticDevice {
    uri: String,
    stopped: Arc<AtomicUsize>,
}

impl SyntheticDevice {
    pub fn new(uri: &str) -> Self {
        Self {
            uri: uri.to_string(),
            stopped: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of tracks of this device that have been stopped.
    pub fn stopped_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.stopped)
    }
}

impl CaptureDevice for SyntheticDevice {
    fn name(&self) -> &str {
        &self.uri
    }

    fn open(
        &mut self,
        constraints: &CaptureConstraints,
    ) -> Result<Vec<Box<dyn VideoTrack>>, CameraError> {
        match self.uri.trim_start_matches("stub://") {
            "denied" => Err(CameraError::PermissionDenied(format!(
                "{} refused access",
                self.uri
            ))),
            "missing" => Err(CameraError::DeviceUnavailable(format!(
                "{} not present",
                self.uri
            ))),
            _ => {
                log::info!("SyntheticDevice: opened {} (synthetic)", self.uri);
                Ok(vec![Box::new(SyntheticTrack {
                    label: format!("{} video", self.uri),
                    width: constraints.width,
                    height: constraints.height,
                    frame_count: 0,
                    scene_state: 0,
                    live: true,
                    stopped: Arc::clone(&self.stopped),
                })])
            }
        }
    }
}

struct SyntheticTrack {
    label: String,
    width: u32,
    height: u32,
    frame_count: u64,
    /// Simulated scene state, changes every 50 frames.
    scene_state: u8,
    live: bool,
    stopped: Arc<AtomicUsize>,
}

impl SyntheticTrack {
    fn generate_pixels(&mut self) -> Vec<u8> {
        let pixel_count = (self.width * self.height * 3) as usize;
        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count + self.scene_state as u64) % 256) as u8;
        }
        pixels
    }
}

impl VideoTrack for SyntheticTrack {
    fn label(&self) -> &str {
        &self.label
    }

    fn current_frame(&mut self) -> Option<VideoFrame> {
        if !self.live {
            return None;
        }
        self.frame_count += 1;
        if self.frame_count == 1 {
            return None;
        }
        let pixels = self.generate_pixels();
        Some(VideoFrame::new(self.width, self.height, pixels))
    }

    fn stop(&mut self) {
        if self.live {
            self.live = false;
            self.stopped.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_live(&self) -> bool {
        self.live
    }
}
