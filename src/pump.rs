//! Frame pump.
//!
//! A fixed-period loop that pulls the current camera frame, encodes it and
//! hands it to a `FrameSink`. It skips ticks (never errors) when the sink is
//! not ready, the camera has not decoded a frame yet, or sending is paused.

use std::time::{Duration, Instant};

use crate::camera::CameraSource;
use crate::encoder::{EncodedFrame, FrameEncoder};
use crate::timer::RepeatingTask;

pub const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(100);

/// Destination for encoded frames.
pub trait FrameSink {
    /// True when a send would be transmitted rather than dropped.
    fn is_ready(&self) -> bool;

    /// Send a frame. Returns false when it was dropped. Must not panic or
    /// error when called in the wrong state.
    fn send_frame(&mut self, frame: EncodedFrame, now: Instant) -> bool;
}

/// Outcome of one `tick`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PumpTick {
    /// No tick due (or the pump is stopped).
    Idle,
    Paused,
    SinkNotReady,
    /// Camera absent or not decoding yet.
    NoFrame,
    Sent,
    Dropped,
    EncodeFailed,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PumpStats {
    pub ticks: u64,
    pub frames_sent: u64,
    pub skipped: u64,
    pub encode_failures: u64,
}

pub struct FramePump {
    task: RepeatingTask,
    stats: PumpStats,
}

impl FramePump {
    pub fn new(interval: Duration) -> Self {
        Self {
            task: RepeatingTask::new("frame-pump", interval),
            stats: PumpStats::default(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.task.period()
    }

    /// Start ticking. The first tick is due immediately.
    pub fn start(&mut self, now: Instant) {
        if !self.task.is_scheduled() {
            log::info!("frame pump started ({:?} interval)", self.task.period());
            self.task.start_immediately(now);
        }
    }

    /// Stop ticking. No tick fires after this until `start`.
    pub fn stop(&mut self) {
        if self.task.is_scheduled() {
            log::info!("frame pump stopped");
        }
        self.task.cancel();
    }

    pub fn is_running(&self) -> bool {
        self.task.is_scheduled()
    }

    pub fn pause(&mut self) {
        self.task.pause();
    }

    pub fn resume(&mut self) {
        self.task.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.task.is_paused()
    }

    pub fn stats(&self) -> &PumpStats {
        &self.stats
    }

    pub fn tick(
        &mut self,
        now: Instant,
        camera: &mut CameraSource,
        encoder: &mut FrameEncoder,
        sink: &mut dyn FrameSink,
    ) -> PumpTick {
        if !self.task.is_scheduled() {
            return PumpTick::Idle;
        }
        let paused = self.task.is_paused();
        if paused {
            // Keep the schedule moving so resume does not burst.
            self.task.fire(now);
            return PumpTick::Paused;
        }
        if !self.task.fire(now) {
            return PumpTick::Idle;
        }
        self.stats.ticks += 1;

        if !sink.is_ready() {
            self.stats.skipped += 1;
            return PumpTick::SinkNotReady;
        }
        let Some(frame) = camera.current_frame() else {
            self.stats.skipped += 1;
            return PumpTick::NoFrame;
        };
        let encoded = match encoder.encode(&frame) {
            Ok(Some(encoded)) => encoded,
            Ok(None) => {
                self.stats.skipped += 1;
                return PumpTick::NoFrame;
            }
            Err(err) => {
                log::warn!("frame encode failed: {:#}", err);
                self.stats.encode_failures += 1;
                return PumpTick::EncodeFailed;
            }
        };
        if sink.send_frame(encoded, now) {
            self.stats.frames_sent += 1;
            PumpTick::Sent
        } else {
            PumpTick::Dropped
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CaptureConstraints, SyntheticDevice};
    use crate::encoder::EncoderSettings;

    #[derive(Default)]
    struct RecordingSink {
        ready: bool,
        sent: Vec<usize>,
    }

    impl FrameSink for RecordingSink {
        fn is_ready(&self) -> bool {
            self.ready
        }

        fn send_frame(&mut self, frame: EncodedFrame, _now: Instant) -> bool {
            if !self.ready {
                return false;
            }
            self.sent.push(frame.len());
            true
        }
    }

    fn camera(now: Instant) -> CameraSource {
        let mut camera = CameraSource::new(
            Box::new(SyntheticDevice::new("stub://pump")),
            CaptureConstraints {
                width: 32,
                height: 24,
                frame_rate: 10,
            },
            Duration::from_secs(5),
        );
        camera.acquire(now).expect("acquire");
        camera
    }

    fn encoder() -> FrameEncoder {
        FrameEncoder::new(EncoderSettings::default()).expect("encoder")
    }

    #[test]
    fn skips_until_first_frame_then_sends() {
        let t0 = Instant::now();
        let mut camera = camera(t0);
        let mut encoder = encoder();
        let mut sink = RecordingSink {
            ready: true,
            ..Default::default()
        };
        let mut pump = FramePump::new(Duration::from_millis(100));
        pump.start(t0);

        assert_eq!(pump.tick(t0, &mut camera, &mut encoder, &mut sink), PumpTick::NoFrame);
        assert_eq!(
            pump.tick(t0 + Duration::from_millis(50), &mut camera, &mut encoder, &mut sink),
            PumpTick::Idle
        );
        assert_eq!(
            pump.tick(t0 + Duration::from_millis(100), &mut camera, &mut encoder, &mut sink),
            PumpTick::Sent
        );
        assert_eq!(sink.sent.len(), 1);
    }

    #[test]
    fn never_sends_when_sink_not_ready() {
        let t0 = Instant::now();
        let mut camera = camera(t0);
        let mut encoder = encoder();
        let mut sink = RecordingSink::default();
        let mut pump = FramePump::new(Duration::from_millis(100));
        pump.start(t0);
        for i in 0..10 {
            let tick = pump.tick(
                t0 + Duration::from_millis(100 * i),
                &mut camera,
                &mut encoder,
                &mut sink,
            );
            assert_eq!(tick, PumpTick::SinkNotReady);
        }
        assert!(sink.sent.is_empty());
        assert_eq!(encoder.frames_encoded(), 0);
    }

    #[test]
    fn pause_suspends_without_stopping() {
        let t0 = Instant::now();
        let mut camera = camera(t0);
        let mut encoder = encoder();
        let mut sink = RecordingSink {
            ready: true,
            ..Default::default()
        };
        let mut pump = FramePump::new(Duration::from_millis(100));
        pump.start(t0);
        pump.pause();
        assert_eq!(pump.tick(t0, &mut camera, &mut encoder, &mut sink), PumpTick::Paused);
        assert!(pump.is_running());
        assert!(camera.is_acquired());
        pump.resume();
        assert_eq!(
            pump.tick(t0 + Duration::from_millis(100), &mut camera, &mut encoder, &mut sink),
            PumpTick::NoFrame
        );
    }

    #[test]
    fn stopped_pump_never_ticks() {
        let t0 = Instant::now();
        let mut camera = camera(t0);
        let mut encoder = encoder();
        let mut sink = RecordingSink {
            ready: true,
            ..Default::default()
        };
        let mut pump = FramePump::new(Duration::from_millis(100));
        pump.start(t0);
        pump.stop();
        assert_eq!(
            pump.tick(t0 + Duration::from_secs(1), &mut camera, &mut encoder, &mut sink),
            PumpTick::Idle
        );
        assert_eq!(pump.stats().ticks, 0);
    }
}
