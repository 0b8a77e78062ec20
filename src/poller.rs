//! Recognition poller.
//!
//! Polls the backend's "latest plate" endpoint on a fixed period. It is
//! redundant with channel pushes: the channel may be down, or the backend may
//! only answer polled requests. Forwarding is deduplicated on plate value so a
//! vehicle that stays in view is reconciled once.

use std::time::{Duration, Instant};

use crate::api::RecognitionBackend;
use crate::error::ApiError;
use crate::plate::{is_sentinel_plate, EventOrigin, RecognitionEvent};
use crate::timer::RepeatingTask;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub enum PollOutcome {
    NotDue,
    /// Backend reported no plate.
    NoPlate,
    /// Same plate as last forwarded.
    Unchanged,
    Forwarded(RecognitionEvent),
    Failed(ApiError),
}

pub struct RecognitionPoller {
    task: RepeatingTask,
    last_plate: Option<String>,
    failures: u64,
}

impl RecognitionPoller {
    pub fn new(interval: Duration) -> Self {
        Self {
            task: RepeatingTask::new("recognition-poller", interval),
            last_plate: None,
            failures: 0,
        }
    }

    /// First poll is due immediately.
    pub fn start(&mut self, now: Instant) {
        if !self.task.is_scheduled() {
            self.task.start_immediately(now);
        }
    }

    pub fn stop(&mut self) {
        self.task.cancel();
    }

    pub fn is_running(&self) -> bool {
        self.task.is_scheduled()
    }

    pub fn last_plate(&self) -> Option<&str> {
        self.last_plate.as_deref()
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    /// Record a plate the channel already delivered, so a later poll that
    /// catches up to the same detection is not forwarded again.
    pub fn note_pushed(&mut self, plate: &str) {
        let plate = plate.trim();
        if !is_sentinel_plate(plate) {
            self.last_plate = Some(plate.to_string());
        }
    }

    pub fn poll(&mut self, now: Instant, backend: &mut dyn RecognitionBackend) -> PollOutcome {
        if !self.task.fire(now) {
            return PollOutcome::NotDue;
        }
        let reading = match backend.latest_plate() {
            Ok(reading) => reading,
            Err(err) => {
                // Retried on the next tick; no backoff escalation.
                self.failures += 1;
                log::warn!("plate poll failed: {}", err);
                return PollOutcome::Failed(err);
            }
        };
        let plate = reading.plate.trim();
        if is_sentinel_plate(plate) {
            return PollOutcome::NoPlate;
        }
        if self.last_plate.as_deref() == Some(plate) {
            return PollOutcome::Unchanged;
        }
        log::info!("poller observed plate {}", plate);
        self.last_plate = Some(plate.to_string());
        PollOutcome::Forwarded(RecognitionEvent::new(
            plate,
            reading.boxes,
            EventOrigin::Poll,
        ))
    }
}
