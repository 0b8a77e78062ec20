//! Cancellable timers driven by a caller-supplied `Instant`.
//!
//! Nothing here sleeps or spawns. The owner checks `fire(now)` from its loop,
//! so cancelling a timer is just clearing its deadline and teardown is
//! deterministic.

use std::time::{Duration, Instant};

/// A fixed-period task. Idle until `start`, stopped by `cancel`.
#[derive(Clone, Debug)]
pub struct RepeatingTask {
    name: &'static str,
    period: Duration,
    next_due: Option<Instant>,
    paused: bool,
}

impl RepeatingTask {
    pub fn new(name: &'static str, period: Duration) -> Self {
        Self {
            name,
            period,
            next_due: None,
            paused: false,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Schedule the first tick one period from `now`.
    pub fn start(&mut self, now: Instant) {
        self.next_due = Some(now + self.period);
    }

    /// Schedule the first tick at `now`.
    pub fn start_immediately(&mut self, now: Instant) {
        self.next_due = Some(now);
    }

    pub fn cancel(&mut self) {
        if self.next_due.take().is_some() {
            log::debug!("timer {} cancelled", self.name);
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.next_due.is_some()
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.next_due
    }

    /// Paused ticks keep their schedule but do not fire.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Returns true when a tick is due and not paused.
    ///
    /// Missed ticks are coalesced: a loop that falls behind fires once and
    /// reschedules from `now` instead of bursting.
    pub fn fire(&mut self, now: Instant) -> bool {
        let Some(due) = self.next_due else {
            return false;
        };
        if now < due {
            return false;
        }
        let next = due + self.period;
        self.next_due = Some(if next <= now { now + self.period } else { next });
        !self.paused
    }
}

/// A one-shot deadline (reconnect backoff, camera retry).
#[derive(Clone, Debug, Default)]
pub struct Deadline {
    due: Option<Instant>,
}

impl Deadline {
    pub fn new() -> Self {
        Self { due: None }
    }

    /// Arm the deadline unless it is already armed. Returns true when armed by
    /// this call.
    pub fn arm(&mut self, now: Instant, delay: Duration) -> bool {
        if self.due.is_some() {
            return false;
        }
        self.due = Some(now + delay);
        true
    }

    pub fn cancel(&mut self) {
        self.due = None;
    }

    pub fn is_armed(&self) -> bool {
        self.due.is_some()
    }

    pub fn due(&self) -> Option<Instant> {
        self.due
    }

    /// Returns true once when the deadline has passed, then disarms.
    pub fn fire(&mut self, now: Instant) -> bool {
        match self.due {
            Some(due) if now >= due => {
                self.due = None;
                true
            }
            _ => false,
        }
    }
}
