//! Session reconciler.
//!
//! Turns plate sightings into vehicle sessions:
//! - first sighting (or sighting after the last session closed) is an entry
//! - a sighting while the plate's session is `in` is an exit
//! - sightings inside the duplicate window of the previous one change nothing
//!
//! The duplicate window makes the reconciler insensitive to the same detection
//! arriving through both the channel and the poller, in either order.
//! Sessions are never deleted; they only move from `in` to `out`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::SessionError;
use crate::plate::{is_sentinel_plate, RecognitionEvent};

pub const DEFAULT_HOURLY_RATE: u64 = 25_000;
/// Longer than one poll period plus its request timeout, so a poll that
/// catches up to a pushed detection still lands inside the window.
pub const DEFAULT_DUPLICATE_WINDOW: Duration = Duration::from_secs(5);

const MILLIS_PER_HOUR: u128 = 3_600_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    In,
    Out,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleSession {
    pub plate: String,
    pub entry_time: DateTime<Utc>,
    pub exit_time: Option<DateTime<Utc>>,
    pub fee: Option<u64>,
    pub status: SessionStatus,
}

impl VehicleSession {
    fn open(plate: &str, at: DateTime<Utc>) -> Self {
        Self {
            plate: plate.to_string(),
            entry_time: at,
            exit_time: None,
            fee: None,
            status: SessionStatus::In,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == SessionStatus::In
    }
}

/// What a sighting did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reconciled {
    Entered(VehicleSession),
    Exited(VehicleSession),
    /// Same detection as the previous sighting of this plate.
    Duplicate { plate: String },
    /// Sentinel "no plate" value.
    Ignored,
}

/// Parking fee for a stay: `ceil(hours × hourly_rate)`.
///
/// Computed on whole milliseconds so results are exact. An exit before the
/// entry (clock skew) is billed as zero time.
pub fn compute_fee(entry: DateTime<Utc>, exit: DateTime<Utc>, hourly_rate: u64) -> u64 {
    let elapsed_ms = (exit - entry).num_milliseconds().max(0) as u128;
    let fee = (elapsed_ms * hourly_rate as u128).div_ceil(MILLIS_PER_HOUR);
    u64::try_from(fee).unwrap_or(u64::MAX)
}

pub struct SessionReconciler {
    hourly_rate: u64,
    duplicate_window: chrono::Duration,
    sessions: Vec<VehicleSession>,
    latest: HashMap<String, usize>,
    last_seen: HashMap<String, DateTime<Utc>>,
}

impl SessionReconciler {
    pub fn new(hourly_rate: u64, duplicate_window: Duration) -> Self {
        Self {
            hourly_rate,
            duplicate_window: chrono::Duration::from_std(duplicate_window)
                .unwrap_or(chrono::Duration::MAX),
            sessions: Vec::new(),
            latest: HashMap::new(),
            last_seen: HashMap::new(),
        }
    }

    pub fn hourly_rate(&self) -> u64 {
        self.hourly_rate
    }

    /// Apply one sighting.
    pub fn observe(&mut self, event: &RecognitionEvent, at: DateTime<Utc>) -> Reconciled {
        let plate = event.plate.trim();
        if is_sentinel_plate(plate) {
            return Reconciled::Ignored;
        }
        if self.is_duplicate(plate, at) {
            self.touch(plate, at);
            log::debug!("duplicate sighting of {} ignored", plate);
            return Reconciled::Duplicate {
                plate: plate.to_string(),
            };
        }
        self.touch(plate, at);

        match self.open_index(plate) {
            Some(index) => {
                let closed = self.close_at(index, at);
                log::info!(
                    "vehicle {} exited, fee {}",
                    closed.plate,
                    closed.fee.unwrap_or(0)
                );
                Reconciled::Exited(closed)
            }
            None => {
                let session = VehicleSession::open(plate, at);
                self.sessions.push(session.clone());
                self.latest.insert(plate.to_string(), self.sessions.len() - 1);
                log::info!("vehicle {} entered", plate);
                Reconciled::Entered(session)
            }
        }
    }

    /// Operator checkout. Same transition and fee as an automatic exit.
    pub fn checkout(
        &mut self,
        plate: &str,
        at: DateTime<Utc>,
    ) -> Result<VehicleSession, SessionError> {
        let plate = plate.trim();
        let index = self
            .open_index(plate)
            .ok_or_else(|| SessionError::NoOpenSession(plate.to_string()))?;
        self.touch(plate, at);
        let closed = self.close_at(index, at);
        log::info!(
            "vehicle {} checked out, fee {}",
            closed.plate,
            closed.fee.unwrap_or(0)
        );
        Ok(closed)
    }

    /// Most recent session for a plate.
    pub fn latest(&self, plate: &str) -> Option<&VehicleSession> {
        self.latest
            .get(plate.trim())
            .and_then(|index| self.sessions.get(*index))
    }

    pub fn open_session(&self, plate: &str) -> Option<&VehicleSession> {
        self.latest(plate).filter(|session| session.is_open())
    }

    /// All sessions, oldest first.
    pub fn sessions(&self) -> &[VehicleSession] {
        &self.sessions
    }

    pub fn open_count(&self) -> usize {
        self.sessions.iter().filter(|s| s.is_open()).count()
    }

    fn open_index(&self, plate: &str) -> Option<usize> {
        self.latest
            .get(plate)
            .copied()
            .filter(|index| self.sessions[*index].is_open())
    }

    fn is_duplicate(&self, plate: &str, at: DateTime<Utc>) -> bool {
        match self.last_seen.get(plate) {
            Some(last) => at - *last < self.duplicate_window,
            None => false,
        }
    }

    fn touch(&mut self, plate: &str, at: DateTime<Utc>) {
        let entry = self.last_seen.entry(plate.to_string()).or_insert(at);
        if at > *entry {
            *entry = at;
        }
    }

    fn close_at(&mut self, index: usize, at: DateTime<Utc>) -> VehicleSession {
        let rate = self.hourly_rate;
        let session = &mut self.sessions[index];
        session.status = SessionStatus::Out;
        session.exit_time = Some(at);
        session.fee = Some(compute_fee(session.entry_time, at, rate));
        session.clone()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plate::EventOrigin;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, s)
            .single()
            .expect("valid time")
    }

    fn sighting(plate: &str, origin: EventOrigin) -> RecognitionEvent {
        RecognitionEvent::new(plate, Vec::new(), origin)
    }

    fn reconciler() -> SessionReconciler {
        SessionReconciler::new(DEFAULT_HOURLY_RATE, DEFAULT_DUPLICATE_WINDOW)
    }

    #[test]
    fn fee_is_exact_ceiling_of_hours_times_rate() {
        assert_eq!(compute_fee(at(10, 0, 0), at(12, 30, 0), 25_000), 62_500);
        assert_eq!(compute_fee(at(10, 0, 0), at(10, 0, 0), 25_000), 0);
        assert_eq!(compute_fee(at(10, 0, 0), at(10, 0, 1), 25_000), 7);
        assert_eq!(compute_fee(at(12, 0, 0), at(10, 0, 0), 25_000), 0);
    }

    #[test]
    fn fee_is_monotonic_in_exit_time() {
        let entry = at(8, 0, 0);
        let mut previous = 0;
        for minutes in 0..600 {
            let exit = entry + chrono::Duration::minutes(minutes);
            let fee = compute_fee(entry, exit, 25_000);
            assert!(fee >= previous);
            previous = fee;
        }
    }

    #[test]
    fn entry_then_exit_scenario() {
        let mut sessions = reconciler();
        let entered = sessions.observe(&sighting("51F-123.45", EventOrigin::Poll), at(10, 0, 0));
        assert!(matches!(entered, Reconciled::Entered(_)));
        assert_eq!(sessions.open_count(), 1);

        let exited = sessions.observe(&sighting("51F-123.45", EventOrigin::Push), at(12, 30, 0));
        match exited {
            Reconciled::Exited(session) => {
                assert_eq!(session.status, SessionStatus::Out);
                assert_eq!(session.exit_time, Some(at(12, 30, 0)));
                assert_eq!(session.fee, Some(62_500));
            }
            other => panic!("expected exit, got {:?}", other),
        }
        assert_eq!(sessions.open_count(), 0);
        assert_eq!(sessions.sessions().len(), 1);
    }

    #[test]
    fn duplicate_delivery_across_sources_is_a_no_op() {
        let mut sessions = reconciler();
        sessions.observe(&sighting("51F-123.45", EventOrigin::Push), at(10, 0, 0));
        sessions.observe(&sighting("51F-123.45", EventOrigin::Push), at(12, 0, 0));

        // The same exit detection arrives again through the poller.
        let again = sessions.observe(&sighting("51F-123.45", EventOrigin::Poll), at(12, 0, 1));
        assert_eq!(
            again,
            Reconciled::Duplicate {
                plate: "51F-123.45".to_string()
            }
        );
        assert_eq!(sessions.sessions().len(), 1);
        assert_eq!(sessions.open_count(), 0);
    }

    #[test]
    fn continuous_sightings_do_not_toggle_the_session() {
        let mut sessions = reconciler();
        let start = at(9, 0, 0);
        for tenth in 0..100 {
            let when = start + chrono::Duration::milliseconds(100 * tenth);
            sessions.observe(&sighting("29A-555.55", EventOrigin::Push), when);
        }
        assert_eq!(sessions.sessions().len(), 1);
        assert_eq!(sessions.open_count(), 1);
    }

    #[test]
    fn never_two_open_sessions_for_one_plate() {
        let mut sessions = reconciler();
        for hour in 0..9 {
            sessions.observe(&sighting("51F-123.45", EventOrigin::Poll), at(8 + hour, 0, 0));
            let open = sessions
                .sessions()
                .iter()
                .filter(|s| s.plate == "51F-123.45" && s.is_open())
                .count();
            assert!(open <= 1);
        }
        // 9 sightings: entries on even hours, exits on odd hours.
        assert_eq!(sessions.sessions().len(), 5);
        assert_eq!(sessions.open_count(), 1);
    }

    #[test]
    fn sentinels_never_create_or_mutate_sessions() {
        let mut sessions = reconciler();
        for (i, plate) in ["No plate detected", "unknown", "", "UNKNOWN"].iter().enumerate() {
            let result = sessions.observe(&sighting(plate, EventOrigin::Poll), at(10, i as u32, 0));
            assert_eq!(result, Reconciled::Ignored);
        }
        assert!(sessions.sessions().is_empty());
    }

    #[test]
    fn checkout_matches_automatic_exit_fee() {
        let mut by_checkout = reconciler();
        let mut by_sighting = reconciler();
        by_checkout.observe(&sighting("51F-123.45", EventOrigin::Poll), at(7, 15, 0));
        by_sighting.observe(&sighting("51F-123.45", EventOrigin::Poll), at(7, 15, 0));

        let checked_out = by_checkout
            .checkout("51F-123.45", at(9, 40, 20))
            .expect("checkout");
        let exited = match by_sighting
            .observe(&sighting("51F-123.45", EventOrigin::Push), at(9, 40, 20))
        {
            Reconciled::Exited(session) => session,
            other => panic!("expected exit, got {:?}", other),
        };
        assert_eq!(checked_out, exited);
    }

    #[test]
    fn checkout_without_open_session_fails() {
        let mut sessions = reconciler();
        assert_eq!(
            sessions.checkout("51F-123.45", at(10, 0, 0)),
            Err(SessionError::NoOpenSession("51F-123.45".to_string()))
        );
    }

    #[test]
    fn sighting_right_after_checkout_is_a_duplicate() {
        let mut sessions = reconciler();
        sessions.observe(&sighting("51F-123.45", EventOrigin::Poll), at(10, 0, 0));
        sessions.checkout("51F-123.45", at(11, 0, 0)).expect("checkout");
        let result = sessions.observe(&sighting("51F-123.45", EventOrigin::Push), at(11, 0, 1));
        assert!(matches!(result, Reconciled::Duplicate { .. }));
        assert_eq!(sessions.open_count(), 0);
    }
}
