use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::time::Duration;

use parkscan::plate::{EventOrigin, RecognitionEvent};
use parkscan::session::{compute_fee, Reconciled, SessionReconciler, SessionStatus};

const PLATES: &[&str] = &["51F-123.45", "30A-999.99", "29A-555.55", "unknown", ""];

fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 6, 0, 0)
        .single()
        .expect("valid time")
}

/// Random sightings, strictly increasing in time.
fn sightings(seed: u64, count: usize) -> Vec<(RecognitionEvent, DateTime<Utc>)> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut at = base();
    (0..count)
        .map(|_| {
            at += ChronoDuration::milliseconds(rng.gen_range(1..900_000));
            let plate = PLATES[rng.gen_range(0..PLATES.len())];
            let origin = if rng.gen_bool(0.5) {
                EventOrigin::Push
            } else {
                EventOrigin::Poll
            };
            (RecognitionEvent::new(plate, Vec::new(), origin), at)
        })
        .collect()
}

#[test]
fn at_most_one_open_session_per_plate() {
    for seed in 0..20 {
        let mut reconciler = SessionReconciler::new(25_000, Duration::from_secs(2));
        let mut previous_len = 0;
        for (event, at) in sightings(seed, 300) {
            reconciler.observe(&event, at);

            let mut open: HashMap<&str, usize> = HashMap::new();
            for session in reconciler.sessions() {
                if session.status == SessionStatus::In {
                    *open.entry(session.plate.as_str()).or_default() += 1;
                }
            }
            assert!(open.values().all(|count| *count <= 1), "seed {}", seed);

            // Sessions are never deleted.
            assert!(reconciler.sessions().len() >= previous_len);
            previous_len = reconciler.sessions().len();
        }
    }
}

#[test]
fn sentinel_plates_never_produce_sessions() {
    for seed in 0..10 {
        let mut reconciler = SessionReconciler::new(25_000, Duration::from_secs(2));
        for (event, at) in sightings(seed, 200) {
            let outcome = reconciler.observe(&event, at);
            if event.is_sentinel() {
                assert_eq!(outcome, Reconciled::Ignored);
            }
        }
        assert!(reconciler
            .sessions()
            .iter()
            .all(|session| session.plate != "unknown" && !session.plate.is_empty()));
    }
}

#[test]
fn fees_match_exact_ceiling_and_grow_with_time() {
    let mut rng = StdRng::seed_from_u64(7);
    let entry = base();
    for _ in 0..500 {
        let elapsed_ms: i64 = rng.gen_range(0..400_000_000);
        let rate: u64 = rng.gen_range(0..200_000);
        let exit = entry + ChronoDuration::milliseconds(elapsed_ms);
        let fee = compute_fee(entry, exit, rate);

        let product = elapsed_ms as u128 * rate as u128;
        let expected = (product + 3_599_999) / 3_600_000;
        assert_eq!(fee as u128, expected);

        let later = exit + ChronoDuration::milliseconds(rng.gen_range(0..10_000_000));
        assert!(compute_fee(entry, later, rate) >= fee);
    }
}

#[test]
fn duplicate_deliveries_commute() {
    // Each detection arrives once by push and once by poll, within the
    // duplicate window, in either order.
    let mut rng = StdRng::seed_from_u64(42);
    let mut detections = Vec::new();
    let mut at = base();
    for _ in 0..100 {
        at += ChronoDuration::minutes(rng.gen_range(1..120));
        detections.push((PLATES[rng.gen_range(0..3)], at));
    }

    let run = |push_first: &dyn Fn(usize) -> bool| {
        let mut reconciler = SessionReconciler::new(25_000, Duration::from_secs(2));
        for (i, (plate, at)) in detections.iter().enumerate() {
            let push = RecognitionEvent::new(*plate, Vec::new(), EventOrigin::Push);
            let poll = RecognitionEvent::new(*plate, Vec::new(), EventOrigin::Poll);
            let (first, second) = if push_first(i) {
                (push, poll)
            } else {
                (poll, push)
            };
            reconciler.observe(&first, *at);
            reconciler.observe(&second, *at + ChronoDuration::milliseconds(500));
        }
        reconciler.sessions().to_vec()
    };

    let baseline = run(&|_| true);
    let flipped = run(&|_| false);
    let alternating = run(&|i| i % 2 == 0);

    // Entry and exit times may differ by the 500 ms gap between deliveries;
    // plates, statuses and session count must not.
    let shape = |sessions: &[parkscan::session::VehicleSession]| {
        sessions
            .iter()
            .map(|s| (s.plate.clone(), s.status))
            .collect::<Vec<_>>()
    };
    assert_eq!(shape(&baseline), shape(&flipped));
    assert_eq!(shape(&baseline), shape(&alternating));
    assert_eq!(baseline, flipped);
}
