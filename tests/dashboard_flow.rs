use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};

use parkscan::api::{PlateReading, RecognitionBackend};
use parkscan::camera::{CameraSource, CaptureConstraints, SyntheticDevice};
use parkscan::channel::{
    ChannelSettings, ChannelState, Inbound, MemoryLink, MemoryTransport, TelemetryChannel,
    DELIBERATE_CLOSE_CODE,
};
use parkscan::dashboard::{
    CaptureMode, ConnectionStatus, Dashboard, DashboardParts, DashboardSettings, DisplayMode,
    Notice,
};
use parkscan::encoder::{EncodedFrame, EncoderSettings, FrameEncoder};
use parkscan::error::{ApiError, CameraError};
use parkscan::session::SessionStatus;

#[derive(Default)]
struct BackendState {
    plate: String,
    upload_reply: String,
    fail: bool,
    uploads: usize,
}

#[derive(Clone, Default)]
struct FakeBackend {
    state: Arc<Mutex<BackendState>>,
}

impl FakeBackend {
    fn set_plate(&self, plate: &str) {
        self.state.lock().unwrap().plate = plate.to_string();
    }

    /// Plate returned in reply to uploaded frames.
    fn set_upload_reply(&self, plate: &str) {
        self.state.lock().unwrap().upload_reply = plate.to_string();
    }

    fn set_failing(&self, fail: bool) {
        self.state.lock().unwrap().fail = fail;
    }

    fn uploads(&self) -> usize {
        self.state.lock().unwrap().uploads
    }
}

impl RecognitionBackend for FakeBackend {
    fn latest_plate(&mut self) -> Result<PlateReading, ApiError> {
        let state = self.state.lock().unwrap();
        if state.fail {
            return Err(ApiError::Request {
                endpoint: "GET /get_plate".to_string(),
                message: "connection refused".to_string(),
            });
        }
        Ok(PlateReading {
            plate: state.plate.clone(),
            boxes: Vec::new(),
        })
    }

    fn upload_frame(&mut self, _frame: &EncodedFrame) -> Result<PlateReading, ApiError> {
        let mut state = self.state.lock().unwrap();
        state.uploads += 1;
        Ok(PlateReading {
            plate: state.upload_reply.clone(),
            boxes: Vec::new(),
        })
    }
}

fn settings() -> DashboardSettings {
    DashboardSettings {
        display_mode: DisplayMode::LocalCamera,
        capture_mode: CaptureMode::Socket,
        push_recognition: true,
        poll_recognition: true,
        frame_interval: Duration::from_millis(100),
        poll_interval: Duration::from_secs(2),
        hourly_rate: 25_000,
        duplicate_window: Duration::from_secs(5),
    }
}

struct Rig {
    dashboard: Dashboard,
    link: MemoryLink,
    backend: FakeBackend,
    stopped: Arc<AtomicUsize>,
    t0: Instant,
    w0: DateTime<Utc>,
}

impl Rig {
    fn new(camera_uri: &str, settings: DashboardSettings) -> Self {
        let link = MemoryLink::new();
        let backend = FakeBackend::default();
        backend.set_plate("No plate detected");

        let device = SyntheticDevice::new(camera_uri);
        let stopped = device.stopped_counter();
        let camera = CameraSource::new(
            Box::new(device),
            CaptureConstraints {
                width: 32,
                height: 24,
                frame_rate: 10,
            },
            Duration::from_secs(5),
        );
        let channel = TelemetryChannel::new(
            ChannelSettings::new("ws://backend.test/ws/stream"),
            Box::new(MemoryTransport::new(link.clone())),
        );
        let dashboard = Dashboard::new(
            settings,
            DashboardParts {
                camera,
                encoder: FrameEncoder::new(EncoderSettings::default()).expect("encoder"),
                channel: Some(channel),
                backend: Box::new(backend.clone()),
            },
        )
        .expect("dashboard");

        Self {
            dashboard,
            link,
            backend,
            stopped,
            t0: Instant::now(),
            w0: Utc
                .with_ymd_and_hms(2024, 5, 1, 8, 0, 0)
                .single()
                .expect("valid time"),
        }
    }

    fn start(&mut self) -> Vec<Notice> {
        self.dashboard.start(self.t0)
    }

    fn step_at(&mut self, millis: u64) -> Vec<Notice> {
        let now = self.t0 + Duration::from_millis(millis);
        let wall = self.w0 + chrono::Duration::milliseconds(millis as i64);
        self.dashboard.step(now, wall)
    }

    fn step_range(&mut self, from_ms: u64, to_ms: u64) -> Vec<Notice> {
        let mut notices = Vec::new();
        let mut at = from_ms;
        while at <= to_ms {
            notices.extend(self.step_at(at));
            at += 100;
        }
        notices
    }

    fn push(&self, json: &str) {
        self.link.push_inbound(Inbound::Text(json.to_string()));
    }
}

#[test]
fn streams_frames_once_connected_and_camera_decodes() {
    let mut rig = Rig::new("stub://gate", settings());
    assert_eq!(rig.start(), vec![Notice::CameraReady]);
    assert!(rig.dashboard.camera().is_acquired());

    let notices = rig.step_at(0);
    assert_eq!(notices, vec![Notice::Connection(ConnectionStatus::Connected)]);
    assert!(rig.dashboard.pump_running());
    // First read has no decoded frame yet.
    assert_eq!(rig.link.frames_sent(), 0);

    rig.step_at(100);
    rig.step_at(200);
    assert_eq!(rig.link.frames_sent(), 2);
    assert!(rig
        .link
        .sent()
        .iter()
        .all(|message| message.starts_with("data:image/jpeg;base64,")));
}

#[test]
fn pushed_and_polled_sightings_reconcile_to_one_session() {
    let mut rig = Rig::new("stub://gate", settings());
    rig.start();
    rig.step_at(0);

    rig.push(r#"{"plate":"51F-123.45","boxes":[{"x":1,"y":2,"w":3,"h":4,"plate":"51F-123.45"}]}"#);
    let notices = rig.step_at(200);
    assert!(matches!(notices.as_slice(), [Notice::Entered(s)] if s.plate == "51F-123.45"));

    // Poller sees the same detection 1.8 s later: duplicate, no notice.
    rig.backend.set_plate("51F-123.45");
    let notices = rig.step_range(300, 2_000);
    assert!(notices.is_empty(), "unexpected notices {:?}", notices);
    assert_eq!(rig.dashboard.sessions().len(), 1);

    // Vehicle leaves two and a half hours after entering.
    rig.push(r#"{"plate":"51F-123.45","boxes":[]}"#);
    let notices = rig.step_at(200 + 9_000_000);
    match notices.as_slice() {
        [Notice::Exited(session)] => {
            assert_eq!(session.status, SessionStatus::Out);
            assert_eq!(session.fee, Some(62_500));
        }
        other => panic!("expected exit, got {:?}", other),
    }
    assert_eq!(rig.dashboard.reconciler().open_count(), 0);
}

#[test]
fn poll_catching_up_to_a_pushed_plate_does_not_exit() {
    // Even with a window no longer than one poll period, the poller must not
    // re-forward a detection the channel already delivered.
    let mut rig = Rig::new(
        "stub://gate",
        DashboardSettings {
            duplicate_window: Duration::from_secs(2),
            ..settings()
        },
    );
    rig.start();
    // The poll at t=0 still reports no plate.
    rig.step_at(0);
    rig.push(r#"{"plate":"51F-123.45","boxes":[]}"#);
    let notices = rig.step_at(100);
    assert!(notices
        .iter()
        .any(|n| matches!(n, Notice::Entered(s) if s.plate == "51F-123.45")));

    // /get_plate only reports the plate on the next poll tick.
    rig.backend.set_plate("51F-123.45");
    let notices = rig.step_range(200, 6_000);
    assert!(notices.is_empty(), "unexpected notices {:?}", notices);
    assert_eq!(rig.dashboard.sessions().len(), 1);
    assert_eq!(rig.dashboard.reconciler().open_count(), 1);
    assert_eq!(rig.dashboard.poller().last_plate(), Some("51F-123.45"));
}

#[test]
fn never_sends_while_disconnected() {
    let mut rig = Rig::new("stub://gate", settings());
    rig.link.fail_next_opens(1);
    rig.start();

    let notices = rig.step_at(0);
    assert!(notices.contains(&Notice::Connection(ConnectionStatus::Error)));
    rig.step_range(100, 2_900);
    assert_eq!(rig.link.frames_sent(), 0);
    assert!(!rig.dashboard.pump_running());

    // Reconnect fires after the fixed delay.
    let notices = rig.step_at(3_000);
    assert!(notices.contains(&Notice::Connection(ConnectionStatus::Connected)));
    rig.step_at(3_100);
    assert_eq!(rig.link.frames_sent(), 1);

    // Abnormal close: the pump keeps ticking but nothing is sent.
    rig.link.push_inbound(Inbound::Closed { code: Some(1006) });
    let notices = rig.step_at(3_200);
    assert!(notices.contains(&Notice::Connection(ConnectionStatus::Disconnected)));
    rig.step_range(3_300, 6_100);
    assert_eq!(rig.link.frames_sent(), 1);
    assert_eq!(rig.link.opens(), 2);
    // Reconnected at 6.2 s.
    let notices = rig.step_at(6_200);
    assert!(notices.contains(&Notice::Connection(ConnectionStatus::Connected)));
    assert_eq!(rig.link.opens(), 3);
}

#[test]
fn degraded_feed_is_reported_once_and_cleared_by_a_recognition() {
    let mut rig = Rig::new("stub://gate", settings());
    rig.start();
    rig.step_at(0);

    rig.push(r#"{"status":"no_active_feed"}"#);
    rig.push(r#"{"status":"no_active_feed"}"#);
    let notices = rig.step_at(100);
    assert_eq!(notices, vec![Notice::DegradedFeed]);
    assert!(rig.dashboard.is_degraded());
    assert_eq!(
        rig.dashboard.connection_status(),
        ConnectionStatus::Connected
    );

    rig.push(r#"{"plate":"30A-999.99","boxes":[]}"#);
    let notices = rig.step_at(200);
    assert_eq!(notices.len(), 2);
    assert_eq!(notices[0], Notice::FeedRestored);
    assert!(matches!(&notices[1], Notice::Entered(s) if s.plate == "30A-999.99"));
}

#[test]
fn teardown_releases_everything_and_is_idempotent() {
    let mut rig = Rig::new("stub://gate", settings());
    rig.start();
    rig.step_at(0);
    rig.step_at(100);
    let sent = rig.link.frames_sent();

    rig.dashboard.teardown();
    assert_eq!(rig.link.close_codes(), vec![DELIBERATE_CLOSE_CODE]);
    assert_eq!(rig.stopped.load(Ordering::SeqCst), 1);
    assert!(!rig.dashboard.camera().is_acquired());
    assert!(!rig.dashboard.camera().retry_pending());
    assert!(!rig.dashboard.pump_running());
    assert!(!rig.dashboard.poller().is_running());
    let channel = rig.dashboard.channel().expect("channel");
    assert_eq!(channel.state(), ChannelState::Closed);
    assert!(!channel.heartbeat_scheduled());
    assert!(channel.reconnect_due().is_none());

    assert!(rig.step_range(200, 60_000).is_empty());
    assert_eq!(rig.link.frames_sent(), sent);
    assert_eq!(rig.link.opens(), 1);

    rig.dashboard.teardown();
    drop(rig.dashboard);
    assert_eq!(rig.link.close_codes(), vec![DELIBERATE_CLOSE_CODE]);
    assert_eq!(rig.stopped.load(Ordering::SeqCst), 1);
}

#[test]
fn teardown_cancels_pending_reconnect() {
    let mut rig = Rig::new("stub://gate", settings());
    rig.link.fail_next_opens(1);
    rig.start();
    rig.step_at(0);
    assert!(rig.dashboard.channel().expect("channel").reconnect_due().is_some());

    rig.dashboard.teardown();
    rig.step_range(100, 10_000);
    assert_eq!(rig.link.opens(), 1);
}

#[test]
fn dropping_the_dashboard_tears_it_down() {
    let rig = {
        let mut rig = Rig::new("stub://gate", settings());
        rig.start();
        rig.step_at(0);
        rig
    };
    let link = rig.link.clone();
    let stopped = Arc::clone(&rig.stopped);
    drop(rig);
    assert_eq!(link.close_codes(), vec![DELIBERATE_CLOSE_CODE]);
    assert_eq!(stopped.load(Ordering::SeqCst), 1);
}

#[test]
fn annotated_mode_releases_camera_and_local_reacquires() {
    let mut rig = Rig::new("stub://gate", settings());
    rig.start();
    rig.step_at(0);
    rig.step_at(100);
    let sent = rig.link.frames_sent();

    let notices = rig
        .dashboard
        .switch_display_mode(DisplayMode::AnnotatedFeed, rig.t0 + Duration::from_millis(150));
    assert!(notices.is_empty());
    assert!(!rig.dashboard.camera().is_acquired());
    assert_eq!(rig.stopped.load(Ordering::SeqCst), 1);

    rig.step_range(200, 1_000);
    assert_eq!(rig.link.frames_sent(), sent);
    assert!(rig.dashboard.channel().expect("channel").is_connected());

    let notices = rig
        .dashboard
        .switch_display_mode(DisplayMode::LocalCamera, rig.t0 + Duration::from_millis(1_050));
    assert_eq!(notices, vec![Notice::CameraReady]);
    assert!(rig.dashboard.camera().is_acquired());
    rig.step_at(1_100);
    rig.step_at(1_200);
    assert!(rig.link.frames_sent() > sent);
}

#[test]
fn pause_stops_frames_without_touching_camera_or_channel() {
    let mut rig = Rig::new("stub://gate", settings());
    rig.start();
    rig.step_at(0);
    rig.step_at(100);
    let sent = rig.link.frames_sent();

    rig.dashboard.pause_recognition();
    rig.step_range(200, 1_000);
    assert_eq!(rig.link.frames_sent(), sent);
    assert!(rig.dashboard.camera().is_acquired());
    assert!(rig.dashboard.channel().expect("channel").is_connected());

    rig.dashboard.resume_recognition();
    rig.step_at(1_100);
    assert_eq!(rig.link.frames_sent(), sent + 1);
}

#[test]
fn camera_permission_failure_is_reported_and_retried() {
    let mut rig = Rig::new("stub://denied", settings());
    let notices = rig.start();
    assert!(matches!(
        notices.as_slice(),
        [Notice::CameraFailed(CameraError::PermissionDenied(_))]
    ));
    assert!(rig.dashboard.camera().retry_pending());

    // Channel still connects; the pump just has nothing to send.
    rig.step_range(0, 4_900);
    assert_eq!(rig.link.frames_sent(), 0);
    let notices = rig.step_at(5_000);
    assert!(notices
        .iter()
        .any(|n| matches!(n, Notice::CameraFailed(CameraError::PermissionDenied(_)))));
    assert_eq!(rig.dashboard.camera().attempts(), 2);
}

#[test]
fn upload_mode_posts_frames_without_a_channel() {
    let mut rig = Rig::new(
        "stub://gate",
        DashboardSettings {
            capture_mode: CaptureMode::Upload,
            ..settings()
        },
    );
    rig.start();
    assert!(rig.dashboard.channel().is_none());
    rig.step_at(0);
    rig.step_at(100);
    rig.step_at(200);
    assert_eq!(rig.backend.uploads(), 2);
    assert_eq!(rig.link.opens(), 0);
}

#[test]
fn upload_reply_plate_opens_a_session_without_polling() {
    let mut rig = Rig::new(
        "stub://gate",
        DashboardSettings {
            capture_mode: CaptureMode::Upload,
            poll_recognition: false,
            ..settings()
        },
    );
    rig.start();
    rig.step_at(0);
    // Status-only replies read as "no plate".
    assert!(rig.step_at(100).is_empty());
    assert_eq!(rig.backend.uploads(), 1);

    rig.backend.set_upload_reply("51F-123.45");
    let notices = rig.step_at(200);
    assert!(matches!(notices.as_slice(), [Notice::Entered(s)] if s.plate == "51F-123.45"));

    // Every following frame shows the same car: one session, no exit.
    assert!(rig.step_range(300, 1_500).is_empty());
    assert_eq!(rig.dashboard.sessions().len(), 1);
    assert_eq!(rig.dashboard.reconciler().open_count(), 1);
}

#[test]
fn poll_failures_surface_as_notices() {
    let mut rig = Rig::new("stub://gate", settings());
    rig.backend.set_failing(true);
    rig.start();
    let notices = rig.step_at(0);
    assert!(notices.iter().any(|n| matches!(n, Notice::PollFailed(_))));
    assert_eq!(rig.dashboard.poller().failures(), 1);

    rig.backend.set_failing(false);
    rig.backend.set_plate("29A-555.55");
    let notices = rig.step_at(2_000);
    assert!(notices
        .iter()
        .any(|n| matches!(n, Notice::Entered(s) if s.plate == "29A-555.55")));
}

#[test]
fn push_delivery_can_be_disabled() {
    let mut rig = Rig::new(
        "stub://gate",
        DashboardSettings {
            push_recognition: false,
            poll_recognition: false,
            ..settings()
        },
    );
    rig.start();
    rig.step_at(0);
    rig.push(r#"{"plate":"51F-123.45","boxes":[]}"#);
    assert!(rig.step_at(100).is_empty());
    assert!(rig.dashboard.sessions().is_empty());
}

#[test]
fn checkout_closes_session_with_same_fee_rule() {
    let mut rig = Rig::new("stub://gate", settings());
    rig.start();
    rig.step_at(0);
    rig.push(r#"{"plate":"51F-123.45","boxes":[]}"#);
    rig.step_at(100);

    let exit = rig.w0 + chrono::Duration::milliseconds(100 + 3_600_000);
    let session = rig.dashboard.checkout("51F-123.45", exit).expect("checkout");
    assert_eq!(session.fee, Some(25_000));
    assert!(rig.dashboard.checkout("51F-123.45", exit).is_err());
}
