//! ParkScan gate agent
//!
//! Client-side capture and telemetry pipeline for a license-plate parking
//! system. The recognition backend is an external service; this crate owns
//! everything between the gate camera and that service.
//!
//! # Module Structure
//!
//! - `camera`: capture device acquisition, release and retry
//! - `encoder`: RGB frame to JPEG
//! - `channel`: persistent telemetry connection (heartbeat, reconnect)
//! - `pump`: fixed-period frame capture and send
//! - `poller`: periodic latest-plate requests
//! - `session`: entry/exit reconciliation and fees
//! - `dashboard`: one gate's pipeline, wired together
//! - `api`: REST client and annotated feed reader
//! - `auth`: stored login session and role gate

pub mod api;
pub mod auth;
pub mod camera;
pub mod channel;
pub mod config;
pub mod dashboard;
pub mod encoder;
pub mod error;
pub mod plate;
pub mod poller;
pub mod pump;
pub mod session;
pub mod timer;
pub mod ui;

pub use api::{ApiClient, PlateReading, RecognitionBackend, UploadReply, UploadSink};
pub use auth::{allows, Role, SessionStore, StoredSession, Surface};
pub use camera::{CameraSource, CaptureConstraints, CaptureDevice, VideoFrame, VideoTrack};
pub use channel::{
    ChannelEvent, ChannelSettings, ChannelState, SendStatus, TelemetryChannel,
    DELIBERATE_CLOSE_CODE,
};
pub use config::AgentConfig;
pub use dashboard::{
    CaptureMode, ConnectionStatus, Dashboard, DashboardParts, DashboardSettings, DisplayMode,
    Notice,
};
pub use encoder::{EncodedFrame, EncoderSettings, FrameEncoder};
pub use error::{ApiError, CameraError, ChannelError, SessionError};
pub use plate::{is_sentinel_plate, BoundingBox, EventOrigin, RecognitionEvent};
pub use poller::{PollOutcome, RecognitionPoller};
pub use pump::{FramePump, FrameSink, PumpTick};
pub use session::{compute_fee, Reconciled, SessionReconciler, SessionStatus, VehicleSession};
pub use timer::{Deadline, RepeatingTask};
