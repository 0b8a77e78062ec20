//! Telemetry channel.
//!
//! A persistent duplex connection to the recognition backend:
//! - frames go out as data-URL text messages
//! - a heartbeat token keeps idle proxies from dropping the socket
//! - recognition pushes and "no active feed" notices come back as JSON
//!
//! The channel is driven from the owner's loop through `poll(now)`. Opening a
//! connection goes through `Transport::begin_open`, so a transport that needs
//! a slow handshake can finish it off-thread while the loop keeps running.
//! Outgoing frames are never queued beyond the transport's bounded write
//! buffer: while earlier output is unflushed the channel reports not ready.
//!
//! Close policy: a close carrying `DELIBERATE_CLOSE_CODE` (or a local
//! `close()`) is terminal. Any other close or transport error schedules
//! exactly one reconnect after the configured delay.

pub mod memory;
pub mod ws;

use serde::Deserialize;
use std::time::{Duration, Instant};

use crate::encoder::EncodedFrame;
use crate::error::ChannelError;
use crate::plate::{BoundingBox, EventOrigin, RecognitionEvent};
use crate::pump::FrameSink;
use crate::timer::{Deadline, RepeatingTask};

pub use memory::{MemoryLink, MemoryTransport};
pub use ws::WsTransport;

/// Close code used for deliberate shutdown (RFC 6455 normal closure).
pub const DELIBERATE_CLOSE_CODE: u16 = 1000;

pub const DEFAULT_HEARTBEAT_TOKEN: &str = "ping";
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Max inbound messages drained per `poll`, so a chatty server cannot starve
/// the frame pump.
const MAX_INBOUND_PER_POLL: usize = 64;

const STATUS_NO_ACTIVE_FEED: &str = "no_active_feed";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    /// Disconnected with a reconnect scheduled.
    Retrying,
    /// Deliberately shut down. Terminal.
    Closed,
}

/// A message received from the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Binary(Vec<u8>),
    Closed { code: Option<u16> },
}

/// What became of an outgoing message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendStatus {
    /// Written to the peer.
    Flushed,
    /// Accepted into the bounded write buffer; the socket is not writable yet.
    Queued,
    /// Write buffer full. The message was discarded.
    Dropped,
}

/// An open connection.
pub trait Connection: Send {
    fn send_text(&mut self, text: &str) -> Result<SendStatus, ChannelError>;

    /// False while earlier output still waits to be flushed.
    fn is_writable(&self) -> bool {
        true
    }

    /// Non-blocking receive. `Ok(None)` when nothing is pending.
    fn try_recv(&mut self) -> Result<Option<Inbound>, ChannelError>;

    /// Close with `code`. Must not fail.
    fn close(&mut self, code: u16);
}

/// A connection attempt in progress.
pub trait PendingConnection: Send {
    /// `None` while the attempt is still running.
    fn poll_ready(&mut self) -> Option<Result<Box<dyn Connection>, ChannelError>>;
}

/// Opens connections to an endpoint.
pub trait Transport: Send {
    fn open(&mut self, endpoint: &str) -> Result<Box<dyn Connection>, ChannelError>;

    /// Start opening without blocking the caller. The default opens inline.
    fn begin_open(&mut self, endpoint: &str) -> Box<dyn PendingConnection> {
        Box::new(ReadyConnection(Some(self.open(endpoint))))
    }
}

struct ReadyConnection(Option<Result<Box<dyn Connection>, ChannelError>>);

impl PendingConnection for ReadyConnection {
    fn poll_ready(&mut self) -> Option<Result<Box<dyn Connection>, ChannelError>> {
        self.0.take()
    }
}

/// What the channel reports to its owner.
#[derive(Clone, Debug, PartialEq)]
pub enum ChannelEvent {
    Connected,
    Recognition(RecognitionEvent),
    /// Server says no camera feed is active. Not a connection failure.
    DegradedFeed,
    ConnectFailed {
        error: ChannelError,
        reconnect_in: Duration,
    },
    Disconnected {
        code: Option<u16>,
        reconnect_in: Duration,
    },
    Closed,
}

#[derive(Clone, Debug)]
pub struct ChannelSettings {
    pub endpoint: String,
    pub heartbeat_interval: Duration,
    pub reconnect_delay: Duration,
    pub heartbeat_token: String,
}

impl ChannelSettings {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            heartbeat_token: DEFAULT_HEARTBEAT_TOKEN.to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub connects: u64,
    pub reconnects_scheduled: u64,
    pub frames_sent: u64,
    pub sends_dropped: u64,
    pub heartbeats_sent: u64,
    pub messages_ignored: u64,
}

/// Server JSON. Either `{status}` or `{plate, boxes}`.
#[derive(Debug, Deserialize)]
struct ServerMessage {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    plate: Option<String>,
    #[serde(default)]
    boxes: Vec<BoundingBox>,
}

pub struct TelemetryChannel {
    settings: ChannelSettings,
    transport: Box<dyn Transport>,
    conn: Option<Box<dyn Connection>>,
    opening: Option<Box<dyn PendingConnection>>,
    state: ChannelState,
    heartbeat: RepeatingTask,
    reconnect: Deadline,
    pending: Vec<ChannelEvent>,
    stats: ChannelStats,
}

impl TelemetryChannel {
    pub fn new(settings: ChannelSettings, transport: Box<dyn Transport>) -> Self {
        let heartbeat = RepeatingTask::new("heartbeat", settings.heartbeat_interval);
        Self {
            settings,
            transport,
            conn: None,
            opening: None,
            state: ChannelState::Disconnected,
            heartbeat,
            reconnect: Deadline::new(),
            pending: Vec::new(),
            stats: ChannelStats::default(),
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ChannelState::Connected
    }

    /// Connected, with nothing left over from the previous send.
    pub fn is_writable(&self) -> bool {
        self.is_connected() && self.conn.as_ref().is_some_and(|conn| conn.is_writable())
    }

    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    pub fn endpoint(&self) -> &str {
        &self.settings.endpoint
    }

    pub fn reconnect_due(&self) -> Option<Instant> {
        self.reconnect.due()
    }

    pub fn heartbeat_scheduled(&self) -> bool {
        self.heartbeat.is_scheduled()
    }

    /// Start opening the connection. Events are returned by `poll`.
    pub fn connect(&mut self, now: Instant) {
        match self.state {
            ChannelState::Closed => {
                log::debug!("channel closed; ignoring connect");
                return;
            }
            ChannelState::Connected | ChannelState::Connecting => return,
            ChannelState::Disconnected | ChannelState::Retrying => {}
        }
        self.reconnect.cancel();
        self.state = ChannelState::Connecting;
        log::info!("channel connecting to {}", self.settings.endpoint);
        self.opening = Some(self.transport.begin_open(&self.settings.endpoint));
        self.finish_connect(now);
    }

    fn finish_connect(&mut self, now: Instant) {
        let Some(pending) = self.opening.as_mut() else {
            return;
        };
        let Some(result) = pending.poll_ready() else {
            return;
        };
        self.opening = None;
        match result {
            Ok(conn) => {
                self.conn = Some(conn);
                self.state = ChannelState::Connected;
                self.stats.connects += 1;
                self.heartbeat.start(now);
                log::info!("channel connected to {}", self.settings.endpoint);
                self.pending.push(ChannelEvent::Connected);
            }
            Err(error) => {
                log::warn!("channel connect failed: {}", error);
                self.schedule_reconnect(now);
                self.pending.push(ChannelEvent::ConnectFailed {
                    error,
                    reconnect_in: self.settings.reconnect_delay,
                });
            }
        }
    }

    /// Drive reconnects, heartbeats and inbound dispatch.
    pub fn poll(&mut self, now: Instant) -> Vec<ChannelEvent> {
        if self.state == ChannelState::Retrying && self.reconnect.fire(now) {
            self.connect(now);
        }

        if self.state == ChannelState::Connecting {
            self.finish_connect(now);
        }

        if self.state == ChannelState::Connected && self.heartbeat.fire(now) {
            self.send_heartbeat(now);
        }

        if self.state == ChannelState::Connected {
            self.drain_inbound(now);
        }

        std::mem::take(&mut self.pending)
    }

    /// Deliberate shutdown. Idempotent. Never reconnects afterwards.
    pub fn close(&mut self) {
        self.heartbeat.cancel();
        self.reconnect.cancel();
        // An attempt still running off-thread is abandoned.
        self.opening = None;
        if let Some(mut conn) = self.conn.take() {
            conn.close(DELIBERATE_CLOSE_CODE);
        }
        if self.state != ChannelState::Closed {
            log::info!("channel to {} closed", self.settings.endpoint);
            self.state = ChannelState::Closed;
        }
    }

    /// Send a frame. Dropped silently unless connected.
    pub fn send_frame(&mut self, frame: EncodedFrame, now: Instant) -> bool {
        if self.state != ChannelState::Connected {
            self.stats.sends_dropped += 1;
            return false;
        }
        let payload = frame.to_data_url();
        match self.send_text(&payload, now) {
            SendStatus::Flushed | SendStatus::Queued => {
                self.stats.frames_sent += 1;
                true
            }
            SendStatus::Dropped => {
                self.stats.sends_dropped += 1;
                false
            }
        }
    }

    fn send_heartbeat(&mut self, now: Instant) {
        let token = self.settings.heartbeat_token.clone();
        if self.send_text(&token, now) != SendStatus::Dropped {
            self.stats.heartbeats_sent += 1;
            log::debug!("heartbeat sent");
        }
    }

    fn send_text(&mut self, text: &str, now: Instant) -> SendStatus {
        let Some(conn) = self.conn.as_mut() else {
            return SendStatus::Dropped;
        };
        match conn.send_text(text) {
            Ok(SendStatus::Dropped) => {
                log::debug!("channel write buffer full; message dropped");
                SendStatus::Dropped
            }
            Ok(status) => status,
            Err(err) => {
                log::warn!("channel send failed: {}", err);
                self.handle_close(None, now);
                SendStatus::Dropped
            }
        }
    }

    fn drain_inbound(&mut self, now: Instant) {
        for _ in 0..MAX_INBOUND_PER_POLL {
            let Some(conn) = self.conn.as_mut() else {
                return;
            };
            match conn.try_recv() {
                Ok(Some(Inbound::Text(text))) => self.dispatch(&text),
                Ok(Some(Inbound::Binary(_))) => self.stats.messages_ignored += 1,
                Ok(Some(Inbound::Closed { code })) => {
                    self.handle_close(code, now);
                    return;
                }
                Ok(None) => return,
                Err(err) => {
                    log::warn!("channel receive failed: {}", err);
                    self.handle_close(None, now);
                    return;
                }
            }
        }
    }

    fn dispatch(&mut self, text: &str) {
        let message: ServerMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(_) => {
                // Liveness pongs and other control chatter.
                self.stats.messages_ignored += 1;
                log::trace!("ignoring non-json channel message");
                return;
            }
        };
        if message.status.as_deref() == Some(STATUS_NO_ACTIVE_FEED) {
            self.pending.push(ChannelEvent::DegradedFeed);
            return;
        }
        match message.plate {
            Some(plate) => self.pending.push(ChannelEvent::Recognition(RecognitionEvent::new(
                plate,
                message.boxes,
                EventOrigin::Push,
            ))),
            None => self.stats.messages_ignored += 1,
        }
    }

    fn handle_close(&mut self, code: Option<u16>, now: Instant) {
        self.heartbeat.cancel();
        if let Some(mut conn) = self.conn.take() {
            if code.is_none() {
                conn.close(DELIBERATE_CLOSE_CODE);
            }
        }
        if code == Some(DELIBERATE_CLOSE_CODE) {
            log::info!("channel closed by peer with deliberate code");
            self.reconnect.cancel();
            self.state = ChannelState::Closed;
            self.pending.push(ChannelEvent::Closed);
            return;
        }
        log::warn!(
            "channel closed abnormally (code {:?}); reconnecting in {:?}",
            code,
            self.settings.reconnect_delay
        );
        self.schedule_reconnect(now);
        self.pending.push(ChannelEvent::Disconnected {
            code,
            reconnect_in: self.settings.reconnect_delay,
        });
    }

    fn schedule_reconnect(&mut self, now: Instant) {
        self.state = ChannelState::Retrying;
        if self.reconnect.arm(now, self.settings.reconnect_delay) {
            self.stats.reconnects_scheduled += 1;
        }
    }
}

impl FrameSink for TelemetryChannel {
    fn is_ready(&self) -> bool {
        self.is_writable()
    }

    fn send_frame(&mut self, frame: EncodedFrame, now: Instant) -> bool {
        TelemetryChannel::send_frame(self, frame, now)
    }
}

impl Drop for TelemetryChannel {
    fn drop(&mut self) {
        self.close();
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
