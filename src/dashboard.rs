//! Gate dashboard.
//!
//! Owns the capture pipeline for one gate and wires its data flow:
//! camera -> encoder -> pump -> channel (or upload) -> backend, and
//! channel pushes / poller results -> session reconciler -> notices.
//!
//! Everything runs on the caller's thread. `step` is called from the owner's
//! loop and never blocks beyond the transport and request timeouts.
//! `teardown` (also run on drop) stops the camera, cancels every timer and
//! closes the channel with the deliberate close code.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::{Duration, Instant};

use crate::api::{ApiClient, RecognitionBackend, UploadSink};
use crate::camera::{open_device, CameraSource};
use crate::channel::{ChannelEvent, ChannelSettings, TelemetryChannel, WsTransport};
use crate::config::AgentConfig;
use crate::encoder::FrameEncoder;
use crate::error::{CameraError, SessionError};
use crate::plate::RecognitionEvent;
use crate::poller::{PollOutcome, RecognitionPoller};
use crate::pump::{FramePump, PumpStats};
use crate::session::{Reconciled, SessionReconciler, VehicleSession};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisplayMode {
    /// Live local camera, frames streamed to the backend.
    #[serde(rename = "local")]
    LocalCamera,
    /// Backend's annotated MJPEG feed; the local camera is released.
    #[serde(rename = "annotated")]
    AnnotatedFeed,
}

impl FromStr for DisplayMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" | "camera" => Ok(DisplayMode::LocalCamera),
            "annotated" | "feed" => Ok(DisplayMode::AnnotatedFeed),
            other => Err(anyhow!(
                "unknown display mode '{}' (expected local or annotated)",
                other
            )),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    /// Frames over the telemetry channel.
    Socket,
    /// Frames over `POST /upload_frame`.
    Upload,
}

impl FromStr for CaptureMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "socket" | "ws" => Ok(CaptureMode::Socket),
            "upload" | "http" => Ok(CaptureMode::Upload),
            other => Err(anyhow!(
                "unknown capture mode '{}' (expected socket or upload)",
                other
            )),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Error,
}

/// Something the render layer (or log) should show.
#[derive(Clone, Debug, PartialEq)]
pub enum Notice {
    Entered(VehicleSession),
    Exited(VehicleSession),
    DegradedFeed,
    FeedRestored,
    CameraReady,
    CameraFailed(CameraError),
    Connection(ConnectionStatus),
    PollFailed(String),
}

#[derive(Clone, Debug)]
pub struct DashboardSettings {
    pub display_mode: DisplayMode,
    pub capture_mode: CaptureMode,
    /// Reconcile plates pushed over the channel or returned by frame uploads.
    pub push_recognition: bool,
    pub poll_recognition: bool,
    pub frame_interval: Duration,
    pub poll_interval: Duration,
    pub hourly_rate: u64,
    pub duplicate_window: Duration,
}

impl DashboardSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            display_mode: config.display_mode,
            capture_mode: config.capture.mode,
            push_recognition: config.recognition.push_enabled,
            poll_recognition: config.recognition.poll_enabled,
            frame_interval: config.capture.frame_interval,
            poll_interval: config.recognition.poll_interval,
            hourly_rate: config.sessions.hourly_rate,
            duplicate_window: config.sessions.duplicate_window,
        }
    }
}

/// Components the dashboard takes ownership of.
pub struct DashboardParts {
    pub camera: CameraSource,
    pub encoder: FrameEncoder,
    /// Required in socket capture mode, ignored otherwise.
    pub channel: Option<TelemetryChannel>,
    pub backend: Box<dyn RecognitionBackend>,
}

pub struct Dashboard {
    settings: DashboardSettings,
    camera: CameraSource,
    encoder: FrameEncoder,
    channel: Option<TelemetryChannel>,
    backend: Box<dyn RecognitionBackend>,
    pump: FramePump,
    poller: RecognitionPoller,
    reconciler: SessionReconciler,
    display_mode: DisplayMode,
    status: ConnectionStatus,
    degraded: bool,
    recognition_paused: bool,
    torn_down: bool,
}

impl Dashboard {
    pub fn new(settings: DashboardSettings, parts: DashboardParts) -> Result<Self> {
        let channel = match settings.capture_mode {
            CaptureMode::Socket => Some(
                parts
                    .channel
                    .ok_or_else(|| anyhow!("socket capture mode needs a telemetry channel"))?,
            ),
            CaptureMode::Upload => None,
        };
        Ok(Self {
            pump: FramePump::new(settings.frame_interval),
            poller: RecognitionPoller::new(settings.poll_interval),
            reconciler: SessionReconciler::new(settings.hourly_rate, settings.duplicate_window),
            display_mode: settings.display_mode,
            camera: parts.camera,
            encoder: parts.encoder,
            channel,
            backend: parts.backend,
            settings,
            status: ConnectionStatus::Disconnected,
            degraded: false,
            recognition_paused: false,
            torn_down: false,
        })
    }

    /// Build the real pipeline: capture device, WebSocket channel, REST client.
    pub fn from_config(config: &AgentConfig) -> Result<Self> {
        let device = open_device(&config.camera.device)
            .with_context(|| format!("open camera {}", config.camera.device))?;
        let camera = CameraSource::new(
            device,
            config.camera.constraints.clone(),
            config.camera.retry_delay,
        );
        let encoder = FrameEncoder::new(config.encoder.clone())?;
        let channel = match config.capture.mode {
            CaptureMode::Socket => {
                let mut settings = ChannelSettings::new(config.stream_url.clone());
                settings.heartbeat_interval = config.channel.heartbeat_interval;
                settings.heartbeat_token = config.channel.heartbeat_token.clone();
                settings.reconnect_delay = config.channel.reconnect_delay;
                Some(TelemetryChannel::new(
                    settings,
                    Box::new(WsTransport::new(config.channel.connect_timeout)),
                ))
            }
            CaptureMode::Upload => None,
        };
        // Poll requests must finish inside one poll period.
        let backend = ApiClient::new(&config.api_base_url, config.recognition.poll_timeout)?;
        Self::new(
            DashboardSettings::from_config(config),
            DashboardParts {
                camera,
                encoder,
                channel,
                backend: Box::new(backend),
            },
        )
    }

    pub fn start(&mut self, now: Instant) -> Vec<Notice> {
        let mut notices = Vec::new();
        if self.torn_down {
            return notices;
        }
        log::info!(
            "dashboard starting ({:?} display, {:?} capture)",
            self.display_mode,
            self.settings.capture_mode
        );
        if self.display_mode == DisplayMode::LocalCamera {
            notices.push(self.acquire_camera(now));
        }
        match self.channel.as_mut() {
            Some(channel) => channel.connect(now),
            None => self.pump.start(now),
        }
        if self.settings.poll_recognition {
            self.poller.start(now);
        }
        notices
    }

    /// One pass of the cooperative loop.
    pub fn step(&mut self, now: Instant, wall: DateTime<Utc>) -> Vec<Notice> {
        let mut notices = Vec::new();
        if self.torn_down {
            return notices;
        }

        if self.display_mode == DisplayMode::LocalCamera {
            match self.camera.poll_retry(now) {
                Some(Ok(())) => notices.push(Notice::CameraReady),
                Some(Err(err)) => notices.push(Notice::CameraFailed(err)),
                None => {}
            }
        }

        let events = self
            .channel
            .as_mut()
            .map(|channel| channel.poll(now))
            .unwrap_or_default();
        for event in events {
            self.on_channel_event(event, now, wall, &mut notices);
        }

        match self.channel.as_mut() {
            Some(channel) => {
                self.pump
                    .tick(now, &mut self.camera, &mut self.encoder, channel);
            }
            None => {
                let mut sink = UploadSink::new(self.backend.as_mut());
                self.pump
                    .tick(now, &mut self.camera, &mut self.encoder, &mut sink);
                let recognized = sink.into_recognized();
                if self.settings.push_recognition {
                    for event in recognized {
                        self.poller.note_pushed(&event.plate);
                        self.reconcile(&event, wall, &mut notices);
                    }
                }
            }
        }

        if self.settings.poll_recognition {
            match self.poller.poll(now, self.backend.as_mut()) {
                PollOutcome::Forwarded(event) => self.reconcile(&event, wall, &mut notices),
                PollOutcome::Failed(err) => notices.push(Notice::PollFailed(err.to_string())),
                PollOutcome::NotDue | PollOutcome::NoPlate | PollOutcome::Unchanged => {}
            }
        }
        notices
    }

    /// Entering the annotated feed releases the camera; returning to the
    /// local camera acquires it again.
    pub fn switch_display_mode(&mut self, mode: DisplayMode, now: Instant) -> Vec<Notice> {
        if self.torn_down || mode == self.display_mode {
            return Vec::new();
        }
        log::info!("display mode {:?} -> {:?}", self.display_mode, mode);
        self.display_mode = mode;
        match mode {
            DisplayMode::AnnotatedFeed => {
                self.camera.shutdown();
                Vec::new()
            }
            DisplayMode::LocalCamera => vec![self.acquire_camera(now)],
        }
    }

    /// Stop sending frames. Camera and channel stay up.
    pub fn pause_recognition(&mut self) {
        if !self.recognition_paused {
            log::info!("recognition paused");
        }
        self.recognition_paused = true;
        self.pump.pause();
    }

    pub fn resume_recognition(&mut self) {
        if self.recognition_paused {
            log::info!("recognition resumed");
        }
        self.recognition_paused = false;
        self.pump.resume();
    }

    pub fn checkout(
        &mut self,
        plate: &str,
        wall: DateTime<Utc>,
    ) -> Result<VehicleSession, SessionError> {
        self.reconciler.checkout(plate, wall)
    }

    /// Release everything. Idempotent.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.camera.shutdown();
        self.pump.stop();
        self.poller.stop();
        if let Some(channel) = self.channel.as_mut() {
            channel.close();
        }
        self.status = ConnectionStatus::Disconnected;
        log::info!("dashboard torn down");
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    pub fn display_mode(&self) -> DisplayMode {
        self.display_mode
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn is_recognition_paused(&self) -> bool {
        self.recognition_paused
    }

    pub fn sessions(&self) -> &[VehicleSession] {
        self.reconciler.sessions()
    }

    pub fn reconciler(&self) -> &SessionReconciler {
        &self.reconciler
    }

    pub fn camera(&self) -> &CameraSource {
        &self.camera
    }

    pub fn channel(&self) -> Option<&TelemetryChannel> {
        self.channel.as_ref()
    }

    pub fn pump_running(&self) -> bool {
        self.pump.is_running()
    }

    pub fn pump_stats(&self) -> &PumpStats {
        self.pump.stats()
    }

    pub fn poller(&self) -> &RecognitionPoller {
        &self.poller
    }

    fn acquire_camera(&mut self, now: Instant) -> Notice {
        match self.camera.acquire(now) {
            Ok(()) => Notice::CameraReady,
            Err(err) => {
                log::warn!("{}", err.remediation());
                Notice::CameraFailed(err)
            }
        }
    }

    fn on_channel_event(
        &mut self,
        event: ChannelEvent,
        now: Instant,
        wall: DateTime<Utc>,
        notices: &mut Vec<Notice>,
    ) {
        match event {
            ChannelEvent::Connected => {
                self.pump.start(now);
                self.set_status(ConnectionStatus::Connected, notices);
            }
            ChannelEvent::Recognition(event) => {
                if self.degraded {
                    self.degraded = false;
                    notices.push(Notice::FeedRestored);
                }
                if self.settings.push_recognition {
                    self.poller.note_pushed(&event.plate);
                    self.reconcile(&event, wall, notices);
                }
            }
            ChannelEvent::DegradedFeed => {
                if !self.degraded {
                    log::warn!("backend reports no active camera feed");
                    self.degraded = true;
                    notices.push(Notice::DegradedFeed);
                }
            }
            ChannelEvent::ConnectFailed { .. } => {
                self.set_status(ConnectionStatus::Error, notices);
            }
            ChannelEvent::Disconnected { .. } => {
                self.set_status(ConnectionStatus::Disconnected, notices);
            }
            ChannelEvent::Closed => {
                self.pump.stop();
                self.set_status(ConnectionStatus::Disconnected, notices);
            }
        }
    }

    fn set_status(&mut self, status: ConnectionStatus, notices: &mut Vec<Notice>) {
        if self.status != status {
            self.status = status;
            notices.push(Notice::Connection(status));
        }
    }

    fn reconcile(&mut self, event: &RecognitionEvent, wall: DateTime<Utc>, notices: &mut Vec<Notice>) {
        match self.reconciler.observe(event, wall) {
            Reconciled::Entered(session) => notices.push(Notice::Entered(session)),
            Reconciled::Exited(session) => notices.push(Notice::Exited(session)),
            Reconciled::Duplicate { .. } | Reconciled::Ignored => {}
        }
    }
}

impl Drop for Dashboard {
    fn drop(&mut self) {
        self.teardown();
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
