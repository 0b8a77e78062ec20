use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::api::{DEFAULT_API_BASE_URL, DEFAULT_REQUEST_TIMEOUT};
use crate::camera::CaptureConstraints;
use crate::channel::{
    ws::DEFAULT_CONNECT_TIMEOUT, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_HEARTBEAT_TOKEN,
    DEFAULT_RECONNECT_DELAY,
};
use crate::dashboard::{CaptureMode, DisplayMode};
use crate::encoder::{EncoderSettings, DEFAULT_JPEG_QUALITY};
use crate::poller::DEFAULT_POLL_INTERVAL;
use crate::pump::DEFAULT_FRAME_INTERVAL;
use crate::session::{DEFAULT_DUPLICATE_WINDOW, DEFAULT_HOURLY_RATE};

const DEFAULT_CAMERA: &str = "stub://gate_camera";
const DEFAULT_CAMERA_RETRY: Duration = Duration::from_secs(5);
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(1500);
const DEFAULT_SESSION_PATH: &str = "parkscan-session.json";
const STREAM_PATH: &str = "ws/stream";

#[derive(Debug, Deserialize, Default)]
struct AgentConfigFile {
    api_url: Option<String>,
    stream_url: Option<String>,
    request_timeout_ms: Option<u64>,
    session_path: Option<PathBuf>,
    display_mode: Option<String>,
    camera: Option<CameraConfigFile>,
    encoder: Option<EncoderConfigFile>,
    capture: Option<CaptureConfigFile>,
    channel: Option<ChannelConfigFile>,
    recognition: Option<RecognitionConfigFile>,
    sessions: Option<SessionsConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    device: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    frame_rate: Option<u32>,
    retry_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct EncoderConfigFile {
    quality: Option<u8>,
    max_width: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    mode: Option<String>,
    frame_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ChannelConfigFile {
    heartbeat_secs: Option<u64>,
    heartbeat_token: Option<String>,
    reconnect_ms: Option<u64>,
    connect_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct RecognitionConfigFile {
    push: Option<bool>,
    poll: Option<bool>,
    poll_interval_ms: Option<u64>,
    poll_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct SessionsConfigFile {
    hourly_rate: Option<u64>,
    duplicate_window_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub api_base_url: String,
    /// Derived from `api_base_url` unless set explicitly.
    pub stream_url: String,
    pub request_timeout: Duration,
    pub session_path: PathBuf,
    pub display_mode: DisplayMode,
    pub camera: CameraSettings,
    pub encoder: EncoderSettings,
    pub capture: CaptureSettings,
    pub channel: ChannelTuning,
    pub recognition: RecognitionSettings,
    pub sessions: SessionSettings,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub device: String,
    pub constraints: CaptureConstraints,
    pub retry_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub mode: CaptureMode,
    pub frame_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct ChannelTuning {
    pub heartbeat_interval: Duration,
    pub heartbeat_token: String,
    pub reconnect_delay: Duration,
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RecognitionSettings {
    pub push_enabled: bool,
    pub poll_enabled: bool,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub hourly_rate: u64,
    pub duplicate_window: Duration,
}

impl AgentConfig {
    pub fn load() -> Result<Self> {
        let config_path = env_value("PARKSCAN_CONFIG").map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    /// Like `load`, with the config file given explicitly.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Built-in defaults, validated.
    pub fn defaults() -> Result<Self> {
        let mut cfg = Self::from_file(AgentConfigFile::default())?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: AgentConfigFile) -> Result<Self> {
        let camera = file.camera.unwrap_or_default();
        let encoder = file.encoder.unwrap_or_default();
        let capture = file.capture.unwrap_or_default();
        let channel = file.channel.unwrap_or_default();
        let recognition = file.recognition.unwrap_or_default();
        let sessions = file.sessions.unwrap_or_default();
        let default_constraints = CaptureConstraints::default();

        Ok(Self {
            api_base_url: file
                .api_url
                .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string()),
            stream_url: file.stream_url.unwrap_or_default(),
            request_timeout: file
                .request_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            session_path: file
                .session_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SESSION_PATH)),
            display_mode: match file.display_mode {
                Some(mode) => mode.parse()?,
                None => DisplayMode::LocalCamera,
            },
            camera: CameraSettings {
                device: camera.device.unwrap_or_else(|| DEFAULT_CAMERA.to_string()),
                constraints: CaptureConstraints {
                    width: camera.width.unwrap_or(default_constraints.width),
                    height: camera.height.unwrap_or(default_constraints.height),
                    frame_rate: camera.frame_rate.unwrap_or(default_constraints.frame_rate),
                },
                retry_delay: camera
                    .retry_ms
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_CAMERA_RETRY),
            },
            encoder: EncoderSettings {
                quality: encoder.quality.unwrap_or(DEFAULT_JPEG_QUALITY),
                max_width: encoder.max_width,
            },
            capture: CaptureSettings {
                mode: match capture.mode {
                    Some(mode) => mode.parse()?,
                    None => CaptureMode::Socket,
                },
                frame_interval: capture
                    .frame_interval_ms
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_FRAME_INTERVAL),
            },
            channel: ChannelTuning {
                heartbeat_interval: channel
                    .heartbeat_secs
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL),
                heartbeat_token: channel
                    .heartbeat_token
                    .unwrap_or_else(|| DEFAULT_HEARTBEAT_TOKEN.to_string()),
                reconnect_delay: channel
                    .reconnect_ms
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_RECONNECT_DELAY),
                connect_timeout: channel
                    .connect_timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            },
            recognition: RecognitionSettings {
                push_enabled: recognition.push.unwrap_or(true),
                poll_enabled: recognition.poll.unwrap_or(true),
                poll_interval: recognition
                    .poll_interval_ms
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_POLL_INTERVAL),
                poll_timeout: recognition
                    .poll_timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_POLL_TIMEOUT),
            },
            sessions: SessionSettings {
                hourly_rate: sessions.hourly_rate.unwrap_or(DEFAULT_HOURLY_RATE),
                duplicate_window: sessions
                    .duplicate_window_ms
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_DUPLICATE_WINDOW),
            },
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(url) = env_value("PARKSCAN_API_URL") {
            self.api_base_url = url;
        }
        if let Some(url) = env_value("PARKSCAN_STREAM_URL") {
            self.stream_url = url;
        }
        if let Some(device) = env_value("PARKSCAN_CAMERA") {
            self.camera.device = device;
        }
        if let Some(interval) = env_value("PARKSCAN_FRAME_INTERVAL_MS") {
            let millis: u64 = interval.parse().map_err(|_| {
                anyhow!("PARKSCAN_FRAME_INTERVAL_MS must be an integer number of milliseconds")
            })?;
            self.capture.frame_interval = Duration::from_millis(millis);
        }
        if let Some(rate) = env_value("PARKSCAN_HOURLY_RATE") {
            self.sessions.hourly_rate = rate
                .parse()
                .map_err(|_| anyhow!("PARKSCAN_HOURLY_RATE must be a non-negative integer"))?;
        }
        if let Some(mode) = env_value("PARKSCAN_CAPTURE_MODE") {
            self.capture.mode = mode.parse()?;
        }
        if let Some(mode) = env_value("PARKSCAN_DISPLAY_MODE") {
            self.display_mode = mode.parse()?;
        }
        if let Some(path) = env_value("PARKSCAN_SESSION_PATH") {
            self.session_path = PathBuf::from(path);
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        let api = Url::parse(&self.api_base_url)
            .map_err(|e| anyhow!("invalid api url {}: {}", self.api_base_url, e))?;
        if api.scheme() != "http" && api.scheme() != "https" {
            return Err(anyhow!("api url must use http or https"));
        }
        if self.stream_url.trim().is_empty() {
            self.stream_url = derive_stream_url(&api)?;
        }
        let stream = Url::parse(&self.stream_url)
            .map_err(|e| anyhow!("invalid stream url {}: {}", self.stream_url, e))?;
        if stream.scheme() != "ws" && stream.scheme() != "wss" {
            return Err(anyhow!("stream url must use ws or wss"));
        }

        if !(1..=100).contains(&self.encoder.quality) {
            return Err(anyhow!("jpeg quality must be between 1 and 100"));
        }
        if self.encoder.max_width == Some(0) {
            return Err(anyhow!("encoder max_width must be greater than zero"));
        }
        let constraints = &self.camera.constraints;
        if constraints.width == 0 || constraints.height == 0 || constraints.frame_rate == 0 {
            return Err(anyhow!("camera width, height and frame_rate must be non-zero"));
        }
        if self.camera.device.trim().is_empty() {
            return Err(anyhow!("camera device must not be empty"));
        }
        for (name, period) in [
            ("frame interval", self.capture.frame_interval),
            ("heartbeat interval", self.channel.heartbeat_interval),
            ("reconnect delay", self.channel.reconnect_delay),
            ("connect timeout", self.channel.connect_timeout),
            ("poll interval", self.recognition.poll_interval),
            ("poll timeout", self.recognition.poll_timeout),
            ("request timeout", self.request_timeout),
            ("camera retry delay", self.camera.retry_delay),
        ] {
            if period.is_zero() {
                return Err(anyhow!("{} must be greater than zero", name));
            }
        }
        if self.recognition.poll_timeout >= self.recognition.poll_interval {
            return Err(anyhow!(
                "poll timeout ({:?}) must be shorter than the poll interval ({:?})",
                self.recognition.poll_timeout,
                self.recognition.poll_interval
            ));
        }
        let poll_span = self.recognition.poll_interval + self.recognition.poll_timeout;
        if self.recognition.poll_enabled && self.sessions.duplicate_window <= poll_span {
            return Err(anyhow!(
                "duplicate window ({:?}) must be longer than the poll interval plus poll timeout ({:?})",
                self.sessions.duplicate_window,
                poll_span
            ));
        }
        if self.channel.heartbeat_token.is_empty() {
            return Err(anyhow!("heartbeat token must not be empty"));
        }
        Ok(())
    }
}

/// `http://host/base` becomes `ws://host/base/ws/stream`.
pub fn derive_stream_url(api: &Url) -> Result<String> {
    let mut stream = api.clone();
    let scheme = if api.scheme() == "https" { "wss" } else { "ws" };
    stream
        .set_scheme(scheme)
        .map_err(|_| anyhow!("cannot derive stream url from {}", api))?;
    {
        let mut path = stream
            .path_segments_mut()
            .map_err(|_| anyhow!("cannot derive stream url from {}", api))?;
        path.pop_if_empty();
        path.extend(STREAM_PATH.split('/'));
    }
    stream.set_query(None);
    Ok(stream.to_string())
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_config_file(path: &Path) -> Result<AgentConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
