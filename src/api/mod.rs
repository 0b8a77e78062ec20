//! REST client for the parking backend.
//!
//! One blocking `ureq` agent with a request timeout. Every endpoint maps
//! failures into `ApiError`; loosely shaped admin responses are returned as
//! `serde_json::Value` since the backend does not pin their schema.

pub mod feed;

use anyhow::{anyhow, Context, Result};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};
use url::Url;

use crate::encoder::EncodedFrame;
use crate::error::ApiError;
use crate::plate::{is_sentinel_plate, BoundingBox, EventOrigin, RecognitionEvent};
use crate::pump::FrameSink;

pub use feed::{AnnotatedFeed, FeedFrame, FeedOpener, FeedViewer, FeedViewerSettings};

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8000";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Error bodies are truncated to this many characters.
const MAX_ERROR_BODY: usize = 512;

const UPLOAD_FIELD: &str = "file";
const UPLOAD_FILENAME: &str = "frame.jpg";

// ----------------------------------------------------------------------------
// Wire types
// ----------------------------------------------------------------------------

/// `GET /get_plate` reply.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PlateReading {
    #[serde(default)]
    pub plate: String,
    #[serde(default)]
    pub boxes: Vec<BoundingBox>,
}

/// `POST /upload_frame` reply. Older backends answer `{"status":"ok"}` only,
/// which reads as an empty plate.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UploadReply {
    #[serde(flatten)]
    pub reading: PlateReading,
    /// Annotated frame, base64 JPEG.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

/// `POST /login` reply. The backend has shipped both a nested `user` object
/// and flat `username`/`role` fields; both are accepted.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginResponse {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub user: Option<UserInfo>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

impl LoginResponse {
    /// Flattened view of the logged-in user.
    pub fn user_info(&self) -> UserInfo {
        let nested = self.user.clone().unwrap_or_default();
        UserInfo {
            username: nested.username.or_else(|| self.username.clone()),
            email: nested.email.or_else(|| self.email.clone()),
            role: nested.role.or_else(|| self.role.clone()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NewUser {
    pub username: String,
    pub password: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct UserUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParkingConfig {
    pub id: u64,
    pub vehicle_type: String,
    pub max_capacity: u64,
    pub price_per_hour: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ParkingConfigUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vehicle_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_capacity: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_per_hour: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SessionUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

#[derive(Serialize)]
struct AutoCheckBody<'a> {
    license_plate: &'a str,
}

// ----------------------------------------------------------------------------
// Client
// ----------------------------------------------------------------------------

enum Body {
    Empty,
    Json(Value),
    Multipart { content_type: String, bytes: Vec<u8> },
}

#[derive(Clone)]
pub struct ApiClient {
    base: Url,
    agent: ureq::Agent,
    timeout: Duration,
}

impl ApiClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base = Url::parse(base_url).with_context(|| format!("parse api url {}", base_url))?;
        if base.scheme() != "http" && base.scheme() != "https" {
            return Err(anyhow!(
                "api url must be http or https, got {}",
                base.scheme()
            ));
        }
        if base.cannot_be_a_base() {
            return Err(anyhow!("api url {} cannot carry a path", base_url));
        }
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Ok(Self {
            base,
            agent,
            timeout,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Absolute URL for `segments` under the base path. Segments are
    /// percent-encoded, so plates and usernames are safe to pass through.
    pub fn endpoint_url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    // ---- auth & users ----

    pub fn login(&self, username: &str, password: &str) -> Result<LoginResponse, ApiError> {
        self.fetch_json(
            "POST",
            &["login"],
            &[("username", username), ("password", password)],
            Body::Empty,
        )
    }

    pub fn create_user(&self, user: &NewUser) -> Result<Value, ApiError> {
        self.fetch_json("POST", &["admin", "create_user"], &[], json_body(user)?)
    }

    pub fn modify_user(&self, username: &str, update: &UserUpdate) -> Result<Value, ApiError> {
        self.fetch_json(
            "PUT",
            &["admin", "modify_user_info", username],
            &[],
            json_body(update)?,
        )
    }

    pub fn get_user(&self, username: &str) -> Result<Value, ApiError> {
        self.fetch_json("GET", &["get_user_info", username], &[], Body::Empty)
    }

    pub fn get_all_users(&self) -> Result<Value, ApiError> {
        self.fetch_json("GET", &["admin", "get_all_users"], &[], Body::Empty)
    }

    pub fn delete_user(&self, username: &str) -> Result<Value, ApiError> {
        self.fetch_json(
            "DELETE",
            &["admin", "delete_user", username],
            &[],
            Body::Empty,
        )
    }

    // ---- parking configuration ----

    pub fn get_parking_config(&self) -> Result<Value, ApiError> {
        self.fetch_json("GET", &["admin", "get_parking_config"], &[], Body::Empty)
    }

    pub fn create_parking_config(&self, config: &ParkingConfig) -> Result<Value, ApiError> {
        let id = config.id.to_string();
        let capacity = config.max_capacity.to_string();
        let price = config.price_per_hour.to_string();
        self.fetch_json(
            "POST",
            &["admin", "create_parking_config"],
            &[
                ("id", id.as_str()),
                ("vehicle_type", config.vehicle_type.as_str()),
                ("max_capacity", capacity.as_str()),
                ("price_per_hour", price.as_str()),
            ],
            Body::Empty,
        )
    }

    pub fn update_parking_config(
        &self,
        id: u64,
        update: &ParkingConfigUpdate,
    ) -> Result<Value, ApiError> {
        let id = id.to_string();
        self.fetch_json(
            "PUT",
            &["admin", "update_parking_config", id.as_str()],
            &[],
            json_body(update)?,
        )
    }

    pub fn delete_parking_config(&self, id: u64) -> Result<Value, ApiError> {
        let id = id.to_string();
        self.fetch_json(
            "DELETE",
            &["admin", "delete_parking_config", id.as_str()],
            &[],
            Body::Empty,
        )
    }

    // ---- parking sessions ----

    pub fn auto_check(&self, license_plate: &str) -> Result<Value, ApiError> {
        self.fetch_json(
            "POST",
            &["auto_check"],
            &[],
            json_body(&AutoCheckBody { license_plate })?,
        )
    }

    pub fn get_parking_session(&self, license_plate: &str) -> Result<Value, ApiError> {
        self.fetch_json(
            "GET",
            &["get_parking_session", license_plate],
            &[],
            Body::Empty,
        )
    }

    pub fn get_all_parking_sessions(&self) -> Result<Value, ApiError> {
        self.fetch_json("GET", &["get_all_parking_sessions"], &[], Body::Empty)
    }

    pub fn update_parking_session(
        &self,
        license_plate: &str,
        update: &SessionUpdate,
    ) -> Result<Value, ApiError> {
        self.fetch_json(
            "PUT",
            &["update_parking_session", license_plate],
            &[],
            json_body(update)?,
        )
    }

    pub fn delete_parking_session(&self, id: u64) -> Result<Value, ApiError> {
        let id = id.to_string();
        self.fetch_json(
            "DELETE",
            &["delete_parking_session", id.as_str()],
            &[],
            Body::Empty,
        )
    }

    // ---- recognition ----

    pub fn get_plate(&self) -> Result<PlateReading, ApiError> {
        self.fetch_json("GET", &["get_plate"], &[], Body::Empty)
    }

    /// `POST /upload_frame` with an encoded capture.
    pub fn upload_frame(&self, frame: &EncodedFrame) -> Result<PlateReading, ApiError> {
        Ok(self.upload_image(frame.bytes())?.reading)
    }

    /// `POST /upload_frame` as `multipart/form-data` with any JPEG.
    pub fn upload_image(&self, jpeg: &[u8]) -> Result<UploadReply, ApiError> {
        let boundary = format!("parkscan-{:016x}", rand::thread_rng().gen::<u64>());
        let bytes = multipart_body(&boundary, UPLOAD_FIELD, UPLOAD_FILENAME, jpeg);
        self.fetch_json(
            "POST",
            &["upload_frame"],
            &[],
            Body::Multipart {
                content_type: format!("multipart/form-data; boundary={}", boundary),
                bytes,
            },
        )
    }

    /// Open `GET /video_feed` as a streaming MJPEG reader.
    pub fn open_video_feed(&self) -> Result<AnnotatedFeed, ApiError> {
        let url = self.endpoint_url(&["video_feed"]);
        let label = url.path().to_string();
        // The feed never ends; only the connect is bounded by the timeout.
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(self.timeout)
            .build();
        let response = agent
            .request_url("GET", &url)
            .call()
            .map_err(|err| map_ureq_error(&label, err))?;
        if !response.content_type().starts_with("multipart/") {
            log::warn!(
                "{} answered {} instead of a multipart stream",
                label,
                response.content_type()
            );
        }
        Ok(AnnotatedFeed::new(Box::new(response.into_reader())))
    }

    fn fetch_json<T: DeserializeOwned>(
        &self,
        method: &str,
        segments: &[&str],
        query: &[(&str, &str)],
        body: Body,
    ) -> Result<T, ApiError> {
        let (label, response) = self.send(method, segments, query, body)?;
        response.into_json::<T>().map_err(|err| ApiError::Decode {
            endpoint: label,
            message: err.to_string(),
        })
    }

    fn send(
        &self,
        method: &str,
        segments: &[&str],
        query: &[(&str, &str)],
        body: Body,
    ) -> Result<(String, ureq::Response), ApiError> {
        let mut url = self.endpoint_url(segments);
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query.iter());
        }
        let label = format!("{} {}", method, url.path());
        log::debug!("api request {}", label);

        let request = self.agent.request_url(method, &url);
        let result = match body {
            Body::Empty => request.call(),
            Body::Json(value) => request.send_json(value),
            Body::Multipart {
                content_type,
                bytes,
            } => request.set("Content-Type", &content_type).send_bytes(&bytes),
        };
        match result {
            Ok(response) => Ok((label, response)),
            Err(err) => Err(map_ureq_error(&label, err)),
        }
    }
}

fn json_body<T: Serialize>(value: &T) -> Result<Body, ApiError> {
    serde_json::to_value(value)
        .map(Body::Json)
        .map_err(|err| ApiError::Request {
            endpoint: "request body".to_string(),
            message: err.to_string(),
        })
}

fn map_ureq_error(endpoint: &str, err: ureq::Error) -> ApiError {
    match err {
        ureq::Error::Status(status, response) => {
            let mut body = response.into_string().unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let cut = (0..=MAX_ERROR_BODY)
                    .rev()
                    .find(|i| body.is_char_boundary(*i))
                    .unwrap_or(0);
                body.truncate(cut);
            }
            ApiError::Status {
                endpoint: endpoint.to_string(),
                status,
                body,
            }
        }
        ureq::Error::Transport(transport) => ApiError::Request {
            endpoint: endpoint.to_string(),
            message: transport.to_string(),
        },
    }
}

fn multipart_body(boundary: &str, field: &str, filename: &str, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(payload.len() + 256);
    body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
            field, filename
        )
        .as_bytes(),
    );
    body.extend_from_slice(b"Content-Type: image/jpeg\r\n\r\n");
    body.extend_from_slice(payload);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
    body
}

// ----------------------------------------------------------------------------
// Recognition backend seam
// ----------------------------------------------------------------------------

/// The two recognition calls the capture pipeline makes over REST.
pub trait RecognitionBackend {
    fn latest_plate(&mut self) -> Result<PlateReading, ApiError>;

    /// Upload a frame; the reply carries the plate read from it, if any.
    fn upload_frame(&mut self, frame: &EncodedFrame) -> Result<PlateReading, ApiError>;
}

impl RecognitionBackend for ApiClient {
    fn latest_plate(&mut self) -> Result<PlateReading, ApiError> {
        self.get_plate()
    }

    fn upload_frame(&mut self, frame: &EncodedFrame) -> Result<PlateReading, ApiError> {
        ApiClient::upload_frame(self, frame)
    }
}

/// Frame sink for the upload capture mode. Plates read from uploaded frames
/// are collected for the caller to reconcile.
pub struct UploadSink<'a> {
    backend: &'a mut dyn RecognitionBackend,
    failures: u64,
    recognized: Vec<RecognitionEvent>,
}

impl<'a> UploadSink<'a> {
    pub fn new(backend: &'a mut dyn RecognitionBackend) -> Self {
        Self {
            backend,
            failures: 0,
            recognized: Vec::new(),
        }
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    /// Non-sentinel plates from upload replies, oldest first.
    pub fn into_recognized(self) -> Vec<RecognitionEvent> {
        self.recognized
    }
}

impl FrameSink for UploadSink<'_> {
    fn is_ready(&self) -> bool {
        true
    }

    fn send_frame(&mut self, frame: EncodedFrame, _now: Instant) -> bool {
        match self.backend.upload_frame(&frame) {
            Ok(reading) => {
                if !is_sentinel_plate(&reading.plate) {
                    self.recognized.push(RecognitionEvent::new(
                        reading.plate,
                        reading.boxes,
                        EventOrigin::Upload,
                    ));
                }
                true
            }
            Err(err) => {
                self.failures += 1;
                log::warn!("frame upload failed: {}", err);
                false
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
