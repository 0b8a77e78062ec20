//! Error taxonomy for the capture and telemetry pipeline.
//!
//! Component boundaries return these typed errors so callers can tell a
//! recoverable camera or transport failure from a programming error.
//! Application layers (config, binaries) wrap them in `anyhow`.

use thiserror::Error;

/// Camera acquisition failures. Both are recoverable: the source retries.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CameraError {
    #[error("camera permission denied: {0}")]
    PermissionDenied(String),
    #[error("camera unavailable: {0}")]
    DeviceUnavailable(String),
}

impl CameraError {
    /// Operator-facing remediation text for the camera banner.
    pub fn remediation(&self) -> &'static str {
        match self {
            CameraError::PermissionDenied(_) => {
                "grant the agent access to the capture device and wait for the retry"
            }
            CameraError::DeviceUnavailable(_) => {
                "check that the camera is connected and not held by another process"
            }
        }
    }
}

/// Telemetry channel failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("connect to {endpoint} failed: {message}")]
    Connect { endpoint: String, message: String },
    #[error("channel transport error: {0}")]
    Transport(String),
}

/// REST request failures.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request to {endpoint} failed: {message}")]
    Request { endpoint: String, message: String },
    #[error("{endpoint} returned HTTP {status}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },
    #[error("invalid response from {endpoint}: {message}")]
    Decode { endpoint: String, message: String },
}

impl ApiError {
    pub fn endpoint(&self) -> &str {
        match self {
            ApiError::Request { endpoint, .. }
            | ApiError::Status { endpoint, .. }
            | ApiError::Decode { endpoint, .. } => endpoint,
        }
    }
}

/// Session reconciliation failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("no open parking session for plate {0}")]
    NoOpenSession(String),
}
