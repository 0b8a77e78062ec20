//! Plate detections as they arrive from the backend.

use serde::{Deserialize, Serialize};

/// Values the recognizer reports when nothing usable was read.
pub const NO_PLATE_SENTINELS: &[&str] = &["", "no plate detected", "unknown"];

/// Region of the frame where a plate was found.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
    #[serde(default)]
    pub plate: String,
}

/// Where a recognition event came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventOrigin {
    /// Pushed over the telemetry channel.
    Push,
    /// Returned by the recognition poller.
    Poll,
    /// Reply to an uploaded frame.
    Upload,
}

/// A detected plate. Carries no identity beyond the plate value.
#[derive(Clone, Debug, PartialEq)]
pub struct RecognitionEvent {
    pub plate: String,
    pub boxes: Vec<BoundingBox>,
    pub origin: EventOrigin,
}

impl RecognitionEvent {
    pub fn new(plate: impl Into<String>, boxes: Vec<BoundingBox>, origin: EventOrigin) -> Self {
        Self {
            plate: plate.into().trim().to_string(),
            boxes,
            origin,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        is_sentinel_plate(&self.plate)
    }
}

/// Returns true for "no plate" / "unknown" style values.
pub fn is_sentinel_plate(plate: &str) -> bool {
    let normalized = plate.trim().to_lowercase();
    NO_PLATE_SENTINELS.contains(&normalized.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinels_are_case_and_whitespace_insensitive() {
        assert!(is_sentinel_plate("No plate detected"));
        assert!(is_sentinel_plate("  UNKNOWN "));
        assert!(is_sentinel_plate(""));
        assert!(!is_sentinel_plate("51F-123.45"));
    }

    #[test]
    fn event_plate_is_trimmed() {
        let event = RecognitionEvent::new(" 51F-123.45\n", Vec::new(), EventOrigin::Poll);
        assert_eq!(event.plate, "51F-123.45");
        assert!(!event.is_sentinel());
    }

    #[test]
    fn bounding_box_plate_defaults_when_missing() {
        let parsed: BoundingBox =
            serde_json::from_str(r#"{"x":1,"y":2,"w":30,"h":10}"#).expect("parse box");
        assert_eq!(parsed.w, 30.0);
        assert!(parsed.plate.is_empty());
    }
}
