//! Observations returned by targets.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Screen size in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

impl Resolution {
    /// Create a resolution.
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// True when both dimensions are positive.
    pub fn is_positive(&self) -> bool {
        self.width > 0 && self.height > 0
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Snapshot of a target after a step.
///
/// Wire form: `{"screenshot"?: base64, "text"?: str, "width"?: u32, "height"?: u32}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Encoded screenshot (PNG or JPEG), if the target captured one
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_screenshot",
        deserialize_with = "deserialize_screenshot"
    )]
    pub screenshot: Option<Vec<u8>>,

    /// Textual state (page text, accessibility tree, terminal contents)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Reported screenshot width
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,

    /// Reported screenshot height
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

impl Observation {
    /// Observation carrying only text.
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    /// The reported resolution, when both dimensions are present.
    pub fn resolution(&self) -> Option<Resolution> {
        match (self.width, self.height) {
            (Some(width), Some(height)) => Some(Resolution { width, height }),
            _ => None,
        }
    }

    /// Replace the reported resolution.
    pub fn with_resolution(mut self, resolution: Resolution) -> Self {
        self.width = Some(resolution.width);
        self.height = Some(resolution.height);
        self
    }

    /// True when the text contains `needle`.
    pub fn contains_text(&self, needle: &str) -> bool {
        self.text.as_deref().is_some_and(|t| t.contains(needle))
    }

    /// Trace-friendly summary that leaves out the image bytes.
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "screenshot_bytes": self.screenshot.as_ref().map(Vec::len),
            "text": self.text,
            "width": self.width,
            "height": self.height,
        })
    }
}

fn serialize_screenshot<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
    match bytes {
        Some(bytes) => s.serialize_str(&BASE64.encode(bytes)),
        None => s.serialize_none(),
    }
}

fn deserialize_screenshot<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
    let encoded: Option<String> = Option::deserialize(d)?;
    encoded
        .filter(|s| !s.is_empty())
        .map(|s| BASE64.decode(s.as_bytes()).map_err(serde::de::Error::custom))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parses_controller_payload() {
        let obs: Observation = serde_json::from_value(json!({
            "screenshot": BASE64.encode(b"\x89PNG"),
            "text": "ok",
            "width": 2000,
            "height": 1000
        }))
        .unwrap();
        assert_eq!(obs.screenshot.as_deref(), Some(&b"\x89PNG"[..]));
        assert_eq!(obs.resolution(), Some(Resolution::new(2000, 1000)));
        assert!(obs.contains_text("ok"));
    }

    #[test]
    fn test_missing_fields_default() {
        let obs: Observation = serde_json::from_value(json!({})).unwrap();
        assert_eq!(obs, Observation::default());
        assert_eq!(obs.resolution(), None);
        assert!(!obs.contains_text("ok"));
    }

    #[test]
    fn test_rejects_bad_base64() {
        let result: Result<Observation, _> =
            serde_json::from_value(json!({"screenshot": "not base64!!"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_summary_omits_bytes() {
        let obs = Observation {
            screenshot: Some(vec![0; 1024]),
            ..Observation::from_text("hello")
        };
        let summary = obs.summary();
        assert_eq!(summary["screenshot_bytes"], 1024);
        assert_eq!(summary["text"], "hello");
    }
}
