//! JSON text frames exchanged with the companion monitoring process.

use crate::metrics::ActivityMetrics;
use serde::{Deserialize, Serialize};

/// One protocol frame, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// Client identifies itself right after the socket opens.
    Auth { user_id: String, timestamp: String },
    /// Heartbeat request.
    Ping { timestamp: String },
    /// Heartbeat acknowledgement.
    Pong {
        #[serde(default)]
        timestamp: Option<String>,
    },
    /// Activity delta, sent in both directions.
    ActivityUpdate {
        data: ActivityMetrics,
        timestamp: String,
    },
    /// Server-side failure report.
    Error { error: String },
    StartMonitoring,
    StopMonitoring,
}

impl WireMessage {
    pub fn to_json(&self) -> String {
        // The enum has no non-serializable variants.
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Parse an inbound frame.
pub fn parse_frame(text: &str) -> Result<WireMessage, serde_json::Error> {
    serde_json::from_str(text)
}

/// Best-effort extraction of the `type` field for logging unknown frames.
pub fn frame_type(text: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    value.get("type")?.as_str().map(str::to_string)
}
