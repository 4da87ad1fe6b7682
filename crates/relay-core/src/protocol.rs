//! JSON wire protocol spoken over the client WebSocket.
//!
//! Client → server: `{"type":"start","rtspUrl":"..."}` and `{"type":"stop"}`.
//! Server → client: `started`, `frame`, `stopped` and `error` events.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::errors::RelayError;

/// Prefix of the inline-encoded image carried by `frame` events.
pub const JPEG_DATA_URL_PREFIX: &str = "data:image/jpeg;base64,";

/// Command sent by a browser client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientCommand {
    Start {
        #[serde(rename = "rtspUrl")]
        rtsp_url: String,
    },
    Stop,
}

impl ClientCommand {
    /// Decode one inbound text message.
    pub fn decode(text: &str) -> Result<Self, RelayError> {
        serde_json::from_str(text).map_err(|e| RelayError::InvalidCommand(e.to_string()))
    }
}

/// Event pushed to a browser client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerEvent {
    Started { message: String },
    Frame { data: String, timestamp: i64 },
    Stopped { message: String },
    Error { message: String },
}

impl ServerEvent {
    pub fn started() -> Self {
        Self::Started {
            message: "Stream started".into(),
        }
    }

    pub fn stopped(message: impl Into<String>) -> Self {
        Self::Stopped {
            message: message.into(),
        }
    }

    /// Wrap a complete JPEG as a data URL.
    pub fn frame(jpeg: &[u8], timestamp: i64) -> Self {
        let mut data = String::with_capacity(JPEG_DATA_URL_PREFIX.len() + jpeg.len() * 4 / 3 + 4);
        data.push_str(JPEG_DATA_URL_PREFIX);
        STANDARD.encode_string(jpeg, &mut data);
        Self::Frame { data, timestamp }
    }

    pub fn error(err: &RelayError) -> Self {
        Self::Error {
            message: err.client_message(),
        }
    }

    /// Wire name of the event, as it appears in the `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::Frame { .. } => "frame",
            Self::Stopped { .. } => "stopped",
            Self::Error { .. } => "error",
        }
    }

    pub fn to_json(&self) -> String {
        // Every variant is plain strings and integers, serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}
