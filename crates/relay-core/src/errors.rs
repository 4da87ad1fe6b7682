use std::time::Duration;

/// Everything that can go wrong inside one relay session.
///
/// Every variant is scoped to the session that produced it and is reported
/// to that session's client as a single `error` event.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("invalid source url: {0}")]
    InvalidSource(String),

    #[error("failed to spawn transcoder: {0}")]
    SpawnFailed(String),

    #[error("transcoder exited (code {code:?})")]
    StreamEnded { code: Option<i32> },

    #[error("frame buffer exceeded {limit} bytes without a complete frame")]
    BufferOverflow { limit: usize },

    #[error("no data from source for {0:?}")]
    Stalled(Duration),
}

impl RelayError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::InvalidCommand(_) => "invalid_command",
            Self::InvalidSource(_) => "invalid_source",
            Self::SpawnFailed(_) => "spawn_failed",
            Self::StreamEnded { .. } => "stream_ended",
            Self::BufferOverflow { .. } => "buffer_overflow",
            Self::Stalled(_) => "stalled",
        }
    }

    /// Text shown to the client in the `error` event.
    pub fn client_message(&self) -> String {
        match self {
            Self::InvalidCommand(detail) => format!("Invalid command: {detail}"),
            Self::InvalidSource(hint) => format!("Invalid URL. {hint}"),
            Self::SpawnFailed(detail) => format!("Failed to start stream: {detail}"),
            Self::StreamEnded { .. } => "Stream ended".into(),
            Self::BufferOverflow { .. } => "Frame buffer limit exceeded".into(),
            Self::Stalled(_) => "Stream stalled".into(),
        }
    }
}
