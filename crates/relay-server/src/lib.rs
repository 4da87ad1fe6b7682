pub mod config;
pub mod gateway;
pub mod pump;
pub mod registry;
pub mod server;
pub mod session;
pub mod transcoder;

#[cfg(test)]
mod testutil;

pub use config::{load_config, ConfigError, LoadedConfig, RejectedEnv, RelayConfig};
pub use registry::SessionRegistry;
pub use server::{build_router, start, AppState, ServerHandle};
pub use session::{Session, SessionInput, SessionSettings, SessionState, SessionStatus};
pub use transcoder::{FfmpegTranscoder, TranscodeSettings, Transcoder};
