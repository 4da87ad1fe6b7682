//! Relay configuration.
//!
//! Loading flow:
//! 1. Start with [`RelayConfig::default()`]
//! 2. If a config file is given, deep-merge its JSON over the defaults
//! 3. Apply environment variable overrides
//!
//! The caller applies its own overrides (CLI flags) and then calls
//! [`RelayConfig::validate`] once on the final result.
//!
//! Deep merge rules: objects merge per key, arrays and primitives are
//! replaced, nulls in the file are skipped.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use relay_telemetry::{LogFormat, TelemetryConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::Level;

use crate::session::SessionSettings;
use crate::transcoder::TranscodeSettings;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub transcode: TranscodeSettings,
    pub accepted_schemes: Vec<String>,
    /// Cap on bytes held for an unfinished frame; 0 disables the cap.
    pub max_frame_buffer_bytes: usize,
    /// Outbound messages queued per connection before frames are dropped.
    pub max_send_queue: usize,
    /// Seconds without transcoder output before a stream fails; 0 disables.
    pub stall_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
    pub logging: LoggingConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 9999,
            transcode: TranscodeSettings::default(),
            accepted_schemes: relay_core::source::DEFAULT_ACCEPTED_SCHEMES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_frame_buffer_bytes: relay_core::frame::DEFAULT_MAX_BUFFER,
            max_send_queue: 64,
            stall_timeout_secs: 0,
            shutdown_grace_secs: 5,
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    /// Per-module levels, e.g. `{"relay_server::pump": "trace"}`.
    pub modules: BTreeMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Json,
            modules: BTreeMap::new(),
        }
    }
}

impl RelayConfig {
    /// `host:port` to bind. The host may be a name, resolved at bind time.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            accepted_schemes: self.accepted_schemes.clone(),
            max_frame_buffer: (self.max_frame_buffer_bytes > 0).then_some(self.max_frame_buffer_bytes),
            stall_timeout: (self.stall_timeout_secs > 0)
                .then(|| Duration::from_secs(self.stall_timeout_secs)),
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            log_level: Level::from_str(&self.logging.level).unwrap_or(Level::INFO),
            module_levels: self
                .logging
                .modules
                .iter()
                .filter_map(|(module, level)| Some((module.clone(), Level::from_str(level).ok()?)))
                .collect(),
            format: self.logging.format,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(ConfigError::InvalidValue(msg.to_string()));

        if self.transcode.program.trim().is_empty() {
            return invalid("transcode.program must not be empty");
        }
        if self.transcode.fps == 0 {
            return invalid("transcode.fps must be positive");
        }
        if self.transcode.width == 0 || self.transcode.height == 0 {
            return invalid("transcode.width and transcode.height must be positive");
        }
        if !(1..=31).contains(&self.transcode.quality) {
            return invalid("transcode.quality must be between 1 and 31");
        }
        if self.accepted_schemes.is_empty() {
            return invalid("acceptedSchemes must not be empty");
        }
        if self.max_send_queue == 0 {
            return invalid("maxSendQueue must be positive");
        }
        if Level::from_str(&self.logging.level).is_err() {
            return Err(ConfigError::InvalidValue(format!(
                "unknown log level: {}",
                self.logging.level
            )));
        }
        for (module, level) in &self.logging.modules {
            if module.trim().is_empty() || Level::from_str(level).is_err() {
                return Err(ConfigError::InvalidValue(format!(
                    "invalid module log level: {module:?} = {level:?}"
                )));
            }
        }
        if self.host.trim().is_empty() || self.host.chars().any(char::is_whitespace) {
            return Err(ConfigError::InvalidValue(format!("invalid host: {:?}", self.host)));
        }
        Ok(())
    }
}

/// Config as loaded, before validation.
#[derive(Debug)]
pub struct LoadedConfig {
    pub config: RelayConfig,
    /// Environment overrides that were set but could not be parsed.
    pub rejected_env: Vec<RejectedEnv>,
}

/// An environment variable whose value was ignored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RejectedEnv {
    pub key: String,
    pub value: String,
}

/// Load the config: defaults, then the optional JSON file, then the process
/// environment. The result is not validated.
pub fn load_config(path: Option<&Path>) -> Result<LoadedConfig> {
    let mut config = load_file(path)?;
    let rejected_env = apply_env_overrides_from(&mut config, |name| std::env::var(name).ok());
    Ok(LoadedConfig { config, rejected_env })
}

fn load_file(path: Option<&Path>) -> Result<RelayConfig> {
    let defaults = serde_json::to_value(RelayConfig::default())?;
    let merged = match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)?;
            let user: Value = serde_json::from_str(&content)?;
            deep_merge(defaults, user)
        }
        None => defaults,
    };
    Ok(serde_json::from_value(merged)?)
}

pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply overrides read through `lookup`. Unparseable values are skipped and
/// returned so the caller can report them once logging is up.
pub fn apply_env_overrides_from(
    config: &mut RelayConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Vec<RejectedEnv> {
    let mut env = EnvReader {
        lookup,
        rejected: Vec::new(),
    };

    // RELAY_PORT wins over the conventional PORT.
    if let Some(v) = env.parse::<u16>("PORT") {
        config.port = v;
    }
    if let Some(v) = env.parse::<u16>("RELAY_PORT") {
        config.port = v;
    }
    if let Some(v) = env.string("RELAY_HOST") {
        config.host = v;
    }
    if let Some(v) = env.string("RELAY_FFMPEG") {
        config.transcode.program = v;
    }
    if let Some(v) = env.string("RELAY_RTSP_TRANSPORT") {
        config.transcode.rtsp_transport = v;
    }
    if let Some(v) = env.parse::<u32>("RELAY_FPS") {
        config.transcode.fps = v;
    }
    if let Some(v) = env.parse::<u32>("RELAY_WIDTH") {
        config.transcode.width = v;
    }
    if let Some(v) = env.parse::<u32>("RELAY_HEIGHT") {
        config.transcode.height = v;
    }
    if let Some(v) = env.parse::<u8>("RELAY_QUALITY") {
        config.transcode.quality = v;
    }
    if let Some(v) = env.string("RELAY_ACCEPTED_SCHEMES") {
        let schemes: Vec<String> = v
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        if !schemes.is_empty() {
            config.accepted_schemes = schemes;
        }
    }
    if let Some(v) = env.parse::<usize>("RELAY_MAX_BUFFER_BYTES") {
        config.max_frame_buffer_bytes = v;
    }
    if let Some(v) = env.parse::<usize>("RELAY_SEND_QUEUE") {
        config.max_send_queue = v;
    }
    if let Some(v) = env.parse::<u64>("RELAY_STALL_TIMEOUT_SECS") {
        config.stall_timeout_secs = v;
    }
    if let Some(v) = env.string("RELAY_LOG_LEVEL") {
        config.logging.level = v;
    }
    if let Some(v) = env.parse::<LogFormat>("RELAY_LOG_FORMAT") {
        config.logging.format = v;
    }
    env.rejected
}

struct EnvReader<F> {
    lookup: F,
    rejected: Vec<RejectedEnv>,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.trim().is_empty())
    }

    fn parse<T: FromStr>(&mut self, name: &str) -> Option<T> {
        let val = self.string(name)?;
        let parsed = val.trim().parse().ok();
        if parsed.is_none() {
            self.rejected.push(RejectedEnv {
                key: name.to_string(),
                value: val,
            });
        }
        parsed
    }
}
