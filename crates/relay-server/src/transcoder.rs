//! Subprocess boundary to the external transcoding tool.
//!
//! The relay never decodes video itself. It runs ffmpeg with a fixed argument
//! set that turns the camera source into back-to-back JPEG images on stdout.

use std::io;
use std::pin::Pin;
use std::process::Stdio;

use async_trait::async_trait;
use relay_core::RelayError;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};

/// Byte stream read from a subprocess pipe.
pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;

/// Fixed transcoding parameters passed to every ffmpeg invocation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TranscodeSettings {
    /// Executable name or path.
    pub program: String,
    /// `-rtsp_transport` value.
    pub rtsp_transport: String,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    /// `-q:v`, 1 (best) to 31 (worst).
    pub quality: u8,
}

impl Default for TranscodeSettings {
    fn default() -> Self {
        Self {
            program: "ffmpeg".into(),
            rtsp_transport: "tcp".into(),
            fps: 10,
            width: 1280,
            height: 720,
            quality: 5,
        }
    }
}

impl TranscodeSettings {
    /// Argument list for transcoding `source` into an MJPEG pipe on stdout.
    pub fn ffmpeg_args(&self, source: &str) -> Vec<String> {
        vec![
            "-rtsp_transport".into(),
            self.rtsp_transport.clone(),
            "-i".into(),
            source.into(),
            "-f".into(),
            "image2pipe".into(),
            "-vcodec".into(),
            "mjpeg".into(),
            "-q:v".into(),
            self.quality.to_string(),
            "-vf".into(),
            format!("fps={},scale={}:{}", self.fps, self.width, self.height),
            "-".into(),
        ]
    }
}

/// Kill/wait half of a running transcoder.
#[async_trait]
pub trait ProcessControl: Send {
    fn id(&self) -> Option<u32>;

    /// Signal termination without waiting for the process to exit.
    fn start_kill(&mut self) -> io::Result<()>;

    /// Wait for exit and return the exit code (`None` when killed by a signal).
    async fn wait(&mut self) -> io::Result<Option<i32>>;
}

#[async_trait]
impl ProcessControl for Child {
    fn id(&self) -> Option<u32> {
        Child::id(self)
    }

    fn start_kill(&mut self) -> io::Result<()> {
        Child::start_kill(self)
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        Ok(Child::wait(self).await?.code())
    }
}

/// A spawned transcoder: its output pipes plus a control handle.
pub struct TranscodeProcess {
    pub stdout: BoxedReader,
    pub stderr: Option<BoxedReader>,
    pub control: Box<dyn ProcessControl>,
}

/// Starts transcoders for sessions.
pub trait Transcoder: Send + Sync {
    fn spawn(&self, source: &str) -> Result<TranscodeProcess, RelayError>;
}

/// Spawns the real ffmpeg binary.
pub struct FfmpegTranscoder {
    settings: TranscodeSettings,
}

impl FfmpegTranscoder {
    pub fn new(settings: TranscodeSettings) -> Self {
        Self { settings }
    }
}

impl Transcoder for FfmpegTranscoder {
    fn spawn(&self, source: &str) -> Result<TranscodeProcess, RelayError> {
        let mut child = Command::new(&self.settings.program)
            .args(self.settings.ffmpeg_args(source))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RelayError::SpawnFailed(e.to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RelayError::SpawnFailed("transcoder stdout not captured".into()))?;
        let stderr = child.stderr.take();

        Ok(TranscodeProcess {
            stdout: Box::pin(stdout),
            stderr: stderr.map(|s| Box::pin(s) as BoxedReader),
            control: Box::new(child),
        })
    }
}

/// Why the version check failed.
#[derive(Debug, thiserror::Error)]
pub enum VersionCheckError {
    #[error("{0}")]
    NotInstalled(#[from] io::Error),

    #[error("exited with code {0:?}")]
    Failed(Option<i32>),
}

/// Run `<program> -version` and return the first line it prints.
pub async fn check_version(program: &str) -> Result<String, VersionCheckError> {
    let output = Command::new(program)
        .arg("-version")
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await?;

    if !output.status.success() {
        return Err(VersionCheckError::Failed(output.status.code()));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.lines().next().unwrap_or_default().trim().to_string())
}

/// Heuristic used to decide whether a stderr line is worth a warning.
pub fn looks_like_error(line: &str) -> bool {
    line.contains("error") || line.contains("Error")
}
