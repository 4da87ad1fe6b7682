//! Per-connection relay session.
//!
//! A [`Session`] binds one client connection to at most one transcoder. It
//! consumes [`SessionInput`]s from the gateway and [`ProcessEvent`]s from the
//! transcoder pump in a single loop ([`Session::run`]) and answers with
//! [`ServerEvent`]s on the connection's outbound queue.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use relay_core::source::{redact_credentials, validate_source};
use relay_core::{ClientCommand, ConnectionId, FrameExtractor, RelayError, ServerEvent};
use relay_telemetry::MetricsRecorder;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::pump::{self, ProcessEvent, ProcessEventKind};
use crate::transcoder::{looks_like_error, Transcoder};

const PROCESS_EVENT_QUEUE: usize = 64;

/// Lifecycle state of a session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    Starting,
    Streaming,
    Stopping,
    Closed,
}

/// Input delivered to a session by the gateway.
#[derive(Debug)]
pub enum SessionInput {
    Command(ClientCommand),
    /// A message that could not be decoded into a command.
    Rejected(RelayError),
    Disconnected,
}

/// Per-session limits and policies, derived from the relay config.
#[derive(Clone, Debug)]
pub struct SessionSettings {
    pub accepted_schemes: Vec<String>,
    pub max_frame_buffer: Option<usize>,
    pub stall_timeout: Option<Duration>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            accepted_schemes: relay_core::source::DEFAULT_ACCEPTED_SCHEMES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_frame_buffer: Some(relay_core::frame::DEFAULT_MAX_BUFFER),
            stall_timeout: None,
        }
    }
}

/// State of a session as seen from outside (registry, diagnostics, tests).
#[derive(Default)]
pub struct SessionStatus {
    inner: Mutex<StatusInner>,
}

#[derive(Default)]
struct StatusInner {
    state: SessionState,
    source: Option<String>,
}

impl SessionStatus {
    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    /// Redacted source URL of the active stream.
    pub fn source(&self) -> Option<String> {
        self.inner.lock().source.clone()
    }

    pub fn is_streaming(&self) -> bool {
        self.state() == SessionState::Streaming
    }

    pub(crate) fn set(&self, state: SessionState, source: Option<String>) {
        let mut inner = self.inner.lock();
        inner.state = state;
        inner.source = source;
    }

    fn set_state(&self, state: SessionState) {
        self.inner.lock().state = state;
    }
}

/// Sending half of a connection's outbound queue.
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::Sender<String>,
}

/// Why a frame was not queued.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameDrop {
    QueueFull,
    Disconnected,
}

impl Outbound {
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self { tx }
    }

    /// Queue a control event, waiting for room. Returns false once the
    /// connection is gone.
    pub async fn send(&self, event: &ServerEvent) -> bool {
        let sent = self.tx.send(event.to_json()).await.is_ok();
        if !sent {
            tracing::debug!(event = event.kind(), "Connection gone, event discarded");
        }
        sent
    }

    /// Queue a frame without waiting. Frames are dropped under backpressure.
    pub fn try_send_frame(&self, event: &ServerEvent) -> Result<(), FrameDrop> {
        match self.tx.try_send(event.to_json()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(FrameDrop::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(FrameDrop::Disconnected),
        }
    }
}

/// The stream currently owned by a session.
struct ActiveStream {
    generation: u64,
    source: String,
    cancel: CancellationToken,
    pump: JoinHandle<()>,
    frames: u64,
    last_data: Instant,
}

pub struct Session {
    id: ConnectionId,
    state: SessionState,
    settings: Arc<SessionSettings>,
    transcoder: Arc<dyn Transcoder>,
    outbound: Outbound,
    status: Arc<SessionStatus>,
    metrics: Arc<MetricsRecorder>,
    extractor: FrameExtractor,
    active: Option<ActiveStream>,
    next_generation: u64,
    last_timestamp: i64,
    events_tx: mpsc::Sender<ProcessEvent>,
    events_rx: mpsc::Receiver<ProcessEvent>,
}

impl Session {
    pub fn new(
        id: ConnectionId,
        settings: Arc<SessionSettings>,
        transcoder: Arc<dyn Transcoder>,
        outbound: Outbound,
        status: Arc<SessionStatus>,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(PROCESS_EVENT_QUEUE);
        let extractor = FrameExtractor::new(settings.max_frame_buffer);
        status.set(SessionState::Idle, None);
        Self {
            id,
            state: SessionState::Idle,
            settings,
            transcoder,
            outbound,
            status,
            metrics,
            extractor,
            active: None,
            next_generation: 1,
            last_timestamp: 0,
            events_tx,
            events_rx,
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drive the session until the client disconnects or `terminate` fires.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<SessionInput>, terminate: CancellationToken) {
        tracing::debug!(conn_id = %self.id, "Session started");

        loop {
            let stall_at = self.stall_deadline();
            tokio::select! {
                biased;
                _ = terminate.cancelled() => {
                    self.shutdown().await;
                    break;
                }
                input = inbound.recv() => match input {
                    Some(SessionInput::Command(cmd)) => self.handle_command(cmd).await,
                    Some(SessionInput::Rejected(err)) => self.report(&err).await,
                    Some(SessionInput::Disconnected) | None => {
                        self.close().await;
                        break;
                    }
                },
                Some(event) = self.events_rx.recv() => self.handle_process_event(event).await,
                _ = sleep_until(stall_at) => self.handle_stall().await,
            }
        }

        tracing::debug!(conn_id = %self.id, "Session finished");
    }

    pub async fn handle_command(&mut self, cmd: ClientCommand) {
        match cmd {
            ClientCommand::Start { rtsp_url } => self.start(rtsp_url).await,
            ClientCommand::Stop => self.stop().await,
        }
    }

    async fn start(&mut self, url: String) {
        // A new start always supersedes the current stream.
        if self.terminate_active().await {
            tracing::info!(conn_id = %self.id, "Previous stream replaced");
        }

        if let Err(err) = validate_source(&url, &self.settings.accepted_schemes) {
            self.report(&err).await;
            return;
        }

        let source = redact_credentials(&url);
        self.set_state(SessionState::Starting);

        let process = match self.transcoder.spawn(&url) {
            Ok(process) => process,
            Err(err) => {
                tracing::error!(conn_id = %self.id, source = %source, error = %err, "Transcoder spawn failed");
                self.metrics.counter_inc("relay.spawn_failures", &[], 1);
                self.set_state(SessionState::Idle);
                self.report(&err).await;
                return;
            }
        };

        let generation = self.next_generation;
        self.next_generation += 1;
        let pid = process.control.id();
        let cancel = CancellationToken::new();
        let pump = pump::spawn_pump(generation, process, cancel.clone(), self.events_tx.clone());

        self.extractor.clear();
        self.active = Some(ActiveStream {
            generation,
            source: source.clone(),
            cancel,
            pump,
            frames: 0,
            last_data: Instant::now(),
        });
        self.state = SessionState::Streaming;
        self.status.set(SessionState::Streaming, Some(source.clone()));
        self.metrics.counter_inc("relay.streams_started", &[], 1);

        tracing::info!(conn_id = %self.id, source = %source, ?pid, generation, "Stream started");
        self.outbound.send(&ServerEvent::started()).await;
    }

    async fn stop(&mut self) {
        if self.terminate_active().await {
            self.outbound
                .send(&ServerEvent::stopped("Stream stopped"))
                .await;
        } else {
            tracing::debug!(conn_id = %self.id, "Stop ignored, no active stream");
        }
    }

    /// Kill and reap the active transcoder, if any. Returns whether there was one.
    async fn terminate_active(&mut self) -> bool {
        let Some(active) = self.active.take() else {
            return false;
        };

        self.set_state(SessionState::Stopping);
        // Signalled within this turn; the pump kills the process and any
        // events it already queued carry a generation that is now stale.
        active.cancel.cancel();
        self.extractor.clear();

        if let Err(e) = active.pump.await {
            tracing::warn!(conn_id = %self.id, error = %e, "Transcoder pump task failed");
        }

        self.status.set(SessionState::Idle, None);
        self.state = SessionState::Idle;
        tracing::info!(
            conn_id = %self.id,
            source = %active.source,
            generation = active.generation,
            frames = active.frames,
            "Stream stopped"
        );
        true
    }

    pub async fn handle_process_event(&mut self, event: ProcessEvent) {
        let current = self.active.as_ref().map(|a| a.generation);
        if current != Some(event.generation) {
            tracing::trace!(conn_id = %self.id, generation = event.generation, "Stale transcoder event dropped");
            return;
        }

        match event.kind {
            ProcessEventKind::Stdout(chunk) => {
                if let Some(active) = self.active.as_mut() {
                    active.last_data = Instant::now();
                }
                for frame in self.extractor.push(&chunk) {
                    self.forward_frame(frame);
                }
                if let Err(err) = self.extractor.enforce_limit() {
                    tracing::warn!(conn_id = %self.id, error = %err, "Frame buffer overflow");
                    self.fail_stream(err).await;
                }
            }
            ProcessEventKind::Stderr(line) => {
                if looks_like_error(&line) {
                    tracing::warn!(conn_id = %self.id, line = %line, "Transcoder error output");
                } else {
                    tracing::trace!(conn_id = %self.id, line = %line, "Transcoder output");
                }
            }
            ProcessEventKind::Exited(code) => {
                tracing::info!(conn_id = %self.id, ?code, "Transcoder exited");
                self.fail_stream(RelayError::StreamEnded { code }).await;
            }
        }
    }

    fn forward_frame(&mut self, frame: Bytes) {
        let timestamp = self.next_timestamp();
        let event = ServerEvent::frame(&frame, timestamp);

        match self.outbound.try_send_frame(&event) {
            Ok(()) => {
                if let Some(active) = self.active.as_mut() {
                    active.frames += 1;
                }
                self.metrics.counter_inc("relay.frames_forwarded", &[], 1);
                self.metrics
                    .histogram_observe("relay.frame_bytes", &[], frame.len() as f64);
            }
            Err(FrameDrop::QueueFull) => {
                self.metrics.counter_inc("relay.frames_dropped", &[], 1);
                tracing::warn!(conn_id = %self.id, bytes = frame.len(), "Send queue full, dropping frame");
            }
            Err(FrameDrop::Disconnected) => {}
        }
    }

    /// Wall-clock milliseconds, forced strictly increasing within the session.
    fn next_timestamp(&mut self) -> i64 {
        let now = chrono::Utc::now().timestamp_millis();
        self.last_timestamp = now.max(self.last_timestamp + 1);
        self.last_timestamp
    }

    fn stall_deadline(&self) -> Option<Instant> {
        let timeout = self.settings.stall_timeout?;
        match (&self.active, self.state) {
            (Some(active), SessionState::Streaming) => Some(active.last_data + timeout),
            _ => None,
        }
    }

    async fn handle_stall(&mut self) {
        let Some(timeout) = self.settings.stall_timeout else {
            return;
        };
        tracing::warn!(conn_id = %self.id, ?timeout, "Source stalled");
        self.fail_stream(RelayError::Stalled(timeout)).await;
    }

    /// End the active stream because of `err` and tell the client.
    async fn fail_stream(&mut self, err: RelayError) {
        self.terminate_active().await;
        self.report(&err).await;
    }

    async fn report(&mut self, err: &RelayError) {
        self.metrics
            .counter_inc("relay.stream_errors", &[("kind", err.error_kind())], 1);
        tracing::debug!(conn_id = %self.id, kind = err.error_kind(), error = %err, "Reporting error to client");
        self.outbound.send(&ServerEvent::error(err)).await;
    }

    async fn close(&mut self) {
        self.terminate_active().await;
        self.set_state(SessionState::Closed);
        tracing::info!(conn_id = %self.id, "Session closed");
    }

    async fn shutdown(&mut self) {
        if self.terminate_active().await {
            self.outbound
                .send(&ServerEvent::stopped("Relay shutting down"))
                .await;
        }
        self.set_state(SessionState::Closed);
        tracing::info!(conn_id = %self.id, "Session terminated by shutdown");
    }

    fn set_state(&mut self, state: SessionState) {
        self.state = state;
        self.status.set_state(state);
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
