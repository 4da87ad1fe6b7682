//! End-to-end tests against a real server, WebSocket client and subprocesses.

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use relay_core::protocol::JPEG_DATA_URL_PREFIX;
use relay_core::RelayError;
use relay_server::transcoder::{BoxedReader, TranscodeProcess};
use relay_server::{RelayConfig, ServerHandle, Transcoder};
use relay_telemetry::MetricsRecorder;
use serde_json::{json, Value};
use tokio::process::Command;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

const TIMEOUT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(300);

/// Emits a small JPEG-framed payload every 100ms until killed.
const FRAME_LOOP: &str = r"while :; do printf '\377\330relay\377\331'; sleep 0.1; done";

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Runs a shell loop instead of ffmpeg. Sources containing `dies` exit at once.
#[derive(Default)]
struct ShellTranscoder {
    pids: Mutex<Vec<u32>>,
}

impl ShellTranscoder {
    fn pids(&self) -> Vec<u32> {
        self.pids.lock().unwrap().clone()
    }
}

impl Transcoder for ShellTranscoder {
    fn spawn(&self, source: &str) -> Result<TranscodeProcess, RelayError> {
        let script = if source.contains("dies") { "exit 1" } else { FRAME_LOOP };
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RelayError::SpawnFailed(e.to_string()))?;

        if let Some(pid) = child.id() {
            self.pids.lock().unwrap().push(pid);
        }
        let stdout = child.stdout.take().unwrap();
        let stderr = child.stderr.take().unwrap();
        Ok(TranscodeProcess {
            stdout: Box::pin(stdout),
            stderr: Some(Box::pin(stderr) as BoxedReader),
            control: Box::new(child),
        })
    }
}

struct TestRelay {
    handle: ServerHandle,
    transcoder: Arc<ShellTranscoder>,
    metrics: Arc<MetricsRecorder>,
}

impl TestRelay {
    fn ws_url(&self) -> String {
        format!("ws://127.0.0.1:{}/", self.handle.port)
    }

    fn http_url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{path}", self.handle.port)
    }
}

async fn boot_relay() -> TestRelay {
    boot_relay_with(RelayConfig::default()).await
}

async fn boot_relay_with(config: RelayConfig) -> TestRelay {
    let config = RelayConfig {
        host: "127.0.0.1".into(),
        port: 0,
        ..config
    };
    let transcoder = Arc::new(ShellTranscoder::default());
    let metrics = Arc::new(MetricsRecorder::new());
    let handle = relay_server::start(&config, transcoder.clone(), Arc::clone(&metrics))
        .await
        .unwrap();
    TestRelay {
        handle,
        transcoder,
        metrics,
    }
}

async fn connect(url: &str) -> WsStream {
    let (ws, _) = connect_async(url).await.unwrap();
    ws
}

async fn send_json(ws: &mut WsStream, value: Value) {
    ws.send(Message::text(value.to_string())).await.unwrap();
}

/// Read the next text message as JSON.
async fn read_json(ws: &mut WsStream) -> Value {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream closed")
            .expect("ws error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// Read until a message of the given type arrives, skipping frames.
async fn read_until(ws: &mut WsStream, kind: &str) -> Value {
    loop {
        let msg = read_json(ws).await;
        if msg["type"] == kind {
            return msg;
        }
        assert_eq!(msg["type"], "frame", "unexpected message while waiting for {kind}: {msg}");
    }
}

/// Assert nothing but pings arrives within a short window.
async fn assert_quiet(ws: &mut WsStream) {
    let deadline = tokio::time::Instant::now() + QUIET;
    loop {
        match tokio::time::timeout_at(deadline, ws.next()).await {
            Err(_) => return,
            Ok(Some(Ok(Message::Text(text)))) => panic!("unexpected message: {text}"),
            Ok(_) => {}
        }
    }
}

fn process_alive(pid: u32) -> bool {
    std::path::Path::new(&format!("/proc/{pid}")).exists()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn invalid_scheme_yields_exactly_one_error() {
    let relay = boot_relay().await;
    let mut ws = connect(&relay.ws_url()).await;

    send_json(&mut ws, json!({"type": "start", "rtspUrl": "ftp://bad"})).await;
    let msg = read_json(&mut ws).await;
    assert_eq!(msg["type"], "error");
    assert!(msg["message"].as_str().unwrap().contains("rtsp://"));
    assert_quiet(&mut ws).await;
    assert!(relay.transcoder.pids().is_empty());

    relay.handle.shutdown().await;
}

#[tokio::test]
async fn start_relays_frames_in_order() {
    let relay = boot_relay().await;
    let mut ws = connect(&relay.ws_url()).await;

    send_json(&mut ws, json!({"type": "start", "rtspUrl": "rtsp://cam/1"})).await;
    let started = read_json(&mut ws).await;
    assert_eq!(started["type"], "started");

    let mut last = 0;
    for _ in 0..3 {
        let frame = read_json(&mut ws).await;
        assert_eq!(frame["type"], "frame");
        assert!(frame["data"].as_str().unwrap().starts_with(JPEG_DATA_URL_PREFIX));
        let ts = frame["timestamp"].as_i64().unwrap();
        assert!(ts > last);
        last = ts;
    }
    assert!(relay.metrics.counter_get("relay.frames_forwarded", &[]) >= 3);

    relay.handle.shutdown().await;
}

#[tokio::test]
async fn stop_kills_subprocess() {
    let relay = boot_relay().await;
    let mut ws = connect(&relay.ws_url()).await;

    send_json(&mut ws, json!({"type": "start", "rtspUrl": "rtsp://cam/1"})).await;
    read_until(&mut ws, "started").await;
    send_json(&mut ws, json!({"type": "stop"})).await;
    let stopped = read_until(&mut ws, "stopped").await;
    assert_eq!(stopped["message"], "Stream stopped");

    let pids = relay.transcoder.pids();
    assert_eq!(pids.len(), 1);
    assert!(!process_alive(pids[0]));

    // A second stop is a silent no-op.
    send_json(&mut ws, json!({"type": "stop"})).await;
    assert_quiet(&mut ws).await;

    relay.handle.shutdown().await;
}

#[tokio::test]
async fn restart_keeps_single_subprocess() {
    let relay = boot_relay().await;
    let mut ws = connect(&relay.ws_url()).await;

    send_json(&mut ws, json!({"type": "start", "rtspUrl": "rtsp://cam/1"})).await;
    read_until(&mut ws, "started").await;
    send_json(&mut ws, json!({"type": "start", "rtspUrl": "rtsp://cam/2"})).await;
    read_until(&mut ws, "started").await;

    let pids = relay.transcoder.pids();
    assert_eq!(pids.len(), 2);
    assert!(!process_alive(pids[0]));
    assert!(process_alive(pids[1]));

    relay.handle.shutdown().await;
}

#[tokio::test]
async fn disconnect_reaps_subprocess_and_removes_session() {
    let relay = boot_relay().await;
    let mut ws = connect(&relay.ws_url()).await;

    send_json(&mut ws, json!({"type": "start", "rtspUrl": "rtsp://cam/1"})).await;
    read_until(&mut ws, "started").await;
    assert_eq!(relay.handle.registry().count(), 1);

    ws.close(None).await.unwrap();
    drop(ws);

    assert!(relay.handle.registry().wait_empty(TIMEOUT).await);
    let pids = relay.transcoder.pids();
    assert!(!process_alive(pids[0]));

    relay.handle.shutdown().await;
}

#[tokio::test]
async fn subprocess_exit_reports_stream_ended() {
    let relay = boot_relay().await;
    let mut ws = connect(&relay.ws_url()).await;

    send_json(&mut ws, json!({"type": "start", "rtspUrl": "rtsp://dies/1"})).await;
    assert_eq!(read_json(&mut ws).await["type"], "started");
    let err = read_json(&mut ws).await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["message"], "Stream ended");

    relay.handle.shutdown().await;
}

#[tokio::test]
async fn sessions_are_isolated() {
    let relay = boot_relay().await;
    let mut a = connect(&relay.ws_url()).await;
    let mut b = connect(&relay.ws_url()).await;

    send_json(&mut b, json!({"type": "start", "rtspUrl": "rtsp://cam/b"})).await;
    read_until(&mut b, "started").await;

    send_json(&mut a, json!({"type": "start", "rtspUrl": "ftp://bad"})).await;
    assert_eq!(read_json(&mut a).await["type"], "error");

    // B keeps receiving frames only.
    for _ in 0..3 {
        assert_eq!(read_json(&mut b).await["type"], "frame");
    }

    relay.handle.shutdown().await;
}

#[tokio::test]
async fn malformed_messages_are_reported() {
    let relay = boot_relay().await;
    let mut ws = connect(&relay.ws_url()).await;

    ws.send(Message::text("not json")).await.unwrap();
    let err = read_json(&mut ws).await;
    assert_eq!(err["type"], "error");
    assert!(err["message"].as_str().unwrap().starts_with("Invalid command"));

    send_json(&mut ws, json!({"type": "rewind"})).await;
    assert_eq!(read_json(&mut ws).await["type"], "error");

    ws.send(Message::binary(vec![1u8, 2, 3])).await.unwrap();
    assert_eq!(read_json(&mut ws).await["type"], "error");

    relay.handle.shutdown().await;
}

#[tokio::test]
async fn health_counts_active_streams() {
    let relay = boot_relay().await;
    let mut ws = connect(&relay.ws_url()).await;
    send_json(&mut ws, json!({"type": "start", "rtspUrl": "rtsp://cam/1"})).await;
    read_until(&mut ws, "started").await;

    let body: Value = reqwest::get(relay.http_url("/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["activeStreams"], 1);
    assert_eq!(body["sessions"], 1);

    relay.handle.shutdown().await;
}

#[tokio::test]
async fn ws_path_alias_is_served() {
    let relay = boot_relay().await;
    let url = format!("ws://127.0.0.1:{}/ws", relay.handle.port);
    let mut ws = connect(&url).await;
    send_json(&mut ws, json!({"type": "start", "rtspUrl": "ftp://bad"})).await;
    assert_eq!(read_json(&mut ws).await["type"], "error");

    relay.handle.shutdown().await;
}

#[tokio::test]
async fn shutdown_stops_streams_and_notifies_clients() {
    let relay = boot_relay().await;
    let mut ws = connect(&relay.ws_url()).await;
    send_json(&mut ws, json!({"type": "start", "rtspUrl": "rtsp://cam/1"})).await;
    read_until(&mut ws, "started").await;

    let transcoder = Arc::clone(&relay.transcoder);
    let shutdown = tokio::spawn(relay.handle.shutdown());

    let stopped = read_until(&mut ws, "stopped").await;
    assert_eq!(stopped["message"], "Relay shutting down");
    shutdown.await.unwrap();
    assert!(!process_alive(transcoder.pids()[0]));
}

#[tokio::test]
async fn stall_timeout_spares_active_source() {
    let config = RelayConfig {
        stall_timeout_secs: 1,
        ..Default::default()
    };
    let relay = boot_relay_with(config).await;
    let mut ws = connect(&relay.ws_url()).await;

    send_json(&mut ws, json!({"type": "start", "rtspUrl": "rtsp://cam/1"})).await;
    read_until(&mut ws, "started").await;
    tokio::time::sleep(Duration::from_millis(1500)).await;

    // Frames every 100ms keep the stream alive past the timeout.
    send_json(&mut ws, json!({"type": "stop"})).await;
    let stopped = read_until(&mut ws, "stopped").await;
    assert_eq!(stopped["message"], "Stream stopped");

    relay.handle.shutdown().await;
}
