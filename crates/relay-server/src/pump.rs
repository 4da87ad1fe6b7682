//! Reads one transcoder's pipes and exit status and turns them into
//! [`ProcessEvent`]s for the owning session.

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::transcoder::{BoxedReader, ProcessControl, TranscodeProcess};

const READ_CHUNK_BYTES: usize = 64 * 1024;
const REAP_TIMEOUT: Duration = Duration::from_secs(5);
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Something that happened to a transcoder, tagged with the stream
/// generation it belongs to.
#[derive(Debug)]
pub struct ProcessEvent {
    pub generation: u64,
    pub kind: ProcessEventKind,
}

#[derive(Debug)]
pub enum ProcessEventKind {
    Stdout(Bytes),
    Stderr(String),
    /// Stdout reached EOF and the process exited. Always the last event of
    /// a generation; stderr written before exit is delivered first.
    Exited(Option<i32>),
}

/// Line reader over stderr that keeps partial lines across cancelled reads.
struct StderrLines {
    reader: BufReader<BoxedReader>,
    line: Vec<u8>,
}

impl StderrLines {
    fn new(reader: BoxedReader) -> Self {
        Self {
            reader: BufReader::new(reader),
            line: Vec::new(),
        }
    }

    async fn next_line(&mut self) -> Option<String> {
        match self.reader.read_until(b'\n', &mut self.line).await {
            Ok(0) | Err(_) => None,
            Ok(_) => {
                let text = String::from_utf8_lossy(&self.line).trim_end().to_string();
                self.line.clear();
                Some(text)
            }
        }
    }
}

async fn next_stderr(lines: &mut Option<StderrLines>) -> Option<String> {
    match lines {
        Some(l) => l.next_line().await,
        None => std::future::pending().await,
    }
}

/// Spawn the pump task for one transcoder. Cancelling `cancel` kills the
/// process; the task finishes once the process has been reaped.
pub fn spawn_pump(
    generation: u64,
    process: TranscodeProcess,
    cancel: CancellationToken,
    events: mpsc::Sender<ProcessEvent>,
) -> JoinHandle<()> {
    tokio::spawn(run_pump(generation, process, cancel, events))
}

async fn run_pump(
    generation: u64,
    process: TranscodeProcess,
    cancel: CancellationToken,
    events: mpsc::Sender<ProcessEvent>,
) {
    let TranscodeProcess {
        mut stdout,
        stderr,
        mut control,
    } = process;
    let mut stderr = stderr.map(StderrLines::new);
    let mut chunk = vec![0u8; READ_CHUNK_BYTES];
    let mut stdout_open = true;

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            read = stdout.read(&mut chunk), if stdout_open => match read {
                Ok(0) => {
                    stdout_open = false;
                    continue;
                }
                Ok(n) => ProcessEventKind::Stdout(Bytes::copy_from_slice(&chunk[..n])),
                Err(e) => {
                    tracing::warn!(generation, error = %e, "Transcoder stdout read failed");
                    stdout_open = false;
                    continue;
                }
            },
            line = next_stderr(&mut stderr), if stderr.is_some() => match line {
                Some(line) => ProcessEventKind::Stderr(line),
                None => {
                    stderr = None;
                    continue;
                }
            },
            status = control.wait(), if !stdout_open => {
                let code = status.unwrap_or_else(|e| {
                    tracing::warn!(generation, error = %e, "Failed to collect transcoder exit status");
                    None
                });
                if let Some(lines) = stderr.take() {
                    drain_stderr(lines, generation, &events, &cancel).await;
                }
                let _ = deliver(&events, &cancel, ProcessEvent {
                    generation,
                    kind: ProcessEventKind::Exited(code),
                })
                .await;
                return;
            }
        };

        if !deliver(&events, &cancel, ProcessEvent { generation, kind: event }).await {
            break;
        }
    }

    terminate(control.as_mut(), generation).await;
}

/// Forward stderr lines still pending after exit, until EOF or the drain
/// timeout.
async fn drain_stderr(
    mut lines: StderrLines,
    generation: u64,
    events: &mpsc::Sender<ProcessEvent>,
    cancel: &CancellationToken,
) {
    let drain = async {
        while let Some(line) = lines.next_line().await {
            let event = ProcessEvent {
                generation,
                kind: ProcessEventKind::Stderr(line),
            };
            if !deliver(events, cancel, event).await {
                break;
            }
        }
    };
    if tokio::time::timeout(STDERR_DRAIN_TIMEOUT, drain).await.is_err() {
        tracing::debug!(generation, "Transcoder stderr still open after exit");
    }
}

/// Send unless the stream was cancelled or the session is gone.
async fn deliver(
    events: &mpsc::Sender<ProcessEvent>,
    cancel: &CancellationToken,
    event: ProcessEvent,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = events.send(event) => sent.is_ok(),
    }
}

async fn terminate(control: &mut dyn ProcessControl, generation: u64) {
    let pid = control.id();
    if let Err(e) = control.start_kill() {
        // Already exited; nothing to signal.
        tracing::debug!(generation, ?pid, error = %e, "Transcoder kill skipped");
    }
    match tokio::time::timeout(REAP_TIMEOUT, control.wait()).await {
        Ok(Ok(code)) => tracing::debug!(generation, ?pid, ?code, "Transcoder reaped"),
        Ok(Err(e)) => tracing::warn!(generation, ?pid, error = %e, "Transcoder wait failed"),
        Err(_) => tracing::warn!(generation, ?pid, "Transcoder did not exit after kill"),
    }
}
