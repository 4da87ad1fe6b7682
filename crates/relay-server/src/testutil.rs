//! In-process transcoder doubles shared by unit tests.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_core::RelayError;
use tokio_util::sync::CancellationToken;

use crate::transcoder::{ProcessControl, TranscodeProcess, Transcoder};

/// Wrap `payload` in JPEG start/end markers.
pub fn jpeg(payload: &[u8]) -> Vec<u8> {
    let mut out = vec![0xFF, 0xD8];
    out.extend_from_slice(payload);
    out.extend_from_slice(&[0xFF, 0xD9]);
    out
}

#[derive(Default)]
struct Counters {
    live: AtomicUsize,
    killed: AtomicUsize,
}

/// Transcoder whose processes produce no output and run until killed.
pub struct FakeTranscoder {
    fail: bool,
    spawned: Mutex<Vec<String>>,
    counters: Arc<Counters>,
}

impl FakeTranscoder {
    pub fn held() -> Self {
        Self {
            fail: false,
            spawned: Mutex::new(Vec::new()),
            counters: Arc::default(),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::held()
        }
    }

    pub fn spawned(&self) -> Vec<String> {
        self.spawned.lock().clone()
    }

    /// Processes spawned and not yet released by their pump.
    pub fn live(&self) -> usize {
        self.counters.live.load(Ordering::SeqCst)
    }

    pub fn killed(&self) -> usize {
        self.counters.killed.load(Ordering::SeqCst)
    }
}

impl Transcoder for FakeTranscoder {
    fn spawn(&self, source: &str) -> Result<TranscodeProcess, RelayError> {
        if self.fail {
            return Err(RelayError::SpawnFailed("No such file or directory (os error 2)".into()));
        }
        self.spawned.lock().push(source.to_string());
        self.counters.live.fetch_add(1, Ordering::SeqCst);
        Ok(TranscodeProcess {
            stdout: Box::pin(tokio::io::empty()),
            stderr: None,
            control: Box::new(FakeControl {
                exit: CancellationToken::new(),
                counters: Arc::clone(&self.counters),
            }),
        })
    }
}

struct FakeControl {
    exit: CancellationToken,
    counters: Arc<Counters>,
}

#[async_trait]
impl ProcessControl for FakeControl {
    fn id(&self) -> Option<u32> {
        None
    }

    fn start_kill(&mut self) -> io::Result<()> {
        if !self.exit.is_cancelled() {
            self.counters.killed.fetch_add(1, Ordering::SeqCst);
            self.exit.cancel();
        }
        Ok(())
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        self.exit.cancelled().await;
        Ok(None)
    }
}

impl Drop for FakeControl {
    fn drop(&mut self) {
        self.counters.live.fetch_sub(1, Ordering::SeqCst);
    }
}
