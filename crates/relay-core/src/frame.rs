//! Incremental JPEG frame extraction from a motion-JPEG byte stream.
//!
//! The transcoder writes back-to-back JPEG images to a pipe. Chunks read from
//! that pipe are not aligned with image boundaries, so bytes are accumulated
//! and cut at SOI (`FF D8`) / EOI (`FF D9`) markers. Image content is never
//! inspected: whatever lies between a start marker and the next end marker is
//! one frame.

use bytes::{Buf, Bytes, BytesMut};

use crate::errors::RelayError;

/// JPEG start-of-image marker.
pub const JPEG_START: [u8; 2] = [0xFF, 0xD8];
/// JPEG end-of-image marker.
pub const JPEG_END: [u8; 2] = [0xFF, 0xD9];

/// Default cap on bytes held while waiting for an end marker.
pub const DEFAULT_MAX_BUFFER: usize = 8 * 1024 * 1024;

/// Per-session frame splitter.
#[derive(Debug)]
pub struct FrameExtractor {
    buf: BytesMut,
    /// `buf` begins with a start marker whose end marker has not been seen.
    in_frame: bool,
    /// Where the next end-marker search resumes, relative to `buf`.
    end_scan_from: usize,
    max_buffer: Option<usize>,
}

impl FrameExtractor {
    pub fn new(max_buffer: Option<usize>) -> Self {
        Self {
            buf: BytesMut::new(),
            in_frame: false,
            end_scan_from: 0,
            max_buffer,
        }
    }

    /// Append a chunk and return every frame it completes, in stream order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            if !self.in_frame {
                match find_marker(&self.buf, &JPEG_START, 0) {
                    Some(start) => {
                        self.buf.advance(start);
                        self.in_frame = true;
                        self.end_scan_from = JPEG_START.len();
                    }
                    None => {
                        // A trailing 0xFF may be half of a start marker.
                        let keep = usize::from(self.buf.last() == Some(&JPEG_START[0]));
                        let discard = self.buf.len() - keep;
                        self.buf.advance(discard);
                        break;
                    }
                }
            }

            match find_marker(&self.buf, &JPEG_END, self.end_scan_from) {
                Some(end) => {
                    let frame = self.buf.split_to(end + JPEG_END.len()).freeze();
                    frames.push(frame);
                    self.in_frame = false;
                }
                None => {
                    self.end_scan_from = self
                        .buf
                        .len()
                        .saturating_sub(JPEG_END.len() - 1)
                        .max(JPEG_START.len());
                    break;
                }
            }
        }

        frames
    }

    /// Fail if the bytes retained for an unfinished frame exceed the cap.
    /// The buffer is cleared when the cap is exceeded.
    pub fn enforce_limit(&mut self) -> Result<(), RelayError> {
        match self.max_buffer {
            Some(limit) if self.buf.len() > limit => {
                self.clear();
                Err(RelayError::BufferOverflow { limit })
            }
            _ => Ok(()),
        }
    }

    /// Bytes currently retained.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drop all retained bytes.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.in_frame = false;
        self.end_scan_from = 0;
    }
}

impl Default for FrameExtractor {
    fn default() -> Self {
        Self::new(Some(DEFAULT_MAX_BUFFER))
    }
}

fn find_marker(haystack: &[u8], marker: &[u8; 2], from: usize) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(marker.len())
        .position(|w| w == marker)
        .map(|pos| pos + from)
}
