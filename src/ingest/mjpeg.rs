//! MJPEG frame extraction.
//!
//! The upstream is treated as an unstructured byte stream: frames are found by
//! JPEG SOI/EOI markers, never by multipart boundaries or declared lengths.
//!
//! - `MjpegParser`: pure byte accumulator, chunk in, complete frames out.
//! - `FrameExtractor`: drives a parser from a `Read` source and reports stalls.

use std::collections::VecDeque;
use std::io::{ErrorKind, Read};
use std::time::{Duration, Instant};

use crate::error::RelayError;
use crate::frame::{Frame, EOI, SOI};

/// Hard cap on buffered upstream bytes.
pub const MAX_BUFFER_BYTES: usize = 1024 * 1024;

const READ_CHUNK_BYTES: usize = 8192;

/// Incremental SOI/EOI scanner.
pub struct MjpegParser {
    buffer: Vec<u8>,
    max_buffer: usize,
    /// Where to resume the EOI search when the buffer starts with SOI.
    eoi_scan_from: usize,
}

impl MjpegParser {
    pub fn new() -> Self {
        Self::with_max_buffer(MAX_BUFFER_BYTES)
    }

    pub fn with_max_buffer(max_buffer: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(64 * 1024),
            max_buffer: max_buffer.max(4),
            eoi_scan_from: 2,
        }
    }

    /// Bytes currently held while waiting for a complete frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Append a chunk and return every frame it completes, in stream order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        loop {
            let Some(start) = find_marker(&self.buffer, SOI, 0) else {
                if self.buffer.len() > self.max_buffer {
                    self.keep_recent();
                }
                self.eoi_scan_from = 2;
                break;
            };
            if start > 0 {
                // Resynchronise: anything before SOI is a partial or corrupt frame.
                self.buffer.drain(..start);
                self.eoi_scan_from = 2;
            }

            match find_marker(&self.buffer, EOI, self.eoi_scan_from) {
                Some(eoi) => {
                    let end = eoi + EOI.len();
                    frames.push(Frame::from(&self.buffer[..end]));
                    self.buffer.drain(..end);
                    self.eoi_scan_from = 2;
                }
                None => {
                    if self.buffer.len() > self.max_buffer {
                        self.keep_recent();
                        self.eoi_scan_from = 2;
                    } else {
                        // A marker may straddle the next chunk boundary.
                        self.eoi_scan_from = self.buffer.len().saturating_sub(1).max(2);
                    }
                    break;
                }
            }
        }
        frames
    }

    fn keep_recent(&mut self) {
        let keep = self.max_buffer / 2;
        let drop_len = self.buffer.len().saturating_sub(keep);
        log::debug!(
            "mjpeg buffer over {} bytes without a frame; dropping {} bytes",
            self.max_buffer,
            drop_len
        );
        self.buffer.drain(..drop_len);
    }
}

impl Default for MjpegParser {
    fn default() -> Self {
        Self::new()
    }
}

fn find_marker(buffer: &[u8], marker: [u8; 2], from: usize) -> Option<usize> {
    if from >= buffer.len() {
        return None;
    }
    buffer[from..]
        .windows(2)
        .position(|w| w == marker)
        .map(|pos| pos + from)
}

/// Outcome of one extraction step.
#[derive(Debug)]
pub enum Extracted {
    /// A complete frame; the upstream is healthy.
    Frame(Frame),
    /// Connection still open, but nothing usable arrived within the stall timeout.
    Stalled,
    /// The upstream failed or ended.
    Failed(RelayError),
}

/// Pulls frames out of an upstream byte source.
pub struct FrameExtractor<R> {
    reader: R,
    parser: MjpegParser,
    ready: VecDeque<Frame>,
    stall_timeout: Duration,
    last_progress: Instant,
    chunk: Vec<u8>,
    frames_extracted: u64,
}

impl<R: Read> FrameExtractor<R> {
    pub fn new(reader: R, stall_timeout: Duration) -> Self {
        Self::with_parser(reader, MjpegParser::new(), stall_timeout)
    }

    pub fn with_parser(reader: R, parser: MjpegParser, stall_timeout: Duration) -> Self {
        Self {
            reader,
            parser,
            ready: VecDeque::new(),
            stall_timeout,
            last_progress: Instant::now(),
            chunk: vec![0u8; READ_CHUNK_BYTES],
            frames_extracted: 0,
        }
    }

    /// Reset the stall timer. Called after a frame has been delivered downstream.
    pub fn mark_progress(&mut self) {
        self.last_progress = Instant::now();
    }

    pub fn frames_extracted(&self) -> u64 {
        self.frames_extracted
    }

    /// Block until the next frame, a stall, or an upstream failure.
    pub fn next_frame(&mut self) -> Extracted {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                self.frames_extracted += 1;
                return Extracted::Frame(frame);
            }
            if self.last_progress.elapsed() >= self.stall_timeout {
                return Extracted::Stalled;
            }
            match self.reader.read(&mut self.chunk) {
                Ok(0) => {
                    return Extracted::Failed(RelayError::UpstreamUnavailable(
                        "upstream closed the stream".to_string(),
                    ))
                }
                Ok(read) => {
                    let frames = self.parser.push(&self.chunk[..read]);
                    self.ready.extend(frames);
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if matches!(err.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                    return Extracted::Stalled
                }
                Err(err) => {
                    return Extracted::Failed(RelayError::UpstreamUnavailable(format!(
                        "read mjpeg chunk: {}",
                        err
                    )))
                }
            }
        }
    }
}
