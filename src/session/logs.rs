//! Command log storage.
//!
//! `output.log` holds stdout and stderr chunks, each preceded by a 3-byte
//! stream marker. Readers either strip the markers (combined output) or
//! hand the framed bytes to a client that demultiplexes them itself.

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

pub const STDOUT_PREFIX: [u8; 3] = [0x01, 0x01, 0x01];
pub const STDERR_PREFIX: [u8; 3] = [0x02, 0x02, 0x02];

const MARKER_LEN: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    pub fn prefix(self) -> &'static [u8; 3] {
        match self {
            Stream::Stdout => &STDOUT_PREFIX,
            Stream::Stderr => &STDERR_PREFIX,
        }
    }

    fn from_marker_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Stream::Stdout),
            0x02 => Some(Stream::Stderr),
            _ => None,
        }
    }
}

/// Frame one chunk for `output.log`.
pub fn frame(stream: Stream, chunk: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(MARKER_LEN + chunk.len());
    framed.extend_from_slice(stream.prefix());
    framed.extend_from_slice(chunk);
    framed
}

/// Incremental marker parser. Markers may be split across chunks, so up to
/// two bytes of a candidate marker are held back between calls.
#[derive(Debug)]
pub struct LogDecoder {
    current: Stream,
    pending: Vec<u8>,
}

impl Default for LogDecoder {
    fn default() -> Self {
        Self {
            current: Stream::Stdout,
            pending: Vec::with_capacity(MARKER_LEN),
        }
    }
}

impl LogDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a chunk into per-stream segments.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<(Stream, Vec<u8>)> {
        let mut segments: Vec<(Stream, Vec<u8>)> = Vec::new();
        for &byte in chunk {
            if let Some(&first) = self.pending.first() {
                if byte == first {
                    self.pending.push(byte);
                    if self.pending.len() == MARKER_LEN {
                        self.pending.clear();
                        if let Some(stream) = Stream::from_marker_byte(first) {
                            self.current = stream;
                        }
                    }
                    continue;
                }
                let held = std::mem::take(&mut self.pending);
                push_bytes(&mut segments, self.current, &held);
            }

            if Stream::from_marker_byte(byte).is_some() {
                self.pending.push(byte);
            } else {
                push_bytes(&mut segments, self.current, &[byte]);
            }
        }
        segments
    }

    /// Flush held-back bytes that never completed a marker.
    pub fn finish(&mut self) -> Vec<(Stream, Vec<u8>)> {
        let mut segments = Vec::new();
        let held = std::mem::take(&mut self.pending);
        push_bytes(&mut segments, self.current, &held);
        segments
    }

    /// Decode and drop the stream distinction.
    pub fn strip(&mut self, chunk: &[u8]) -> Vec<u8> {
        self.decode(chunk).into_iter().flat_map(|(_, b)| b).collect()
    }
}

fn push_bytes(segments: &mut Vec<(Stream, Vec<u8>)>, stream: Stream, bytes: &[u8]) {
    if bytes.is_empty() {
        return;
    }
    match segments.last_mut() {
        Some((last, buf)) if *last == stream => buf.extend_from_slice(bytes),
        _ => segments.push((stream, bytes.to_vec())),
    }
}

/// Remove all stream markers from a complete log.
pub fn strip_markers(log: &[u8]) -> Vec<u8> {
    let mut decoder = LogDecoder::new();
    let mut out = decoder.strip(log);
    out.extend(decoder.finish().into_iter().flat_map(|(_, b)| b));
    out
}

/// Split a complete log into (stdout, stderr).
pub fn demux(log: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let mut decoder = LogDecoder::new();
    let mut segments = decoder.decode(log);
    segments.extend(decoder.finish());

    let (mut stdout, mut stderr) = (Vec::new(), Vec::new());
    for (stream, bytes) in segments {
        match stream {
            Stream::Stdout => stdout.extend(bytes),
            Stream::Stderr => stderr.extend(bytes),
        }
    }
    (stdout, stderr)
}

/// Whole log file. A log that does not exist yet reads as empty.
pub async fn read_log(path: &Path) -> io::Result<Vec<u8>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

/// Reads bytes appended to a log since the previous call.
#[derive(Debug)]
pub struct LogFollower {
    path: PathBuf,
    offset: u64,
}

impl LogFollower {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: 0,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// New bytes, possibly empty. A missing file is treated as empty.
    pub async fn read_new(&mut self) -> io::Result<Vec<u8>> {
        let mut file = match File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;
        self.offset += buf.len() as u64;
        Ok(buf)
    }
}
