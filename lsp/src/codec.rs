//! JSON-RPC framing codec for LSP communication.
//!
//! LSP uses `Content-Length: N\r\n\r\n{json}` framing over stdin/stdout.
//! [`FrameDecoder`] reassembles frames from arbitrary byte chunks,
//! [`FrameReader`] drives it from an async reader, and [`FrameWriter`]
//! emits frames.
//!
//! Decoding is resilient: a malformed header discards the offending bytes and
//! framing resumes at the next plausible header, while a body that fails to
//! parse as JSON is reported and skipped without disturbing the bytes that
//! follow it.

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame size (16 MiB) to prevent unbounded memory allocation.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Header bytes tolerated without a terminator before resynchronizing.
const MAX_HEADER_BYTES: usize = 8 * 1024;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

const CONTENT_LENGTH: &[u8] = b"content-length";

const READ_CHUNK_BYTES: usize = 8 * 1024;

/// A recoverable decoding failure. The stream stays usable after any of these.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame header ({reason}); discarded {discarded} bytes")]
    MalformedHeader { reason: String, discarded: usize },
    #[error("Content-Length {length} exceeds maximum {MAX_FRAME_BYTES}; body skipped")]
    Oversized { length: usize },
    #[error("frame body is not valid JSON: {source}")]
    InvalidBody {
        #[source]
        source: serde_json::Error,
    },
}

/// Incremental decoder for `Content-Length` framed messages.
///
/// Feed bytes with [`push`](Self::push) in whatever fragments they arrive,
/// then drain complete frames with [`next_frame`](Self::next_frame). Trailing
/// partial bytes are retained for the next chunk.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    /// Bytes of an oversized body still to be thrown away.
    skip: usize,
}

impl FrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Number of bytes buffered but not yet decoded.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Extract the next complete frame.
    ///
    /// Returns `None` when more bytes are needed.
    pub fn next_frame(&mut self) -> Option<Result<serde_json::Value, FrameError>> {
        if self.skip > 0 {
            let n = self.skip.min(self.buf.len());
            self.buf.drain(..n);
            self.skip -= n;
            if self.skip > 0 {
                return None;
            }
        }

        let Some(header_end) = find(&self.buf, HEADER_TERMINATOR) else {
            if self.buf.len() > MAX_HEADER_BYTES {
                // Keep a tail that might be the start of a split "Content-Length".
                let limit = self.buf.len() - (CONTENT_LENGTH.len() - 1);
                let discarded = self.resync_point(limit);
                self.buf.drain(..discarded);
                return Some(Err(FrameError::MalformedHeader {
                    reason: format!("no header terminator within {MAX_HEADER_BYTES} bytes"),
                    discarded,
                }));
            }
            return None;
        };
        let body_start = header_end + HEADER_TERMINATOR.len();

        match parse_content_length(&self.buf[..header_end]) {
            Ok(length) if length > MAX_FRAME_BYTES => {
                self.buf.drain(..body_start);
                self.skip = length;
                Some(Err(FrameError::Oversized { length }))
            }
            Ok(length) => {
                let frame_end = body_start + length;
                if self.buf.len() < frame_end {
                    return None;
                }
                let parsed = serde_json::from_slice(&self.buf[body_start..frame_end]);
                self.buf.drain(..frame_end);
                Some(parsed.map_err(|source| FrameError::InvalidBody { source }))
            }
            Err(reason) => {
                let discarded = self.resync_point(body_start);
                self.buf.drain(..discarded);
                Some(Err(FrameError::MalformedHeader { reason, discarded }))
            }
        }
    }

    /// Where framing should resume after garbage at the front of the buffer:
    /// the next `Content-Length` occurrence past offset 0, else `limit`.
    fn resync_point(&self, limit: usize) -> usize {
        let window = &self.buf[..limit.min(self.buf.len())];
        window
            .windows(CONTENT_LENGTH.len())
            .skip(1)
            .position(|w| w.eq_ignore_ascii_case(CONTENT_LENGTH))
            .map_or(limit, |pos| pos + 1)
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Parse the header block (without the blank-line terminator).
fn parse_content_length(header: &[u8]) -> Result<usize, String> {
    let text = std::str::from_utf8(header).map_err(|_| "header is not UTF-8".to_string())?;
    let mut content_length = None;
    for line in text.split("\r\n") {
        // Header names are case-insensitive.
        // Other headers (e.g. Content-Type) are ignored.
        if let Some((key, value)) = line.split_once(':')
            && key.trim().eq_ignore_ascii_case("Content-Length")
        {
            let len = value
                .trim()
                .parse::<usize>()
                .map_err(|e| format!("invalid Content-Length value {:?}: {e}", value.trim()))?;
            content_length = Some(len);
        }
    }
    content_length.ok_or_else(|| "missing Content-Length header".to_string())
}

/// What the reader observed next on the stream.
#[derive(Debug)]
pub enum ReadEvent {
    Frame(serde_json::Value),
    /// A recoverable decode failure; keep reading.
    Malformed(FrameError),
    /// The peer closed the stream.
    Closed,
}

/// Reads JSON-RPC frames from an async reader.
pub struct FrameReader<R> {
    reader: R,
    decoder: FrameDecoder,
    chunk: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::new(),
            chunk: vec![0u8; READ_CHUNK_BYTES],
        }
    }

    /// Read until the next frame, decode failure, or EOF.
    ///
    /// I/O errors are fatal to the stream and returned as `Err`.
    pub async fn next_event(&mut self) -> std::io::Result<ReadEvent> {
        loop {
            match self.decoder.next_frame() {
                Some(Ok(frame)) => return Ok(ReadEvent::Frame(frame)),
                Some(Err(e)) => return Ok(ReadEvent::Malformed(e)),
                None => {}
            }

            let n = self.reader.read(&mut self.chunk).await?;
            if n == 0 {
                if self.decoder.buffered() > 0 {
                    tracing::debug!(
                        bytes = self.decoder.buffered(),
                        "Stream closed with a partial frame buffered"
                    );
                }
                return Ok(ReadEvent::Closed);
            }
            self.decoder.push(&self.chunk[..n]);
        }
    }
}

/// Serialize a message into a complete frame (header and body).
pub fn encode_frame(msg: &serde_json::Value) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(msg).context("serializing JSON-RPC frame")?;
    let mut frame = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Writes JSON-RPC frames to an async writer.
///
/// Each frame goes out in a single `write_all` so header and body are never
/// interleaved with another frame.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write a JSON-RPC frame with `Content-Length` header.
    pub async fn write_frame(&mut self, msg: &serde_json::Value) -> Result<()> {
        let frame = encode_frame(msg)?;
        self.writer
            .write_all(&frame)
            .await
            .context("writing frame")?;
        self.writer.flush().await.context("flushing frame")?;
        Ok(())
    }

    /// Close the underlying writer (EOF for the peer).
    pub async fn close(&mut self) -> Result<()> {
        self.writer.shutdown().await.context("closing frame writer")
    }
}
