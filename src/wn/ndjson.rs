//! Newline-delimited JSON stream parsing.
//!
//! Several transports in this runtime speak NDJSON: the Ollama chat stream,
//! the RPC channel on stdin/stdout, and the sub-agent worker protocol.  This
//! module holds the byte-stream flavour used by streaming HTTP providers: it
//! buffers partial lines across network chunk boundaries and yields one
//! `serde_json::Value` per complete line, skipping blanks.

use async_stream::stream;
use futures_util::stream::{Stream, StreamExt};

/// Convert a stream of byte chunks into a stream of parsed JSON lines.
///
/// Malformed lines and transport failures are yielded as `Err(String)` so the
/// consumer decides whether to tolerate or abort; the stream itself keeps
/// going after a bad line but ends on a transport error.
pub fn json_lines<B, E, S>(bytes: S) -> impl Stream<Item = Result<serde_json::Value, String>>
where
    B: AsRef<[u8]>,
    E: std::fmt::Display,
    S: Stream<Item = Result<B, E>>,
{
    stream! {
        // Byte buffering keeps multibyte characters intact when they span
        // network chunk boundaries.
        let mut buffer: Vec<u8> = Vec::new();
        futures_util::pin_mut!(bytes);

        while let Some(chunk) = bytes.next().await {
            match chunk {
                Ok(chunk) => {
                    buffer.extend_from_slice(chunk.as_ref());
                    while let Some(newline) = buffer.iter().position(|&b| b == b'\n') {
                        let raw: Vec<u8> = buffer.drain(..=newline).collect();
                        let line = String::from_utf8_lossy(&raw);
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<serde_json::Value>(line) {
                            Ok(value) => yield Ok(value),
                            Err(err) => yield Err(format!("invalid JSON line: {}", err)),
                        }
                    }
                }
                Err(err) => {
                    yield Err(format!("stream error: {}", err));
                    return;
                }
            }
        }

        // Trailing line without a final newline.
        let rest = String::from_utf8_lossy(&buffer);
        let rest = rest.trim();
        if !rest.is_empty() {
            match serde_json::from_str::<serde_json::Value>(rest) {
                Ok(value) => yield Ok(value),
                Err(err) => yield Err(format!("invalid JSON line: {}", err)),
            }
        }
    }
}
