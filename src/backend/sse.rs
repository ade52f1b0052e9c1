//! Server-Sent Events decoding for OpenAI-compatible streams.
//!
//! Buffers raw bytes across TCP chunk boundaries and decodes only complete
//! lines, so a multi-byte character split between chunks survives intact.
//! Skips keep-alives and `event:` lines,
//! and reports the `data: [DONE]` terminator explicitly so callers can tell
//! a finished stream from a dropped connection.

use serde_json::Value;

/// One decoded SSE item.
#[derive(Debug, Clone, PartialEq)]
pub enum SseEvent {
    /// A JSON payload from a `data:` line.
    Data(Value),
    /// The `data: [DONE]` end marker.
    Done,
}

/// Incremental SSE decoder.
///
/// # Example
///
/// ```
/// use llm_runnables::backend::sse::{SseDecoder, SseEvent};
///
/// let mut decoder = SseDecoder::new();
/// let events = decoder.decode(b"data: {\"x\":1}\n\ndata: [DONE]\n\n");
/// assert_eq!(events.len(), 2);
/// assert_eq!(events[1], SseEvent::Done);
/// ```
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes and return every complete event they finish.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            events.extend(parse_line(&String::from_utf8_lossy(&line)));
        }
        events
    }

    /// Decode whatever remains after the connection closed.
    pub fn flush(&mut self) -> Vec<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        String::from_utf8_lossy(&rest)
            .lines()
            .filter_map(parse_line)
            .collect()
    }
}

fn parse_line(line: &str) -> Option<SseEvent> {
    let data = line.trim().strip_prefix("data:")?.trim();
    if data == "[DONE]" {
        return Some(SseEvent::Done);
    }
    serde_json::from_str::<Value>(data).ok().map(SseEvent::Data)
}
