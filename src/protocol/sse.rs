//! Incremental Server-Sent-Events parsing and formatting
//!
//! Upstream chunk boundaries do not align with event boundaries; the parser
//! buffers partial lines across `feed` calls so events are only surfaced
//! once complete.

use bytes::BytesMut;

/// One parsed SSE event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event type from an `event:` line, if present
    pub event_type: Option<String>,
    /// Event payload from the `data:` line
    pub data: String,
    /// The original wire text of this event, including terminators
    pub raw: String,
}

impl SseEvent {
    /// Check if this is the OpenAI-style done marker
    pub fn is_done(&self) -> bool {
        self.data == "[DONE]"
    }
}

/// Incremental SSE parser
pub struct SseParser {
    buffer: BytesMut,
    event_type: Option<String>,
    raw: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
            event_type: None,
            raw: String::new(),
        }
    }

    /// Feed incoming bytes and extract complete SSE events
    pub fn feed(&mut self, data: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(data);
        let mut events = Vec::new();

        loop {
            let line_end = match self.buffer.iter().position(|&b| b == b'\n') {
                Some(pos) => pos,
                None => break,
            };

            let line_bytes = self.buffer.split_to(line_end + 1);
            let line_raw = String::from_utf8_lossy(&line_bytes).into_owned();
            let line = line_raw.trim_end_matches(['\r', '\n']);
            self.raw.push_str(&line_raw);

            if line.is_empty() {
                // Event boundary; raw text without a data line is dropped
                self.raw.clear();
                continue;
            }

            if let Some(rest) = line.strip_prefix("event:") {
                self.event_type = Some(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("data:") {
                let mut raw = std::mem::take(&mut self.raw);
                // Terminate the raw form so it can be replayed verbatim
                if !raw.ends_with("\n\n") {
                    raw.push('\n');
                }
                events.push(SseEvent {
                    event_type: self.event_type.take(),
                    data: rest.trim().to_string(),
                    raw,
                });
            } else if line.starts_with(':') {
                // Comment / keep-alive, ignore
                self.raw.clear();
            }
        }

        events
    }

    /// Reset parser state
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.event_type = None;
        self.raw.clear();
    }
}

impl Default for SseParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Format an SSE data line
pub fn format_data(data: &str) -> String {
    format!("data: {}\n\n", data)
}

/// Format an SSE event with an explicit type
pub fn format_event(event_type: &str, data: &str) -> String {
    format!("event: {}\ndata: {}\n\n", event_type, data)
}

/// The OpenAI-style stream terminator
pub fn format_done() -> &'static str {
    "data: [DONE]\n\n"
}
