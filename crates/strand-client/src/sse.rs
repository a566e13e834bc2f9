//! Generic server-sent-event parser.
//!
//! Splits a byte stream into named events with `{event, id, data}` fields.
//! Field framing follows the SSE wire format: one field per line, records
//! separated by a blank line, multi-`data:` payloads joined with `\n`,
//! comment lines (leading `:`) ignored, `\r\n` tolerated. Byte fragments
//! may split anywhere, including inside a multi-byte character; lines are
//! framed at the byte level before decoding, same as the row reassembler.

use bytes::BytesMut;

use strand_core::event::StreamEvent;

/// Incremental SSE parser. Feed fragments, collect completed events.
#[derive(Debug, Default)]
pub struct SseParser {
    buf: BytesMut,
    event_name: Option<String>,
    data_lines: Vec<String>,
    /// Last-seen `id:` value; persists across events per the SSE spec.
    last_id: Option<String>,
    /// Last `retry:` hint from the server, milliseconds.
    pub retry_hint: Option<u64>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fragment; returns every event completed by it, in order.
    pub fn push(&mut self, fragment: &[u8]) -> Vec<StreamEvent> {
        self.buf.extend_from_slice(fragment);

        let mut events = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line = self.buf.split_to(pos + 1);
            line.truncate(pos);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }
            // Non-UTF-8 lines cannot name a meaningful field; skip them.
            let Ok(line) = std::str::from_utf8(&line) else {
                tracing::warn!("non-UTF-8 SSE line skipped");
                continue;
            };
            if line.is_empty() {
                if let Some(event) = self.flush() {
                    events.push(event);
                }
                continue;
            }
            self.field(line);
        }
        events
    }

    /// Dispatch the record accumulated so far, if it carries any data.
    fn flush(&mut self) -> Option<StreamEvent> {
        let name = self.event_name.take();
        if self.data_lines.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data_lines).join("\n");
        Some(StreamEvent {
            name: name.unwrap_or_else(|| "message".to_string()),
            id: self.last_id.clone(),
            data,
        })
    }

    fn field(&mut self, line: &str) {
        if line.starts_with(':') {
            return; // comment / keep-alive
        }
        let (name, value) = match line.split_once(':') {
            Some((n, v)) => (n, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match name {
            "event" => self.event_name = Some(value.to_string()),
            "data" => self.data_lines.push(value.to_string()),
            "id" => self.last_id = Some(value.to_string()),
            "retry" => {
                if let Ok(ms) = value.parse() {
                    self.retry_hint = Some(ms);
                }
            }
            other => tracing::trace!(field = other, "unknown SSE field ignored"),
        }
    }
}
