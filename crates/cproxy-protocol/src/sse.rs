use bytes::Bytes;

/// One parsed server-sent event: an optional `event:` name and the joined
/// `data:` payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    /// Serialise back to wire framing. Events without a name use the
    /// data-only form; embedded newlines become one `data:` line each.
    pub fn to_frame(&self) -> String {
        let mut out = String::new();
        if let Some(name) = &self.event {
            out.push_str("event: ");
            out.push_str(name);
            out.push('\n');
        }
        for line in self.data.split('\n') {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        out
    }
}

/// Incremental SSE parser fed from arbitrary byte chunks.
///
/// A multi-byte UTF-8 sequence split across two chunks is held back until the
/// remainder arrives, so chunk boundaries never corrupt the decoded text.
#[derive(Debug, Default)]
pub struct SseParser {
    pending: Vec<u8>,
    buffer: String,
    event: Option<String>,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, chunk: &Bytes) -> Vec<SseEvent> {
        self.pending.extend_from_slice(chunk);
        let mut text = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    text.push_str(valid);
                    self.pending.clear();
                    break;
                }
                Err(err) => {
                    let valid_up_to = err.valid_up_to();
                    text.push_str(&String::from_utf8_lossy(&self.pending[..valid_up_to]));
                    match err.error_len() {
                        // Partial sequence at the buffer edge: keep it for the
                        // next chunk.
                        None => {
                            self.pending.drain(..valid_up_to);
                            break;
                        }
                        // Invalid bytes: replace and keep decoding.
                        Some(len) => {
                            text.push('\u{FFFD}');
                            self.pending.drain(..valid_up_to + len);
                        }
                    }
                }
            }
        }
        self.push_str(&text)
    }

    pub fn push_str(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let mut line = self.buffer[..pos].to_string();
            self.buffer.drain(..=pos);

            if line.ends_with('\r') {
                line.pop();
            }

            if line.is_empty() {
                self.finish_event(&mut events);
                continue;
            }

            if line.starts_with(':') {
                continue;
            }

            if let Some(value) = line.strip_prefix("event:") {
                let value = value.trim_start();
                self.event = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
                continue;
            }

            if let Some(value) = line.strip_prefix("data:") {
                self.data_lines.push(value.trim_start().to_string());
                continue;
            }
            if line == "data" {
                self.data_lines.push(String::new());
            }
        }

        events
    }

    /// Flush whatever is buffered when the upstream closes without a trailing
    /// blank line.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if !self.buffer.is_empty() {
            let mut line = std::mem::take(&mut self.buffer);
            if line.ends_with('\r') {
                line.pop();
            }
            if let Some(value) = line.strip_prefix("event:") {
                let value = value.trim_start();
                self.event = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            } else if let Some(value) = line.strip_prefix("data:") {
                self.data_lines.push(value.trim_start().to_string());
            }
        }
        self.finish_event(&mut events);
        events
    }

    fn finish_event(&mut self, events: &mut Vec<SseEvent>) {
        if self.event.is_none() && self.data_lines.is_empty() {
            return;
        }
        let data = self.data_lines.join("\n");
        events.push(SseEvent {
            event: self.event.take(),
            data,
        });
        self.data_lines.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_named_events() {
        let mut parser = SseParser::new();
        let events =
            parser.push_str("event: message_start\ndata: {\"type\":\"message_start\"}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("message_start"));
        assert_eq!(events[0].data, "{\"type\":\"message_start\"}");
    }

    #[test]
    fn event_split_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.push_str("event: ping\nda").is_empty());
        let events = parser.push_str("ta: {}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("ping"));
        assert_eq!(events[0].data, "{}");
    }

    #[test]
    fn multibyte_utf8_split_across_chunks() {
        let mut parser = SseParser::new();
        let full = "data: {\"text\":\"héllo\"}\n\n".as_bytes();
        // Split in the middle of the two-byte é sequence.
        let cut = full.iter().position(|b| *b == 0xc3).unwrap() + 1;
        assert!(parser.push_bytes(&Bytes::copy_from_slice(&full[..cut])).is_empty());
        let events = parser.push_bytes(&Bytes::copy_from_slice(&full[cut..]));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"text\":\"héllo\"}");
    }

    #[test]
    fn multiline_data_joined() {
        let mut parser = SseParser::new();
        let events = parser.push_str("data: a\ndata: b\n\n");
        assert_eq!(events[0].data, "a\nb");
    }

    #[test]
    fn finish_flushes_unterminated_event() {
        let mut parser = SseParser::new();
        assert!(parser.push_str("data: tail").is_empty());
        let events = parser.finish();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "tail");
    }

    #[test]
    fn frame_round_trip() {
        let event = SseEvent {
            event: Some("message_stop".to_string()),
            data: "{\"type\":\"message_stop\"}".to_string(),
        };
        assert_eq!(
            event.to_frame(),
            "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n"
        );
    }
}
