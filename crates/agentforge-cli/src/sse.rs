//! Incremental parser for `text/event-stream` bodies.
//!
//! Chunks from the network may split lines (or UTF-8 sequences) anywhere;
//! [`SseParser::push`] buffers the tail and yields complete messages only.

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseMessage {
    /// `event:` field, `message` when absent.
    pub event: String,
    pub data: String,
}

#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every message it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseMessage> {
        self.buffer.extend_from_slice(chunk);
        let mut messages = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            let line = line.strip_suffix('\r').unwrap_or(&line);
            if let Some(message) = self.line(line) {
                messages.push(message);
            }
        }
        messages
    }

    fn line(&mut self, line: &str) -> Option<SseMessage> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            // Comment, used for keep-alives.
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseMessage> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseMessage {
            event: event.unwrap_or_else(|| "message".to_string()),
            data,
        })
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_named_event() {
        let mut parser = SseParser::new();
        let messages = parser.push(b"event: run_started\ndata: {\"seq\":1}\n\n");
        assert_eq!(
            messages,
            vec![SseMessage {
                event: "run_started".into(),
                data: "{\"seq\":1}".into(),
            }]
        );
    }

    #[test]
    fn handles_split_chunks_and_crlf() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"event: fea").is_empty());
        assert!(parser.push(b"ture_claimed\r\ndata: {\"a\"").is_empty());
        let messages = parser.push(b":1}\r\n\r\n");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].event, "feature_claimed");
        assert_eq!(messages[0].data, "{\"a\":1}");
    }

    #[test]
    fn ignores_keep_alive_comments() {
        let mut parser = SseParser::new();
        assert!(parser.push(b": keep-alive\n\n").is_empty());
        let messages = parser.push(b"data: x\ndata: y\n\n");
        assert_eq!(messages[0].event, "message");
        assert_eq!(messages[0].data, "x\ny");
    }
}
