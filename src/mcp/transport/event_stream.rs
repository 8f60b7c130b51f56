//! Incremental decoder for `text/event-stream` bodies.
//!
//! Bytes arrive in arbitrary chunks; lines are reassembled first, then
//! grouped into events at each blank line.

/// Splits a byte stream into lines, keeping blank lines because they
/// terminate events.
#[derive(Default)]
pub struct SseLineBuffer {
    buffer: Vec<u8>,
}

impl SseLineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        self.drain_lines(false)
    }

    pub fn finish(&mut self) -> Vec<String> {
        self.drain_lines(true)
    }

    fn drain_lines(&mut self, flush: bool) -> Vec<String> {
        let mut lines = Vec::new();
        let mut search_index = 0;

        while let Some(relative_pos) = memchr::memchr(b'\n', &self.buffer[search_index..]) {
            let newline_index = search_index + relative_pos;
            let mut line_end = newline_index;
            if line_end > search_index && self.buffer[line_end - 1] == b'\r' {
                line_end -= 1;
            }

            let line_bytes = &self.buffer[search_index..line_end];
            lines.push(String::from_utf8_lossy(line_bytes).into_owned());
            search_index = newline_index + 1;
        }

        if flush {
            let rest = &self.buffer[search_index..];
            if !rest.is_empty() {
                let text = String::from_utf8_lossy(rest);
                lines.push(text.trim_end_matches('\r').to_string());
            }
            self.buffer.clear();
        } else if search_index > 0 {
            self.buffer.drain(..search_index);
        }

        lines
    }
}

/// One dispatched event. `event` defaults to `message` when the server sends
/// only `data:` lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
    pub id: Option<String>,
}

impl SseEvent {
    pub fn is(&self, event: &str) -> bool {
        self.event.eq_ignore_ascii_case(event)
    }
}

pub const DEFAULT_EVENT_TYPE: &str = "message";

#[derive(Default)]
pub struct SseEventDecoder {
    lines: SseLineBuffer,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
}

impl SseEventDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let lines = self.lines.push(chunk);
        self.feed_lines(lines)
    }

    /// Flushes a trailing event that was not terminated by a blank line.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let lines = self.lines.finish();
        let mut events = self.feed_lines(lines);
        events.extend(self.dispatch());
        events
    }

    fn feed_lines(&mut self, lines: Vec<String>) -> Vec<SseEvent> {
        lines
            .iter()
            .filter_map(|line| self.feed_line(line))
            .collect()
    }

    fn feed_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.trim().to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        let id = self.id.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent {
            event: event
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| DEFAULT_EVENT_TYPE.to_string()),
            data,
            id,
        })
    }
}

pub fn is_event_stream_content_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(str::trim)
        .is_some_and(|value| value.eq_ignore_ascii_case("text/event-stream"))
}
