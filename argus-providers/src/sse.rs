//! Server-Sent Events parsing shared by the provider clients.

use futures::{Stream, StreamExt};

use argus_types::StreamFault;

/// One parsed SSE event: the optional `event:` name and the joined
/// `data:` payload.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Accumulates SSE lines into events. Lines arrive split across
/// arbitrary byte chunk boundaries; the parser buffers partial lines.
#[derive(Debug, Default)]
pub(crate) struct SseLineParser {
    line_buf: String,
    current_event: Option<String>,
    current_data: String,
}

impl SseLineParser {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of UTF-8 text; returns the events completed by it.
    pub(crate) fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        let mut events = Vec::new();
        self.line_buf.push_str(chunk);
        while let Some(newline) = self.line_buf.find('\n') {
            let line = self.line_buf[..newline].trim_end_matches('\r').to_string();
            self.line_buf.drain(..=newline);
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Flush any event accumulated when the stream ends without a
    /// trailing blank line.
    pub(crate) fn finish(&mut self) -> Option<SseEvent> {
        if !self.line_buf.trim().is_empty() {
            let line = std::mem::take(&mut self.line_buf);
            if let Some(event) = self.process_line(line.trim_end()) {
                return Some(event);
            }
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if let Some(event) = line.strip_prefix("event:") {
            self.current_event = Some(event.trim().to_string());
        } else if let Some(data) = line.strip_prefix("data:") {
            if !self.current_data.is_empty() {
                self.current_data.push('\n');
            }
            self.current_data.push_str(data.trim_start());
        }
        // Comment lines (":") and unknown prefixes are ignored.
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.current_data.is_empty() && self.current_event.is_none() {
            return None;
        }
        let event = SseEvent {
            event: self.current_event.take(),
            data: std::mem::take(&mut self.current_data),
        };
        Some(event)
    }
}

/// Turn an HTTP response body into a stream of SSE events.
pub(crate) fn sse_events(
    response: reqwest::Response,
) -> impl Stream<Item = Result<SseEvent, StreamFault>> + Send + 'static {
    let byte_stream = response.bytes_stream();
    async_stream::stream! {
        let mut parser = SseLineParser::new();
        let mut bytes = std::pin::pin!(byte_stream);
        while let Some(chunk) = bytes.next().await {
            let chunk = match chunk {
                Ok(b) => b,
                Err(e) => {
                    yield Err(StreamFault::retryable(format!("stream read error: {e}")));
                    return;
                }
            };
            let text = match std::str::from_utf8(&chunk) {
                Ok(s) => s,
                Err(e) => {
                    yield Err(StreamFault::fatal(format!("utf-8 decode error: {e}")));
                    return;
                }
            };
            for event in parser.feed(text) {
                yield Ok(event);
            }
        }
        if let Some(event) = parser.finish() {
            yield Ok(event);
        }
    }
}
