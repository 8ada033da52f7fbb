use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use relay_core::ApplyCommand;
use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

use crate::{EdgeError, Result};

const APPLY_EVENT: &str = "apply";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Longest line the parser buffers while waiting for its newline.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

// ─── Traits ───────────────────────────────────────────────────────────────

/// A live subscription to the relay's command stream.
#[async_trait]
pub trait CommandStream: Send {
    /// `None` once the stream has ended; every later call also returns `None`.
    async fn next_command(&mut self) -> Option<Result<ApplyCommand>>;
}

/// Opens command streams; one call per (re)connect.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, client_id: &str) -> Result<Box<dyn CommandStream>>;
}

// ─── SSE wire parsing ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Incremental `text/event-stream` parser. Chunks may split lines anywhere.
#[derive(Debug, Default)]
pub struct SseParser {
    buf: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns every event completed by it. Fails once an
    /// unterminated line grows past [`MAX_LINE_BYTES`]; the partial line is
    /// discarded.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<SseEvent>> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(event) = self.line(line) {
                events.push(event);
            }
        }
        if self.buf.len() > MAX_LINE_BYTES {
            let pending = self.buf.len();
            self.buf.clear();
            return Err(EdgeError::Decode(format!(
                "stream line exceeds {MAX_LINE_BYTES} bytes ({pending} buffered without a newline)"
            )));
        }
        Ok(events)
    }

    fn line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent {
            event: event.unwrap_or_else(|| "message".to_string()),
            data,
        })
    }
}

// ─── HTTP connector ───────────────────────────────────────────────────────

/// Connects to `GET {server_url}/api/stream?client_id=...`.
pub struct HttpConnector {
    client: reqwest::Client,
    server_url: String,
}

impl HttpConnector {
    pub fn new(server_url: impl Into<String>, ca_file: Option<&Path>) -> Result<Self> {
        let mut builder = reqwest::Client::builder().connect_timeout(CONNECT_TIMEOUT);
        if let Some(path) = ca_file {
            let pem = std::fs::read(path)?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| EdgeError::Connect(format!("invalid CA file {}: {e}", path.display())))?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder
            .build()
            .map_err(|e| EdgeError::Connect(e.to_string()))?;
        Ok(Self {
            client,
            server_url: server_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn stream_url(&self) -> String {
        format!("{}/api/stream", self.server_url)
    }
}

fn transport_error(e: reqwest::Error) -> EdgeError {
    if e.is_connect() || e.is_timeout() || e.is_body() {
        EdgeError::Unavailable(e.to_string())
    } else {
        EdgeError::Connect(e.to_string())
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(&self, client_id: &str) -> Result<Box<dyn CommandStream>> {
        let resp = self
            .client
            .get(self.stream_url())
            .query(&[("client_id", client_id)])
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        if status == reqwest::StatusCode::SERVICE_UNAVAILABLE {
            return Err(EdgeError::Unavailable(format!("relay returned {status}")));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(EdgeError::Connect(format!("relay returned {status}: {body}")));
        }
        debug!(client_id, "command stream opened");
        Ok(Box::new(SseCommandStream::new(resp.bytes_stream().boxed())))
    }
}

/// Decodes `apply` events from a byte stream; other event types are skipped.
pub struct SseCommandStream {
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    parser: SseParser,
    pending: VecDeque<SseEvent>,
    done: bool,
}

impl SseCommandStream {
    pub fn new(body: BoxStream<'static, reqwest::Result<Bytes>>) -> Self {
        Self {
            body,
            parser: SseParser::new(),
            pending: VecDeque::new(),
            done: false,
        }
    }
}

#[async_trait]
impl CommandStream for SseCommandStream {
    async fn next_command(&mut self) -> Option<Result<ApplyCommand>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                if event.event != APPLY_EVENT {
                    debug!(event = %event.event, "ignoring stream event");
                    continue;
                }
                return Some(
                    serde_json::from_str::<ApplyCommand>(&event.data)
                        .map_err(|e| EdgeError::Decode(format!("{e}: {}", event.data))),
                );
            }
            if self.done {
                return None;
            }
            match self.body.next().await {
                Some(Ok(chunk)) => match self.parser.push(&chunk) {
                    Ok(events) => self.pending.extend(events),
                    Err(e) => {
                        warn!(error = %e, "command stream unreadable");
                        self.done = true;
                        return Some(Err(e));
                    }
                },
                Some(Err(e)) => {
                    warn!(error = %e, "command stream broke");
                    self.done = true;
                    return Some(Err(transport_error(e)));
                }
                None => self.done = true,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_events_split_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"event: app").unwrap().is_empty());
        assert!(parser.push(b"ly\ndata: {\"a\":").unwrap().is_empty());
        let events = parser.push(b"1}\n\n").unwrap();
        assert_eq!(
            events,
            vec![SseEvent {
                event: "apply".into(),
                data: "{\"a\":1}".into()
            }]
        );
    }

    #[test]
    fn comments_and_crlf_handled() {
        let mut parser = SseParser::new();
        let events = parser.push(b":\r\n\r\nevent: apply\r\ndata: x\r\n\r\n").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn multi_line_data_joined_and_default_event_name() {
        let mut parser = SseParser::new();
        let events = parser.push(b"data: one\ndata:two\n\n").unwrap();
        assert_eq!(events[0].event, "message");
        assert_eq!(events[0].data, "one\ntwo");
    }

    #[test]
    fn unterminated_line_is_capped() {
        let mut parser = SseParser::new();
        let half = vec![b'x'; MAX_LINE_BYTES / 2];
        assert!(parser.push(b"data: ").unwrap().is_empty());
        assert!(parser.push(&half).unwrap().is_empty());
        let err = parser.push(&half).unwrap_err();
        assert!(matches!(err, EdgeError::Decode(_)), "{err}");

        let events = parser.push(b"\n\nevent: apply\ndata: ok\n\n").unwrap();
        assert_eq!(events.last().map(|e| e.data.as_str()), Some("ok"));
    }

    #[tokio::test]
    async fn oversized_line_ends_the_stream() {
        let long: &'static str = Box::leak("x".repeat(MAX_LINE_BYTES + 1).into_boxed_str());
        let mut stream = SseCommandStream::new(body(vec!["event: apply\ndata: ", long]));
        assert!(matches!(
            stream.next_command().await,
            Some(Err(EdgeError::Decode(_)))
        ));
        assert!(stream.next_command().await.is_none());
    }

    fn body(chunks: Vec<&'static str>) -> BoxStream<'static, reqwest::Result<Bytes>> {
        futures::stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from_static(c.as_bytes())))).boxed()
    }

    #[tokio::test]
    async fn stream_yields_apply_commands_then_ends() {
        let mut stream = SseCommandStream::new(body(vec![
            ": keep-alive\n\n",
            "event: apply\ndata: {\"actuatorId\":\"a1\",\"key\":\"state\",\"value\":\"off\"}\n\n",
            "event: other\ndata: {}\n\n",
            "event: apply\ndata: not json\n\n",
        ]));

        let first = stream.next_command().await.unwrap().unwrap();
        assert_eq!(first.actuator_id, "a1");
        assert!(!first.value.is_on());
        assert!(matches!(
            stream.next_command().await,
            Some(Err(EdgeError::Decode(_)))
        ));
        assert!(stream.next_command().await.is_none());
        assert!(stream.next_command().await.is_none());
    }

    #[test]
    fn stream_url_normalizes_trailing_slash() {
        let connector = HttpConnector::new("http://relay:50051/", None).unwrap();
        assert_eq!(connector.stream_url(), "http://relay:50051/api/stream");
    }
}
