use std::borrow::Cow;
use std::sync::Mutex;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use serde_json::{json, Value};
use tokio::sync::Notify;

use crate::correlation::{Correlation, CorrelationId, ResponseSink};
use crate::error::RelayError;

/// What an inbound request stands for. Persistent connections raise one
/// request per lifecycle event; everything else is a plain `Request`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EventKind {
    #[default]
    Request,
    Open,
    Message,
    Error,
    Close,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Request => "request",
            EventKind::Open => "open",
            EventKind::Message => "message",
            EventKind::Error => "error",
            EventKind::Close => "close",
        }
    }
}

/// Transport-agnostic snapshot of an inbound request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub event: EventKind,
    /// Connection that raised the event, for persistent connections.
    pub connection: Option<u64>,
}

impl Request {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Self::default()
        }
    }

    /// Lifecycle event raised by persistent connection `connection` on `path`.
    pub fn connection_event(event: EventKind, connection: u64, path: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            path: path.into(),
            event,
            connection: Some(connection),
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Case-insensitive header lookup; first match wins.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Reply {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self::new(200).with_body(body)
    }

    pub fn text(status: u16, body: &str) -> Self {
        Self::new(status)
            .with_header("Content-Type", "text/plain; charset=utf-8")
            .with_body(Bytes::copy_from_slice(body.as_bytes()))
    }

    pub fn json(status: u16, value: &Value) -> Self {
        Self::new(status)
            .with_header("Content-Type", "application/json")
            .with_body(value.to_string())
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }
}

/// One generation of a request's journey through the pipeline.
///
/// Tasks are handed to stages behind an `Arc` and are therefore read-only
/// there. A stage that continues the chain derives its own copy with
/// [`Task::scoped`], mutates it and returns it for republication.
#[derive(Debug)]
pub struct Task {
    correlation: Correlation,
    tag: String,
    buffer: BytesMut,
    data: Option<Value>,
    trace: Vec<String>,
    generation: u64,
}

impl Task {
    pub fn new(correlation: Correlation, tag: impl Into<String>) -> Self {
        Self {
            correlation,
            tag: tag.into(),
            buffer: BytesMut::new(),
            data: None,
            trace: Vec::new(),
            generation: 0,
        }
    }

    /// Task handed straight to the terminal when a correlation cannot finish
    /// normally. `data` describes why.
    pub fn fallback(correlation: Correlation, tag: &str, error: &RelayError) -> Self {
        let mut task = Self::new(correlation, tag);
        task.data = Some(json!({
            "error": error.kind(),
            "detail": error.to_string(),
        }));
        task.trace.push(tag.to_string());
        task
    }

    /// Deep copy for the next generation: buffer and data are duplicated,
    /// the trace is copied and extended with `stage`.
    pub fn scoped(&self, stage: &str) -> Task {
        let mut trace = Vec::with_capacity(self.trace.len() + 1);
        trace.extend(self.trace.iter().cloned());
        trace.push(stage.to_string());

        Task {
            correlation: self.correlation.clone(),
            tag: self.tag.clone(),
            buffer: BytesMut::from(&self.buffer[..]),
            data: self.data.clone(),
            trace,
            generation: self.generation + 1,
        }
    }

    pub fn correlation(&self) -> &Correlation {
        &self.correlation
    }

    pub fn id(&self) -> CorrelationId {
        self.correlation.id()
    }

    pub fn request(&self) -> &Request {
        self.correlation.request()
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn set_tag(&mut self, tag: impl Into<String>) {
        self.tag = tag.into();
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn buffer_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.buffer)
    }

    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    pub fn append(&mut self, chunk: impl AsRef<[u8]>) {
        self.buffer.extend_from_slice(chunk.as_ref());
    }

    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    pub fn data_mut(&mut self) -> &mut Option<Value> {
        &mut self.data
    }

    pub fn set_data(&mut self, value: Value) {
        self.data = Some(value);
    }

    pub fn trace(&self) -> &[String] {
        &self.trace
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_fallback(&self, fallback_tag: &str) -> bool {
        self.tag == fallback_tag && self.data.as_ref().is_some_and(|d| d.get("error").is_some())
    }

    /// Parses the request body as JSON. An unparsable body yields
    /// `{"error": "parse error"}` rather than failing the stage.
    pub fn json_body(&self) -> Value {
        serde_json::from_slice(&self.request().body)
            .unwrap_or_else(|_| json!({ "error": "parse error" }))
    }

    /// Attaches the parsed body as structured data unless data is already present.
    pub fn attach_json_body(&mut self) -> &Value {
        if self.data.is_none() {
            self.data = Some(self.json_body());
        }
        self.data.get_or_insert(Value::Null)
    }
}

/// Response sink that keeps replies in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    replies: Mutex<Vec<Reply>>,
    notify: Notify,
}

impl MemorySink {
    pub fn replies(&self) -> Vec<Reply> {
        self.replies.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn count(&self) -> usize {
        self.replies.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Waits until at least `n` replies arrived or `timeout` elapsed.
    pub async fn wait_for(&self, n: usize, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.notify.notified();
                if self.count() >= n {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

impl ResponseSink for MemorySink {
    fn write(&self, reply: Reply) -> Result<(), RelayError> {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push(reply);
        }
        self.notify.notify_waiters();
        Ok(())
    }
}
