//! Minimal HTTP/1.1 front door.
//!
//! One request per connection: request line, headers and an optional
//! `Content-Length` body are read, handed to the relay, and the single reply
//! is written back before the connection is closed.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::{BufMut, Bytes, BytesMut};
use relay_core::{RelayError, Reply, Request, ResponseSink};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

use crate::server::RelayHandle;

const MAX_HEAD_LINES: usize = 100;
const MAX_LINE: usize = 8 * 1024;

/// Maps a request to the tag of its first published generation.
#[derive(Debug, Clone)]
struct Binding {
    method: Option<String>,
    prefix: String,
    tag: String,
}

pub struct HttpFrontDoor {
    relay: RelayHandle,
    bindings: Vec<Binding>,
    default_tag: String,
    max_body: usize,
}

impl HttpFrontDoor {
    pub fn new(relay: RelayHandle) -> Self {
        let default_tag = relay.config().initial_tag.clone();
        Self {
            relay,
            bindings: Vec::new(),
            default_tag,
            max_body: 1 << 20,
        }
    }

    /// Requests whose path starts with `prefix` enter the pipeline as `tag`.
    /// `method` of `"*"` matches any method. The longest matching prefix wins.
    pub fn bind(mut self, method: &str, prefix: &str, tag: &str) -> Self {
        let method = (method != "*").then(|| method.to_ascii_uppercase());
        self.bindings.push(Binding {
            method,
            prefix: prefix.to_string(),
            tag: tag.to_string(),
        });
        self
    }

    pub fn with_default_tag(mut self, tag: &str) -> Self {
        self.default_tag = tag.to_string();
        self
    }

    pub fn with_max_body(mut self, bytes: usize) -> Self {
        self.max_body = bytes;
        self
    }

    pub fn tag_for(&self, method: &str, path: &str) -> &str {
        self.bindings
            .iter()
            .filter(|b| b.method.as_deref().map_or(true, |m| m.eq_ignore_ascii_case(method)))
            .filter(|b| path.starts_with(&b.prefix))
            .max_by_key(|b| b.prefix.len())
            .map(|b| b.tag.as_str())
            .unwrap_or(&self.default_tag)
    }

    /// Binds the configured address and serves until `shutdown` resolves.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<(), RelayError> {
        let config = self.relay.config();
        if config.tls_enabled() {
            return Err(RelayError::Config(
                "TLS termination is not provided by the bundled listener".into(),
            ));
        }
        let addr: SocketAddr = config
            .listen_addr()
            .parse()
            .map_err(|e| RelayError::Config(format!("invalid listen address: {}", e)))?;
        let listener = bind_listener(addr)?;
        self.serve(listener, shutdown).await
    }

    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), RelayError> {
        tracing::info!("HttpFrontDoor: listening on {}", listener.local_addr()?);
        let door = Arc::new(self);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::warn!("HttpFrontDoor: accept failed: {}", e);
                            continue;
                        }
                    };
                    let door = door.clone();
                    tokio::spawn(async move {
                        if let Err(e) = door.handle(stream).await {
                            tracing::debug!("HttpFrontDoor: connection {} ended: {}", peer, e);
                        }
                    });
                }
                _ = &mut shutdown => break,
            }
        }

        tracing::info!("HttpFrontDoor: stopped accepting");
        Ok(())
    }

    async fn handle(&self, stream: TcpStream) -> Result<(), RelayError> {
        let mut reader = BufReader::new(stream);
        let reply = match read_request(&mut reader, self.max_body).await {
            Ok(request) => self.dispatch(request).await,
            Err(RelayError::Protocol(msg)) => {
                tracing::debug!("HttpFrontDoor: bad request: {}", msg);
                Reply::text(400, "Bad Request")
            }
            Err(e) => return Err(e),
        };

        let mut stream = reader.into_inner();
        stream.write_all(&encode_reply(&reply)).await?;
        stream.shutdown().await?;
        Ok(())
    }

    async fn dispatch(&self, request: Request) -> Reply {
        let tag = self.tag_for(&request.method, &request.path).to_string();
        let (sink, rx) = OneshotSink::channel();

        if let Err(e) = self.relay.on_request_tagged(request, sink.clone(), &tag) {
            tracing::warn!("HttpFrontDoor: request rejected: {}", e);
            return match e {
                RelayError::ChannelClosed => Reply::text(503, "Service Unavailable"),
                other => sink.fallback(&other),
            };
        }
        rx.await.unwrap_or_else(|_| Reply::text(503, "Service Unavailable"))
    }
}

/// Listener with `SO_REUSEADDR`, configured through socket2.
pub fn bind_listener(addr: SocketAddr) -> Result<TcpListener, RelayError> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nodelay(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    Ok(TcpListener::from_std(std::net::TcpListener::from(socket))?)
}

/// Sink forwarding the single reply of a correlation to the connection task.
struct OneshotSink {
    tx: Mutex<Option<oneshot::Sender<Reply>>>,
}

impl OneshotSink {
    fn channel() -> (Arc<Self>, oneshot::Receiver<Reply>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(Self {
                tx: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }
}

impl ResponseSink for OneshotSink {
    fn write(&self, reply: Reply) -> Result<(), RelayError> {
        let tx = self.tx.lock().ok().and_then(|mut slot| slot.take());
        match tx {
            Some(tx) => tx
                .send(reply)
                .map_err(|_| RelayError::Protocol("peer went away before the reply".into())),
            None => Err(RelayError::Protocol("reply already written".into())),
        }
    }
}

/// Reads one line, never buffering more than `MAX_LINE` bytes of it.
async fn read_line<R>(reader: &mut R, line: &mut String) -> Result<(), RelayError>
where
    R: AsyncBufReadExt + Unpin,
{
    line.clear();
    let n = (&mut *reader).take(MAX_LINE as u64 + 1).read_line(line).await?;
    if n == 0 {
        return Err(RelayError::Protocol("connection closed mid-request".into()));
    }
    if n > MAX_LINE {
        return Err(RelayError::Protocol("header line too long".into()));
    }
    if !line.ends_with('\n') {
        return Err(RelayError::Protocol("connection closed mid-line".into()));
    }
    Ok(())
}

pub(crate) async fn read_request<R>(reader: &mut R, max_body: usize) -> Result<Request, RelayError>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut line = String::new();
    read_line(reader, &mut line).await?;

    let mut parts = line.split_whitespace();
    let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v)) => (m.to_string(), t.to_string(), v),
        _ => return Err(RelayError::Protocol(format!("malformed request line {:?}", line.trim_end()))),
    };
    if !version.starts_with("HTTP/1.") {
        return Err(RelayError::Protocol(format!("unsupported version {}", version)));
    }
    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p.to_string(), Some(q.to_string())),
        None => (target, None),
    };

    let mut request = Request::new(method, path);
    request.query = query;

    for _ in 0..MAX_HEAD_LINES {
        read_line(reader, &mut line).await?;
        let header = line.trim_end_matches(['\r', '\n']);
        if header.is_empty() {
            let length = match request.header("content-length") {
                Some(v) => v
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| RelayError::Protocol(format!("bad Content-Length {:?}", v)))?,
                None => 0,
            };
            if length > max_body {
                return Err(RelayError::Protocol(format!("body of {} bytes too large", length)));
            }
            let mut body = vec![0u8; length];
            reader.read_exact(&mut body).await?;
            request.body = Bytes::from(body);
            return Ok(request);
        }
        let (name, value) = header
            .split_once(':')
            .ok_or_else(|| RelayError::Protocol(format!("malformed header {:?}", header)))?;
        request.headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Err(RelayError::Protocol("too many header lines".into()))
}

pub(crate) fn encode_reply(reply: &Reply) -> Bytes {
    let mut out = BytesMut::with_capacity(128 + reply.body.len());
    out.put_slice(format!("HTTP/1.1 {} {}\r\n", reply.status, reason_phrase(reply.status)).as_bytes());
    for (name, value) in &reply.headers {
        if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("connection") {
            continue;
        }
        out.put_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }
    out.put_slice(format!("Content-Length: {}\r\nConnection: close\r\n\r\n", reply.body.len()).as_bytes());
    out.put_slice(&reply.body);
    out.freeze()
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_request_with_body() {
        let raw = b"POST /json?x=1 HTTP/1.1\r\nHost: local\r\nContent-Length: 14\r\n\r\n{\"foo\": \"bar\"}";
        let mut reader = BufReader::new(&raw[..]);
        let request = read_request(&mut reader, 1024).await.unwrap();
        assert_eq!(request.method, "POST");
        assert_eq!(request.path, "/json");
        assert_eq!(request.query.as_deref(), Some("x=1"));
        assert_eq!(request.header("host"), Some("local"));
        assert_eq!(&request.body[..], br#"{"foo": "bar"}"#);
    }

    #[tokio::test]
    async fn rejects_garbage_and_oversized_bodies() {
        let mut reader = BufReader::new(&b"NONSENSE\r\n\r\n"[..]);
        assert!(matches!(
            read_request(&mut reader, 1024).await,
            Err(RelayError::Protocol(_))
        ));

        let raw = b"POST / HTTP/1.1\r\nContent-Length: 99\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        assert!(matches!(
            read_request(&mut reader, 10).await,
            Err(RelayError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn rejects_unterminated_oversized_lines() {
        let mut raw = b"GET /".to_vec();
        raw.extend(std::iter::repeat(b'a').take(4 * MAX_LINE));
        let mut reader = BufReader::new(&raw[..]);
        let err = read_request(&mut reader, 1024).await.unwrap_err();
        assert!(matches!(err, RelayError::Protocol(ref m) if m.contains("too long")), "{}", err);

        let mut raw = b"GET / HTTP/1.1\r\nX-Big: ".to_vec();
        raw.extend(std::iter::repeat(b'b').take(MAX_LINE));
        raw.extend_from_slice(b"\r\n\r\n");
        let mut reader = BufReader::new(&raw[..]);
        assert!(matches!(
            read_request(&mut reader, 1024).await,
            Err(RelayError::Protocol(_))
        ));
    }

    #[test]
    fn encodes_status_line_and_length() {
        let reply = Reply::text(504, "Gateway Timeout");
        let wire = encode_reply(&reply);
        let text = std::str::from_utf8(&wire).unwrap();
        assert!(text.starts_with("HTTP/1.1 504 Gateway Timeout\r\n"));
        assert!(text.contains("Content-Length: 15\r\n"));
        assert!(text.ends_with("\r\n\r\nGateway Timeout"));
    }
}
