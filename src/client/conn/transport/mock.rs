//! A transport over in-memory duplex streams, suitable for testing the pool and
//! the HTTP/1.1 exchange without touching the network.
//!
//! Each connection made through a [`MockTransport`] is counted, and its server
//! half is either handed to a [`MockListener`], or driven by a scripted
//! responder which answers each request with raw bytes.

use std::fmt;
use std::future::ready;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Buf as _, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _, DuplexStream};
use tokio::sync::mpsc;
use tracing::trace;

use crate::client::pool::Origin;
use crate::BoxFuture;

/// An error that can occur when creating a mock connection.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("mock connection error")]
pub struct MockConnectionError;

/// A request as seen by the scripted responder.
#[derive(Debug, Clone)]
pub struct MockRequest {
    /// Request method.
    pub method: String,

    /// Request target as written on the request line.
    pub path: String,

    /// Header names (lower-cased) and values in the order they were sent.
    pub headers: Vec<(String, String)>,

    /// The decoded request body.
    pub body: Bytes,
}

impl MockRequest {
    /// The first value of the named header.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// What a scripted responder does with a request.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Write these bytes and wait for the next request.
    Respond(Vec<u8>),

    /// Write these bytes and close the connection.
    RespondAndClose(Vec<u8>),

    /// Close the connection without responding.
    Close,
}

impl MockReply {
    /// A `200 OK` with the given body and a content-length.
    pub fn ok(body: &str) -> Self {
        MockReply::Respond(
            format!(
                "HTTP/1.1 200 OK\r\ncontent-length: {}\r\n\r\n{}",
                body.len(),
                body
            )
            .into_bytes(),
        )
    }
}

type Responder = Arc<dyn Fn(&MockRequest) -> MockReply + Send + Sync + 'static>;

#[derive(Clone)]
enum Mode {
    Listener(mpsc::UnboundedSender<(Origin, DuplexStream)>),
    Responder(Responder),
}

struct Shared {
    mode: Mode,
    connects: AtomicUsize,
    failures: AtomicUsize,
    requests: AtomicUsize,
}

/// A mock transport that can be used to test connection behavior.
#[derive(Clone)]
pub struct MockTransport {
    shared: Arc<Shared>,
}

impl fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockTransport")
            .field("connects", &self.connects())
            .finish_non_exhaustive()
    }
}

/// Receives the server half of each mock connection.
#[derive(Debug)]
pub struct MockListener {
    incoming: mpsc::UnboundedReceiver<(Origin, DuplexStream)>,
}

impl MockListener {
    /// Wait for the next connection.
    pub async fn accept(&mut self) -> Option<(Origin, DuplexStream)> {
        self.incoming.recv().await
    }
}

impl MockTransport {
    fn with_mode(mode: Mode) -> Self {
        Self {
            shared: Arc::new(Shared {
                mode,
                connects: AtomicUsize::new(0),
                failures: AtomicUsize::new(0),
                requests: AtomicUsize::new(0),
            }),
        }
    }

    /// Transport which hands the server side of each connection to a listener.
    pub fn channel() -> (Self, MockListener) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self::with_mode(Mode::Listener(tx)),
            MockListener { incoming: rx },
        )
    }

    /// Transport whose connections answer every request with the responder's reply.
    pub fn responder<F>(respond: F) -> Self
    where
        F: Fn(&MockRequest) -> MockReply + Send + Sync + 'static,
    {
        Self::with_mode(Mode::Responder(Arc::new(respond)))
    }

    /// Transport whose connections answer every request with `200 OK` and the given body.
    pub fn ok(body: &'static str) -> Self {
        Self::responder(move |_| MockReply::ok(body))
    }

    /// Make the next `n` connection attempts fail.
    pub fn fail_next(&self, n: usize) {
        self.shared.failures.store(n, Ordering::SeqCst);
    }

    /// Number of successful connections made through this transport.
    pub fn connects(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    /// Number of requests answered by the responder.
    pub fn requests(&self) -> usize {
        self.shared.requests.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> bool {
        self.shared
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl tower::Service<Origin> for MockTransport {
    type Response = DuplexStream;
    type Error = MockConnectionError;
    type Future = BoxFuture<'static, Result<DuplexStream, MockConnectionError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, origin: Origin) -> Self::Future {
        if self.take_failure() {
            trace!(%origin, "mock connection refused");
            return Box::pin(ready(Err(MockConnectionError)));
        }

        let (client, server) = tokio::io::duplex(16 * 1024);
        self.shared.connects.fetch_add(1, Ordering::SeqCst);

        match &self.shared.mode {
            Mode::Listener(tx) => {
                if tx.send((origin, server)).is_err() {
                    return Box::pin(ready(Err(MockConnectionError)));
                }
            }
            Mode::Responder(respond) => {
                tokio::spawn(serve(server, respond.clone(), self.shared.clone()));
            }
        }

        Box::pin(ready(Ok(client)))
    }
}

async fn serve(mut stream: DuplexStream, respond: Responder, shared: Arc<Shared>) {
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        let request = match read_request(&mut stream, &mut buf).await {
            Some(request) => request,
            None => return,
        };
        shared.requests.fetch_add(1, Ordering::SeqCst);

        match respond(&request) {
            MockReply::Respond(bytes) => {
                if stream.write_all(&bytes).await.is_err() {
                    return;
                }
            }
            MockReply::RespondAndClose(bytes) => {
                let _ = stream.write_all(&bytes).await;
                return;
            }
            MockReply::Close => return,
        }
    }
}

async fn fill(stream: &mut DuplexStream, buf: &mut BytesMut) -> Option<()> {
    match stream.read_buf(buf).await {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(()),
    }
}

/// Read one request off the stream, decoding a content-length or chunked body.
pub(crate) async fn read_request(stream: &mut DuplexStream, buf: &mut BytesMut) -> Option<MockRequest> {
    let (consumed, method, path, headers) = loop {
        let mut slots = [httparse::EMPTY_HEADER; 64];
        let mut request = httparse::Request::new(&mut slots);
        match request.parse(buf) {
            Ok(httparse::Status::Complete(consumed)) => {
                let headers: Vec<(String, String)> = request
                    .headers
                    .iter()
                    .map(|h| {
                        (
                            h.name.to_ascii_lowercase(),
                            String::from_utf8_lossy(h.value).into_owned(),
                        )
                    })
                    .collect();
                break (
                    consumed,
                    request.method.unwrap_or_default().to_owned(),
                    request.path.unwrap_or_default().to_owned(),
                    headers,
                );
            }
            Ok(httparse::Status::Partial) => fill(stream, buf).await?,
            Err(_) => return None,
        }
    };
    buf.advance(consumed);

    let mut request = MockRequest {
        method,
        path,
        headers,
        body: Bytes::new(),
    };

    if request
        .header("transfer-encoding")
        .is_some_and(|te| te.eq_ignore_ascii_case("chunked"))
    {
        let mut body = BytesMut::new();
        loop {
            let (consumed, size) = loop {
                match httparse::parse_chunk_size(buf) {
                    Ok(httparse::Status::Complete(parsed)) => break parsed,
                    Ok(httparse::Status::Partial) => fill(stream, buf).await?,
                    Err(_) => return None,
                }
            };
            buf.advance(consumed);

            let size = usize::try_from(size).ok()?;
            if size == 0 {
                // No trailers are sent by the client under test; expect the final CRLF.
                while buf.len() < 2 {
                    fill(stream, buf).await?;
                }
                buf.advance(2);
                break;
            }

            while buf.len() < size + 2 {
                fill(stream, buf).await?;
            }
            body.extend_from_slice(&buf[..size]);
            buf.advance(size + 2);
        }
        request.body = body.freeze();
    } else if let Some(length) = request.header("content-length") {
        let length: usize = length.trim().parse().ok()?;
        while buf.len() < length {
            fill(stream, buf).await?;
        }
        request.body = buf.split_to(length).freeze();
    }

    Some(request)
}
