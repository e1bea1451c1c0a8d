//! HTTP/1.1 request/response exchange on a leased connection.
//!
//! [`execute`] writes one request onto a [`Lease`], reads the response head back and
//! hands out the body as an [`IncomingBody`]. The lease travels with the body: the
//! connection is returned to the pool when the body has been read to the end and the
//! server allows reuse, and closed in every other case.
//!
//! Request bodies with a known length are sent with `content-length`, everything else
//! is sent chunked. Response bodies are delimited following RFC 9112: by status and
//! method, then `transfer-encoding`, then `content-length`, and otherwise by the end
//! of the connection.

use std::future::poll_fn;
use std::io;

use bytes::{Buf as _, BytesMut};
use http::StatusCode;
use tracing::{debug, trace};

mod decode;
mod encode;
mod incoming;

pub(crate) use self::decode::has_connection_token;
use self::decode::{BodyFraming, Decoder, ResponseHead};
pub use self::incoming::IncomingBody;

use crate::body::Body;
use crate::client::error::ProtocolError;
use crate::client::pool::Lease;
use crate::client::Error;

/// Limits applied while reading responses.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Config {
    /// Largest status line and header block accepted, in bytes.
    pub max_head_size: usize,

    /// Largest number of headers (or trailers) accepted.
    pub max_headers: usize,

    /// Largest redirect body read and dropped so its connection can be reused.
    pub redirect_drain_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_head_size: 64 * 1024,
            max_headers: 100,
            redirect_drain_limit: 64 * 1024,
        }
    }
}

/// Request extension which sends an `OPTIONS` request to the server as a whole, with
/// the asterisk-form target `*` instead of the URI path.
///
/// The request URI still names the origin to connect to. Requests with other methods
/// ignore it.
///
/// ```
/// use courier::client::conn::http1::AsteriskForm;
///
/// let request = http::Request::options("http://example.com")
///     .extension(AsteriskForm)
///     .body(courier::Body::empty())
///     .unwrap();
/// # let _ = request;
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AsteriskForm;

/// Send `request` on the leased connection and read the response head.
///
/// The request URI should be absolute. Unless the request already has one, a `host`
/// header is added from the URI. Any `content-length` or `transfer-encoding` headers
/// on the request are replaced to match the body.
///
/// Errors close the connection. A connection which ends before any part of a response
/// arrives (typically a keep-alive connection closed by the server) reports
/// [`Error::ConnectionFailed`]; one which ends part way through reports
/// [`ProtocolError::IncompleteMessage`].
#[cfg_attr(not(tarpaulin), tracing::instrument(skip_all, fields(method = %request.method(), uri = %request.uri()), level = "debug"))]
pub async fn execute(
    mut lease: Lease,
    request: http::Request<Body>,
    config: &Config,
) -> Result<http::Response<IncomingBody>, Error> {
    let (parts, body) = request.into_parts();
    let request_close = has_connection_token(&parts.headers, "close");

    let (head, framing) = match encode::request_head(&parts, &body) {
        Ok(encoded) => encoded,
        Err(error) => {
            // Nothing was written, the connection is still good.
            let _ = lease.release(true);
            return Err(error);
        }
    };

    lease.connection_mut().begin_exchange();
    encode::write_request(&mut lease, head, body, framing).await?;

    let mut buf = BytesMut::with_capacity(8 * 1024);
    let head = read_head(&mut lease, &mut buf, config).await?;
    let framing = decode::body_framing(&parts.method, &head)?;
    let keep_alive = !request_close && decode::keep_alive(&head);
    let info = lease.connection().info();
    debug!(status = %head.status, id = %info.id, ?framing, keep_alive, "received response");

    let body = match framing {
        BodyFraming::Empty => {
            let reusable = keep_alive && buf.is_empty();
            if !buf.is_empty() {
                debug!(extra = buf.len(), "unexpected bytes after response head");
            }
            lease.release(reusable)?;
            IncomingBody::empty()
        }
        framing => IncomingBody::new(lease, buf, Decoder::new(framing), keep_alive, config),
    };

    let ResponseHead {
        version,
        status,
        headers,
    } = head;

    let mut response = http::Response::new(body);
    *response.status_mut() = status;
    *response.version_mut() = version;
    *response.headers_mut() = headers;
    response.extensions_mut().insert(info);
    Ok(response)
}

/// Read until a final (non-1xx) response head is available.
async fn read_head(
    lease: &mut Lease,
    buf: &mut BytesMut,
    config: &Config,
) -> Result<ResponseHead, Error> {
    let mut received = false;

    loop {
        if let Some((len, head)) = decode::parse_head(buf, config)? {
            buf.advance(len);

            if head.status == StatusCode::SWITCHING_PROTOCOLS {
                return Err(ProtocolError::UnexpectedUpgrade.into());
            }

            if head.status.is_informational() {
                trace!(status = %head.status, "skipping interim response");
                continue;
            }

            return Ok(head);
        }

        let n = poll_fn(|cx| lease.poll_read_buf(cx, buf)).await?;
        if n == 0 {
            lease.connection_mut().mark_broken();
            return Err(if received || !buf.is_empty() {
                ProtocolError::IncompleteMessage.into()
            } else {
                Error::connection(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before response",
                ))
            });
        }
        received = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use bytes::Bytes;
    use http_body_util::BodyExt as _;

    use crate::client::conn::transport::mock::{MockReply, MockRequest, MockTransport};
    use crate::client::conn::ConnectionInfo;
    use crate::client::pool::{Config as PoolConfig, Origin, Pool};

    fn origin() -> Origin {
        "http://dispatch.test".parse().unwrap()
    }

    fn get() -> http::Request<Body> {
        http::Request::get("http://dispatch.test/resource")
            .body(Body::empty())
            .unwrap()
    }

    fn raw(reply: &'static str) -> MockTransport {
        MockTransport::responder(move |_| MockReply::Respond(reply.as_bytes().to_vec()))
    }

    fn pool(transport: &MockTransport) -> Pool<MockTransport> {
        Pool::new(transport.clone(), PoolConfig::default())
    }

    async fn send(
        pool: &Pool<MockTransport>,
        request: http::Request<Body>,
    ) -> Result<http::Response<IncomingBody>, Error> {
        let lease = pool.acquire(origin()).await?;
        execute(lease, request, &Config::default()).await
    }

    #[tokio::test]
    async fn keep_alive_connection_is_reused() {
        let _ = tracing_subscriber::fmt::try_init();

        let transport = MockTransport::ok("hello");
        let pool = pool(&transport);

        let response = send(&pool, get()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let first = response.extensions().get::<ConnectionInfo>().cloned().unwrap();
        assert!(!first.reused);

        // Still leased until the body is read.
        assert_eq!(pool.stats().leased, 1);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from_static(b"hello"));
        assert_eq!(pool.stats().idle, 1);

        let response = send(&pool, get()).await.unwrap();
        let second = response.extensions().get::<ConnectionInfo>().cloned().unwrap();
        assert_eq!(second.id, first.id);
        assert!(second.reused);
        assert_eq!(second.requests, 2);
        assert_eq!(transport.connects(), 1);
    }

    /// Read data frames until `expected` bytes have arrived, then stop polling.
    async fn read_exactly(body: &mut IncomingBody, expected: usize) -> Vec<u8> {
        let mut data = Vec::new();
        while data.len() < expected {
            let frame = body.frame().await.unwrap().unwrap();
            if let Some(chunk) = frame.data_ref() {
                data.extend_from_slice(chunk);
            }
        }
        data
    }

    #[tokio::test]
    async fn length_body_releases_after_last_byte() {
        let _ = tracing_subscriber::fmt::try_init();

        let transport = MockTransport::ok("hello");
        let pool = pool(&transport);

        let mut body = send(&pool, get()).await.unwrap().into_body();
        assert_eq!(read_exactly(&mut body, 5).await, b"hello");
        assert!(http_body::Body::is_end_stream(&body));
        assert_eq!(pool.stats().idle, 1);

        drop(body);
        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.closed, 0);
    }

    #[tokio::test]
    async fn chunked_body_releases_before_trailers_are_polled() {
        let _ = tracing_subscriber::fmt::try_init();

        let transport = raw(
            "HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n\
             5\r\nhello\r\n6\r\n world\r\n0\r\nx-checksum: abc\r\n\r\n",
        );
        let pool = pool(&transport);

        let mut body = send(&pool, get()).await.unwrap().into_body();
        assert_eq!(read_exactly(&mut body, 11).await, b"hello world");
        assert_eq!(pool.stats().idle, 1);
        assert!(!http_body::Body::is_end_stream(&body));

        let trailers = body.frame().await.unwrap().unwrap().into_trailers().unwrap();
        assert_eq!(trailers["x-checksum"], "abc");
        assert!(http_body::Body::is_end_stream(&body));
        assert!(body.frame().await.is_none());

        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.released, 1);
    }

    #[tokio::test]
    async fn bodiless_response_releases_immediately() {
        let _ = tracing_subscriber::fmt::try_init();

        let transport = raw("HTTP/1.1 204 No Content\r\n\r\n");
        let pool = pool(&transport);

        let response = send(&pool, get()).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(http_body::Body::is_end_stream(response.body()));

        let stats = pool.stats();
        assert_eq!(stats.leased, 0);
        assert_eq!(stats.idle, 1);
    }

    #[tokio::test]
    async fn head_response_ignores_content_length() {
        let _ = tracing_subscriber::fmt::try_init();

        let transport = raw("HTTP/1.1 200 OK\r\ncontent-length: 1000\r\n\r\n");
        let pool = pool(&transport);

        let request = http::Request::head("http://dispatch.test/")
            .body(Body::empty())
            .unwrap();
        let response = send(&pool, request).await.unwrap();
        assert_eq!(response.headers()["content-length"], "1000");
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn connection_close_is_not_reused() {
        let _ = tracing_subscriber::fmt::try_init();

        let transport = raw("HTTP/1.1 200 OK\r\nconnection: close\r\ncontent-length: 2\r\n\r\nok");
        let pool = pool(&transport);

        let response = send(&pool, get()).await.unwrap();
        response.into_body().collect().await.unwrap();

        let stats = pool.stats();
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.closed, 1);
    }

    #[tokio::test]
    async fn request_connection_close_is_honored() {
        let _ = tracing_subscriber::fmt::try_init();

        let transport = MockTransport::ok("hi");
        let pool = pool(&transport);

        let request = http::Request::get("http://dispatch.test/")
            .header("connection", "close")
            .body(Body::empty())
            .unwrap();
        let response = send(&pool, request).await.unwrap();
        response.into_body().collect().await.unwrap();
        assert_eq!(pool.stats().idle, 0);
    }

    #[tokio::test]
    async fn http10_without_keep_alive() {
        let _ = tracing_subscriber::fmt::try_init();

        let transport = raw("HTTP/1.0 200 OK\r\ncontent-length: 2\r\n\r\nok");
        let pool = pool(&transport);

        let response = send(&pool, get()).await.unwrap();
        assert_eq!(response.version(), http::Version::HTTP_10);
        response.into_body().collect().await.unwrap();
        assert_eq!(pool.stats().idle, 0);
    }

    #[tokio::test]
    async fn truncated_body_is_protocol_error() {
        let _ = tracing_subscriber::fmt::try_init();

        let transport = MockTransport::responder(|_| {
            MockReply::RespondAndClose(b"HTTP/1.1 200 OK\r\ncontent-length: 10\r\n\r\nhello".to_vec())
        });
        let pool = pool(&transport);

        let response = send(&pool, get()).await.unwrap();
        let error = response.into_body().collect().await.unwrap_err();
        assert!(
            matches!(error, Error::Protocol(ProtocolError::IncompleteMessage)),
            "{error:?}"
        );

        let stats = pool.stats();
        assert_eq!(stats.open, 0);
        assert_eq!(stats.closed, 1);
    }

    #[tokio::test]
    async fn truncated_head_is_protocol_error() {
        let _ = tracing_subscriber::fmt::try_init();

        let transport = MockTransport::responder(|_| {
            MockReply::RespondAndClose(b"HTTP/1.1 200 OK\r\ncontent-le".to_vec())
        });
        let pool = pool(&transport);

        let error = send(&pool, get()).await.unwrap_err();
        assert!(error.is_protocol(), "{error:?}");
        assert_eq!(pool.stats().open, 0);
    }

    #[tokio::test]
    async fn closed_before_response_is_connection_failure() {
        let _ = tracing_subscriber::fmt::try_init();

        let transport = MockTransport::responder(|_| MockReply::Close);
        let pool = pool(&transport);

        let error = send(&pool, get()).await.unwrap_err();
        assert!(error.is_connection_failure(), "{error:?}");
        assert_eq!(pool.stats().open, 0);
    }

    #[tokio::test]
    async fn dropped_body_discards_connection() {
        let _ = tracing_subscriber::fmt::try_init();

        let transport = MockTransport::ok("a body nobody reads");
        let pool = pool(&transport);

        let response = send(&pool, get()).await.unwrap();
        drop(response);

        let stats = pool.stats();
        assert_eq!(stats.leased, 0);
        assert_eq!(stats.open, 0);
        assert_eq!(stats.released, 1);
    }

    #[tokio::test]
    async fn chunked_response_with_trailers() {
        let _ = tracing_subscriber::fmt::try_init();

        let transport = raw(
            "HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n\
             4\r\nwiki\r\n5\r\npedia\r\n0\r\nx-digest: 42\r\n\r\n",
        );
        let pool = pool(&transport);

        let response = send(&pool, get()).await.unwrap();
        let collected = response.into_body().collect().await.unwrap();
        assert_eq!(collected.trailers().unwrap()["x-digest"], "42");
        assert_eq!(collected.to_bytes(), Bytes::from_static(b"wikipedia"));
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn close_delimited_body_is_not_reused() {
        let _ = tracing_subscriber::fmt::try_init();

        let transport = MockTransport::responder(|_| {
            MockReply::RespondAndClose(b"HTTP/1.1 200 OK\r\n\r\nuntil the end".to_vec())
        });
        let pool = pool(&transport);

        let response = send(&pool, get()).await.unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from_static(b"until the end"));

        let stats = pool.stats();
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.closed, 1);
    }

    #[tokio::test]
    async fn interim_responses_are_skipped() {
        let _ = tracing_subscriber::fmt::try_init();

        let transport = raw("HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok");
        let pool = pool(&transport);

        let response = send(&pool, get()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from_static(b"ok"));
    }

    #[tokio::test]
    async fn upgrade_is_rejected() {
        let _ = tracing_subscriber::fmt::try_init();

        let transport = raw("HTTP/1.1 101 Switching Protocols\r\nupgrade: websocket\r\n\r\n");
        let pool = pool(&transport);

        let error = send(&pool, get()).await.unwrap_err();
        assert!(matches!(
            error,
            Error::Protocol(ProtocolError::UnexpectedUpgrade)
        ));
        assert_eq!(pool.stats().open, 0);
    }

    #[tokio::test]
    async fn trailing_garbage_prevents_reuse() {
        let _ = tracing_subscriber::fmt::try_init();

        let transport = raw("HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nokEXTRA");
        let pool = pool(&transport);

        let response = send(&pool, get()).await.unwrap();
        response.into_body().collect().await.unwrap();
        assert_eq!(pool.stats().idle, 0);
    }

    #[tokio::test]
    async fn request_bodies_reach_the_server() {
        let _ = tracing_subscriber::fmt::try_init();

        let seen = Arc::new(parking_lot::Mutex::new(Vec::<MockRequest>::new()));
        let transport = MockTransport::responder({
            let seen = seen.clone();
            move |request| {
                seen.lock().push(request.clone());
                MockReply::ok("")
            }
        });
        let pool = pool(&transport);

        let request = http::Request::post("http://dispatch.test/upload")
            .body(Body::from("fixed"))
            .unwrap();
        send(&pool, request).await.unwrap();

        let frames = futures_util::stream::iter(vec![
            Ok::<_, crate::BoxError>(http_body::Frame::data(Bytes::from_static(b"str"))),
            Ok(http_body::Frame::data(Bytes::from_static(b"eamed"))),
        ]);
        let request = http::Request::put("http://dispatch.test/upload")
            .body(Body::stream(http_body_util::StreamBody::new(frames)))
            .unwrap();
        send(&pool, request).await.unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].method, "POST");
        assert_eq!(seen[0].header("content-length"), Some("5"));
        assert_eq!(seen[0].header("host"), Some("dispatch.test"));
        assert_eq!(seen[0].body, Bytes::from_static(b"fixed"));
        assert_eq!(seen[1].header("transfer-encoding"), Some("chunked"));
        assert_eq!(seen[1].body, Bytes::from_static(b"streamed"));
    }

    /// Claims ten bytes, delivers three.
    struct ShortBody(Option<Bytes>);

    impl http_body::Body for ShortBody {
        type Data = Bytes;
        type Error = crate::BoxError;

        fn poll_frame(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Option<Result<http_body::Frame<Bytes>, Self::Error>>> {
            std::task::Poll::Ready(self.0.take().map(|data| Ok(http_body::Frame::data(data))))
        }

        fn size_hint(&self) -> http_body::SizeHint {
            http_body::SizeHint::with_exact(10)
        }
    }

    #[tokio::test]
    async fn short_streamed_body_is_an_error() {
        let _ = tracing_subscriber::fmt::try_init();

        let transport = MockTransport::ok("");
        let pool = pool(&transport);

        let request = http::Request::post("http://dispatch.test/")
            .body(Body::stream(ShortBody(Some(Bytes::from_static(b"abc")))))
            .unwrap();
        let error = send(&pool, request).await.unwrap_err();
        assert!(matches!(error, Error::Body(_)), "{error:?}");
        assert_eq!(pool.stats().open, 0);
    }

    #[tokio::test]
    async fn drain_returns_connection() {
        let _ = tracing_subscriber::fmt::try_init();

        let transport = MockTransport::ok("redirect body");
        let pool = pool(&transport);

        let response = send(&pool, get()).await.unwrap();
        assert!(response.into_body().drain(1024).await);
        assert_eq!(pool.stats().idle, 1);

        let response = send(&pool, get()).await.unwrap();
        assert!(!response.into_body().drain(4).await);
        assert_eq!(pool.stats().idle, 0);
    }

    #[tokio::test]
    async fn response_count_matches_requests() {
        let _ = tracing_subscriber::fmt::try_init();

        let served = Arc::new(AtomicUsize::new(0));
        let transport = MockTransport::responder({
            let served = served.clone();
            move |_| {
                served.fetch_add(1, Ordering::SeqCst);
                MockReply::ok("x")
            }
        });
        let pool = pool(&transport);

        for _ in 0..5 {
            let response = send(&pool, get()).await.unwrap();
            response.into_body().collect().await.unwrap();
        }

        assert_eq!(served.load(Ordering::SeqCst), 5);
        assert_eq!(transport.connects(), 1);
    }
}
