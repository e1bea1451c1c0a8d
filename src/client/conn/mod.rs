//! Client connection types.
//!
//! A client connection is composed of a transport and a protocol, which each serve a
//! different purpose in the client connection lifecycle.
//!
//! ## Transport
//!
//! The transport is responsible for establishing a connection to a remote server, shuffling bytes back
//! and forth, and handling the low-level details of the connection (DNS, TCP options, TLS). Transports
//! implement the [`Transport`] trait, effectively making them a service which accepts an
//! [`Origin`] and returns a bidirectional stream.
//!
//! ## Connection
//!
//! A [`Connection`] owns exactly one transport stream to one origin. It records when it was
//! created and last used, and whether it may carry another request once the current
//! exchange is finished.
//!
//! ## Protocol
//!
//! The [`http1`] module writes requests onto a leased connection and reads the response back,
//! handing out the response body as a lazy stream bound to the connection.

use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{trace, warn};

use super::pool::Origin;

pub mod http1;
pub mod transport;

pub use self::transport::Transport;

/// The I/O requirements for a transport stream carried by a [`Connection`].
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub(crate) type BoxedIo = Box<dyn Io>;

static CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// A process-unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        ConnectionId(CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A single duplex channel to one origin.
pub struct Connection {
    id: ConnectionId,
    origin: Origin,
    io: BoxedIo,
    created_at: Instant,
    last_used: Instant,
    reusable: bool,
    requests: usize,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("origin", &self.origin)
            .field("reusable", &self.reusable)
            .field("requests", &self.requests)
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub(crate) fn new<IO>(origin: Origin, io: IO) -> Self
    where
        IO: Io,
    {
        let now = Instant::now();
        let connection = Self {
            id: ConnectionId::next(),
            origin,
            io: Box::new(io),
            created_at: now,
            last_used: now,
            reusable: true,
            requests: 0,
        };
        trace!(id=%connection.id, origin=%connection.origin, "creating connection");
        connection
    }

    /// The unique id of this connection.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The origin this connection is bound to.
    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// When the transport was opened.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// When the last exchange on this connection started.
    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    /// Number of requests which have been written to this connection.
    pub fn requests(&self) -> usize {
        self.requests
    }

    /// Whether this connection can carry another request.
    ///
    /// Once false, it never becomes true again.
    pub fn is_reusable(&self) -> bool {
        self.reusable
    }

    pub(crate) fn mark_broken(&mut self) {
        self.reusable = false;
    }

    pub(crate) fn begin_exchange(&mut self) {
        self.last_used = Instant::now();
        self.requests += 1;
    }

    pub(crate) fn io_mut(&mut self) -> &mut BoxedIo {
        &mut self.io
    }

    pub(crate) fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            origin: self.origin.clone(),
            reused: self.requests > 1,
            requests: self.requests,
        }
    }

    /// Non-blocking check for a peer which has closed (or half-closed) the transport.
    ///
    /// An idle HTTP/1.1 connection should have nothing to read: end-of-stream, an
    /// error, or unsolicited bytes all mean it can't be used for another request.
    pub(crate) fn peer_closed(&mut self) -> bool {
        let mut cx = Context::from_waker(futures_util::task::noop_waker_ref());
        let mut byte = [0u8; 1];
        let mut buf = ReadBuf::new(&mut byte);

        let closed = match Pin::new(&mut self.io).poll_read(&mut cx, &mut buf) {
            Poll::Pending => false,
            Poll::Ready(Ok(())) if buf.filled().is_empty() => {
                trace!(id=%self.id, "peer closed idle connection");
                true
            }
            Poll::Ready(Ok(())) => {
                warn!(id=%self.id, "unsolicited bytes on idle connection");
                true
            }
            Poll::Ready(Err(error)) => {
                trace!(id=%self.id, %error, "idle connection errored");
                true
            }
        };

        if closed {
            self.mark_broken();
        }
        closed
    }
}

/// Details about the connection which carried a response.
///
/// Available as a response extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// The connection id.
    pub id: ConnectionId,

    /// The origin of the connection.
    pub origin: Origin,

    /// Whether the connection had carried an earlier request.
    pub reused: bool,

    /// Number of requests carried so far, including this one.
    pub requests: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    use static_assertions::assert_impl_all;
    use tokio::io::AsyncWriteExt as _;

    assert_impl_all!(Connection: Send);
    assert_impl_all!(ConnectionInfo: Send, Sync, Clone);

    fn origin() -> Origin {
        "http://example.com".parse().unwrap()
    }

    #[tokio::test]
    async fn open_connection_is_usable() {
        let (client, _server) = tokio::io::duplex(64);
        let mut conn = Connection::new(origin(), client);

        assert!(!conn.peer_closed());
        assert!(conn.is_reusable());
    }

    #[tokio::test]
    async fn peer_closed_connection() {
        let (client, server) = tokio::io::duplex(64);
        let mut conn = Connection::new(origin(), client);
        drop(server);

        assert!(conn.peer_closed());
        assert!(!conn.is_reusable());
    }

    #[tokio::test]
    async fn unsolicited_bytes_close_connection() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut conn = Connection::new(origin(), client);
        server.write_all(b"HTTP/1.1 408").await.unwrap();

        assert!(conn.peer_closed());
    }

    #[test]
    fn ids_are_unique() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("conn-"));
    }

    #[tokio::test]
    async fn exchanges_are_counted() {
        let (client, _server) = tokio::io::duplex(64);
        let mut conn = Connection::new(origin(), client);

        conn.begin_exchange();
        assert!(!conn.info().reused);
        conn.begin_exchange();
        assert!(conn.info().reused);
        assert_eq!(conn.requests(), 2);
    }
}
