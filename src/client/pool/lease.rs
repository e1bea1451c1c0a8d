use std::fmt;
use std::future::{Future as _, IntoFuture as _};
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{ready, Context, Poll};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::trace;

use super::{Origin, Shared};
use crate::client::conn::{Connection, ConnectionId};
use crate::client::Error;
use crate::notify::{Listener, Notified};

/// A connection borrowed from the pool.
///
/// A lease gives exclusive use of one connection. It ends either by calling
/// [`Lease::release`], which tells the pool whether the connection can carry
/// another request, or by dropping the lease, which discards the connection.
/// Either way the pool sees the connection come back exactly once.
///
/// Reads and writes go straight to the transport. After the pool is shut down
/// and its grace period has elapsed, they fail with
/// [`io::ErrorKind::ConnectionAborted`].
pub struct Lease {
    connection: Option<Connection>,
    pool: Weak<Shared>,
    revoked: Listener,
    revocation: Option<Notified>,
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("connection", &self.connection)
            .finish()
    }
}

impl Lease {
    pub(super) fn new(connection: Connection, pool: &Arc<Shared>) -> Self {
        Self {
            connection: Some(connection),
            pool: Arc::downgrade(pool),
            revoked: pool.revoke.listener(),
            revocation: None,
        }
    }

    /// The leased connection.
    pub fn connection(&self) -> &Connection {
        self.connection
            .as_ref()
            .expect("lease holds its connection until released")
    }

    pub(crate) fn connection_mut(&mut self) -> &mut Connection {
        self.connection
            .as_mut()
            .expect("lease holds its connection until released")
    }

    /// The id of the leased connection.
    pub fn id(&self) -> ConnectionId {
        self.connection().id()
    }

    /// The origin of the leased connection.
    pub fn origin(&self) -> &Origin {
        self.connection().origin()
    }

    /// Return the connection to the pool.
    ///
    /// With `reusable` set, and if nothing has marked the connection broken, it is
    /// handed to the next waiting request or kept idle. Otherwise it is closed.
    pub fn release(mut self, reusable: bool) -> Result<(), Error> {
        match self.connection.take() {
            Some(connection) => release(&self.pool, connection, reusable),
            None => Ok(()),
        }
    }

    /// Close the connection and free its slot in the pool.
    pub fn discard(self) {
        let _ = self.release(false);
    }

    /// Take the connection without telling the pool; only used while the pool lock is held.
    pub(super) fn into_connection(mut self) -> Option<Connection> {
        self.connection.take()
    }

    /// Read whatever is available from the transport onto the end of `buf`.
    pub(crate) fn poll_read_buf(
        &mut self,
        cx: &mut Context<'_>,
        buf: &mut BytesMut,
    ) -> Poll<io::Result<usize>> {
        let mut chunk = [0u8; 8 * 1024];
        let mut read = ReadBuf::new(&mut chunk);
        ready!(Pin::new(&mut *self).poll_read(cx, &mut read))?;

        let filled = read.filled();
        buf.extend_from_slice(filled);
        Poll::Ready(Ok(filled.len()))
    }

    fn poll_revoked(&mut self, cx: &mut Context<'_>) -> Poll<io::Error> {
        let fired = self.revoked.is_fired() || {
            let revoked = &self.revoked;
            let revocation = self
                .revocation
                .get_or_insert_with(|| revoked.clone().into_future());
            Pin::new(revocation).poll(cx).is_ready()
        };

        if fired {
            let connection = self.connection_mut();
            trace!(id=%connection.id(), "lease revoked by pool shutdown");
            connection.mark_broken();
            Poll::Ready(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "connection revoked by pool shutdown",
            ))
        } else {
            Poll::Pending
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            trace!(id=%connection.id(), "lease dropped without release");
            let _ = release(&self.pool, connection, false);
        }
    }
}

fn release(pool: &Weak<Shared>, connection: Connection, reusable: bool) -> Result<(), Error> {
    match pool.upgrade() {
        Some(shared) => shared.release(connection, reusable),
        None => Ok(()),
    }
}

impl AsyncRead for Lease {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Poll::Ready(error) = this.poll_revoked(cx) {
            return Poll::Ready(Err(error));
        }
        Pin::new(this.connection_mut().io_mut()).poll_read(cx, buf)
    }
}

impl AsyncWrite for Lease {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Poll::Ready(error) = this.poll_revoked(cx) {
            return Poll::Ready(Err(error));
        }
        Pin::new(this.connection_mut().io_mut()).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Poll::Ready(error) = this.poll_revoked(cx) {
            return Poll::Ready(Err(error));
        }
        Pin::new(this.connection_mut().io_mut()).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(self.get_mut().connection_mut().io_mut()).poll_shutdown(cx)
    }
}

/// A reserved slot for a connection which is still being opened.
///
/// Dropping the reservation before it is fulfilled gives the slot back.
pub(super) struct Reservation {
    origin: Origin,
    pool: Weak<Shared>,
    armed: bool,
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("origin", &self.origin)
            .finish()
    }
}

impl Reservation {
    pub(super) fn new(origin: Origin, pool: &Arc<Shared>) -> Self {
        Self {
            origin,
            pool: Arc::downgrade(pool),
            armed: true,
        }
    }

    pub(super) fn origin(&self) -> &Origin {
        &self.origin
    }

    /// Turn the slot into a lease on the newly opened connection.
    pub(super) fn fulfill(mut self, connection: Connection) -> Result<Lease, Error> {
        self.armed = false;
        match self.pool.upgrade() {
            Some(shared) => shared.fulfill(connection),
            None => Err(Error::PoolClosed),
        }
    }

    /// Forget the reservation without touching the pool; only used while the pool lock is held.
    pub(super) fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.armed {
            if let Some(shared) = self.pool.upgrade() {
                trace!(origin=%self.origin, "connection attempt abandoned");
                shared.unreserve(&self.origin);
            }
        }
    }
}

/// What a request waiting on the pool is eventually given.
#[derive(Debug)]
pub(super) enum Grant {
    /// A connection released by another request.
    Idle(Lease),

    /// Permission to open a new connection.
    Connect(Reservation),
}

impl Grant {
    /// Undo a grant which could not be delivered, without re-entering the pool.
    pub(super) fn into_connection(self) -> Option<Connection> {
        match self {
            Grant::Idle(lease) => lease.into_connection(),
            Grant::Connect(reservation) => {
                reservation.disarm();
                None
            }
        }
    }
}
