//! Connection pooling for clients.
//!
//! The pool keeps HTTP/1.1 connections open between requests and lends each one to a
//! single request at a time. Connections are partitioned by [`Origin`], and bounded both
//! per origin and in total.
//!
//! Borrowing a connection produces a [`Lease`]. The lease ends when it is released (with
//! a verdict on whether the connection can be reused) or dropped (which discards the
//! connection). Released connections go to the oldest request waiting on the same
//! origin, or into a last-in-first-out idle set where they stay until they are reused,
//! they time out, or the peer closes them.
//!
//! All pool bookkeeping sits behind one lock. Connecting, probing and closing
//! transports all happen outside of it.
//!
//! Pool configuration happens in the [`Config`] type.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::poll_fn;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

mod idle;
mod key;
mod lease;
mod reaper;

use self::idle::IdleConnections;
pub use self::key::{Origin, UriError};
pub use self::lease::Lease;
use self::lease::{Grant, Reservation};

use super::conn::{Connection, ConnectionId, Transport};
use super::Error;
use crate::notify::Trigger;

/// Configuration for a connection pool.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Config {
    /// Limit on open connections (idle, leased or connecting) to one origin.
    pub max_connections_per_origin: usize,

    /// Limit on open connections across all origins.
    pub max_total_connections: usize,

    /// Limit on idle connections kept for one origin.
    pub max_idle_per_origin: usize,

    /// Limit on idle connections kept across all origins.
    pub max_idle_total: usize,

    /// How long a connection may sit idle before it is closed.
    pub idle_timeout: Option<Duration>,

    /// How long a request waits for pool capacity before failing with
    /// [`Error::PoolExhausted`].
    pub acquisition_timeout: Option<Duration>,

    /// How often idle connections are checked for expiry in the background.
    pub reap_interval: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_connections_per_origin: 10,
            max_total_connections: 100,
            max_idle_per_origin: 32,
            max_idle_total: 100,
            idle_timeout: Some(Duration::from_secs(90)),
            acquisition_timeout: Some(Duration::from_secs(30)),
            reap_interval: Some(Duration::from_secs(30)),
        }
    }
}

/// A snapshot of pool occupancy and lifetime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct PoolStats {
    /// Connections waiting in the idle set.
    pub idle: usize,

    /// Connections currently leased to a request.
    pub leased: usize,

    /// Connections being opened.
    pub connecting: usize,

    /// Requests waiting for capacity.
    pub waiting: usize,

    /// All open connections: idle, leased and connecting.
    pub open: usize,

    /// Leases handed out.
    pub acquired: u64,

    /// Leases returned.
    pub released: u64,

    /// Connections opened.
    pub created: u64,

    /// Connections closed.
    pub closed: u64,
}

/// A pool of connections to remote origins, opened with the transport `T`.
pub struct Pool<T> {
    shared: Arc<Shared>,
    transport: T,
}

impl<T: Clone> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            transport: self.transport.clone(),
        }
    }
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("stats", &self.shared.stats())
            .finish()
    }
}

impl<T> Pool<T> {
    /// Create a pool which opens connections with `transport`.
    ///
    /// When called inside a tokio runtime, a background task is started to close
    /// expired idle connections every [`Config::reap_interval`].
    pub fn new(transport: T, config: Config) -> Self {
        let shared = Arc::new(Shared::new(config));
        reaper::spawn(&shared);
        Self { shared, transport }
    }

    /// The pool configuration.
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Current occupancy of the pool.
    pub fn stats(&self) -> PoolStats {
        self.shared.stats()
    }

    /// A handle for observing and shutting down the pool, independent of the transport type.
    pub fn handle(&self) -> PoolHandle {
        PoolHandle {
            shared: self.shared.clone(),
        }
    }

    /// Close the pool.
    ///
    /// Idle connections are closed and waiting requests fail with
    /// [`Error::PoolClosed`] straight away. Leased connections get `grace` to be
    /// returned, after which their leases are revoked and fail on the next read or write.
    pub async fn shutdown(&self, grace: Duration) {
        self.shared.shutdown(grace).await
    }
}

impl<T> Pool<T>
where
    T: Transport,
{
    /// Borrow a connection to `origin`.
    ///
    /// Reuses the most recently released idle connection when there is one, opens a
    /// new connection when the limits allow, and otherwise waits up to
    /// [`Config::acquisition_timeout`] for capacity.
    #[cfg_attr(not(tarpaulin), tracing::instrument(skip_all, fields(origin = %origin), level = "debug"))]
    pub async fn acquire(&self, origin: Origin) -> Result<Lease, Error> {
        let deadline = self
            .shared
            .config
            .acquisition_timeout
            .map(|timeout| Instant::now() + timeout);

        loop {
            let grant = match self.shared.checkout(&origin)? {
                Checkout::Granted(grant) => grant,
                Checkout::Waiting(receiver) => wait(receiver, deadline).await?,
            };

            match grant {
                Grant::Idle(mut lease) => {
                    if lease.connection_mut().peer_closed() {
                        debug!(id=%lease.id(), "idle connection closed by peer");
                        lease.discard();
                        continue;
                    }

                    debug!(id=%lease.id(), "reusing pooled connection");
                    return Ok(lease);
                }
                Grant::Connect(reservation) => return self.connect(reservation).await,
            }
        }
    }

    async fn connect(&self, reservation: Reservation) -> Result<Lease, Error> {
        let origin = reservation.origin().clone();
        let mut transport = self.transport.clone();

        trace!("opening new connection");
        let ready = poll_fn(|cx| Transport::poll_ready(&mut transport, cx))
            .await
            .map_err(Error::connection);

        let io = match ready {
            Ok(()) => transport
                .connect(origin.clone())
                .await
                .map_err(Error::connection),
            Err(error) => Err(error),
        };

        let io = match io {
            Ok(io) => io,
            Err(error) => {
                debug!(%error, "connection attempt failed");
                return Err(error);
            }
        };

        let connection = Connection::new(origin, io);
        debug!(id=%connection.id(), "connection established");
        reservation.fulfill(connection)
    }
}

async fn wait(
    mut receiver: oneshot::Receiver<Grant>,
    deadline: Option<Instant>,
) -> Result<Grant, Error> {
    let granted = match deadline {
        Some(deadline) => match tokio::time::timeout_at(deadline, &mut receiver).await {
            Ok(granted) => granted,
            Err(_) => return expired(receiver),
        },
        None => receiver.await,
    };

    granted.map_err(|_| Error::PoolClosed)
}

/// The wait timed out. A grant sent after the timer fired is still taken, since
/// dropping it would close a healthy connection or hand back its slot.
fn expired(mut receiver: oneshot::Receiver<Grant>) -> Result<Grant, Error> {
    receiver.close();
    match receiver.try_recv() {
        Ok(grant) => {
            trace!("connection granted as the wait timed out");
            Ok(grant)
        }
        Err(_) => {
            debug!("timed out waiting for a connection");
            Err(Error::PoolExhausted)
        }
    }
}

/// A type-erased handle to a [`Pool`].
#[derive(Debug, Clone)]
pub struct PoolHandle {
    shared: Arc<Shared>,
}

impl PoolHandle {
    /// Current occupancy of the pool.
    pub fn stats(&self) -> PoolStats {
        self.shared.stats()
    }

    /// Close the pool, see [`Pool::shutdown`].
    pub async fn shutdown(&self, grace: Duration) {
        self.shared.shutdown(grace).await
    }
}

enum Checkout {
    Granted(Grant),
    Waiting(oneshot::Receiver<Grant>),
}

struct Waiter {
    origin: Origin,
    tx: oneshot::Sender<Grant>,
}

#[derive(Default)]
struct OriginState {
    idle: IdleConnections,
    open: usize,
}

#[derive(Default)]
struct PoolState {
    origins: HashMap<Origin, OriginState>,
    waiters: VecDeque<Waiter>,
    leased: HashMap<ConnectionId, Origin>,
    open: usize,
    connecting: usize,
    closed: bool,

    acquired: u64,
    released: u64,
    created: u64,
    discarded: u64,
}

impl PoolState {
    fn origin_open(&self, origin: &Origin) -> usize {
        self.origins.get(origin).map_or(0, |entry| entry.open)
    }

    fn idle_count(&self) -> usize {
        self.origins.values().map(|entry| entry.idle.len()).sum()
    }

    fn has_waiter(&self, origin: &Origin) -> bool {
        self.waiters
            .iter()
            .any(|waiter| &waiter.origin == origin && !waiter.tx.is_closed())
    }

    fn has_capacity(
        &mut self,
        origin: &Origin,
        config: &Config,
        closing: &mut Vec<Connection>,
    ) -> bool {
        self.origin_open(origin) < config.max_connections_per_origin
            && (self.open < config.max_total_connections || self.evict_oldest_idle(closing))
    }

    fn can_idle(&self, origin: &Origin, config: &Config) -> bool {
        let for_origin = self.origins.get(origin).map_or(0, |entry| entry.idle.len());
        for_origin < config.max_idle_per_origin && self.idle_count() < config.max_idle_total
    }

    fn reserve(&mut self, origin: &Origin) {
        self.open += 1;
        self.connecting += 1;
        self.origins.entry(origin.clone()).or_default().open += 1;
    }

    fn unreserve(&mut self, origin: &Origin) {
        self.connecting = self.connecting.saturating_sub(1);
        self.open = self.open.saturating_sub(1);
        self.shrink(origin, 1);
    }

    /// Account for `n` closed connections to `origin`.
    fn forget(&mut self, origin: &Origin, n: usize) {
        self.open = self.open.saturating_sub(n);
        self.discarded += n as u64;
        self.shrink(origin, n);
    }

    fn shrink(&mut self, origin: &Origin, n: usize) {
        if let Some(entry) = self.origins.get_mut(origin) {
            entry.open = entry.open.saturating_sub(n);
            if entry.open == 0 && entry.idle.is_empty() {
                self.origins.remove(origin);
            }
        }
    }

    fn lease(&mut self, connection: Connection, shared: &Arc<Shared>) -> Lease {
        self.leased
            .insert(connection.id(), connection.origin().clone());
        self.acquired += 1;
        Lease::new(connection, shared)
    }

    fn pop_idle(
        &mut self,
        origin: &Origin,
        idle_timeout: Option<Duration>,
        closing: &mut Vec<Connection>,
    ) -> Option<Connection> {
        let before = closing.len();
        let connection = self
            .origins
            .get_mut(origin)
            .and_then(|entry| entry.idle.pop(idle_timeout, closing));

        let evicted = closing.len() - before;
        if evicted > 0 {
            debug!(evicted, "closing stale idle connections");
            self.forget(origin, evicted);
        }
        connection
    }

    /// Close the connection which has been idle the longest, across all origins.
    fn evict_oldest_idle(&mut self, closing: &mut Vec<Connection>) -> bool {
        let oldest = self
            .origins
            .iter()
            .filter_map(|(origin, entry)| entry.idle.oldest().map(|at| (at, origin)))
            .min_by_key(|(at, _)| *at)
            .map(|(_, origin)| origin.clone());

        let Some(origin) = oldest else {
            return false;
        };

        match self
            .origins
            .get_mut(&origin)
            .and_then(|entry| entry.idle.pop_oldest())
        {
            Some(connection) => {
                debug!(id=%connection.id(), "evicting idle connection to make room");
                closing.push(connection);
                self.forget(&origin, 1);
                true
            }
            None => false,
        }
    }

    /// Give a released connection to the oldest live request waiting on its origin.
    ///
    /// Returns the connection if nobody wanted it.
    fn hand_off(&mut self, mut connection: Connection, shared: &Arc<Shared>) -> Option<Connection> {
        let origin = connection.origin().clone();

        while let Some(index) = self.waiters.iter().position(|w| w.origin == origin) {
            let Some(waiter) = self.waiters.remove(index) else {
                break;
            };
            if waiter.tx.is_closed() {
                continue;
            }

            let id = connection.id();
            let lease = self.lease(connection, shared);
            match waiter.tx.send(Grant::Idle(lease)) {
                Ok(()) => {
                    trace!(%id, "handed connection to waiting request");
                    return None;
                }
                Err(grant) => {
                    self.leased.remove(&id);
                    self.acquired -= 1;
                    connection = grant.into_connection()?;
                }
            }
        }

        Some(connection)
    }

    /// Hand out connect reservations to waiters, oldest first, while capacity allows.
    fn dispatch(&mut self, shared: &Arc<Shared>, closing: &mut Vec<Connection>) {
        let config = &shared.config;
        let mut index = 0;

        while index < self.waiters.len() {
            if self.waiters[index].tx.is_closed() {
                self.waiters.remove(index);
                continue;
            }

            let origin = self.waiters[index].origin.clone();
            if self.origin_open(&origin) >= config.max_connections_per_origin {
                index += 1;
                continue;
            }

            if self.open >= config.max_total_connections && !self.evict_oldest_idle(closing) {
                break;
            }

            let Some(waiter) = self.waiters.remove(index) else {
                break;
            };

            self.reserve(&origin);
            let reservation = Reservation::new(origin.clone(), shared);
            if let Err(grant) = waiter.tx.send(Grant::Connect(reservation)) {
                grant.into_connection();
                self.unreserve(&origin);
            } else {
                trace!(%origin, "granted connection slot to waiting request");
            }
        }
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.idle_count(),
            leased: self.leased.len(),
            connecting: self.connecting,
            waiting: self
                .waiters
                .iter()
                .filter(|waiter| !waiter.tx.is_closed())
                .count(),
            open: self.open,
            acquired: self.acquired,
            released: self.released,
            created: self.created,
            closed: self.discarded,
        }
    }
}

pub(crate) struct Shared {
    config: Config,
    state: Mutex<PoolState>,
    revoke: Trigger,
    returned: Notify,
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Shared {
    fn new(mut config: Config) -> Self {
        if config.max_connections_per_origin == 0 || config.max_total_connections == 0 {
            warn!("connection limits must be at least 1");
            config.max_connections_per_origin = config.max_connections_per_origin.max(1);
            config.max_total_connections = config.max_total_connections.max(1);
        }

        let (revoke, _) = crate::notify::channel();
        Self {
            config,
            state: Mutex::new(PoolState::default()),
            revoke,
            returned: Notify::new(),
        }
    }

    fn stats(&self) -> PoolStats {
        self.state.lock().stats()
    }

    fn checkout(self: &Arc<Self>, origin: &Origin) -> Result<Checkout, Error> {
        let mut closing = Vec::new();

        let checkout = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(Error::PoolClosed);
            }

            if let Some(connection) = state.pop_idle(origin, self.config.idle_timeout, &mut closing) {
                trace!(id=%connection.id(), "found idle connection");
                Checkout::Granted(Grant::Idle(state.lease(connection, self)))
            } else if !state.has_waiter(origin)
                && state.has_capacity(origin, &self.config, &mut closing)
            {
                state.reserve(origin);
                Checkout::Granted(Grant::Connect(Reservation::new(origin.clone(), self)))
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(Waiter {
                    origin: origin.clone(),
                    tx,
                });
                trace!(waiting = state.waiters.len(), "pool at capacity");
                Checkout::Waiting(rx)
            }
        };

        // Stale connections are closed once the lock is released.
        drop(closing);
        Ok(checkout)
    }

    fn fulfill(self: &Arc<Self>, connection: Connection) -> Result<Lease, Error> {
        let mut state = self.state.lock();
        state.connecting = state.connecting.saturating_sub(1);
        state.created += 1;

        if state.closed {
            let origin = connection.origin().clone();
            state.forget(&origin, 1);
            drop(state);
            drop(connection);
            self.returned.notify_waiters();
            return Err(Error::PoolClosed);
        }

        Ok(state.lease(connection, self))
    }

    fn unreserve(self: &Arc<Self>, origin: &Origin) {
        let mut closing = Vec::new();
        {
            let mut state = self.state.lock();
            state.unreserve(origin);
            state.dispatch(self, &mut closing);
        }
        drop(closing);
        self.returned.notify_waiters();
    }

    fn release(self: &Arc<Self>, connection: Connection, reusable: bool) -> Result<(), Error> {
        let mut closing = Vec::new();
        let result = self.release_locked(connection, reusable, &mut closing);
        drop(closing);
        self.returned.notify_waiters();
        result
    }

    fn release_locked(
        self: &Arc<Self>,
        connection: Connection,
        reusable: bool,
        closing: &mut Vec<Connection>,
    ) -> Result<(), Error> {
        let mut state = self.state.lock();
        let id = connection.id();

        let Some(origin) = state.leased.remove(&id) else {
            error!(%id, "released a connection which is not leased");
            closing.push(connection);
            return Err(Error::DoubleRelease(id));
        };
        state.released += 1;

        if reusable && connection.is_reusable() && !state.closed {
            if let Some(connection) = state.hand_off(connection, self) {
                if state.can_idle(&origin, &self.config) {
                    trace!(%id, "connection returned to idle set");
                    state.origins.entry(origin).or_default().idle.push(connection);
                } else {
                    debug!(%id, "idle limit reached, closing connection");
                    closing.push(connection);
                    state.forget(&origin, 1);
                }
            }
        } else {
            debug!(%id, "discarding connection");
            closing.push(connection);
            state.forget(&origin, 1);
        }

        state.dispatch(self, closing);
        Ok(())
    }

    /// Close expired or hung-up idle connections. Returns `false` once the pool is closed.
    fn reap(self: &Arc<Self>) -> bool {
        let mut closing = Vec::new();
        {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }

            let idle_timeout = self.config.idle_timeout;
            let mut reaped = Vec::new();
            for (origin, entry) in state.origins.iter_mut() {
                let before = closing.len();
                entry.idle.reap(idle_timeout, &mut closing);
                if closing.len() > before {
                    reaped.push((origin.clone(), closing.len() - before));
                }
            }

            for (origin, n) in reaped {
                state.forget(&origin, n);
            }

            if !closing.is_empty() {
                debug!(reaped = closing.len(), "reaped idle connections");
                state.dispatch(self, &mut closing);
            }
        }
        drop(closing);
        true
    }

    async fn shutdown(&self, grace: Duration) {
        let (closing, waiters) = {
            let mut state = self.state.lock();
            state.closed = true;

            let mut closing = Vec::new();
            let mut drained = Vec::new();
            for (origin, entry) in state.origins.iter_mut() {
                let before = closing.len();
                entry.idle.drain(&mut closing);
                drained.push((origin.clone(), closing.len() - before));
            }
            for (origin, n) in drained {
                state.forget(&origin, n);
            }

            (closing, std::mem::take(&mut state.waiters))
        };

        debug!(
            idle = closing.len(),
            waiting = waiters.len(),
            "shutting down connection pool"
        );
        drop(waiters);
        drop(closing);

        let deadline = Instant::now() + grace;
        loop {
            let returned = self.returned.notified();
            tokio::pin!(returned);
            returned.as_mut().enable();

            let outstanding = {
                let state = self.state.lock();
                state.leased.len() + state.connecting
            };

            if outstanding == 0 {
                debug!("connection pool shut down");
                return;
            }

            trace!(outstanding, "waiting for leased connections");
            if tokio::time::timeout_at(deadline, returned).await.is_err() {
                warn!(outstanding, "shutdown grace period elapsed, revoking leases");
                self.revoke.fire();
                return;
            }
        }
    }
}
