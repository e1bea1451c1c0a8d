use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use crate::client::conn::Connection;

#[derive(Debug)]
struct Idle {
    at: Instant,
    connection: Connection,
}

impl Idle {
    fn new(connection: Connection) -> Self {
        Self {
            at: Instant::now(),
            connection,
        }
    }

    fn is_expired(&self, expired: Option<Instant>) -> bool {
        expired.map(|expired| self.at <= expired).unwrap_or(false)
    }
}

/// Idle connections for one origin, most recently released last.
#[derive(Debug, Default)]
pub(super) struct IdleConnections {
    inner: Vec<Idle>,
}

fn expiry(idle_timeout: Option<Duration>) -> Option<Instant> {
    idle_timeout
        .filter(|timeout| !timeout.is_zero())
        .and_then(|timeout| Instant::now().checked_sub(timeout))
}

impl IdleConnections {
    pub(super) fn push(&mut self, connection: Connection) {
        self.inner.push(Idle::new(connection));
    }

    /// Take the most recently released connection which is still usable.
    ///
    /// Expired and broken connections found on the way are moved to `evicted`. Entries are
    /// ordered by release time, so once the newest entry is expired every entry is.
    pub(super) fn pop(
        &mut self,
        idle_timeout: Option<Duration>,
        evicted: &mut Vec<Connection>,
    ) -> Option<Connection> {
        let expired = expiry(idle_timeout);

        trace!("checking {} idle connections", self.len());

        while let Some(entry) = self.inner.pop() {
            if entry.is_expired(expired) {
                trace!("found expired connection");
                evicted.push(entry.connection);
                self.drain(evicted);
                return None;
            }

            if entry.connection.is_reusable() {
                trace!(id=%entry.connection.id(), "found idle connection");
                return Some(entry.connection);
            }

            trace!("found closed connection");
            evicted.push(entry.connection);
        }

        None
    }

    /// Remove connections which have been idle too long, or whose peer has hung up.
    pub(super) fn reap(&mut self, idle_timeout: Option<Duration>, evicted: &mut Vec<Connection>) {
        let expired = expiry(idle_timeout);

        let mut kept = Vec::with_capacity(self.inner.len());
        for mut entry in self.inner.drain(..) {
            if entry.is_expired(expired) || entry.connection.peer_closed() {
                evicted.push(entry.connection);
            } else {
                kept.push(entry);
            }
        }
        self.inner = kept;
    }

    /// When the least recently released connection went idle.
    pub(super) fn oldest(&self) -> Option<Instant> {
        self.inner.first().map(|entry| entry.at)
    }

    pub(super) fn pop_oldest(&mut self) -> Option<Connection> {
        if self.inner.is_empty() {
            None
        } else {
            Some(self.inner.remove(0).connection)
        }
    }

    pub(super) fn drain(&mut self, evicted: &mut Vec<Connection>) {
        evicted.extend(self.inner.drain(..).map(|entry| entry.connection));
    }

    pub(super) fn len(&self) -> usize {
        self.inner.len()
    }

    pub(super) fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::client::pool::Origin;

    fn connection() -> (Connection, tokio::io::DuplexStream) {
        let (client, server) = tokio::io::duplex(64);
        let origin: Origin = "http://idle.test".parse().unwrap();
        (Connection::new(origin, client), server)
    }

    #[tokio::test]
    async fn verify_idle_connections() {
        let mut idle = IdleConnections::default();
        assert_eq!(idle.len(), 0);
        assert!(idle.is_empty());

        let (conn, _server) = connection();
        idle.push(conn);

        assert_eq!(idle.len(), 1);
        assert!(!idle.is_empty());

        let mut evicted = Vec::new();
        let conn = idle.pop(None, &mut evicted);
        assert!(conn.is_some());
        assert!(evicted.is_empty());
        assert!(idle.is_empty());
    }

    #[tokio::test]
    async fn pop_is_last_in_first_out() {
        let mut idle = IdleConnections::default();
        let (first, _s1) = connection();
        let (second, _s2) = connection();
        let (third, _s3) = connection();
        let ids = [first.id(), second.id(), third.id()];

        idle.push(first);
        idle.push(second);
        idle.push(third);

        let mut evicted = Vec::new();
        let popped: Vec<_> = std::iter::from_fn(|| idle.pop(None, &mut evicted))
            .map(|conn| conn.id())
            .collect();

        assert_eq!(popped, vec![ids[2], ids[1], ids[0]]);
        assert!(evicted.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_connections_are_evicted() {
        let mut idle = IdleConnections::default();
        let (a, _s1) = connection();
        let (b, _s2) = connection();
        idle.push(a);
        idle.push(b);

        tokio::time::advance(Duration::from_secs(5)).await;

        let mut evicted = Vec::new();
        let conn = idle.pop(Some(Duration::from_secs(1)), &mut evicted);
        assert!(conn.is_none());
        assert_eq!(evicted.len(), 2);
        assert!(idle.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_connections_survive_timeout() {
        let mut idle = IdleConnections::default();
        let (a, _s1) = connection();
        idle.push(a);

        tokio::time::advance(Duration::from_millis(100)).await;

        let mut evicted = Vec::new();
        assert!(idle.pop(Some(Duration::from_secs(1)), &mut evicted).is_some());
        assert!(evicted.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reap_removes_expired_and_closed() {
        let mut idle = IdleConnections::default();
        let (old, _s1) = connection();
        idle.push(old);

        tokio::time::advance(Duration::from_secs(10)).await;

        let (closed, server) = connection();
        idle.push(closed);
        drop(server);

        let (healthy, _s3) = connection();
        let healthy_id = healthy.id();
        idle.push(healthy);

        let mut evicted = Vec::new();
        idle.reap(Some(Duration::from_secs(5)), &mut evicted);

        assert_eq!(evicted.len(), 2);
        assert_eq!(idle.len(), 1);
        assert_eq!(idle.pop(None, &mut evicted).map(|c| c.id()), Some(healthy_id));
    }

    #[tokio::test(start_paused = true)]
    async fn oldest_is_first_released() {
        let mut idle = IdleConnections::default();
        assert!(idle.oldest().is_none());

        let (a, _s1) = connection();
        let a_id = a.id();
        idle.push(a);
        let first = idle.oldest().unwrap();

        tokio::time::advance(Duration::from_secs(1)).await;
        let (b, _s2) = connection();
        idle.push(b);

        assert_eq!(idle.oldest(), Some(first));
        assert_eq!(idle.pop_oldest().map(|c| c.id()), Some(a_id));
        assert_eq!(idle.len(), 1);
    }
}
