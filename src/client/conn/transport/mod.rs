//! Transport streams for connecting to remote servers.
//!
//! Transports are responsible for establishing a connection to a remote origin and
//! shuffling bytes back and forth. Name resolution and TLS negotiation belong here too:
//! by the time the pool receives a stream it is ready to carry HTTP/1.1.
//!
//! Any `tower::Service<Origin>` which returns an async byte stream is a [`Transport`].

use std::future::Future;
use std::task::{Context, Poll};

use tower::Service;

use super::Io;
use crate::client::pool::Origin;
use crate::BoxError;

#[cfg(any(test, feature = "mocks"))]
pub mod mock;
pub mod tcp;

/// A transport opens duplex byte streams to an [`Origin`].
pub trait Transport: Clone + Send + Sync + 'static {
    /// The type of IO stream used by this transport
    type IO: Io;

    /// Error returned when connection fails
    type Error: Into<BoxError>;

    /// The future type returned by this service
    type Future: Future<Output = Result<Self::IO, <Self as Transport>::Error>> + Send + 'static;

    /// Connect to a remote origin and return a stream.
    fn connect(&mut self, origin: Origin) -> <Self as Transport>::Future;

    /// Poll the transport to see if it is ready to accept a new connection.
    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), <Self as Transport>::Error>>;
}

impl<T, IO> Transport for T
where
    T: Service<Origin, Response = IO>,
    T: Clone + Send + Sync + 'static,
    T::Error: Into<BoxError>,
    T::Future: Send + 'static,
    IO: Io,
{
    type IO = IO;
    type Error = T::Error;
    type Future = T::Future;

    fn connect(&mut self, origin: Origin) -> <Self as Service<Origin>>::Future {
        self.call(origin)
    }

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), <Self as Transport>::Error>> {
        Service::poll_ready(self, cx)
    }
}
