//! HTTP/1.1 client with pooled connections.
//!
//! There are three levels of available APIs in this library:
//!
//! 1. The high-level [`Client`] API, which is the most user-friendly and abstracts away most of the details.
//!    It is "batteries-included", and supports redirects, retries and timeouts.
//! 2. The [`Service`][ClientService] API, which sends exactly one request per call over a pooled
//!    connection. It presents a `tower::Service`, and can be wrapped by middleware compatible with
//!    the tower ecosystem (see [`service::retry`] and [`service::redirect`]).
//! 3. The [pool][self::pool] and [connection][self::conn] APIs, which lease connections explicitly
//!    and run single exchanges on them with [`conn::http1::execute`].
//!
//! Whichever level is used, a connection is leased to one request at a time. The lease
//! travels with the response body: reading the body to the end returns the connection to
//! the pool when the server allows it, and dropping the body early closes the connection.

use std::fmt;
use std::time::Duration;

use tower::util::{BoxCloneSyncService, Oneshot};
use tower::ServiceExt as _;

use self::conn::http1::IncomingBody;
use self::pool::{PoolHandle, PoolStats};
use crate::body::Body;

mod builder;
pub mod conn;
pub mod error;
pub mod pool;
pub mod service;

pub use self::builder::Builder;
pub use self::error::Error;
pub use self::pool::Config as PoolConfig;
pub use self::service::ClientService;

/// A boxed client service, with the body types used by [`Client`].
pub type BoxedClientService =
    BoxCloneSyncService<http::Request<Body>, http::Response<IncomingBody>, Error>;

/// A high-level async HTTP client.
///
/// Cloning a client is cheap, and clones share one connection pool.
///
/// # Example
/// ```no_run
/// # use courier::client::Client;
/// # async fn run() -> Result<(), courier::client::Error> {
/// use http_body_util::BodyExt;
///
/// let client = Client::new();
/// let response = client.get("http://example.com".parse().unwrap()).await?;
/// let body = response.into_body().collect().await?.to_bytes();
/// println!("{} bytes", body.len());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    service: BoxedClientService,
    pool: PoolHandle,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client").field("pool", &self.pool).finish()
    }
}

impl Default for Client {
    fn default() -> Self {
        Builder::default().build()
    }
}

impl Client {
    /// Create a new client with default settings and a TCP transport.
    pub fn new() -> Self {
        Builder::default().build()
    }

    /// Create a new client from a service and the handle of the pool it draws from.
    ///
    /// It is much easier to use the builder interface to create a client.
    pub fn new_from_service(service: BoxedClientService, pool: PoolHandle) -> Self {
        Self { service, pool }
    }

    /// Create a new builder for clients, with default settings.
    pub fn builder() -> Builder {
        Builder::new()
    }
}

impl Client {
    /// Send an http Request, and return a Future of the Response.
    ///
    /// The response resolves once the head has been read. Its body is read from the
    /// connection as it is polled.
    pub fn request(
        &self,
        request: http::Request<Body>,
    ) -> Oneshot<BoxedClientService, http::Request<Body>> {
        self.service.clone().oneshot(request)
    }

    /// Make a GET request to the given URI.
    pub async fn get(&self, uri: http::Uri) -> Result<http::Response<IncomingBody>, Error> {
        let mut request = http::Request::new(Body::empty());
        *request.uri_mut() = uri;
        self.request(request).await
    }

    /// Current occupancy of the connection pool.
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Shut down the connection pool shared by this client and its clones.
    ///
    /// See [`Pool::shutdown`][pool::Pool::shutdown].
    pub async fn shutdown(&self, grace: Duration) {
        self.pool.shutdown(grace).await
    }
}
