//! The `tower::Service` layer of the client.
//!
//! [`ClientService`] is the innermost service: it resolves the origin of each request,
//! borrows a connection from the [pool][crate::client::pool] and runs the exchange with
//! [`http1::execute`]. [`retry`] and [`redirect`] provide the middleware which the
//! [`Client`][crate::client::Client] stacks on top of it.

use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};

use tracing::Instrument as _;

use super::conn::http1::{self, IncomingBody};
use super::conn::Transport;
use super::pool::{Origin, Pool};
use super::Error;
use crate::body::Body;
use crate::BoxFuture;

pub mod redirect;
pub mod retry;

/// A client which provides a simple HTTP `tower::Service`.
///
/// Each call leases one pooled connection for the duration of the exchange. The lease
/// is carried by the response body, so the connection only goes back to the pool once
/// the body has been read to the end (or is closed if the body is dropped early).
///
/// To use a client service, you must first poll the service to readiness with `Service::poll_ready`,
/// and then make the request with `Service::call`. This can be simplified with the `tower::ServiceExt`
/// which provides a `Service::oneshot` method that combines these two steps into a single future.
pub struct ClientService<T> {
    pool: Pool<T>,
    config: Arc<http1::Config>,
}

impl<T> ClientService<T> {
    /// Create a service which sends requests over connections from `pool`.
    pub fn new(pool: Pool<T>, config: http1::Config) -> Self {
        Self {
            pool,
            config: Arc::new(config),
        }
    }

    /// The pool connections are borrowed from.
    pub fn pool(&self) -> &Pool<T> {
        &self.pool
    }
}

impl<T: Clone> Clone for ClientService<T> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            config: self.config.clone(),
        }
    }
}

impl<T> fmt::Debug for ClientService<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientService")
            .field("pool", &self.pool)
            .field("config", &self.config)
            .finish()
    }
}

impl<T> ClientService<T>
where
    T: Transport,
{
    /// Send a single request, without retries or redirects.
    pub async fn send(
        &self,
        request: http::Request<Body>,
    ) -> Result<http::Response<IncomingBody>, Error> {
        let origin = Origin::try_from(request.uri())?;
        let lease = self.pool.acquire(origin).await?;
        http1::execute(lease, request, &self.config).await
    }
}

impl<T> tower::Service<http::Request<Body>> for ClientService<T>
where
    T: Transport,
{
    type Response = http::Response<IncomingBody>;
    type Error = Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Capacity is managed by the pool, which queues callers in `acquire`.
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: http::Request<Body>) -> Self::Future {
        let service = self.clone();
        let span = tracing::debug_span!("request", method = %request.method(), uri = %request.uri());
        Box::pin(async move { service.send(request).await }.instrument(span))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use static_assertions::assert_impl_all;
    use tower::ServiceExt as _;

    use crate::client::conn::transport::mock::MockTransport;
    use crate::client::conn::transport::tcp::TcpTransport;
    use crate::client::conn::ConnectionInfo;
    use crate::client::pool::Config;

    assert_impl_all!(ClientService<TcpTransport>: Clone, Send, Sync, fmt::Debug);

    fn service(transport: MockTransport) -> ClientService<MockTransport> {
        ClientService::new(Pool::new(transport, Config::default()), http1::Config::default())
    }

    #[tokio::test]
    async fn sends_and_reuses() {
        let _ = tracing_subscriber::fmt::try_init();

        let transport = MockTransport::ok("hello");
        let service = service(transport.clone());

        for expected_reuse in [false, true] {
            let response = service
                .clone()
                .oneshot(
                    http::Request::get("http://mock.test/")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();

            let info = response.extensions().get::<ConnectionInfo>().unwrap().clone();
            assert_eq!(info.reused, expected_reuse);

            let body = http_body_util::BodyExt::collect(response.into_body())
                .await
                .unwrap()
                .to_bytes();
            assert_eq!(&body[..], b"hello");
        }

        assert_eq!(transport.connects(), 1);
        assert_eq!(service.pool().stats().idle, 1);
    }

    #[tokio::test]
    async fn relative_uri_is_rejected() {
        let transport = MockTransport::ok("");
        let service = service(transport.clone());

        let error = service
            .oneshot(http::Request::get("/relative").body(Body::empty()).unwrap())
            .await
            .unwrap_err();

        assert!(matches!(error, Error::InvalidUri(_)));
        assert_eq!(transport.connects(), 0);
    }

    #[tokio::test]
    async fn connect_failure() {
        let transport = MockTransport::ok("");
        transport.fail_next(1);
        let service = service(transport.clone());

        let error = service
            .send(
                http::Request::get("http://mock.test/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap_err();

        assert!(error.is_connection_failure());
        let stats = service.pool().stats();
        assert_eq!(stats.open, 0);
        assert_eq!(stats.connecting, 0);
    }
}
