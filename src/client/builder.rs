use std::time::Duration;

use http::header::USER_AGENT;
use http::HeaderValue;
use tower::util::BoxCloneSyncService;
use tower::ServiceBuilder;
use tower_http::set_header::SetRequestHeaderLayer;

use super::conn::http1;
use super::conn::transport::tcp::{TcpTransport, TcpTransportConfig};
use super::conn::Transport;
use super::pool::{self, Pool, PoolHandle};
use super::service::redirect::FollowRedirectLayer;
use super::service::retry::{RetryLayer, RetryPolicy};
use super::{BoxedClientService, Client, ClientService, Error};
use crate::service::TimeoutLayer;

/// A builder for a client.
///
/// The built client stacks, from the outside in: an optional overall request
/// timeout, the `user-agent` header, redirect following, retries of idempotent
/// requests and finally the pooled [`ClientService`].
#[derive(Debug)]
pub struct Builder<T = TcpTransport> {
    transport: T,
    pool: pool::Config,
    http1: http1::Config,
    max_retries: usize,
    max_redirects: Option<usize>,
    user_agent: Option<HeaderValue>,
    timeout: Option<Duration>,
}

impl Builder<TcpTransport> {
    /// Create a builder with the default settings and a TCP transport.
    pub fn new() -> Self {
        Self {
            transport: TcpTransport::default(),
            pool: pool::Config::default(),
            http1: http1::Config::default(),
            max_retries: 3,
            max_redirects: Some(10),
            user_agent: None,
            timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl Default for Builder<TcpTransport> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Builder<T> {
    /// Use the provided TCP configuration.
    pub fn with_tcp(self, config: TcpTransportConfig) -> Builder<TcpTransport> {
        self.with_transport(TcpTransport::new(config))
    }

    /// Provide a custom transport
    pub fn with_transport<T2>(self, transport: T2) -> Builder<T2> {
        Builder {
            transport,
            pool: self.pool,
            http1: self.http1,
            max_retries: self.max_retries,
            max_redirects: self.max_redirects,
            user_agent: self.user_agent,
            timeout: self.timeout,
        }
    }

    /// Get a mutable reference to the transport
    pub fn transport(&mut self) -> &mut T {
        &mut self.transport
    }
}

impl<T> Builder<T> {
    /// Connection pool configuration.
    pub fn pool(&mut self) -> &mut pool::Config {
        &mut self.pool
    }

    /// Use the provided connection pool configuration.
    pub fn with_pool(mut self, pool: pool::Config) -> Self {
        self.pool = pool;
        self
    }

    /// HTTP/1.1 limits.
    pub fn http1(&mut self) -> &mut http1::Config {
        &mut self.http1
    }

    /// Use the provided HTTP/1.1 limits.
    pub fn with_http1(mut self, http1: http1::Config) -> Self {
        self.http1 = http1;
        self
    }
}

impl<T> Builder<T> {
    /// Retry idempotent requests up to `retries` times when the connection fails.
    pub fn with_max_retries(mut self, retries: usize) -> Self {
        self.max_retries = retries;
        self
    }

    /// Disable retries.
    pub fn without_retries(self) -> Self {
        self.with_max_retries(0)
    }

    /// Number of retries allowed per request.
    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    /// Follow up to `redirects` redirects per request.
    pub fn with_max_redirects(mut self, redirects: usize) -> Self {
        self.max_redirects = Some(redirects);
        self
    }

    /// Disable redirects, returning redirect responses to the caller.
    pub fn without_redirects(mut self) -> Self {
        self.max_redirects = None;
        self
    }

    /// Number of redirects followed per request, if redirects are followed at all.
    pub fn max_redirects(&self) -> Option<usize> {
        self.max_redirects
    }
}

impl<T> Builder<T> {
    /// Set the User-Agent header.
    pub fn with_user_agent(mut self, user_agent: HeaderValue) -> Self {
        self.user_agent = Some(user_agent);
        self
    }

    /// Get the user agent currently configured
    pub fn user_agent(&self) -> Option<&HeaderValue> {
        self.user_agent.as_ref()
    }

    /// Set the timeout for requests.
    ///
    /// The timeout covers waiting for a connection, sending the request and reading
    /// the response head, including every retry and redirect.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Disable request timeouts.
    pub fn without_timeout(mut self) -> Self {
        self.timeout = None;
        self
    }

    /// Get the timeout for requests.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

impl<T> Builder<T>
where
    T: Transport,
{
    /// Build a client service with the configured layers
    pub fn build_service(self) -> BoxedClientService {
        self.build_parts().0
    }

    /// Build the client.
    pub fn build(self) -> Client {
        let (service, pool) = self.build_parts();
        Client::new_from_service(service, pool)
    }

    fn build_parts(self) -> (BoxedClientService, PoolHandle) {
        let user_agent = self.user_agent.unwrap_or_else(|| {
            HeaderValue::from_static(concat!(
                env!("CARGO_PKG_NAME"),
                "/",
                env!("CARGO_PKG_VERSION")
            ))
        });

        let drain_limit = self.http1.redirect_drain_limit;
        let pool = Pool::new(self.transport, self.pool);
        let handle = pool.handle();

        let service = ServiceBuilder::new()
            .option_layer(
                self.timeout
                    .map(|timeout| TimeoutLayer::new(|| Error::RequestTimeout, timeout)),
            )
            .layer(SetRequestHeaderLayer::if_not_present(USER_AGENT, user_agent))
            .option_layer(
                self.max_redirects
                    .map(|max| FollowRedirectLayer::new(max, drain_limit)),
            )
            .layer(RetryLayer::new(RetryPolicy::new(self.max_retries)))
            .service(ClientService::new(pool, self.http1));

        (BoxCloneSyncService::new(service), handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::client::conn::transport::mock::{MockReply, MockTransport};

    #[test]
    fn defaults() {
        let builder = Builder::default();
        assert_eq!(builder.max_retries(), 3);
        assert_eq!(builder.max_redirects(), Some(10));
        assert_eq!(builder.timeout(), Some(Duration::from_secs(30)));
        assert!(builder.user_agent().is_none());
    }

    #[test]
    fn build_default_compiles() {
        let _ = Builder::default().build();
    }

    #[tokio::test]
    async fn sets_user_agent() {
        let transport = MockTransport::responder(|request| {
            MockReply::ok(request.header("user-agent").unwrap_or("-"))
        });

        let client = Builder::new()
            .with_transport(transport)
            .with_user_agent(HeaderValue::from_static("courier-test"))
            .build();

        let response = client.get("http://mock.test/".parse().unwrap()).await.unwrap();
        let body = http_body_util::BodyExt::collect(response.into_body())
            .await
            .unwrap()
            .to_bytes();
        assert_eq!(&body[..], b"courier-test");
    }

    #[tokio::test]
    async fn explicit_user_agent_wins() {
        let transport = MockTransport::responder(|request| {
            MockReply::ok(request.header("user-agent").unwrap_or("-"))
        });
        let client = Builder::new().with_transport(transport).build();

        let request = http::Request::get("http://mock.test/")
            .header("user-agent", "custom/1.0")
            .body(crate::Body::empty())
            .unwrap();
        let response = client.request(request).await.unwrap();
        let body = http_body_util::BodyExt::collect(response.into_body())
            .await
            .unwrap()
            .to_bytes();
        assert_eq!(&body[..], b"custom/1.0");
    }

    #[tokio::test]
    async fn redirects_can_be_disabled() {
        let transport = MockTransport::responder(|_| {
            MockReply::Respond(
                b"HTTP/1.1 302 Found\r\nlocation: /next\r\ncontent-length: 0\r\n\r\n".to_vec(),
            )
        });
        let client = Builder::new()
            .with_transport(transport.clone())
            .without_redirects()
            .build();

        let response = client.get("http://mock.test/".parse().unwrap()).await.unwrap();
        assert_eq!(response.status(), http::StatusCode::FOUND);
        assert_eq!(transport.requests(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn request_timeout() {
        let (transport, _listener) = MockTransport::channel();
        let client = Builder::new()
            .with_transport(transport)
            .with_timeout(Duration::from_secs(5))
            .build();

        let error = client
            .get("http://mock.test/".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(error, Error::RequestTimeout));

        // The abandoned exchange closed its connection.
        let stats = client.pool_stats();
        assert_eq!(stats.leased, 0);
        assert_eq!(stats.idle, 0);
    }
}
