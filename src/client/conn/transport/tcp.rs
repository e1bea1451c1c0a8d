//! TCP transport implementation for client connections.
//!
//! This module contains the [`TcpTransport`] type, which is a [`tower::Service`] that connects to
//! remote origins using TCP. It also contains the [`TcpTransportConfig`] type, which is used to
//! configure TCP connections.
//!
//! Normally, you will not need to use this module directly. The [`Client`][crate::client::Client]
//! uses a [`TcpTransport`] unless another transport is provided to the builder.
//!
//! The TCP transport only speaks plaintext. Origins using `https` need a transport which
//! performs the TLS handshake before handing the stream to the pool.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use http::uri::Scheme;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{debug, trace, Instrument};

use crate::client::pool::Origin;
use crate::BoxFuture;

/// Configuration for TCP connections.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct TcpTransportConfig {
    /// Timeout for each individual connection attempt.
    pub connect_timeout: Option<Duration>,

    /// Set `TCP_NODELAY` on new connections.
    pub nodelay: bool,

    /// Idle time before TCP keepalive packets are sent, if enabled.
    pub keepalive: Option<Duration>,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Some(Duration::from_secs(10)),
            nodelay: true,
            keepalive: Some(Duration::from_secs(90)),
        }
    }
}

/// Errors which can occur while opening a TCP connection.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TcpConnectionError {
    /// Name resolution failed.
    #[error("dns resolution for {host}")]
    Resolve {
        /// The host being resolved.
        host: String,

        /// The resolver error.
        #[source]
        source: io::Error,
    },

    /// Name resolution returned no addresses.
    #[error("no addresses found for {0}")]
    NoAddresses(String),

    /// Every address failed; this is the last failure.
    #[error("connecting to {addr}")]
    Connect {
        /// The address of the last attempt.
        addr: SocketAddr,

        /// The connection error.
        #[source]
        source: io::Error,
    },

    /// The last attempt timed out.
    #[error("connecting to {0} timed out")]
    Timeout(SocketAddr),

    /// The origin needs a TLS capable transport.
    #[error("scheme {0} is not supported by the tcp transport")]
    UnsupportedScheme(Scheme),
}

/// A TCP connector for client connections.
///
/// Resolves the origin host with the system resolver, and tries each address
/// in turn until one connects.
///
/// # Example
/// ```no_run
/// # use courier::client::conn::transport::tcp::TcpTransport;
/// # use tower::ServiceExt as _;
/// # async fn run() {
/// let transport = TcpTransport::default();
///
/// let origin = "http://example.com".parse().unwrap();
/// let stream = transport.oneshot(origin).await.unwrap();
/// # }
/// ```
#[derive(Clone, Default)]
pub struct TcpTransport {
    config: Arc<TcpTransportConfig>,
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport")
            .field("config", &self.config)
            .finish()
    }
}

impl TcpTransport {
    /// Create a new TCP transport with the provided configuration.
    pub fn new(config: TcpTransportConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Get the configuration for the TCP connector.
    pub fn config(&self) -> &TcpTransportConfig {
        &self.config
    }
}

impl tower::Service<Origin> for TcpTransport {
    type Response = TcpStream;
    type Error = TcpConnectionError;
    type Future = BoxFuture<'static, Result<TcpStream, TcpConnectionError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, origin: Origin) -> Self::Future {
        if origin.is_secure() {
            let scheme = origin.scheme().clone();
            return Box::pin(std::future::ready(Err(
                TcpConnectionError::UnsupportedScheme(scheme),
            )));
        }

        let config = self.config.clone();
        let span = tracing::trace_span!("tcp", host = %origin.host(), port = %origin.port());

        Box::pin(
            async move {
                let host = origin
                    .host()
                    .trim_start_matches('[')
                    .trim_end_matches(']')
                    .to_owned();
                let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), origin.port()))
                    .await
                    .map_err(|source| TcpConnectionError::Resolve {
                        host: host.clone(),
                        source,
                    })?
                    .collect();

                let mut last_error = TcpConnectionError::NoAddresses(host);
                for addr in addrs {
                    match connect(addr, &config).await {
                        Ok(stream) => {
                            debug!(peer.addr = %addr, "tcp connected");
                            return Ok(stream);
                        }
                        Err(error) => {
                            trace!(peer.addr = %addr, %error, "tcp connect attempt failed");
                            last_error = error;
                        }
                    }
                }

                Err(last_error)
            }
            .instrument(span),
        )
    }
}

async fn connect(
    addr: SocketAddr,
    config: &TcpTransportConfig,
) -> Result<TcpStream, TcpConnectionError> {
    let connecting = TcpStream::connect(addr);
    let stream = match config.connect_timeout {
        Some(timeout) => tokio::time::timeout(timeout, connecting)
            .await
            .map_err(|_| TcpConnectionError::Timeout(addr))?,
        None => connecting.await,
    }
    .map_err(|source| TcpConnectionError::Connect { addr, source })?;

    configure(&stream, config).map_err(|source| TcpConnectionError::Connect { addr, source })?;
    Ok(stream)
}

fn configure(stream: &TcpStream, config: &TcpTransportConfig) -> io::Result<()> {
    stream.set_nodelay(config.nodelay)?;

    if let Some(time) = config.keepalive {
        let keepalive = socket2::TcpKeepalive::new().with_time(time);
        socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
    }

    Ok(())
}
