use thiserror::Error;

use super::conn::transport::tcp::TcpConnectionError;
use super::conn::ConnectionId;
use super::pool::UriError;
use crate::BoxError;

/// Client error type.
///
/// Transport and protocol errors always force the connection they happened
/// on to be discarded before they reach the caller.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Timed out waiting for pool capacity. The caller may try again later.
    #[error("timed out waiting for a pooled connection")]
    PoolExhausted,

    /// The pool has been shut down and will not hand out connections.
    #[error("connection pool is closed")]
    PoolClosed,

    /// Transport level I/O failure, either while connecting or during an exchange.
    #[error("connection failed: {0}")]
    ConnectionFailed(#[source] BoxError),

    /// The server sent a response which violates HTTP/1.1 framing.
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),

    /// A connection was released to the pool twice.
    #[error("connection {0} was released twice")]
    DoubleRelease(ConnectionId),

    /// The redirect limit was reached.
    #[error("too many redirects (limit: {0})")]
    TooManyRedirects(usize),

    /// The request URI can't be used to reach an origin.
    #[error(transparent)]
    InvalidUri(#[from] UriError),

    /// The request body failed, or did not match its declared length.
    #[error("request body: {0}")]
    Body(#[source] BoxError),

    /// Request timeout
    #[error("request timeout")]
    RequestTimeout,
}

impl Error {
    /// Wrap a transport error.
    ///
    /// A TCP transport asked to reach an origin whose scheme it can't speak will never
    /// succeed, so that is reported as an unusable URI rather than a connection failure.
    pub(crate) fn connection<E>(error: E) -> Self
    where
        E: Into<BoxError>,
    {
        match error.into().downcast::<TcpConnectionError>() {
            Ok(tcp) => match *tcp {
                TcpConnectionError::UnsupportedScheme(scheme) => {
                    Error::InvalidUri(UriError::TransportScheme(scheme))
                }
                tcp => Error::ConnectionFailed(Box::new(tcp)),
            },
            Err(error) => Error::ConnectionFailed(error),
        }
    }

    /// Returns `true` if this error came from the transport, and the request
    /// never produced a response.
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, Error::ConnectionFailed(_))
    }

    /// Returns `true` if the pool ran out of capacity.
    pub fn is_pool_exhausted(&self) -> bool {
        matches!(self, Error::PoolExhausted)
    }

    /// Returns `true` if this is a framing violation from the server.
    pub fn is_protocol(&self) -> bool {
        matches!(self, Error::Protocol(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::ConnectionFailed(error.into())
    }
}

/// Violations of HTTP/1.1 message framing found while reading a response.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// The status line or headers could not be parsed.
    #[error("malformed response head: {0}")]
    MalformedHead(#[source] httparse::Error),

    /// The status line and headers did not fit in the configured buffer.
    #[error("response head larger than {0} bytes")]
    HeadTooLarge(usize),

    /// A header name or value was not valid.
    #[error("invalid header in response")]
    InvalidHeader,

    /// Missing, duplicated or unparsable `content-length`.
    #[error("invalid content-length")]
    InvalidContentLength,

    /// A chunk size line or chunk terminator was malformed.
    #[error("invalid chunk: {0}")]
    InvalidChunk(&'static str),

    /// The trailer section could not be parsed.
    #[error("malformed trailers: {0}")]
    MalformedTrailers(#[source] httparse::Error),

    /// The connection closed before the message was complete.
    #[error("connection closed before message completed")]
    IncompleteMessage,

    /// The server switched protocols, which this client never asks for.
    #[error("unexpected protocol upgrade")]
    UnexpectedUpgrade,
}
