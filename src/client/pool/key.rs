use std::fmt;
use std::str::FromStr;

use http::uri::{Authority, Scheme};
use http::Uri;
use thiserror::Error;

/// The URI used for connecting to a server is invalid.
///
/// Usually, this means that the URI is missing a scheme or authority,
/// but it can also mean that the connection string could not be parsed.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum UriError {
    /// The connection string could not be parsed.
    #[error("invalid uri: {0}")]
    InvalidUri(#[from] http::uri::InvalidUri),

    /// The URI is missing a scheme.
    #[error("missing scheme in uri: {0}")]
    MissingScheme(Uri),

    /// The URI uses a scheme other than `http` or `https`.
    #[error("unsupported scheme in uri: {0}")]
    UnsupportedScheme(Uri),

    /// The URI is missing a host.
    #[error("missing host in uri: {0}")]
    MissingHost(Uri),

    /// The transport can't reach origins with this scheme, such as `https` over plain TCP.
    #[error("scheme {0} is not supported by the transport")]
    TransportScheme(Scheme),
}

/// Pool key identifying one remote endpoint: scheme, host and port.
///
/// Two requests share an origin iff all three parts are equal. Hosts are
/// compared case-insensitively and missing ports are filled in from the
/// scheme, so `http://Example.com/` and `http://example.com:80/a` share an origin.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct Origin {
    scheme: Scheme,
    host: Box<str>,
    port: u16,
}

impl Origin {
    /// Create an origin from its parts.
    pub fn new(scheme: Scheme, host: &str, port: u16) -> Self {
        Self {
            scheme,
            host: host.to_ascii_lowercase().into(),
            port,
        }
    }

    /// The scheme of this origin.
    pub fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    /// The host of this origin, lower-cased.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port of this origin, defaulted from the scheme when not explicit.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns `true` when the origin uses `https`.
    pub fn is_secure(&self) -> bool {
        self.scheme == Scheme::HTTPS
    }

    /// The `host[:port]` authority, omitting the port when it is the scheme default.
    pub fn authority(&self) -> Authority {
        let text = if Some(self.port) == default_port(&self.scheme) {
            self.host.to_string()
        } else {
            format!("{}:{}", self.host, self.port)
        };

        text.parse()
            .unwrap_or_else(|_| Authority::from_static("localhost"))
    }
}

fn default_port(scheme: &Scheme) -> Option<u16> {
    if *scheme == Scheme::HTTP {
        Some(80)
    } else if *scheme == Scheme::HTTPS {
        Some(443)
    } else {
        None
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

impl TryFrom<&Uri> for Origin {
    type Error = UriError;

    fn try_from(value: &Uri) -> Result<Self, Self::Error> {
        let scheme = value
            .scheme()
            .cloned()
            .ok_or_else(|| UriError::MissingScheme(value.clone()))?;

        let port = match default_port(&scheme) {
            Some(port) => value.port_u16().unwrap_or(port),
            None => return Err(UriError::UnsupportedScheme(value.clone())),
        };

        let host = value
            .host()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| UriError::MissingHost(value.clone()))?;

        Ok(Origin::new(scheme, host, port))
    }
}

impl TryFrom<Uri> for Origin {
    type Error = UriError;

    fn try_from(value: Uri) -> Result<Self, Self::Error> {
        Origin::try_from(&value)
    }
}

impl TryFrom<&http::request::Parts> for Origin {
    type Error = UriError;

    fn try_from(value: &http::request::Parts) -> Result<Self, Self::Error> {
        Origin::try_from(&value.uri)
    }
}

impl FromStr for Origin {
    type Err = UriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uri = Uri::from_str(s)?;
        uri.try_into()
    }
}
