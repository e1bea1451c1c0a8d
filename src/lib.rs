//! Courier
//!
//! Pooled HTTP/1.1 client connections, leased to one request at a time and
//! returned to the pool only once the response body has been fully read.
//!
//! The entry point is the [`Client`], built from a [`client::Builder`]. Under
//! the hood the client is a stack of `tower` services: a redirect follower, a
//! retry policy for idempotent requests, and the
//! [`ClientService`][client::ClientService] which borrows a connection from
//! the [pool][client::pool] and runs the exchange on it.

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod body;
pub use body::Body;
#[cfg(feature = "server")]
pub mod bridge;
pub mod client;
pub use client::Client;
pub(crate) mod notify;
#[cfg(feature = "server")]
pub mod server;
pub mod service;

/// Boxed error type used where the concrete error is not interesting.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub(crate) type BoxFuture<'a, T> =
    std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;
