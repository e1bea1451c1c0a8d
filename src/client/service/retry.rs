//! Retries for idempotent requests which failed to reach the server.

use std::future::Ready;

use http::Method;
use tower::retry::Policy;
use tracing::debug;

pub use tower::retry::{Retry, RetryLayer};

use crate::body::Body;
use crate::client::Error;

/// Methods which may be sent again without changing the outcome.
pub fn is_idempotent(method: &Method) -> bool {
    method == Method::GET
        || method == Method::HEAD
        || method == Method::PUT
        || method == Method::DELETE
        || method == Method::OPTIONS
        || method == Method::TRACE
}

/// Retry idempotent requests which failed with [`Error::ConnectionFailed`].
///
/// Only requests whose body can be cloned are retried, so a streamed body that may
/// already be partly sent is never replayed. Other errors (including protocol
/// errors and an exhausted pool) are returned to the caller untouched.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    remaining: usize,
}

impl RetryPolicy {
    /// Allow up to `retries` attempts after the first one.
    pub fn new(retries: usize) -> Self {
        Self { remaining: retries }
    }

    /// Attempts left for the current request.
    pub fn remaining(&self) -> usize {
        self.remaining
    }
}

impl<Res> Policy<http::Request<Body>, Res, Error> for RetryPolicy {
    type Future = Ready<()>;

    fn retry(
        &mut self,
        req: &mut http::Request<Body>,
        result: &mut Result<Res, Error>,
    ) -> Option<Self::Future> {
        let Err(error) = result else {
            return None;
        };

        if !error.is_connection_failure() || self.remaining == 0 {
            return None;
        }

        self.remaining -= 1;
        debug!(
            method = %req.method(),
            uri = %req.uri(),
            remaining = self.remaining,
            %error,
            "retrying request"
        );
        Some(std::future::ready(()))
    }

    fn clone_request(&mut self, req: &http::Request<Body>) -> Option<http::Request<Body>> {
        if self.remaining == 0 || !is_idempotent(req.method()) {
            return None;
        }

        let body = req.body().try_clone()?;
        let mut clone = http::Request::new(body);
        *clone.method_mut() = req.method().clone();
        *clone.uri_mut() = req.uri().clone();
        *clone.version_mut() = req.version();
        *clone.headers_mut() = req.headers().clone();
        *clone.extensions_mut() = req.extensions().clone();
        Some(clone)
    }
}
