//! Middleware which applies an overall deadline to requests.
//!
//! Unlike `tower::timeout`, the error returned on expiry is chosen by the caller, so the
//! service keeps a concrete error type. Dropping the inner future on expiry cancels the
//! request, which closes whatever connection it had leased.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use pin_project::pin_project;

/// Layer to apply a timeout to requests, with a custom error type.
pub struct TimeoutLayer<E> {
    error: fn() -> E,
    timeout: Duration,
}

impl<E> TimeoutLayer<E> {
    /// Create a new `TimeoutLayer` with the provided error function and timeout.
    pub fn new(error: fn() -> E, timeout: Duration) -> Self {
        Self { error, timeout }
    }
}

impl<E> Clone for TimeoutLayer<E> {
    fn clone(&self) -> Self {
        Self {
            error: self.error,
            timeout: self.timeout,
        }
    }
}

impl<E> fmt::Debug for TimeoutLayer<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutLayer")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl<S, E> tower::layer::Layer<S> for TimeoutLayer<E> {
    type Service = Timeout<S, E>;

    fn layer(&self, inner: S) -> Self::Service {
        Timeout {
            inner,
            timeout: self.timeout,
            error: self.error,
        }
    }
}

/// Applies a timeout to requests, with a custom error type.
pub struct Timeout<S, E> {
    inner: S,
    timeout: Duration,
    error: fn() -> E,
}

impl<S, E> Timeout<S, E> {
    /// The deadline applied to each request.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl<S: Clone, E> Clone for Timeout<S, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            timeout: self.timeout,
            error: self.error,
        }
    }
}

impl<S: fmt::Debug, E> fmt::Debug for Timeout<S, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timeout")
            .field("inner", &self.inner)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl<S, E, Req> tower::Service<Req> for Timeout<S, E>
where
    S: tower::Service<Req, Error = E>,
{
    type Response = S::Response;
    type Error = E;
    type Future = TimeoutFuture<S::Future, E>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        TimeoutFuture {
            inner: self.inner.call(req),
            error: self.error,
            sleep: tokio::time::sleep(self.timeout),
        }
    }
}

/// Response future for [`Timeout`].
#[pin_project]
pub struct TimeoutFuture<F, E> {
    #[pin]
    inner: F,
    error: fn() -> E,
    #[pin]
    sleep: tokio::time::Sleep,
}

impl<F, E> fmt::Debug for TimeoutFuture<F, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutFuture")
            .field("deadline", &self.sleep.deadline())
            .finish()
    }
}

impl<F, R, E> Future for TimeoutFuture<F, E>
where
    F: Future<Output = Result<R, E>>,
{
    type Output = Result<R, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        if let Poll::Ready(response) = this.inner.poll(cx) {
            return Poll::Ready(response);
        }

        match this.sleep.poll(cx) {
            Poll::Ready(()) => {
                tracing::debug!("request timed out");
                Poll::Ready(Err((this.error)()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tower::{Layer as _, ServiceExt as _};

    #[derive(Debug, PartialEq)]
    struct Elapsed;

    #[tokio::test(start_paused = true)]
    async fn slow_request_times_out() {
        let service = tower::service_fn(|_: ()| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, Elapsed>("done")
        });
        let service = TimeoutLayer::new(|| Elapsed, Duration::from_secs(1)).layer(service);

        assert_eq!(service.oneshot(()).await, Err(Elapsed));
    }

    #[tokio::test(start_paused = true)]
    async fn fast_request_completes() {
        let service = tower::service_fn(|_: ()| async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok::<_, Elapsed>("done")
        });
        let service = TimeoutLayer::new(|| Elapsed, Duration::from_secs(1)).layer(service);

        assert_eq!(service.oneshot(()).await, Ok("done"));
    }
}
