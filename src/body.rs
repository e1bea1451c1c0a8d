//! Request and server response bodies.
//!
//! [`Body`] is the body producer handed to the client. It is consumed at most
//! once: full and empty bodies can be cloned (which is what makes a request
//! eligible for retries and redirects), while streamed bodies cannot.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body::Body as _;
use http_body::{Frame, SizeHint};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::BodyExt as _;
use http_body_util::Full;

use crate::BoxError;

/// An http request using [Body] as the body.
pub type Request = http::Request<Body>;

/// An http response using [Body] as the body.
pub type Response = http::Response<Body>;

/// A wrapper for different internal body types which implements [http_body::Body](http_body::Body)
///
/// Bodies can be created from [`Bytes`](bytes::Bytes), [`String`](std::string::String),
/// or [`&'static str`](str) using [`From`](std::convert::From) implementations.
///
/// An empty body can be created with [Body::empty](Body::empty), and any other
/// [`http_body::Body`] can be streamed with [Body::stream](Body::stream).
#[pin_project::pin_project]
pub struct Body {
    #[pin]
    inner: InnerBody,
}

impl Body {
    /// Create a new empty body.
    pub fn empty() -> Self {
        Self {
            inner: InnerBody::Empty,
        }
    }

    /// Create a new body from something which can be converted into [`Bytes`].
    pub fn full<D>(data: D) -> Self
    where
        D: Into<Bytes>,
    {
        let data = data.into();
        if data.is_empty() {
            return Self::empty();
        }

        Self {
            inner: InnerBody::Full(Full::new(data)),
        }
    }

    /// Create a streaming body from another [`http_body::Body`].
    ///
    /// When the wrapped body reports an exact size, the request is sent with a
    /// `content-length`, otherwise it is sent with chunked framing.
    pub fn stream<B>(body: B) -> Self
    where
        B: http_body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        Self {
            inner: InnerBody::Stream(UnsyncBoxBody::new(body.map_err(Into::into))),
        }
    }

    /// Try to clone this body.
    ///
    /// Streamed bodies can only be read once, so this returns `None` for them.
    pub fn try_clone(&self) -> Option<Self> {
        match &self.inner {
            InnerBody::Empty => Some(Self::empty()),
            InnerBody::Full(body) => Some(Self {
                inner: InnerBody::Full(body.clone()),
            }),
            InnerBody::Stream(_) => None,
        }
    }

    /// The exact length of this body, if it is known up front.
    pub fn exact_len(&self) -> Option<u64> {
        self.size_hint().exact()
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            InnerBody::Empty => f.debug_tuple("Body").field(&"empty").finish(),
            InnerBody::Full(body) => f
                .debug_tuple("Body")
                .field(&body.size_hint().exact())
                .finish(),
            InnerBody::Stream(_) => f.debug_tuple("Body").field(&"stream").finish(),
        }
    }
}

impl From<Bytes> for Body {
    fn from(body: Bytes) -> Self {
        Self::full(body)
    }
}

impl From<String> for Body {
    fn from(body: String) -> Self {
        Self::full(body)
    }
}

impl From<&'static str> for Body {
    fn from(body: &'static str) -> Self {
        Self::full(body)
    }
}

impl From<Vec<u8>> for Body {
    fn from(body: Vec<u8>) -> Self {
        Self::full(body)
    }
}

impl From<Full<Bytes>> for Body {
    fn from(body: Full<Bytes>) -> Self {
        Self {
            inner: InnerBody::Full(body),
        }
    }
}

impl From<http_body_util::Empty<Bytes>> for Body {
    fn from(_body: http_body_util::Empty<Bytes>) -> Self {
        Self::empty()
    }
}

#[pin_project::pin_project(project = InnerBodyProj)]
enum InnerBody {
    Empty,
    Full(#[pin] Full<Bytes>),
    Stream(#[pin] UnsyncBoxBody<Bytes, BoxError>),
}

impl http_body::Body for Body {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.project().inner.project() {
            InnerBodyProj::Empty => Poll::Ready(None),
            InnerBodyProj::Full(body) => body
                .poll_frame(cx)
                .map(|frame| frame.map(|res| res.map_err(|never| match never {}))),
            InnerBodyProj::Stream(body) => body.poll_frame(cx),
        }
    }

    fn is_end_stream(&self) -> bool {
        match &self.inner {
            InnerBody::Empty => true,
            InnerBody::Full(body) => body.is_end_stream(),
            InnerBody::Stream(body) => body.is_end_stream(),
        }
    }

    fn size_hint(&self) -> SizeHint {
        match &self.inner {
            InnerBody::Empty => SizeHint::with_exact(0),
            InnerBody::Full(body) => body.size_hint(),
            InnerBody::Stream(body) => body.size_hint(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use http_body_util::{BodyExt as _, StreamBody};
    use static_assertions::assert_impl_all;

    assert_impl_all!(Body: Send, Default, fmt::Debug);

    #[tokio::test]
    async fn full_body_is_cloneable() {
        let body = Body::from("hello");
        assert_eq!(body.exact_len(), Some(5));

        let copy = body.try_clone().expect("full bodies clone");
        let bytes = copy.collect().await.unwrap().to_bytes();
        assert_eq!(bytes, Bytes::from_static(b"hello"));
    }

    #[test]
    fn empty_string_is_empty_body() {
        let body = Body::from(String::new());
        assert!(body.is_end_stream());
        assert_eq!(body.exact_len(), Some(0));
    }

    #[tokio::test]
    async fn stream_body_has_no_length_and_no_clone() {
        let chunks = futures_util::stream::iter(vec![
            Ok::<_, std::io::Error>(Frame::data(Bytes::from_static(b"ab"))),
            Ok(Frame::data(Bytes::from_static(b"cd"))),
        ]);
        let body = Body::stream(StreamBody::new(chunks));

        assert!(body.try_clone().is_none());
        assert_eq!(body.exact_len(), None);

        let bytes = body.collect().await.unwrap().to_bytes();
        assert_eq!(bytes, Bytes::from_static(b"abcd"));
    }
}
