use std::fmt;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Bytes, BytesMut};
use http::HeaderMap;
use http_body::{Frame, SizeHint};
use http_body_util::BodyExt as _;
use tracing::{debug, trace, warn};

use super::decode::{Decoded, Decoder};
use super::Config;
use crate::client::pool::Lease;
use crate::client::Error;

/// The body of a response, read lazily from the connection which carried it.
///
/// The connection stays leased until the body is read to the end, at which point it
/// goes back to the pool if the server allows reuse. If reading fails, or the body is
/// dropped or [discarded](IncomingBody::discard) first, the connection is closed.
pub struct IncomingBody {
    inner: Inner,
}

enum Inner {
    Empty,
    Streaming(Box<Streaming>),
}

struct Streaming {
    lease: Option<Lease>,
    buf: BytesMut,
    decoder: Decoder,
    trailers: Option<HeaderMap>,
    keep_alive: bool,
    config: Config,
}

impl fmt::Debug for IncomingBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Inner::Empty => f.debug_struct("IncomingBody").finish(),
            Inner::Streaming(streaming) => f
                .debug_struct("IncomingBody")
                .field("decoder", &streaming.decoder)
                .field("buffered", &streaming.buf.len())
                .finish(),
        }
    }
}

impl IncomingBody {
    pub(super) fn empty() -> Self {
        Self { inner: Inner::Empty }
    }

    pub(super) fn new(
        lease: Lease,
        buf: BytesMut,
        decoder: Decoder,
        keep_alive: bool,
        config: &Config,
    ) -> Self {
        Self {
            inner: Inner::Streaming(Box::new(Streaming {
                lease: Some(lease),
                buf,
                decoder,
                trailers: None,
                keep_alive,
                config: config.clone(),
            })),
        }
    }

    /// Stop reading and close the connection.
    pub fn discard(mut self) {
        if let Inner::Streaming(streaming) = &mut self.inner {
            streaming.abandon();
        }
    }

    /// Read and throw away the rest of the body, so the connection can be reused.
    ///
    /// Gives up, closing the connection, once more than `limit` bytes have been read.
    /// Returns `true` when the body was read to the end.
    pub async fn drain(mut self, limit: usize) -> bool {
        let mut read = 0usize;
        loop {
            let Some(frame) = self.frame().await else {
                return true;
            };

            match frame {
                Ok(frame) => {
                    if let Some(data) = frame.data_ref() {
                        read += data.len();
                        if read > limit {
                            debug!(limit, "body too large to drain");
                            self.discard();
                            return false;
                        }
                    }
                }
                Err(error) => {
                    debug!(%error, "error draining body");
                    return false;
                }
            }
        }
    }
}

impl Streaming {
    fn poll_frame(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Bytes>, Error>>> {
        if let Some(trailers) = self.trailers.take() {
            return Poll::Ready(Some(Ok(Frame::trailers(trailers))));
        }

        loop {
            match self.decoder.decode(&mut self.buf, &self.config) {
                Ok(Decoded::Data(data)) => {
                    self.settle();
                    return Poll::Ready(Some(Ok(Frame::data(data))));
                }
                Ok(Decoded::Trailers(trailers)) => {
                    return Poll::Ready(Some(Ok(Frame::trailers(trailers))))
                }
                Ok(Decoded::Done) => {
                    self.finish();
                    return Poll::Ready(None);
                }
                Ok(Decoded::NeedMore) => {}
                Err(error) => {
                    self.abandon();
                    return Poll::Ready(Some(Err(error.into())));
                }
            }

            let Some(lease) = self.lease.as_mut() else {
                return Poll::Ready(None);
            };

            match ready!(lease.poll_read_buf(cx, &mut self.buf)) {
                Ok(0) => {
                    return match self.decoder.eof() {
                        Ok(()) => {
                            trace!("response body ended with the connection");
                            self.keep_alive = false;
                            self.finish();
                            Poll::Ready(None)
                        }
                        Err(error) => {
                            self.abandon();
                            Poll::Ready(Some(Err(error.into())))
                        }
                    };
                }
                Ok(_) => {}
                Err(error) => {
                    self.abandon();
                    return Poll::Ready(Some(Err(error.into())));
                }
            }
        }
    }

    /// Release the connection as soon as the last data has been read, without waiting
    /// for another poll. Trailers found on the way are kept for the next frame.
    fn settle(&mut self) {
        loop {
            match self.decoder.skip_framing(&mut self.buf, &self.config) {
                Ok(Decoded::Done) => return self.finish(),
                Ok(Decoded::Trailers(trailers)) => self.trailers = Some(trailers),
                // Errors are reported by the next call to `decode`.
                Ok(Decoded::Data(_) | Decoded::NeedMore) | Err(_) => return,
            }
        }
    }

    fn is_complete(&self) -> bool {
        self.lease.is_none() && self.trailers.is_none() && self.decoder.is_complete()
    }

    /// The body was read to the end; hand the connection back.
    fn finish(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };

        if !self.buf.is_empty() {
            warn!(
                id=%lease.id(),
                extra = self.buf.len(),
                "unexpected bytes after response body"
            );
        }

        let reusable = self.keep_alive && !self.decoder.is_close_delimited() && self.buf.is_empty();
        trace!(id=%lease.id(), reusable, "response body complete");
        if let Err(error) = lease.release(reusable) {
            warn!(%error, "failed to release connection");
        }
    }

    fn abandon(&mut self) {
        if let Some(lease) = self.lease.take() {
            debug!(id=%lease.id(), "response body not completed, discarding connection");
            lease.discard();
        }
    }
}

impl Drop for Streaming {
    fn drop(&mut self) {
        self.abandon();
    }
}

impl http_body::Body for IncomingBody {
    type Data = Bytes;
    type Error = Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let Inner::Streaming(streaming) = &mut this.inner else {
            return Poll::Ready(None);
        };

        let frame = ready!(streaming.poll_frame(cx));
        if !matches!(frame, Some(Ok(_))) {
            this.inner = Inner::Empty;
        }
        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        match &self.inner {
            Inner::Empty => true,
            Inner::Streaming(streaming) => streaming.is_complete(),
        }
    }

    fn size_hint(&self) -> SizeHint {
        match &self.inner {
            Inner::Empty => SizeHint::with_exact(0),
            Inner::Streaming(streaming) => match streaming.decoder.remaining() {
                Some(remaining) => SizeHint::with_exact(remaining),
                None => SizeHint::default(),
            },
        }
    }
}
