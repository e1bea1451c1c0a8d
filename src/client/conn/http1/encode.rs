//! Request serialization.

use bytes::{BufMut as _, Bytes, BytesMut};
use http::header::{CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, Method};
use http_body_util::BodyExt as _;
use tokio::io::AsyncWriteExt as _;
use tracing::trace;

use super::AsteriskForm;
use crate::body::Body;
use crate::client::pool::{Lease, Origin};
use crate::client::Error;

/// How the request body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Framing {
    Empty,
    Length(u64),
    Chunked,
}

fn method_has_body(method: &Method) -> bool {
    method == Method::POST || method == Method::PUT || method == Method::PATCH
}

/// Serialize the request line and headers, choosing a framing for the body.
pub(super) fn request_head(
    parts: &http::request::Parts,
    body: &Body,
) -> Result<(BytesMut, Framing), Error> {
    let framing = match body.exact_len() {
        Some(0) if !method_has_body(&parts.method) => Framing::Empty,
        Some(length) => Framing::Length(length),
        None => Framing::Chunked,
    };

    let asterisk = parts.extensions.get::<AsteriskForm>().is_some();
    let target = if asterisk && parts.method == Method::OPTIONS {
        "*"
    } else {
        if asterisk {
            trace!(method = %parts.method, "asterisk-form is only sent with OPTIONS");
        }
        parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .filter(|pq| !pq.is_empty())
            .unwrap_or("/")
    };

    let mut head = BytesMut::with_capacity(256);
    head.put_slice(parts.method.as_str().as_bytes());
    head.put_u8(b' ');
    head.put_slice(target.as_bytes());
    head.put_slice(b" HTTP/1.1\r\n");

    if !parts.headers.contains_key(HOST) {
        let origin = Origin::try_from(&parts.uri)?;
        put_header(&mut head, HOST.as_str(), origin.authority().as_str().as_bytes());
    }

    write_headers(&mut head, &parts.headers, |name| {
        name != CONTENT_LENGTH && name != TRANSFER_ENCODING
    });

    match framing {
        Framing::Empty => {}
        Framing::Length(length) => {
            put_header(&mut head, CONTENT_LENGTH.as_str(), length.to_string().as_bytes())
        }
        Framing::Chunked => put_header(&mut head, TRANSFER_ENCODING.as_str(), b"chunked"),
    }

    head.put_slice(b"\r\n");
    trace!(?framing, len = head.len(), "encoded request head");
    Ok((head, framing))
}

fn put_header(buf: &mut BytesMut, name: &str, value: &[u8]) {
    buf.put_slice(name.as_bytes());
    buf.put_slice(b": ");
    buf.put_slice(value);
    buf.put_slice(b"\r\n");
}

fn write_headers<F>(buf: &mut BytesMut, headers: &HeaderMap, include: F)
where
    F: Fn(&http::HeaderName) -> bool,
{
    for (name, value) in headers {
        if include(name) {
            put_header(buf, name.as_str(), value.as_bytes());
        }
    }
}

/// Write the request head and stream the body onto the connection.
pub(super) async fn write_request(
    lease: &mut Lease,
    head: BytesMut,
    mut body: Body,
    framing: Framing,
) -> Result<(), Error> {
    match framing {
        Framing::Empty => {
            lease.write_all(&head).await?;
        }
        Framing::Length(declared) => {
            lease.write_all(&head).await?;

            let mut written: u64 = 0;
            while let Some(frame) = body.frame().await {
                let frame = frame.map_err(Error::Body)?;
                if let Ok(data) = frame.into_data() {
                    written += data.len() as u64;
                    if written > declared {
                        return Err(Error::Body(
                            format!("body is longer than its declared length {declared}").into(),
                        ));
                    }
                    lease.write_all(&data).await?;
                }
            }

            if written != declared {
                return Err(Error::Body(
                    format!("body ended after {written} of {declared} bytes").into(),
                ));
            }
        }
        Framing::Chunked => {
            lease.write_all(&head).await?;

            let mut trailers = None;
            while let Some(frame) = body.frame().await {
                let frame = frame.map_err(Error::Body)?;
                match frame.into_data() {
                    Ok(data) if data.is_empty() => {}
                    Ok(data) => lease.write_all(&chunk(data)).await?,
                    Err(frame) => {
                        if let Ok(map) = frame.into_trailers() {
                            trailers = Some(map);
                        }
                    }
                }
            }

            let mut last = BytesMut::from(&b"0\r\n"[..]);
            if let Some(trailers) = &trailers {
                write_headers(&mut last, trailers, |_| true);
            }
            last.put_slice(b"\r\n");
            lease.write_all(&last).await?;
        }
    }

    lease.flush().await?;
    Ok(())
}

fn chunk(data: Bytes) -> BytesMut {
    let size = format!("{:X}\r\n", data.len());
    let mut chunk = BytesMut::with_capacity(size.len() + data.len() + 2);
    chunk.put_slice(size.as_bytes());
    chunk.put_slice(&data);
    chunk.put_slice(b"\r\n");
    chunk
}
