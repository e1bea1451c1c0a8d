//! Response head parsing and body framing.

use bytes::{Buf as _, Bytes, BytesMut};
use http::header::{CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
use tracing::trace;

use super::Config;
use crate::client::error::ProtocolError;

/// Longest chunk-size line (including extensions) we are willing to buffer.
const MAX_CHUNK_SIZE_LINE: usize = 4 * 1024;

/// The status line and headers of a response.
#[derive(Debug)]
pub(super) struct ResponseHead {
    pub(super) version: Version,
    pub(super) status: StatusCode,
    pub(super) headers: HeaderMap,
}

/// Parse a response head from the front of `buf`.
///
/// Returns the number of bytes the head occupied, or `None` if more bytes are needed.
pub(super) fn parse_head(
    buf: &[u8],
    config: &Config,
) -> Result<Option<(usize, ResponseHead)>, ProtocolError> {
    let mut slots = vec![httparse::EMPTY_HEADER; config.max_headers];
    let mut response = httparse::Response::new(&mut slots);

    let len = match response.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) if buf.len() >= config.max_head_size => {
            return Err(ProtocolError::HeadTooLarge(config.max_head_size));
        }
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(error) => return Err(ProtocolError::MalformedHead(error)),
    };

    if len > config.max_head_size {
        return Err(ProtocolError::HeadTooLarge(config.max_head_size));
    }

    let version = match response.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };

    let status = response
        .code
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or(ProtocolError::MalformedHead(httparse::Error::Status))?;

    let headers = header_map(response.headers)?;

    Ok(Some((
        len,
        ResponseHead {
            version,
            status,
            headers,
        },
    )))
}

fn header_map(headers: &[httparse::Header<'_>]) -> Result<HeaderMap, ProtocolError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for header in headers {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|_| ProtocolError::InvalidHeader)?;
        let value =
            HeaderValue::from_bytes(header.value).map_err(|_| ProtocolError::InvalidHeader)?;
        map.append(name, value);
    }
    Ok(map)
}

/// Whether any `Connection` header value lists `token`.
pub(crate) fn has_connection_token(headers: &HeaderMap, token: &str) -> bool {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|item| item.trim().eq_ignore_ascii_case(token))
}

/// Whether the response leaves the connection open for another request.
pub(super) fn keep_alive(head: &ResponseHead) -> bool {
    if has_connection_token(&head.headers, "close") {
        return false;
    }

    // A message with both framings may have been smuggled through an intermediary.
    if head.headers.contains_key(TRANSFER_ENCODING) && head.headers.contains_key(CONTENT_LENGTH) {
        return false;
    }

    match head.version {
        Version::HTTP_11 => true,
        Version::HTTP_10 => has_connection_token(&head.headers, "keep-alive"),
        _ => false,
    }
}

/// How the body of a response is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum BodyFraming {
    Empty,
    Length(u64),
    Chunked,
    CloseDelimited,
}

/// Work out how the response body is framed, following RFC 9112 section 6.3.
pub(super) fn body_framing(
    method: &Method,
    head: &ResponseHead,
) -> Result<BodyFraming, ProtocolError> {
    let status = head.status;
    if method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return Ok(BodyFraming::Empty);
    }

    if head.headers.contains_key(TRANSFER_ENCODING) {
        let last = head
            .headers
            .get_all(TRANSFER_ENCODING)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .map(str::trim)
            .filter(|coding| !coding.is_empty())
            .last();

        return Ok(match last {
            Some(coding) if coding.eq_ignore_ascii_case("chunked") => BodyFraming::Chunked,
            _ => {
                trace!("transfer-encoding without final chunked, reading until close");
                BodyFraming::CloseDelimited
            }
        });
    }

    match content_length(&head.headers)? {
        Some(0) => Ok(BodyFraming::Empty),
        Some(length) => Ok(BodyFraming::Length(length)),
        None => Ok(BodyFraming::CloseDelimited),
    }
}

/// The declared content length. Repeated values are accepted only when they all agree.
fn content_length(headers: &HeaderMap) -> Result<Option<u64>, ProtocolError> {
    let mut length = None;
    for value in headers.get_all(CONTENT_LENGTH) {
        let value = value
            .to_str()
            .map_err(|_| ProtocolError::InvalidContentLength)?;

        for item in value.split(',') {
            let item = item.trim();
            if item.is_empty() || !item.bytes().all(|b| b.is_ascii_digit()) {
                return Err(ProtocolError::InvalidContentLength);
            }

            let parsed: u64 = item
                .parse()
                .map_err(|_| ProtocolError::InvalidContentLength)?;
            match length {
                Some(existing) if existing != parsed => {
                    return Err(ProtocolError::InvalidContentLength)
                }
                _ => length = Some(parsed),
            }
        }
    }
    Ok(length)
}

/// The outcome of one decoding step.
#[derive(Debug)]
pub(super) enum Decoded {
    Data(Bytes),
    Trailers(HeaderMap),
    NeedMore,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Chunk {
    Size,
    Data(u64),
    DataEnd,
    Trailers,
    Done,
}

/// Incremental decoder for a response body.
#[derive(Debug)]
pub(super) enum Decoder {
    Length(u64),
    Chunked(Chunk),
    CloseDelimited,
}

impl Decoder {
    pub(super) fn new(framing: BodyFraming) -> Self {
        match framing {
            BodyFraming::Empty => Decoder::Length(0),
            BodyFraming::Length(length) => Decoder::Length(length),
            BodyFraming::Chunked => Decoder::Chunked(Chunk::Size),
            BodyFraming::CloseDelimited => Decoder::CloseDelimited,
        }
    }

    /// A close-delimited body leaves nothing behind to reuse.
    pub(super) fn is_close_delimited(&self) -> bool {
        matches!(self, Decoder::CloseDelimited)
    }

    /// Every byte of the body, and any trailers, have been decoded.
    pub(super) fn is_complete(&self) -> bool {
        matches!(self, Decoder::Length(0) | Decoder::Chunked(Chunk::Done))
    }

    /// Bytes left to read, when known.
    pub(super) fn remaining(&self) -> Option<u64> {
        match self {
            Decoder::Length(remaining) => Some(*remaining),
            Decoder::Chunked(Chunk::Done) => Some(0),
            _ => None,
        }
    }

    /// Decode as much of `buf` as makes one step of progress.
    pub(super) fn decode(
        &mut self,
        buf: &mut BytesMut,
        config: &Config,
    ) -> Result<Decoded, ProtocolError> {
        match self {
            Decoder::Length(0) => Ok(Decoded::Done),
            Decoder::Length(remaining) => {
                if buf.is_empty() {
                    return Ok(Decoded::NeedMore);
                }
                let take = usize::try_from(*remaining).map_or(buf.len(), |r| r.min(buf.len()));
                *remaining -= take as u64;
                Ok(Decoded::Data(buf.split_to(take).freeze()))
            }
            Decoder::CloseDelimited => {
                if buf.is_empty() {
                    Ok(Decoded::NeedMore)
                } else {
                    Ok(Decoded::Data(buf.split().freeze()))
                }
            }
            Decoder::Chunked(state) => decode_chunked(state, buf, config, true),
        }
    }

    /// Consume buffered framing which carries no body data, such as the CRLF after a
    /// chunk, the last-chunk marker and trailers. Stops before the next data bytes.
    ///
    /// Errors leave the decoder where it was, so the next [`Decoder::decode`] reports
    /// them again.
    pub(super) fn skip_framing(
        &mut self,
        buf: &mut BytesMut,
        config: &Config,
    ) -> Result<Decoded, ProtocolError> {
        match self {
            Decoder::Length(0) => Ok(Decoded::Done),
            Decoder::Length(_) | Decoder::CloseDelimited => Ok(Decoded::NeedMore),
            Decoder::Chunked(state) => decode_chunked(state, buf, config, false),
        }
    }

    /// The transport reached end-of-stream.
    pub(super) fn eof(&self) -> Result<(), ProtocolError> {
        match self {
            Decoder::CloseDelimited | Decoder::Length(0) | Decoder::Chunked(Chunk::Done) => Ok(()),
            _ => Err(ProtocolError::IncompleteMessage),
        }
    }
}

fn decode_chunked(
    state: &mut Chunk,
    buf: &mut BytesMut,
    config: &Config,
    data: bool,
) -> Result<Decoded, ProtocolError> {
    loop {
        match *state {
            Chunk::Size => match httparse::parse_chunk_size(buf) {
                Ok(httparse::Status::Complete((consumed, size))) => {
                    buf.advance(consumed);
                    trace!(size, "chunk");
                    *state = if size == 0 {
                        Chunk::Trailers
                    } else {
                        Chunk::Data(size)
                    };
                }
                Ok(httparse::Status::Partial) if buf.len() > MAX_CHUNK_SIZE_LINE => {
                    return Err(ProtocolError::InvalidChunk("chunk size line too long"));
                }
                Ok(httparse::Status::Partial) => return Ok(Decoded::NeedMore),
                Err(_) => return Err(ProtocolError::InvalidChunk("invalid chunk size")),
            },
            Chunk::Data(remaining) => {
                if !data || buf.is_empty() {
                    return Ok(Decoded::NeedMore);
                }
                let take = usize::try_from(remaining).map_or(buf.len(), |r| r.min(buf.len()));
                let left = remaining - take as u64;
                *state = if left == 0 {
                    Chunk::DataEnd
                } else {
                    Chunk::Data(left)
                };
                return Ok(Decoded::Data(buf.split_to(take).freeze()));
            }
            Chunk::DataEnd => {
                if buf.len() < 2 {
                    return Ok(Decoded::NeedMore);
                }
                if &buf[..2] != b"\r\n" {
                    return Err(ProtocolError::InvalidChunk("missing CRLF after chunk data"));
                }
                buf.advance(2);
                *state = Chunk::Size;
            }
            Chunk::Trailers => {
                let mut slots = vec![httparse::EMPTY_HEADER; config.max_headers];
                match httparse::parse_headers(buf, &mut slots) {
                    Ok(httparse::Status::Complete((consumed, headers))) => {
                        let trailers = header_map(headers)?;
                        buf.advance(consumed);
                        *state = Chunk::Done;
                        if !trailers.is_empty() {
                            return Ok(Decoded::Trailers(trailers));
                        }
                    }
                    Ok(httparse::Status::Partial) if buf.len() >= config.max_head_size => {
                        return Err(ProtocolError::HeadTooLarge(config.max_head_size));
                    }
                    Ok(httparse::Status::Partial) => return Ok(Decoded::NeedMore),
                    Err(error) => return Err(ProtocolError::MalformedTrailers(error)),
                }
            }
            Chunk::Done => return Ok(Decoded::Done),
        }
    }
}
