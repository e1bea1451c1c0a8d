//! Middleware which follows HTTP redirects.
//!
//! `301`, `302`, `303`, `307` and `308` responses carrying a `Location` header are
//! followed, up to a maximum number of hops. A `303 See Other` turns the next request
//! into a `GET` without a body; every other status repeats the original method and body.
//! When the body can't be repeated (it was streamed) the redirect response is returned
//! to the caller instead.
//!
//! Credentials are not forwarded to a different origin: `authorization`, `cookie` and
//! `proxy-authorization` are removed whenever a redirect leaves the current origin.

use std::fmt;
use std::task::{Context, Poll};

use http::header::{self, HeaderMap, HeaderName};
use http::uri::{PathAndQuery, Uri};
use http::{Method, StatusCode, Version};
use tower::{Service, ServiceExt as _};
use tracing::{debug, trace};

use crate::body::Body;
use crate::client::conn::http1::IncomingBody;
use crate::client::pool::Origin;
use crate::client::Error;
use crate::BoxFuture;

const CONTENT_HEADERS: [HeaderName; 5] = [
    header::CONTENT_TYPE,
    header::CONTENT_LENGTH,
    header::CONTENT_ENCODING,
    header::CONTENT_LANGUAGE,
    header::TRANSFER_ENCODING,
];

const CREDENTIAL_HEADERS: [HeaderName; 3] = [
    header::AUTHORIZATION,
    header::COOKIE,
    header::PROXY_AUTHORIZATION,
];

/// Layer which applies [`FollowRedirect`].
#[derive(Debug, Clone)]
pub struct FollowRedirectLayer {
    max_redirects: usize,
    drain_limit: usize,
}

impl FollowRedirectLayer {
    /// Follow at most `max_redirects` redirects per request.
    ///
    /// Redirect bodies up to `drain_limit` bytes are read and dropped, so their
    /// connection can go back to the pool.
    pub fn new(max_redirects: usize, drain_limit: usize) -> Self {
        Self {
            max_redirects,
            drain_limit,
        }
    }
}

impl<S> tower::Layer<S> for FollowRedirectLayer {
    type Service = FollowRedirect<S>;

    fn layer(&self, inner: S) -> Self::Service {
        FollowRedirect {
            inner,
            max_redirects: self.max_redirects,
            drain_limit: self.drain_limit,
        }
    }
}

/// Follows redirect responses, re-issuing the request against the new location.
///
/// Following more than the configured number of redirects fails with
/// [`Error::TooManyRedirects`].
#[derive(Clone)]
pub struct FollowRedirect<S> {
    inner: S,
    max_redirects: usize,
    drain_limit: usize,
}

impl<S: fmt::Debug> fmt::Debug for FollowRedirect<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FollowRedirect")
            .field("inner", &self.inner)
            .field("max_redirects", &self.max_redirects)
            .finish()
    }
}

impl<S> FollowRedirect<S> {
    /// The most redirects followed for one request.
    pub fn max_redirects(&self) -> usize {
        self.max_redirects
    }
}

impl<S> Service<http::Request<Body>> for FollowRedirect<S>
where
    S: Service<http::Request<Body>, Response = http::Response<IncomingBody>, Error = Error>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    type Response = http::Response<IncomingBody>;
    type Error = Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: http::Request<Body>) -> Self::Future {
        // The polled service goes with the request, its clone stays behind.
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);
        Box::pin(follow(
            inner,
            request,
            self.max_redirects,
            self.drain_limit,
        ))
    }
}

async fn follow<S>(
    mut service: S,
    mut request: http::Request<Body>,
    max_redirects: usize,
    drain_limit: usize,
) -> Result<http::Response<IncomingBody>, Error>
where
    S: Service<http::Request<Body>, Response = http::Response<IncomingBody>, Error = Error>,
{
    let mut redirects = 0;

    loop {
        let previous = Previous::new(&request);
        let response = service.ready().await?.call(request).await?;

        let Some(location) = location(&previous.uri, &response) else {
            return Ok(response);
        };

        let status = response.status();
        let Some(next) = previous.redirect(status, location) else {
            debug!(%status, "request body can't be repeated, not following redirect");
            return Ok(response);
        };

        if redirects >= max_redirects {
            debug!(max_redirects, "redirect limit reached");
            response.into_body().discard();
            return Err(Error::TooManyRedirects(max_redirects));
        }
        redirects += 1;

        trace!(%status, from = %previous.uri, to = %next.uri(), "following redirect");
        response.into_body().drain(drain_limit).await;
        request = next;
    }
}

/// The parts of a request needed to send it again.
struct Previous {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    body: Option<Body>,
}

impl Previous {
    fn new(request: &http::Request<Body>) -> Self {
        Self {
            method: request.method().clone(),
            uri: request.uri().clone(),
            version: request.version(),
            headers: request.headers().clone(),
            body: request.body().try_clone(),
        }
    }

    /// Build the request for the next hop, if the body allows one.
    fn redirect(&self, status: StatusCode, location: Uri) -> Option<http::Request<Body>> {
        let mut headers = self.headers.clone();

        let (method, body) = if status == StatusCode::SEE_OTHER {
            for name in &CONTENT_HEADERS {
                headers.remove(name);
            }
            let method = if self.method == Method::HEAD {
                Method::HEAD
            } else {
                Method::GET
            };
            (method, Body::empty())
        } else {
            (self.method.clone(), self.body.as_ref()?.try_clone()?)
        };

        if !same_origin(&self.uri, &location) {
            for name in &CREDENTIAL_HEADERS {
                headers.remove(name);
            }
            headers.remove(header::HOST);
        }

        let mut request = http::Request::new(body);
        *request.method_mut() = method;
        *request.uri_mut() = location;
        *request.version_mut() = self.version;
        *request.headers_mut() = headers;
        Some(request)
    }
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

/// The redirect target of `response`, resolved against `base`.
fn location<B>(base: &Uri, response: &http::Response<B>) -> Option<Uri> {
    if !is_redirect(response.status()) {
        return None;
    }

    let value = response.headers().get(header::LOCATION)?;
    let Ok(value) = value.to_str() else {
        debug!("location header is not valid text");
        return None;
    };

    let target = resolve(base, value);
    if target.is_none() {
        debug!(location = value, "invalid redirect location");
    }
    target
}

/// Resolve a `Location` value, which may be relative, against the current request URI.
///
/// Dot segments are removed from the resulting path, so `../x` against `/a/b` is `/x`.
pub(crate) fn resolve(base: &Uri, location: &str) -> Option<Uri> {
    let target = join(base, location)?;
    if !target.path().contains('.') {
        return Some(target);
    }

    let mut path = remove_dot_segments(target.path());
    if path.is_empty() {
        path.push('/');
    }
    if let Some(query) = target.query() {
        path.push('?');
        path.push_str(query);
    }

    let mut parts = target.into_parts();
    parts.path_and_query = Some(path.parse().ok()?);
    Uri::from_parts(parts).ok()
}

/// Remove `.` and `..` segments from a path, following RFC 3986 section 5.2.4.
fn remove_dot_segments(path: &str) -> String {
    let mut input = path;
    let mut output = String::with_capacity(path.len());

    while !input.is_empty() {
        if let Some(rest) = input.strip_prefix("../") {
            input = rest;
        } else if let Some(rest) = input.strip_prefix("./") {
            input = rest;
        } else if input.starts_with("/./") {
            input = &input[2..];
        } else if input == "/." {
            input = "/";
        } else if input.starts_with("/../") {
            input = &input[3..];
            pop_segment(&mut output);
        } else if input == "/.." {
            input = "/";
            pop_segment(&mut output);
        } else if input == "." || input == ".." {
            input = "";
        } else {
            let start = usize::from(input.starts_with('/'));
            let end = input[start..].find('/').map_or(input.len(), |index| index + start);
            output.push_str(&input[..end]);
            input = &input[end..];
        }
    }

    output
}

fn pop_segment(output: &mut String) {
    let cut = output.rfind('/').unwrap_or(0);
    output.truncate(cut);
}

fn join(base: &Uri, location: &str) -> Option<Uri> {
    let location = location.trim();
    let location = location
        .split_once('#')
        .map_or(location, |(before, _)| before);

    if location.is_empty() {
        return Some(base.clone());
    }

    if let Some(rest) = location.strip_prefix("//") {
        let scheme = base.scheme_str()?;
        return format!("{scheme}://{rest}").parse().ok();
    }

    if has_scheme(location) {
        return location.parse().ok();
    }

    let path = if location.starts_with('/') {
        location.to_owned()
    } else if location.starts_with('?') {
        format!("{}{location}", base.path())
    } else {
        let base_path = base.path();
        let directory = base_path
            .rfind('/')
            .map_or("/", |index| &base_path[..=index]);
        format!("{directory}{location}")
    };

    let target: Uri = path.parse().ok()?;
    let path_and_query: PathAndQuery = target.path_and_query()?.clone();
    let mut parts = base.clone().into_parts();
    parts.path_and_query = Some(path_and_query);
    Uri::from_parts(parts).ok()
}

fn has_scheme(location: &str) -> bool {
    location.split_once("://").is_some_and(|(scheme, _)| {
        scheme.starts_with(|c: char| c.is_ascii_alphabetic())
            && scheme
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'-' | b'.'))
    })
}

fn same_origin(a: &Uri, b: &Uri) -> bool {
    match (Origin::try_from(a), Origin::try_from(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::Bytes;
    use http_body_util::BodyExt as _;
    use tower::Layer as _;

    use crate::client::conn::http1;
    use crate::client::conn::transport::mock::{MockReply, MockRequest, MockTransport};
    use crate::client::conn::ConnectionInfo;
    use crate::client::pool::{Config, Pool};
    use crate::client::ClientService;

    fn redirect(status: u16, location: &str) -> MockReply {
        MockReply::Respond(
            format!(
                "HTTP/1.1 {status} Redirect\r\nlocation: {location}\r\ncontent-length: 5\r\n\r\nmoved"
            )
            .into_bytes(),
        )
    }

    fn echo(request: &MockRequest) -> MockReply {
        let body = format!(
            "{} {} auth={} body={}",
            request.method,
            request.path,
            request.header("authorization").unwrap_or("-"),
            String::from_utf8_lossy(&request.body)
        );
        MockReply::ok(&body)
    }

    fn service(
        transport: MockTransport,
        max_redirects: usize,
    ) -> FollowRedirect<ClientService<MockTransport>> {
        let client = ClientService::new(
            Pool::new(transport, Config::default()),
            http1::Config::default(),
        );
        FollowRedirectLayer::new(max_redirects, 1024).layer(client)
    }

    async fn text(response: http::Response<IncomingBody>) -> String {
        let body: Bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(body.to_vec()).unwrap()
    }

    #[test]
    fn resolve_locations() {
        let base: Uri = "http://example.com/a/b?x=1".parse().unwrap();

        let cases = [
            ("http://other.test/c", "http://other.test/c"),
            ("//other.test/c", "http://other.test/c"),
            ("/c/d", "http://example.com/c/d"),
            ("c", "http://example.com/a/c"),
            ("?y=2", "http://example.com/a/b?y=2"),
            ("/c#fragment", "http://example.com/c"),
            ("../x", "http://example.com/x"),
            ("./c?y=2", "http://example.com/a/c?y=2"),
            ("../../../x", "http://example.com/x"),
            ("/a/./b/../c", "http://example.com/a/c"),
            ("http://other.test/a/../b", "http://other.test/b"),
            ("v1.2/file.txt", "http://example.com/a/v1.2/file.txt"),
        ];

        for (location, expected) in cases {
            assert_eq!(
                resolve(&base, location).unwrap().to_string(),
                expected,
                "{location}"
            );
        }
    }

    #[test]
    fn dot_segments() {
        let cases = [
            ("/a/b/c/./../../g", "/a/g"),
            ("mid/content=5/../6", "mid/6"),
            ("/a/b/..", "/a/"),
            ("/a/b/.", "/a/b/"),
            ("/..", "/"),
            ("/a/b", "/a/b"),
        ];

        for (path, expected) in cases {
            assert_eq!(remove_dot_segments(path), expected, "{path}");
        }
    }

    #[test]
    fn origin_comparison() {
        let a: Uri = "http://example.com/a".parse().unwrap();
        assert!(same_origin(&a, &"http://EXAMPLE.com:80/b".parse().unwrap()));
        assert!(!same_origin(&a, &"http://example.com:8080/".parse().unwrap()));
        assert!(!same_origin(&a, &"https://example.com/".parse().unwrap()));
    }

    #[tokio::test]
    async fn follows_and_reuses_connection() {
        let _ = tracing_subscriber::fmt::try_init();

        let transport = MockTransport::responder(|request| match request.path.as_str() {
            "/start" => redirect(302, "/end"),
            _ => echo(request),
        });
        let service = service(transport.clone(), 5);

        let response = service
            .oneshot(
                http::Request::get("http://mock.test/start")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.extensions().get::<ConnectionInfo>().unwrap().reused);
        assert_eq!(text(response).await, "GET /end auth=- body=");
        assert_eq!(transport.connects(), 1);
    }

    #[tokio::test]
    async fn see_other_switches_to_get() {
        let transport = MockTransport::responder(|request| match request.path.as_str() {
            "/submit" => redirect(303, "/result"),
            _ => echo(request),
        });
        let service = service(transport, 5);

        let response = service
            .oneshot(
                http::Request::post("http://mock.test/submit")
                    .header("content-type", "text/plain")
                    .body(Body::from("payload"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(text(response).await, "GET /result auth=- body=");
    }

    #[tokio::test]
    async fn temporary_redirect_preserves_method_and_body() {
        let transport = MockTransport::responder(|request| match request.path.as_str() {
            "/submit" => redirect(307, "/other"),
            _ => echo(request),
        });
        let service = service(transport, 5);

        let response = service
            .oneshot(
                http::Request::post("http://mock.test/submit")
                    .body(Body::from("payload"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(text(response).await, "POST /other auth=- body=payload");
    }

    #[tokio::test]
    async fn streamed_body_returns_redirect() {
        let transport = MockTransport::responder(|request| match request.path.as_str() {
            "/submit" => redirect(308, "/other"),
            _ => echo(request),
        });
        let service = service(transport.clone(), 5);

        let body = Body::stream(http_body_util::Full::new(Bytes::from_static(b"data")));
        let response = service
            .oneshot(
                http::Request::put("http://mock.test/submit")
                    .body(body)
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PERMANENT_REDIRECT);
        assert_eq!(text(response).await, "moved");
        assert_eq!(transport.requests(), 1);
    }

    #[tokio::test]
    async fn too_many_redirects() {
        let transport = MockTransport::responder(|_| redirect(301, "/loop"));
        let service = service(transport.clone(), 3);

        let error = service
            .oneshot(
                http::Request::get("http://mock.test/loop")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap_err();

        assert!(matches!(error, Error::TooManyRedirects(3)));
        assert_eq!(transport.requests(), 4);
    }

    #[tokio::test]
    async fn credentials_are_dropped_across_origins() {
        let transport = MockTransport::responder(|request| match request.path.as_str() {
            "/same" => redirect(302, "/landing"),
            "/away" => redirect(302, "http://elsewhere.test/landing"),
            _ => echo(request),
        });
        let service = service(transport.clone(), 5);

        let request = |path: &str| {
            http::Request::get(format!("http://mock.test{path}"))
                .header("authorization", "secret")
                .body(Body::empty())
                .unwrap()
        };

        let response = service.clone().oneshot(request("/same")).await.unwrap();
        assert_eq!(text(response).await, "GET /landing auth=secret body=");

        let response = service.oneshot(request("/away")).await.unwrap();
        assert_eq!(
            response.extensions().get::<ConnectionInfo>().unwrap().origin,
            "http://elsewhere.test".parse::<Origin>().unwrap()
        );
        assert_eq!(text(response).await, "GET /landing auth=- body=");
    }

    #[tokio::test]
    async fn redirect_without_location_is_returned() {
        let transport = MockTransport::responder(|_| {
            MockReply::Respond(b"HTTP/1.1 302 Found\r\ncontent-length: 0\r\n\r\n".to_vec())
        });
        let service = service(transport, 5);

        let response = service
            .oneshot(
                http::Request::get("http://mock.test/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FOUND);
    }
}
