//! A minimal HTTP/1.1 server for exercising clients.
//!
//! [`start`] binds an ephemeral port on the loopback interface and serves every
//! connection with a `tower::Service`, using hyper's HTTP/1.1 server. The returned
//! [`ServerHandle`] counts accepted connections, which is how tests observe pooling,
//! and shuts the server down gracefully.

use std::convert::Infallible;
use std::future::{Future, IntoFuture as _};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::pin::pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use hyper::body::Incoming;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower::ServiceExt as _;
use tracing::{debug, trace, Instrument as _};

use crate::bridge::io::TokioIo;
use crate::notify::{self, Listener, Trigger};
use crate::BoxError;

/// Requests as seen by the server's service.
pub type Request = http::Request<Incoming>;

/// Responses produced by the server's service.
pub type Response = crate::body::Response;

/// Start serving `service` on `127.0.0.1` with an OS-assigned port.
///
/// The service is cloned for each accepted connection. Its errors close the
/// connection they happened on.
pub async fn start<S>(service: S) -> io::Result<(SocketAddr, ServerHandle)>
where
    S: tower::Service<Request, Response = Response> + Clone + Send + 'static,
    S::Error: Into<BoxError>,
    S::Future: Send + 'static,
{
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    let addr = listener.local_addr()?;

    let (signal, shutdown) = notify::channel();
    let (finished, running) = watch::channel(());
    let connections = Arc::new(AtomicUsize::new(0));

    let task = tokio::spawn(
        serve(
            listener,
            service,
            shutdown,
            running,
            connections.clone(),
        )
        .instrument(tracing::debug_span!("server", %addr)),
    );

    debug!(%addr, "server started");
    Ok((
        addr,
        ServerHandle {
            addr,
            signal,
            finished,
            connections,
            task,
        },
    ))
}

/// Start a server which answers every request with `handler`.
pub async fn start_fn<F, Fut>(handler: F) -> io::Result<(SocketAddr, ServerHandle)>
where
    F: Fn(Request) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    start(tower::service_fn(move |request| {
        let response = handler(request);
        async move { Ok::<_, Infallible>(response.await) }
    }))
    .await
}

async fn serve<S>(
    listener: TcpListener,
    service: S,
    shutdown: Listener,
    running: watch::Receiver<()>,
    connections: Arc<AtomicUsize>,
) where
    S: tower::Service<Request, Response = Response> + Clone + Send + 'static,
    S::Error: Into<BoxError>,
    S::Future: Send + 'static,
{
    let mut stop = pin!(shutdown.clone().into_future());

    loop {
        let (stream, remote) = tokio::select! {
            _ = &mut stop => {
                debug!("received shutdown signal");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(error) => {
                    debug!(%error, "accept error");
                    continue;
                }
            },
        };

        let count = connections.fetch_add(1, Ordering::SeqCst) + 1;
        trace!(%remote, count, "accepted connection");

        let span = tracing::trace_span!("connection", %remote);
        tokio::spawn(
            serve_connection(stream, service.clone(), shutdown.clone(), running.clone())
                .instrument(span),
        );
    }
}

async fn serve_connection<S>(
    stream: TcpStream,
    service: S,
    shutdown: Listener,
    // Held until the connection is closed.
    _running: watch::Receiver<()>,
) where
    S: tower::Service<Request, Response = Response> + Clone + Send + 'static,
    S::Error: Into<BoxError>,
    S::Future: Send + 'static,
{
    let service =
        hyper::service::service_fn(move |request: Request| service.clone().oneshot(request));
    let conn = hyper::server::conn::http1::Builder::new()
        .keep_alive(true)
        .serve_connection(TokioIo::new(stream), service);

    let mut conn = pin!(conn);
    let mut stop = pin!(shutdown.into_future());
    let mut stopping = false;

    let result = loop {
        tokio::select! {
            result = conn.as_mut() => break result,
            _ = &mut stop, if !stopping => {
                debug!("connection received shutdown signal");
                conn.as_mut().graceful_shutdown();
                stopping = true;
            }
        }
    };

    match result {
        Ok(()) => trace!("connection closed"),
        Err(error) => debug!(%error, "connection error"),
    }
}

/// Control over a server started with [`start`].
#[derive(Debug)]
pub struct ServerHandle {
    addr: SocketAddr,
    signal: Trigger,
    finished: watch::Sender<()>,
    connections: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// The address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Number of connections accepted so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// A `http://` URI for `path` on this server.
    pub fn uri(&self, path: &str) -> Result<http::Uri, http::uri::InvalidUri> {
        format!("http://{}{}", self.addr, path).parse()
    }

    /// Stop accepting connections, finish in-flight requests and wait for every
    /// connection to close.
    pub async fn shutdown(self) {
        self.signal.fire();
        if let Err(error) = self.task.await {
            debug!(%error, "server task failed");
        }
        self.finished.closed().await;
        debug!(addr = %self.addr, "server stopped");
    }
}
