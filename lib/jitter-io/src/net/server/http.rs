//! Basic HTTP server.

use std::{
    cell::RefCell,
    future::Future,
    net::SocketAddr,
    pin::Pin,
    task::{ready, Context, Poll},
    time::Duration,
};

use http::{Request, Response};
use http_body::Body;
use hyper::{body::Incoming, service::Service};
use hyper_util::{
    rt::{TokioExecutor, TokioIo, TokioTimer},
    server::conn::auto::Builder,
};
use jitter_error::GenericError;
use tokio::{
    net::TcpStream,
    pin, select,
    sync::oneshot,
    task::JoinHandle,
    time::{sleep, timeout},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn, Instrument as _};

use crate::net::listener::Listener;

const MIN_ACCEPT_BACKOFF: Duration = Duration::from_millis(5);
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

tokio::task_local! {
    static CONNECTION_ERROR: RefCell<Option<String>>;
}

/// Returns the reason the current connection was closed abnormally, if any.
///
/// This is only set while the connection is being torn down, so it is meant to be called from the `Drop`
/// implementation of per-request state, which is dropped along with the connection. Outside of a connection task, or
/// when the connection is closing normally, `None` is returned.
pub fn connection_error() -> Option<String> {
    CONNECTION_ERROR
        .try_with(|error| error.borrow().clone())
        .ok()
        .flatten()
}

fn set_connection_error(error: String) {
    let _ = CONNECTION_ERROR.try_with(|slot| *slot.borrow_mut() = Some(error));
}

/// Exponential backoff for accept errors that are not tied to a single connection.
struct AcceptBackoff {
    current: Option<Duration>,
}

impl AcceptBackoff {
    const fn new() -> Self {
        Self { current: None }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = match self.current {
            None => MIN_ACCEPT_BACKOFF,
            Some(previous) => (previous * 2).min(MAX_ACCEPT_BACKOFF),
        };
        self.current = Some(delay);
        delay
    }

    fn reset(&mut self) {
        self.current = None;
    }
}

/// A basic HTTP server that listens for incoming connections and serves them using a given service.
///
/// Each accepted connection is served on its own task. Shutting down the server happens in two steps: first, the
/// server stops accepting new connections and asks every open connection to close once its in-flight request (if any)
/// has been responded to. Second, after whatever bounded wait the caller chooses, any connections still open can be
/// forcibly closed. See [`ShutdownHandle`] and [`DrainingConnections`].
pub struct HttpServer<S> {
    listener: Listener,
    conn_builder: Builder<TokioExecutor>,
    service: S,
}

impl<S> HttpServer<S> {
    /// Create a new `HttpServer` from the given listener and service.
    ///
    /// The service must be able to be cloned, as a copy is given to each incoming connection.
    pub fn from_listener(listener: Listener, service: S) -> Self {
        Self {
            listener,
            conn_builder: Builder::new(TokioExecutor::new()),
            service,
        }
    }

    /// Gets the address the server is listening on.
    pub fn listen_address(&self) -> SocketAddr {
        self.listener.listen_address()
    }

    /// Sets how long a client has to send the request headers before the connection is closed.
    ///
    /// Only applies to HTTP/1 connections.
    pub fn with_header_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.conn_builder
            .http1()
            .timer(TokioTimer::new())
            .header_read_timeout(read_timeout);
        self
    }
}

impl<S, B> HttpServer<S>
where
    S: Service<Request<Incoming>, Response = Response<B>> + Send + Sync + Clone + 'static,
    S::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    S::Future: Send + 'static,
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: std::error::Error + Send + Sync,
{
    /// Starts accepting connections in the background.
    ///
    /// Returns a handle for shutting the server down, and a handle that resolves if the server hits an error that it
    /// cannot recover from.
    pub fn listen(self) -> (ShutdownHandle, ErrorHandle) {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let (error_tx, error_rx) = oneshot::channel();

        let connections = TaskTracker::new();
        let graceful_token = CancellationToken::new();
        let terminate_token = CancellationToken::new();

        let Self {
            mut listener,
            conn_builder,
            service,
        } = self;

        let accept_loop = {
            let connections = connections.clone();
            let graceful_token = graceful_token.clone();
            let terminate_token = terminate_token.clone();

            tokio::spawn(
                async move {
                    let listen_addr = listener.listen_address();
                    info!(%listen_addr, "HTTP server started.");

                    let mut backoff = AcceptBackoff::new();
                    loop {
                        select! {
                            result = listener.accept() => match result {
                                Ok((stream, peer_addr)) => {
                                    backoff.reset();
                                    let conn = serve_connection(
                                        conn_builder.clone(),
                                        stream,
                                        service.clone(),
                                        graceful_token.clone(),
                                        terminate_token.clone(),
                                    );
                                    let conn = CONNECTION_ERROR.scope(RefCell::new(None), conn);
                                    connections.spawn(conn.instrument(tracing::debug_span!("http_connection", %peer_addr)));
                                },
                                Err(e) if e.is_connection_error() => {
                                    debug!(%listen_addr, error = %e, "Transient failure while accepting connection.");
                                },
                                Err(e) if e.is_transient() => {
                                    let delay = backoff.next_delay();
                                    warn!(%listen_addr, error = %e, delay_ms = delay.as_millis() as u64, "Failed to accept connection. Backing off.");

                                    // Keep listening for shutdown while backing off.
                                    select! {
                                        _ = sleep(delay) => {},
                                        _ = &mut shutdown_rx => {
                                            debug!(%listen_addr, "Received shutdown signal.");
                                            break;
                                        }
                                    }
                                },
                                Err(e) => {
                                    let _ = error_tx.send(e.into());
                                    break;
                                }
                            },

                            _ = &mut shutdown_rx => {
                                debug!(%listen_addr, "Received shutdown signal.");
                                break;
                            }
                        }
                    }

                    info!(%listen_addr, "HTTP server stopped accepting connections.");
                }
                .in_current_span(),
            )
        };

        let shutdown_handle = ShutdownHandle {
            shutdown_tx,
            accept_loop,
            connections,
            graceful_token,
            terminate_token,
        };

        (shutdown_handle, ErrorHandle(error_rx))
    }
}

async fn serve_connection<S, B>(
    conn_builder: Builder<TokioExecutor>, stream: TcpStream, service: S, graceful_token: CancellationToken,
    terminate_token: CancellationToken,
) where
    S: Service<Request<Incoming>, Response = Response<B>> + Send + Clone + 'static,
    S::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    S::Future: Send + 'static,
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: std::error::Error + Send + Sync,
{
    let conn = conn_builder.serve_connection(TokioIo::new(stream), service);
    pin!(conn);

    let result = select! {
        result = conn.as_mut() => result,
        _ = graceful_token.cancelled() => {
            // Let the in-flight request, if any, finish, but don't accept any further requests on this connection.
            conn.as_mut().graceful_shutdown();

            select! {
                result = conn.as_mut() => result,
                _ = terminate_token.cancelled() => {
                    debug!("Forcibly closing connection.");
                    set_connection_error("connection forcibly closed during shutdown".to_string());
                    return;
                }
            }
        }
    };

    if let Err(e) = result {
        error!(error = %e, "Failed to serve HTTP connection.");
        set_connection_error(e.to_string());
    }
}

/// Handle for shutting down an [`HttpServer`].
pub struct ShutdownHandle {
    shutdown_tx: oneshot::Sender<()>,
    accept_loop: JoinHandle<()>,
    connections: TaskTracker,
    graceful_token: CancellationToken,
    terminate_token: CancellationToken,
}

impl ShutdownHandle {
    /// Stops accepting new connections, and asks open connections to close once they are idle.
    ///
    /// Once this returns, the listening socket has been closed. The returned [`DrainingConnections`] can be used to
    /// wait for open connections to finish, and to forcibly close them if they take too long.
    pub async fn shutdown(self) -> DrainingConnections {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.accept_loop.await {
            error!(error = %e, "HTTP server accept loop terminated abnormally.");
        }

        self.connections.close();
        self.graceful_token.cancel();

        DrainingConnections {
            connections: self.connections,
            terminate_token: self.terminate_token,
        }
    }
}

/// Connections that are still open after the server has stopped accepting new ones.
pub struct DrainingConnections {
    connections: TaskTracker,
    terminate_token: CancellationToken,
}

impl DrainingConnections {
    /// Returns the number of connections that are still open.
    pub fn remaining(&self) -> usize {
        self.connections.len()
    }

    /// Waits up to `limit` for all open connections to close.
    ///
    /// Returns `true` if all connections closed within the limit.
    pub async fn wait(&self, limit: Duration) -> bool {
        timeout(limit, self.connections.wait()).await.is_ok()
    }

    /// Forcibly closes all remaining connections, waiting until they have been closed.
    ///
    /// Requests still being handled on those connections are abandoned without a response.
    pub async fn terminate(self) {
        self.terminate_token.cancel();
        self.connections.wait().await;
    }
}

/// Handle that resolves when an [`HttpServer`] fails.
pub struct ErrorHandle(oneshot::Receiver<GenericError>);

impl Future for ErrorHandle {
    type Output = Option<GenericError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match ready!(Pin::new(&mut self.0).poll(cx)) {
            Ok(err) => Poll::Ready(Some(err)),
            Err(_) => Poll::Ready(None),
        }
    }
}
