// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! [`Server`]-related things

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::{FutureExt, Stream, StreamExt};
use hyper::body::{Body, Incoming};
use hyper::server::conn::http1;
use hyper::service::{service_fn, HttpService};
use hyper::Request;
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::{watch, Semaphore};
use tokio::time::sleep;
use tokio_util::task::TaskTracker;
use tracing::{error, info, info_span, warn, Instrument};

use crate::opts::Config;
use crate::relay::Relay;
use crate::response::GenericResponse;
use crate::sanitize;
use crate::signal::{fast_shutdown_requested, graceful_shutdown_requested};

/// Time a client gets to send a complete request head.
pub const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Serves HTTP/1 connections while allowing for graceful shutdowns.
pub struct Server {
    concurrent_connections: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
}

impl Server {
    /// Create a new [`Server`].
    ///
    /// `max_connections` is the maximum number of simultaneous connections that may be handled
    /// before new ones are answered with a minimal 503.
    pub fn new(max_connections: usize) -> Self {
        let concurrent_connections = Arc::new(Semaphore::new(max_connections));
        let (shutdown, _) = watch::channel(false);
        Self {
            concurrent_connections,
            shutdown,
        }
    }

    /// Serve incoming `connections` with `responder`.
    ///
    /// Each connection is handled in its own task. Resolves once
    /// [`graceful_shutdown`](Self::graceful_shutdown) has been called (or `connections` is
    /// exhausted) and every connection accepted by this call has ended.
    ///
    /// A connection whose client goes away mid-request is closed immediately, dropping the
    /// in-flight `responder` future along with any outbound work it was doing.
    pub async fn serve<P, C, R, F>(&self, connections: P, responder: R)
    where
        P: Stream<Item = std::io::Result<(C, SocketAddr)>>,
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
        R: Fn(Request<Incoming>, SocketAddr) -> F + Clone + Send + Sync + 'static,
        F: Future<Output = GenericResponse> + Send + 'static,
    {
        // This shutdown receiver is what keeps graceful_shutdown from returning so
        // we need it to be the first thing created so it's the last thing destroyed.
        let mut shutdown_receiver = self.shutdown.subscribe();
        let mut was_shutdown = pin!(shutdown_receiver.wait_for(|&done| done).map(|_| None));

        async fn either<T>(f1: impl Future<Output = T>, f2: impl Future<Output = T>) -> T {
            select! {
                biased; // never accept once shut down
                x1 = f1 => x1,
                x2 = f2 => x2,
            }
        }

        let tracker = TaskTracker::new();

        info!("Started serving");

        // scope is only to force `connections` to be dropped before waiting on connections
        {
            let mut connections = pin!(connections);
            while let Some(accepted) = either(&mut was_shutdown, connections.next()).await {
                let (connection, peer_addr) = match accepted {
                    Ok(a) => a,
                    Err(err) => {
                        error!("Couldn't accept connection: {err}");
                        continue;
                    }
                };

                let connection_span = info_span!("connection", addr = %peer_addr);

                let Ok(permit) = self.concurrent_connections.clone().try_acquire_owned() else {
                    async {
                        warn!("Too overloaded; sending minimal 503.");
                        if let Err(err) = respond_with_temporarily_unavailable(connection).await {
                            warn!("Couldn't send 503: {err}");
                        }
                    }
                    .instrument(connection_span)
                    .await;
                    continue;
                };

                let respond = responder.clone();
                let service = service_fn(move |request: Request<Incoming>| {
                    let respond = respond.clone();
                    async move {
                        info!(
                            "Request: {} {}",
                            request.method(),
                            sanitize::for_log(&request.uri().to_string())
                        );
                        let response = respond(request, peer_addr).await;
                        info!("Response: {}", response.status());
                        Ok::<_, Infallible>(response)
                    }
                });

                let mut shutdown_receiver = self.shutdown.subscribe();
                let connection_task = async move {
                    let _permit = permit;
                    info!("Connected.");
                    let wants_shutdown = shutdown_receiver.wait_for(|&done| done);

                    // Without half-closes, EOF from the client while a request is in
                    // flight ends the connection and cancels the request.
                    let http_connection = http1::Builder::new()
                        .half_close(false)
                        .timer(TokioTimer::new())
                        .header_read_timeout(HEADER_READ_TIMEOUT)
                        .serve_connection(TokioIo::new(connection), service);
                    match with_graceful_shutdown(http_connection, wants_shutdown).await {
                        Ok(()) => {}
                        Err(err) if err.is_incomplete_message() => {
                            info!("Client went away mid-request: {err}")
                        }
                        Err(err) => warn!("Error serving: {err}"),
                    }
                    info!("Disconnected.");
                };
                tracker.spawn(connection_task.instrument(connection_span));
            }
        }

        tracker.close();
        tracker.wait().await;
        info!("Stopped serving");
    }

    /// Gracefully shuts down server.
    ///
    /// Running [`serve`](Self::serve) calls stop accepting, then wait for their connections.
    /// Connections end as soon as their current request finishes; idle ones end immediately.
    /// Resolves once every [`serve`](Self::serve) call has returned.
    pub async fn graceful_shutdown(&self) {
        self.shutdown.send_replace(true);
        self.shutdown.closed().await;
    }
}

/// Serve the relay described by `config` until a shutdown signal arrives.
///
/// A `SIGINT` shuts down gracefully, finishing in-flight requests first. A second `SIGINT`,
/// or a `SIGTERM`, returns immediately.
///
/// **BEWARE:** This registers process-wide signal handlers; call it from `main` only.
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let relay = Arc::new(Relay::from_config(&config)?);
    let address = config.listen_addr();
    let listener = bind(address)
        .await
        .with_context(|| format!("Couldn't listen on {address}"))?;
    info!("Listening on {address}");

    let server = Server::new(config.max_clients);
    let serve = server.serve(tcp_connections(listener), move |request, peer| {
        let relay = relay.clone();
        async move { relay.respond(request, peer).await }
    });

    let graceful_shutdown = async {
        graceful_shutdown_requested().await?;
        info!("Graceful shutdown signaled");
        server.graceful_shutdown().await;
        Ok::<_, std::io::Error>(())
    };

    tokio::select! {
        biased;
        result = fast_shutdown_requested() => {
            result?;
            info!("Fast shutdown requested...");
        }
        result = graceful_shutdown => result?,
        () = serve => {}
    };

    Ok(())
}

/// Bind a TCP listener, with a hint when a privileged port is refused.
pub async fn bind(address: SocketAddr) -> std::io::Result<TcpListener> {
    TcpListener::bind(address).await.map_err(|err| {
        if cfg!(target_os = "linux")
            && err.kind() == std::io::ErrorKind::PermissionDenied
            && address.port() < 1024
        {
            let hint = format!("{err}\n(ports under 1024 usually require admin privileges)");
            std::io::Error::new(err.kind(), hint)
        } else {
            err
        }
    })
}

/// Stream of connections accepted from `listener`.
pub fn tcp_connections(
    listener: TcpListener,
) -> impl Stream<Item = std::io::Result<(TcpStream, SocketAddr)>> {
    futures::stream::unfold(listener, |listener| async {
        let accepted = listener.accept().await;
        Some((accepted, listener))
    })
}

/// Cheaply responds to an HTTP 1 connection with a minimal 503.
async fn respond_with_temporarily_unavailable(
    mut connection: impl AsyncWriteExt + Unpin,
) -> std::io::Result<()> {
    // The request is never parsed, and a slow client gets one second to take the response.
    let write_response = async {
        let msg = b"HTTP/1.1 503 Service Unavailable\r\n\
                    Content-Type: text/plain;charset=utf-8\r\n\
                    Content-Length: 22\r\n\
                    Connection: close\r\n\
                    \r\n\
                    Too many connections!\n";
        connection.write_all(msg).await?;
        connection.shutdown().await
    };
    select! {
         result = write_response => result,
         _ = sleep(Duration::from_secs(1)) => Err(std::io::ErrorKind::TimedOut.into()),
    }
}

/// Gracefully terminate `connection` if `want_shutdown` resolves.
async fn with_graceful_shutdown<I, S, B>(
    connection: http1::Connection<I, S>,
    want_shutdown: impl Future,
) -> Result<(), hyper::Error>
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + 'static,
    S: HttpService<Incoming, ResBody = B>,
    S::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    B: Body + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    // Polling and gracefully shutting down both need exclusive access, hence poll_fn.
    let mut connection = pin!(connection);
    let mut want_shutdown = pin!(want_shutdown.fuse());
    std::future::poll_fn(|cx| {
        if want_shutdown.as_mut().poll(cx).is_ready() {
            connection.as_mut().graceful_shutdown();
        }
        connection.as_mut().poll(cx)
    })
    .await
}
