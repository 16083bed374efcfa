//! TCP relay engine
//!
//! Accepts clients on the frontend listener, dials the backend once per
//! client and pumps bytes both ways. End-of-stream on one side is passed
//! on as a write shutdown to the other side, and the session lasts until
//! both directions are finished.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::{ProxyStats, RelaySession, SessionGuard};
use crate::proxy::lifecycle::{lock, Lifecycle};
use crate::proxy::{Endpoint, Protocol, ProxyError, ProxyOptions};

/// Pause after a failed accept so a persistent error (e.g. fd exhaustion)
/// does not spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// TCP flavour of [`crate::Proxy`].
pub struct TcpProxy {
    frontend: Endpoint,
    listener: Mutex<Option<TcpListener>>,
    relay: Arc<TcpRelay>,
    lifecycle: Lifecycle,
}

/// State shared by the accept loop and every session task.
struct TcpRelay {
    backend: Endpoint,
    connect_timeout: Duration,
    buffer_size: usize,
    stats: Arc<ProxyStats>,
}

impl TcpProxy {
    /// Bind the frontend listener. The backend is not contacted.
    pub async fn bind(
        frontend: Endpoint,
        backend: Endpoint,
        options: &ProxyOptions,
    ) -> Result<Self, ProxyError> {
        let bind_error = |source| ProxyError::BindFailure {
            addr: frontend.addr(),
            source,
        };

        info!("Binding TCP listener to {}", frontend.addr());
        let listener = TcpListener::bind(frontend.addr()).await.map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;
        info!("Successfully bound to {}", local_addr);

        Ok(Self {
            frontend: frontend.with_addr(local_addr),
            listener: Mutex::new(Some(listener)),
            relay: Arc::new(TcpRelay {
                backend,
                connect_timeout: options.connect_timeout,
                buffer_size: options.buffer_size,
                stats: Arc::new(ProxyStats::new()),
            }),
            lifecycle: Lifecycle::new(options.shutdown_timeout),
        })
    }

    pub fn run(&self) -> Result<(), ProxyError> {
        self.lifecycle.check_startable()?;
        let listener = lock(&self.listener)
            .take()
            .ok_or_else(|| self.lifecycle.socket_taken())?;
        let relay = Arc::clone(&self.relay);

        self.lifecycle
            .start(move |shutdown_rx| accept_loop(listener, relay, shutdown_rx))
    }

    pub async fn close(&self) {
        // Closing a proxy that never ran still has to release the listener.
        self.lifecycle.mark_closing();
        drop(lock(&self.listener).take());
        self.lifecycle.stop().await;
    }

    pub fn frontend_addr(&self) -> Endpoint {
        self.frontend
    }

    pub fn backend_addr(&self) -> Endpoint {
        self.relay.backend
    }

    pub fn stats(&self) -> &ProxyStats {
        &self.relay.stats
    }

    pub fn active_sessions(&self) -> usize {
        self.relay.stats.active_sessions() as usize
    }

    pub fn is_closed(&self) -> bool {
        self.lifecycle.is_shutting_down()
    }
}

impl fmt::Debug for TcpProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpProxy")
            .field("frontend", &self.frontend)
            .field("backend", &self.relay.backend)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn accept_loop(
    listener: TcpListener,
    relay: Arc<TcpRelay>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    info!("Starting connection acceptance loop");
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.recv() => {
                info!("Received shutdown signal, stopping connection acceptance");
                break;
            }

            Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        error!("TCP session task panicked: {}", e);
                    }
                }
            }

            accepted = listener.accept() => match accepted {
                Ok((stream, client_addr)) => {
                    debug!("Accepted connection from {}", client_addr);
                    let relay = Arc::clone(&relay);
                    let session_shutdown = shutdown_rx.resubscribe();
                    sessions.spawn(async move {
                        relay.handle_connection(stream, client_addr, session_shutdown).await;
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },
        }
    }

    drop(listener);
    debug!("Closing {} in-flight TCP sessions", sessions.len());
    sessions.shutdown().await;
    info!("Connection acceptance loop stopped");
}

impl TcpRelay {
    async fn handle_connection(
        &self,
        mut client: TcpStream,
        client_addr: SocketAddr,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let dialed = tokio::select! {
            biased;
            _ = shutdown_rx.recv() => return,
            dialed = self.dial() => dialed,
        };

        let mut backend = match dialed {
            Ok(backend) => backend,
            Err(e) => {
                self.stats.dial_failed();
                warn!(client = %client_addr, "{}", e);
                // Dropping the client stream closes it.
                return;
            }
        };

        let session = SessionGuard::open(
            RelaySession::new(Protocol::Tcp, client_addr, self.backend.addr()),
            Arc::clone(&self.stats),
        );
        debug!(
            session_id = %session.session_id,
            "Relaying {} <-> {}", client_addr, self.backend.addr()
        );

        tokio::select! {
            biased;

            _ = shutdown_rx.recv() => {
                debug!(session_id = %session.session_id, "Session closed by shutdown");
                session.set_close_reason("shutdown");
            }

            result = relay_bidirectional(&mut client, &mut backend, self.buffer_size, &session) => {
                match result {
                    Ok(()) => session.set_close_reason("eof"),
                    Err(e) => {
                        let e = ProxyError::RelayError(e);
                        warn!(session_id = %session.session_id, "{}", e);
                        session.set_close_reason("error");
                    }
                }
            }
        }
        // Both streams drop here, fully closing the session's sockets.
    }

    async fn dial(&self) -> Result<TcpStream, ProxyError> {
        let addr = self.backend.addr();
        let dial_error = |source| ProxyError::DialFailure { addr, source };

        match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(dial_error(e)),
            Err(_) => Err(dial_error(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connection timed out after {:?}", self.connect_timeout),
            ))),
        }
    }
}

/// Copy both directions concurrently until each has seen end-of-stream.
/// The first I/O error ends the whole relay.
async fn relay_bidirectional(
    client: &mut TcpStream,
    backend: &mut TcpStream,
    buffer_size: usize,
    session: &RelaySession,
) -> io::Result<()> {
    let (client_read, client_write) = client.split();
    let (backend_read, backend_write) = backend.split();

    let upstream = pipe(client_read, backend_write, buffer_size, |n| session.add_bytes_up(n));
    let downstream = pipe(backend_read, client_write, buffer_size, |n| session.add_bytes_down(n));

    tokio::try_join!(upstream, downstream)?;
    Ok(())
}

/// Copy `from` into `to`, then shut down the write side of `to` so the
/// peer sees end-of-stream while the opposite direction keeps flowing.
async fn pipe<R, W, F>(mut from: R, mut to: W, buffer_size: usize, on_bytes: F) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: Fn(u64),
{
    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = from.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        to.write_all(&buf[..n]).await?;
        on_bytes(n as u64);
    }

    match to.shutdown().await {
        // The peer may already be fully gone; the direction is done either way.
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
        result => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (connected, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (connected.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_pipe_copies_and_half_closes() {
        let (mut source, source_peer) = connected_pair().await;
        let (sink_peer, mut sink) = connected_pair().await;

        let (source_read, _source_write) = source_peer.into_split();
        let (_sink_read, sink_write) = sink_peer.into_split();

        let counted = std::sync::atomic::AtomicU64::new(0);
        let copy = pipe(source_read, sink_write, 16, |n| {
            counted.fetch_add(n, std::sync::atomic::Ordering::Relaxed);
        });

        let feed = async {
            source.write_all(b"hello through the pipe").await.unwrap();
            source.shutdown().await.unwrap();
        };

        let (copied, ()) = tokio::join!(copy, feed);
        copied.unwrap();

        let mut received = Vec::new();
        sink.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"hello through the pipe");
        assert_eq!(counted.load(std::sync::atomic::Ordering::Relaxed), 22);
    }

    #[tokio::test]
    async fn test_run_racing_close_reports_shutdown() {
        let proxy = TcpProxy::bind(
            Endpoint::tcp("127.0.0.1:0".parse().unwrap()),
            Endpoint::tcp("127.0.0.1:9".parse().unwrap()),
            &ProxyOptions::default(),
        )
        .await
        .unwrap();

        // Close has released the listener but not stopped the lifecycle yet.
        proxy.lifecycle.mark_closing();
        drop(lock(&proxy.listener).take());

        assert!(matches!(proxy.run(), Err(ProxyError::ShutdownInProgress)));
        proxy.close().await;
    }

    #[tokio::test]
    async fn test_dial_failure_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = listener.local_addr().unwrap();
        drop(listener);

        let relay = TcpRelay {
            backend: Endpoint::tcp(dead_addr),
            connect_timeout: Duration::from_secs(2),
            buffer_size: 1024,
            stats: Arc::new(ProxyStats::new()),
        };

        match relay.dial().await {
            Err(ProxyError::DialFailure { addr, .. }) => assert_eq!(addr, dead_addr),
            other => panic!("expected dial failure, got {:?}", other.map(|_| ())),
        }
    }
}
