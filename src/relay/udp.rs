//! UDP relay engine
//!
//! Emulates connections over UDP the way a NAT does: the first datagram
//! from a client address opens a session with its own socket connected
//! to the backend. Replies arriving on that socket can only belong to that
//! client, so they are sent back to it through the frontend socket.
//! Sessions that stay idle for the configured timeout are evicted.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use super::conntrack::{ConnTrackTable, IdleCheck};
use super::{ProxyStats, RelaySession, SessionGuard};
use crate::proxy::lifecycle::{lock, Lifecycle};
use crate::proxy::{Endpoint, Protocol, ProxyError, ProxyOptions};

/// UDP flavour of [`crate::Proxy`].
pub struct UdpProxy {
    frontend: Endpoint,
    socket: Mutex<Option<UdpSocket>>,
    relay: Arc<UdpRelay>,
    lifecycle: Lifecycle,
}

struct UdpRelay {
    backend: Endpoint,
    datagram_size: usize,
    table: ConnTrackTable<UdpSession>,
    stats: Arc<ProxyStats>,
}

/// A tracked client and the backend-facing socket it owns.
struct UdpSession {
    socket: UdpSocket,
    guard: SessionGuard,
}

impl UdpProxy {
    /// Bind the frontend socket. The backend is not contacted.
    pub async fn bind(
        frontend: Endpoint,
        backend: Endpoint,
        options: &ProxyOptions,
    ) -> Result<Self, ProxyError> {
        let bind_error = |source| ProxyError::BindFailure {
            addr: frontend.addr(),
            source,
        };

        info!("Binding UDP socket to {}", frontend.addr());
        let socket = UdpSocket::bind(frontend.addr()).await.map_err(bind_error)?;
        let local_addr = socket.local_addr().map_err(bind_error)?;
        info!("Successfully bound to {}", local_addr);

        Ok(Self {
            frontend: frontend.with_addr(local_addr),
            socket: Mutex::new(Some(socket)),
            relay: Arc::new(UdpRelay {
                backend,
                datagram_size: options.udp_datagram_size,
                table: ConnTrackTable::new(options.udp_idle_timeout),
                stats: Arc::new(ProxyStats::new()),
            }),
            lifecycle: Lifecycle::new(options.shutdown_timeout),
        })
    }

    pub fn run(&self) -> Result<(), ProxyError> {
        self.lifecycle.check_startable()?;
        let socket = lock(&self.socket)
            .take()
            .ok_or_else(|| self.lifecycle.socket_taken())?;
        let relay = Arc::clone(&self.relay);

        self.lifecycle
            .start(move |shutdown_rx| receive_loop(Arc::new(socket), relay, shutdown_rx))
    }

    pub async fn close(&self) {
        self.lifecycle.mark_closing();
        drop(lock(&self.socket).take());
        self.lifecycle.stop().await;
        // The loop drains the table on its way out; this covers a loop
        // that had to be aborted and a proxy that never ran.
        close_sessions(&self.relay.table);
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

    /// Number of client addresses currently tracked.
    pub fn active_sessions(&self) -> usize {
        self.relay.table.len()
    }

    /// Client addresses currently tracked.
    pub fn tracked_clients(&self) -> Vec<SocketAddr> {
        self.relay.table.clients()
    }

    pub fn is_closed(&self) -> bool {
        self.lifecycle.is_shutting_down()
    }
}

impl fmt::Debug for UdpProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpProxy")
            .field("frontend", &self.frontend)
            .field("backend", &self.relay.backend)
            .field("sessions", &self.relay.table.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn receive_loop(
    frontend: Arc<UdpSocket>,
    relay: Arc<UdpRelay>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    info!("Starting datagram receive loop");
    let mut readers = JoinSet::new();
    let mut buf = vec![0u8; relay.datagram_size];

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.recv() => {
                info!("Received shutdown signal, stopping datagram reception");
                break;
            }

            Some(joined) = readers.join_next(), if !readers.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        error!("UDP session reader panicked: {}", e);
                    }
                }
            }

            received = frontend.recv_from(&mut buf) => match received {
                Ok((n, client_addr)) => {
                    relay.forward(&frontend, client_addr, &buf[..n], &mut readers).await;
                }
                Err(e) => {
                    // Some platforms report ICMP errors for earlier replies
                    // here; none of them make the frontend unusable.
                    warn!("Error receiving datagram on {}: {}", relay.backend, e);
                }
            },
        }
    }

    debug!("Stopping {} UDP session readers", readers.len());
    readers.shutdown().await;
    close_sessions(&relay.table);
    info!("Datagram receive loop stopped");
}

fn close_sessions(table: &ConnTrackTable<UdpSession>) {
    for (client_addr, session) in table.drain() {
        debug!(client = %client_addr, "Closing UDP session");
        session.guard.set_close_reason("shutdown");
    }
}

impl UdpRelay {
    /// Send one client datagram to the backend, opening a session first
    /// if the client is new.
    async fn forward(
        self: &Arc<Self>,
        frontend: &Arc<UdpSocket>,
        client_addr: SocketAddr,
        payload: &[u8],
        readers: &mut JoinSet<()>,
    ) {
        let session = match self.table.touch(&client_addr) {
            Some(session) => session,
            None => match self.open_session(client_addr).await {
                Ok(session) => {
                    let (session, inserted) = self.table.insert_if_absent(client_addr, session);
                    if inserted {
                        readers.spawn(backend_reader(
                            Arc::clone(self),
                            Arc::clone(frontend),
                            client_addr,
                            Arc::clone(&session),
                        ));
                    }
                    session
                }
                Err(e) => {
                    self.stats.send_failed();
                    warn!(client = %client_addr, "{}", e);
                    return;
                }
            },
        };

        match session.send(payload).await {
            Ok(()) => session.guard.record_datagram_up(payload.len()),
            Err(source) => {
                // The session stays: the backend may come up and the client
                // may retry.
                self.stats.send_failed();
                let e = ProxyError::SendFailure {
                    addr: self.backend.addr(),
                    source,
                };
                warn!(session_id = %session.guard.session_id, "{}", e);
            }
        }
    }

    async fn open_session(&self, client_addr: SocketAddr) -> Result<Arc<UdpSession>, ProxyError> {
        let addr = self.backend.addr();
        let send_error = |source| ProxyError::SendFailure { addr, source };

        let socket = UdpSocket::bind(self.backend.family().unspecified())
            .await
            .map_err(send_error)?;
        socket.connect(addr).await.map_err(send_error)?;

        let guard = SessionGuard::open(
            RelaySession::new(Protocol::Udp, client_addr, addr),
            Arc::clone(&self.stats),
        );
        debug!(
            session_id = %guard.session_id,
            local_addr = ?socket.local_addr().ok(),
            "Opened UDP session for {}", client_addr
        );

        Ok(Arc::new(UdpSession { socket, guard }))
    }
}

impl UdpSession {
    async fn send(&self, payload: &[u8]) -> io::Result<()> {
        match self.socket.send(payload).await {
            // A refusal reported here belongs to an earlier datagram; the
            // kernel clears it on report, so this one has not been sent yet.
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                debug!(session_id = %self.guard.session_id, "Retrying send after stale refusal");
                self.socket.send(payload).await.map(|_| ())
            }
            result => result.map(|_| ()),
        }
    }
}

/// Return path and idle timer of one session.
async fn backend_reader(
    relay: Arc<UdpRelay>,
    frontend: Arc<UdpSocket>,
    client_addr: SocketAddr,
    session: Arc<UdpSession>,
) {
    let mut buf = vec![0u8; relay.datagram_size];
    let mut deadline = Instant::now() + relay.table.idle_timeout();

    loop {
        tokio::select! {
            received = session.socket.recv(&mut buf) => match received {
                Ok(n) => {
                    relay.table.refresh(&client_addr, &session);
                    match frontend.send_to(&buf[..n], client_addr).await {
                        Ok(_) => session.guard.record_datagram_down(n),
                        Err(e) => warn!(
                            session_id = %session.guard.session_id,
                            "Failed to return datagram to {}: {}", client_addr, e
                        ),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                    debug!(
                        session_id = %session.guard.session_id,
                        "Backend {} refused a datagram", relay.backend
                    );
                }
                Err(e) => {
                    warn!(
                        session_id = %session.guard.session_id,
                        "Error reading from backend {}: {}", relay.backend, e
                    );
                    if relay.table.remove(&client_addr, &session) {
                        session.guard.set_close_reason("error");
                    }
                    return;
                }
            },

            _ = sleep_until(deadline) => {
                match relay.table.check_idle(&client_addr, &session, Instant::now()) {
                    IdleCheck::Evicted => {
                        relay.stats.session_evicted();
                        session.guard.set_close_reason("idle");
                        debug!(
                            session_id = %session.guard.session_id,
                            "Evicted idle UDP session for {}", client_addr
                        );
                        return;
                    }
                    IdleCheck::Active { deadline: next } => deadline = next,
                    IdleCheck::Gone => return,
                }
            }
        }
    }
}
