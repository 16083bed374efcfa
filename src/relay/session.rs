//! Relay Session

use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use super::ProxyStats;
use crate::proxy::Protocol;

/// One relayed client association: a TCP connection or a tracked UDP peer.
#[derive(Debug)]
pub struct RelaySession {
    pub session_id: String,
    pub protocol: Protocol,
    pub client_addr: SocketAddr,
    pub backend_addr: SocketAddr,
    pub start_time: Instant,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
    datagrams_up: AtomicU64,
    datagrams_down: AtomicU64,
}

/// Statistics for a finished session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStats {
    pub session_id: String,
    pub protocol: Protocol,
    pub client_addr: SocketAddr,
    pub backend_addr: SocketAddr,
    pub start_time: SystemTime,
    pub duration_ms: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub total_bytes: u64,
    pub datagrams_up: u64,
    pub datagrams_down: u64,
}

impl RelaySession {
    pub fn new(protocol: Protocol, client_addr: SocketAddr, backend_addr: SocketAddr) -> Self {
        let session_id = Uuid::new_v4().to_string();
        debug!(
            "Creating new {} relay session: {} ({} -> {})",
            protocol, session_id, client_addr, backend_addr
        );

        Self {
            session_id,
            protocol,
            client_addr,
            backend_addr,
            start_time: Instant::now(),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
            datagrams_up: AtomicU64::new(0),
            datagrams_down: AtomicU64::new(0),
        }
    }

    /// Bytes relayed client to backend
    pub fn bytes_up(&self) -> u64 {
        self.bytes_up.load(Ordering::Relaxed)
    }

    /// Bytes relayed backend to client
    pub fn bytes_down(&self) -> u64 {
        self.bytes_down.load(Ordering::Relaxed)
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes_up() + self.bytes_down()
    }

    pub fn datagrams_up(&self) -> u64 {
        self.datagrams_up.load(Ordering::Relaxed)
    }

    pub fn datagrams_down(&self) -> u64 {
        self.datagrams_down.load(Ordering::Relaxed)
    }

    pub fn duration(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn add_bytes_up(&self, bytes: u64) {
        self.bytes_up.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_down(&self, bytes: u64) {
        self.bytes_down.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record one datagram forwarded to the backend
    pub fn record_datagram_up(&self, bytes: usize) {
        self.datagrams_up.fetch_add(1, Ordering::Relaxed);
        self.add_bytes_up(bytes as u64);
    }

    /// Record one datagram returned to the client
    pub fn record_datagram_down(&self, bytes: usize) {
        self.datagrams_down.fetch_add(1, Ordering::Relaxed);
        self.add_bytes_down(bytes as u64);
    }

    pub fn to_stats(&self) -> SessionStats {
        let duration = self.duration();

        SessionStats {
            session_id: self.session_id.clone(),
            protocol: self.protocol,
            client_addr: self.client_addr,
            backend_addr: self.backend_addr,
            start_time: SystemTime::now() - duration,
            duration_ms: duration.as_millis() as u64,
            bytes_up: self.bytes_up(),
            bytes_down: self.bytes_down(),
            total_bytes: self.total_bytes(),
            datagrams_up: self.datagrams_up(),
            datagrams_down: self.datagrams_down(),
        }
    }

    /// Log session statistics on completion
    pub fn log_stats(&self, reason: &str) {
        info!(
            session_id = %self.session_id,
            protocol = %self.protocol,
            client_addr = %self.client_addr,
            backend_addr = %self.backend_addr,
            duration_ms = self.duration().as_millis() as u64,
            bytes_up = self.bytes_up(),
            bytes_down = self.bytes_down(),
            datagrams_up = self.datagrams_up(),
            datagrams_down = self.datagrams_down(),
            reason,
            "Relay session closed"
        );
    }
}

/// Keeps a session counted as active in [`ProxyStats`] for as long as it
/// lives. Dropping it, whether the session ended normally or its task was
/// aborted, folds the counters into the proxy totals and logs them.
#[derive(Debug)]
pub struct SessionGuard {
    session: RelaySession,
    stats: Arc<ProxyStats>,
    close_reason: OnceLock<&'static str>,
}

impl SessionGuard {
    pub fn open(session: RelaySession, stats: Arc<ProxyStats>) -> Self {
        stats.session_opened();
        Self {
            session,
            stats,
            close_reason: OnceLock::new(),
        }
    }

    /// First reason wins.
    pub fn set_close_reason(&self, reason: &'static str) {
        let _ = self.close_reason.set(reason);
    }
}

impl Deref for SessionGuard {
    type Target = RelaySession;

    fn deref(&self) -> &RelaySession {
        &self.session
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.stats.session_closed(&self.session);
        self.session
            .log_stats(self.close_reason.get().copied().unwrap_or("aborted"));
    }
}
