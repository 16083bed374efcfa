//! Per-proxy counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use super::RelaySession;

/// Live counters for one proxy, shared by its loop and session tasks.
#[derive(Debug, Default)]
pub struct ProxyStats {
    sessions_created: AtomicU64,
    sessions_closed: AtomicU64,
    sessions_evicted: AtomicU64,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
    datagrams_up: AtomicU64,
    datagrams_down: AtomicU64,
    dial_failures: AtomicU64,
    send_failures: AtomicU64,
}

/// Point-in-time copy of [`ProxyStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub sessions_created: u64,
    pub sessions_active: u64,
    pub sessions_closed: u64,
    pub sessions_evicted: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub datagrams_up: u64,
    pub datagrams_down: u64,
    pub dial_failures: u64,
    pub send_failures: u64,
}

impl ProxyStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_opened(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Fold a finished session's counters into the proxy totals.
    pub fn session_closed(&self, session: &RelaySession) {
        self.sessions_closed.fetch_add(1, Ordering::Relaxed);
        self.bytes_up.fetch_add(session.bytes_up(), Ordering::Relaxed);
        self.bytes_down.fetch_add(session.bytes_down(), Ordering::Relaxed);
        self.datagrams_up
            .fetch_add(session.datagrams_up(), Ordering::Relaxed);
        self.datagrams_down
            .fetch_add(session.datagrams_down(), Ordering::Relaxed);
    }

    pub fn session_evicted(&self) {
        self.sessions_evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dial_failed(&self) {
        self.dial_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn send_failed(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Sessions opened and not yet closed.
    pub fn active_sessions(&self) -> u64 {
        let created = self.sessions_created.load(Ordering::Relaxed);
        let closed = self.sessions_closed.load(Ordering::Relaxed);
        created.saturating_sub(closed)
    }

    /// Byte and datagram totals only cover closed sessions.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_active: self.active_sessions(),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            sessions_evicted: self.sessions_evicted.load(Ordering::Relaxed),
            bytes_up: self.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.bytes_down.load(Ordering::Relaxed),
            datagrams_up: self.datagrams_up.load(Ordering::Relaxed),
            datagrams_down: self.datagrams_down.load(Ordering::Relaxed),
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
        }
    }
}
