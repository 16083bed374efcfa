//! UDP connection tracking.
//!
//! Maps each client address to the session that owns its backend-facing
//! socket. The receive loop inserts and touches entries, session readers
//! expire them, and `close` drains the table. Every operation takes the
//! lock once and never awaits while holding it.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use crate::proxy::lifecycle::lock;

/// Default idle time after which a UDP session is evicted.
pub const DEFAULT_UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

struct Tracked<S> {
    session: Arc<S>,
    last_activity: Instant,
}

/// Outcome of an idle check on a tracked session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleCheck {
    /// The session was idle for the whole window and has been removed.
    Evicted,
    /// The session saw activity; check again at `deadline`.
    Active { deadline: Instant },
    /// The entry no longer belongs to this session.
    Gone,
}

pub struct ConnTrackTable<S> {
    entries: Mutex<HashMap<SocketAddr, Tracked<S>>>,
    idle_timeout: Duration,
}

impl<S> ConnTrackTable<S> {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            idle_timeout,
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Look up the session for `client` and mark it active.
    pub fn touch(&self, client: &SocketAddr) -> Option<Arc<S>> {
        let mut entries = lock(&self.entries);
        entries.get_mut(client).map(|tracked| {
            tracked.last_activity = Instant::now();
            Arc::clone(&tracked.session)
        })
    }

    /// Mark the session for `client` active if it is still `session`.
    pub fn refresh(&self, client: &SocketAddr, session: &Arc<S>) {
        let mut entries = lock(&self.entries);
        if let Some(tracked) = entries.get_mut(client) {
            if Arc::ptr_eq(&tracked.session, session) {
                tracked.last_activity = Instant::now();
            }
        }
    }

    /// Insert `session` unless `client` already has one. Returns the
    /// resident session and whether it is the one just inserted.
    pub fn insert_if_absent(&self, client: SocketAddr, session: Arc<S>) -> (Arc<S>, bool) {
        let mut entries = lock(&self.entries);
        match entries.entry(client) {
            Entry::Occupied(mut occupied) => {
                let tracked = occupied.get_mut();
                tracked.last_activity = Instant::now();
                (Arc::clone(&tracked.session), false)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Tracked {
                    session: Arc::clone(&session),
                    last_activity: Instant::now(),
                });
                (session, true)
            }
        }
    }

    /// Evict `session` if it has been idle for the full timeout as of
    /// `now`, otherwise report when it would next expire.
    pub fn check_idle(&self, client: &SocketAddr, session: &Arc<S>, now: Instant) -> IdleCheck {
        let mut entries = lock(&self.entries);
        let deadline = match entries.get(client) {
            Some(tracked) if Arc::ptr_eq(&tracked.session, session) => {
                tracked.last_activity + self.idle_timeout
            }
            _ => return IdleCheck::Gone,
        };

        if now >= deadline {
            entries.remove(client);
            IdleCheck::Evicted
        } else {
            IdleCheck::Active { deadline }
        }
    }

    /// Remove the entry for `client` if it still holds `session`.
    pub fn remove(&self, client: &SocketAddr, session: &Arc<S>) -> bool {
        let mut entries = lock(&self.entries);
        match entries.get(client) {
            Some(tracked) if Arc::ptr_eq(&tracked.session, session) => {
                entries.remove(client);
                true
            }
            _ => false,
        }
    }

    /// Remove every entry.
    pub fn drain(&self) -> Vec<(SocketAddr, Arc<S>)> {
        lock(&self.entries)
            .drain()
            .map(|(client, tracked)| (client, tracked.session))
            .collect()
    }

    pub fn contains(&self, client: &SocketAddr) -> bool {
        lock(&self.entries).contains_key(client)
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    pub fn clients(&self) -> Vec<SocketAddr> {
        lock(&self.entries).keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_one_session_per_client() {
        let table = ConnTrackTable::new(Duration::from_secs(90));

        let (first, inserted) = table.insert_if_absent(addr(1000), Arc::new("first"));
        assert!(inserted);
        let (resident, inserted) = table.insert_if_absent(addr(1000), Arc::new("second"));
        assert!(!inserted);
        assert!(Arc::ptr_eq(&first, &resident));

        table.insert_if_absent(addr(1001), Arc::new("other"));
        assert_eq!(table.len(), 2);

        let touched = table.touch(&addr(1000)).unwrap();
        assert_eq!(*touched, "first");
        assert!(table.touch(&addr(2000)).is_none());
    }

    #[test]
    fn test_check_idle_keeps_active_sessions() {
        let table = ConnTrackTable::new(Duration::from_secs(90));
        let (session, _) = table.insert_if_absent(addr(1000), Arc::new(()));

        match table.check_idle(&addr(1000), &session, Instant::now()) {
            IdleCheck::Active { deadline } => assert!(deadline > Instant::now()),
            other => panic!("expected active session, got {:?}", other),
        }
        assert!(table.contains(&addr(1000)));
    }

    #[test]
    fn test_check_idle_evicts_expired_sessions() {
        let table = ConnTrackTable::new(Duration::from_secs(90));
        let (session, _) = table.insert_if_absent(addr(1000), Arc::new(()));

        let later = Instant::now() + Duration::from_secs(91);
        assert_eq!(table.check_idle(&addr(1000), &session, later), IdleCheck::Evicted);
        assert!(table.is_empty());
        assert_eq!(table.check_idle(&addr(1000), &session, later), IdleCheck::Gone);
    }

    #[test]
    fn test_touch_pushes_deadline_forward() {
        let table = ConnTrackTable::new(Duration::from_millis(200));
        let (session, _) = table.insert_if_absent(addr(1000), Arc::new(()));

        let first = match table.check_idle(&addr(1000), &session, Instant::now()) {
            IdleCheck::Active { deadline } => deadline,
            other => panic!("unexpected {:?}", other),
        };

        std::thread::sleep(Duration::from_millis(20));
        table.touch(&addr(1000));

        match table.check_idle(&addr(1000), &session, first) {
            IdleCheck::Active { deadline } => assert!(deadline > first),
            other => panic!("touched session must survive its old deadline, got {:?}", other),
        }
    }

    #[test]
    fn test_stale_session_cannot_remove_replacement() {
        let table = ConnTrackTable::new(Duration::from_secs(90));
        let (old, _) = table.insert_if_absent(addr(1000), Arc::new(1));
        assert!(table.remove(&addr(1000), &old));

        let (new, inserted) = table.insert_if_absent(addr(1000), Arc::new(2));
        assert!(inserted);

        assert!(!table.remove(&addr(1000), &old));
        let far = Instant::now() + Duration::from_secs(3600);
        assert_eq!(table.check_idle(&addr(1000), &old, far), IdleCheck::Gone);
        assert!(Arc::ptr_eq(&table.touch(&addr(1000)).unwrap(), &new));
    }

    #[test]
    fn test_drain_empties_table() {
        let table = ConnTrackTable::new(Duration::from_secs(90));
        for port in 1000..1005 {
            table.insert_if_absent(addr(port), Arc::new(port));
        }

        let mut clients = table.clients();
        clients.sort();
        assert_eq!(clients.len(), 5);

        let drained = table.drain();
        assert_eq!(drained.len(), 5);
        assert!(table.is_empty());
    }
}
