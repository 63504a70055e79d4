//! Pending console sessions for one visitor.
//!
//! At most one entry per `(vmid, node)`. Entries are single-use: a successful
//! take removes them, and an expired entry is removed the moment anyone looks
//! at it. "Expired" and "never existed" are indistinguishable to callers.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

use vmportal_common::{ConsoleKey, ConsoleSession};

#[derive(Default)]
pub struct ConsoleRegistry {
    slots: Mutex<HashMap<ConsoleKey, ConsoleSession>>,
}

impl ConsoleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a session under its key, replacing any unconsumed entry.
    /// Returns true when an entry was replaced.
    pub fn put(&self, session: ConsoleSession) -> bool {
        let key = session.key();
        self.purge_expired(Utc::now());
        let replaced = self.slots.lock().insert(key.clone(), session).is_some();
        debug!(console = %key, replaced, "Console session stored");
        replaced
    }

    /// Atomically remove the entry for `key` and return it if `now <= expires_at`.
    pub fn take_if_valid(&self, key: &ConsoleKey, now: DateTime<Utc>) -> Option<ConsoleSession> {
        let taken = self.slots.lock().remove(key)?;
        if taken.is_valid_at(now) {
            debug!(console = %key, "Console session taken");
            Some(taken)
        } else {
            debug!(console = %key, "Console session expired before use");
            None
        }
    }

    /// Drop every expired entry. Returns how many were dropped.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|_, s| s.is_valid_at(now));
        before - slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use vmportal_common::{ConsoleGrant, NodeName, Secret, VmId};

    fn session(vmid: u32, node: &str, ticket: &str, now: DateTime<Utc>, ttl: i64) -> ConsoleSession {
        ConsoleSession::issue(
            ConsoleGrant {
                vmid: VmId::new(vmid).unwrap(),
                node: NodeName::new(node).unwrap(),
                proxmox_host: "pve.example.com:8006".into(),
                proxmox_port: 5901,
                ticket: Secret::new(ticket),
                auth_cookie: Secret::new("PVE:root@pam:cookie"),
                csrf_token: None,
            },
            now,
            Duration::seconds(ttl),
        )
        .unwrap()
    }

    #[test]
    fn test_take_is_single_use() {
        let registry = ConsoleRegistry::new();
        let now = Utc::now();
        let s = session(100, "pve1", "PVEVNC:one", now, 30);
        let key = s.key();
        registry.put(s.clone());

        assert_eq!(registry.take_if_valid(&key, now), Some(s));
        assert_eq!(registry.take_if_valid(&key, now), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_expired_entry_is_not_found_and_discarded() {
        let registry = ConsoleRegistry::new();
        let now = Utc::now();
        let s = session(100, "pve1", "PVEVNC:one", now, 5);
        let key = s.key();
        registry.put(s);

        assert_eq!(registry.take_if_valid(&key, now + Duration::seconds(6)), None);
        assert!(registry.is_empty());
        // Still nothing after the discard, even with a valid clock.
        assert_eq!(registry.take_if_valid(&key, now), None);
    }

    #[test]
    fn test_boundary_is_inclusive() {
        let registry = ConsoleRegistry::new();
        let now = Utc::now();
        let s = session(100, "pve1", "PVEVNC:one", now, 5);
        let key = s.key();
        registry.put(s);
        assert!(registry.take_if_valid(&key, now + Duration::seconds(5)).is_some());
    }

    #[test]
    fn test_put_overwrites_same_key() {
        let registry = ConsoleRegistry::new();
        let now = Utc::now();
        let first = session(100, "pve1", "PVEVNC:first", now, 30);
        let second = session(100, "pve1", "PVEVNC:second", now, 30);
        let key = first.key();

        assert!(!registry.put(first));
        assert!(registry.put(second));
        assert_eq!(registry.len(), 1);
        let taken = registry.take_if_valid(&key, now).unwrap();
        assert_eq!(taken.ticket.expose(), "PVEVNC:second");
    }

    #[test]
    fn test_keys_are_independent() {
        let registry = ConsoleRegistry::new();
        let now = Utc::now();
        let a = session(100, "pve1", "PVEVNC:a", now, 30);
        let b = session(100, "pve2", "PVEVNC:b", now, 30);
        let c = session(101, "pve1", "PVEVNC:c", now, 30);
        let (ka, kb, kc) = (a.key(), b.key(), c.key());
        registry.put(a);
        registry.put(b);
        registry.put(c);

        assert_eq!(registry.take_if_valid(&kb, now).unwrap().ticket.expose(), "PVEVNC:b");
        assert!(registry.take_if_valid(&ka, now).is_some());
        assert!(registry.take_if_valid(&kc, now).is_some());
    }

    #[test]
    fn test_purge_expired() {
        let registry = ConsoleRegistry::new();
        let now = Utc::now();
        registry.put(session(100, "pve1", "PVEVNC:a", now - Duration::seconds(60), 5));
        registry.put(session(101, "pve1", "PVEVNC:b", now, 30));
        // The first entry was already dropped by the second put.
        assert_eq!(registry.len(), 1);

        let registry = ConsoleRegistry::new();
        registry.put(session(100, "pve1", "PVEVNC:a", now, 5));
        assert_eq!(registry.purge_expired(now + Duration::seconds(10)), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_concurrent_take_succeeds_once() {
        for _ in 0..50 {
            let registry = Arc::new(ConsoleRegistry::new());
            let now = Utc::now();
            let s = session(100, "pve1", "PVEVNC:race", now, 30);
            let key = s.key();
            registry.put(s);

            let wins = Arc::new(AtomicUsize::new(0));
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let registry = registry.clone();
                    let key = key.clone();
                    let wins = wins.clone();
                    std::thread::spawn(move || {
                        if registry.take_if_valid(&key, now).is_some() {
                            wins.fetch_add(1, Ordering::SeqCst);
                        }
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }
            assert_eq!(wins.load(Ordering::SeqCst), 1);
        }
    }
}
