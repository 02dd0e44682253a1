//! Embedded coordination store.
//!
//! A revisioned key space with TTL leases, in the manner of an etcd v3
//! keyspace: every mutation bumps a global revision, keys record their
//! create/mod revisions, and keys attached to a lease vanish atomically
//! when the lease expires or is revoked. A compaction floor supports the
//! compacted-revision failure mode campaigns must survive.
//!
//! Lease expiry is enforced lazily: every access first purges leases whose
//! deadline passed, so no background sweeper is needed and expiry is
//! deterministic under paused test clocks.

use crate::core::error::{SluiceError, SluiceResult};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Identifier of a lease.
pub type LeaseId = i64;

/// A key record with its revision history.
#[derive(Debug, Clone)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub create_revision: u64,
    pub mod_revision: u64,
    pub lease: Option<LeaseId>,
}

#[derive(Debug)]
struct LeaseRecord {
    ttl: Duration,
    deadline: Instant,
    keys: HashSet<String>,
}

#[derive(Debug, Default)]
struct StoreInner {
    revision: u64,
    compaction_floor: u64,
    keys: BTreeMap<String, KeyValue>,
    leases: HashMap<LeaseId, LeaseRecord>,
    next_lease_id: LeaseId,
}

impl StoreInner {
    /// Drop expired leases and their attached keys. Returns whether any
    /// state changed.
    fn purge_expired(&mut self, now: Instant) -> bool {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| now >= lease.deadline)
            .map(|(id, _)| *id)
            .collect();
        if expired.is_empty() {
            return false;
        }
        for lease_id in expired {
            if let Some(lease) = self.leases.remove(&lease_id) {
                self.revision += 1;
                for key in lease.keys {
                    self.keys.remove(&key);
                }
            }
        }
        true
    }
}

/// Shared in-process coordination store.
#[derive(Debug)]
pub struct CoordStore {
    inner: Mutex<StoreInner>,
    /// Version channel bumped on every mutation. Waiters subscribe before
    /// checking their condition, so no wakeup is ever lost.
    changed: watch::Sender<u64>,
}

impl Default for CoordStore {
    fn default() -> Self {
        Self {
            inner: Mutex::new(StoreInner::default()),
            changed: watch::channel(0).0,
        }
    }
}

impl CoordStore {
    /// Create an empty store.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn with_inner<T>(&self, f: impl FnOnce(&mut StoreInner) -> (T, bool)) -> T {
        let (result, notify) = {
            let mut inner = self.inner.lock();
            let purged = inner.purge_expired(Instant::now());
            let (result, changed) = f(&mut inner);
            (result, purged || changed)
        };
        if notify {
            self.changed.send_modify(|version| *version += 1);
        }
        result
    }

    /// Grant a lease with the given TTL.
    pub fn grant_lease(&self, ttl: Duration) -> LeaseId {
        self.with_inner(|inner| {
            inner.next_lease_id += 1;
            let lease_id = inner.next_lease_id;
            inner.leases.insert(
                lease_id,
                LeaseRecord {
                    ttl,
                    deadline: Instant::now() + ttl,
                    keys: HashSet::new(),
                },
            );
            (lease_id, false)
        })
    }

    /// Extend a lease's deadline by its TTL.
    pub fn keepalive(&self, lease_id: LeaseId) -> SluiceResult<()> {
        self.with_inner(|inner| {
            let result = match inner.leases.get_mut(&lease_id) {
                Some(lease) => {
                    lease.deadline = Instant::now() + lease.ttl;
                    Ok(())
                }
                None => Err(SluiceError::LeaseExpired { lease_id }),
            };
            (result, false)
        })
    }

    /// Revoke a lease, removing every key attached to it.
    pub fn revoke_lease(&self, lease_id: LeaseId) -> SluiceResult<()> {
        self.with_inner(|inner| match inner.leases.remove(&lease_id) {
            Some(lease) => {
                inner.revision += 1;
                for key in lease.keys {
                    inner.keys.remove(&key);
                }
                (Ok(()), true)
            }
            None => (Err(SluiceError::LeaseExpired { lease_id }), false),
        })
    }

    /// Remaining TTL of a lease; `None` when the lease is gone.
    pub fn time_to_live(&self, lease_id: LeaseId) -> Option<Duration> {
        self.with_inner(|inner| {
            let ttl = inner
                .leases
                .get(&lease_id)
                .map(|lease| lease.deadline.saturating_duration_since(Instant::now()));
            (ttl, false)
        })
    }

    /// Put a key, optionally attached to a lease. Returns the mod revision.
    pub fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> SluiceResult<u64> {
        self.with_inner(|inner| {
            if let Some(lease_id) = lease {
                match inner.leases.get_mut(&lease_id) {
                    Some(record) => {
                        record.keys.insert(key.to_string());
                    }
                    None => return (Err(SluiceError::LeaseExpired { lease_id }), false),
                }
            }
            inner.revision += 1;
            let revision = inner.revision;
            let create_revision = inner
                .keys
                .get(key)
                .map(|kv| kv.create_revision)
                .unwrap_or(revision);
            inner.keys.insert(
                key.to_string(),
                KeyValue {
                    key: key.to_string(),
                    value,
                    create_revision,
                    mod_revision: revision,
                    lease,
                },
            );
            (Ok(revision), true)
        })
    }

    /// Put a key only when it is absent. Returns the mod revision on
    /// success, `None` when another key holder exists.
    pub fn put_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> SluiceResult<Option<u64>> {
        self.with_inner(|inner| {
            if inner.keys.contains_key(key) {
                return (Ok(None), false);
            }
            if let Some(lease_id) = lease {
                match inner.leases.get_mut(&lease_id) {
                    Some(record) => {
                        record.keys.insert(key.to_string());
                    }
                    None => return (Err(SluiceError::LeaseExpired { lease_id }), false),
                }
            }
            inner.revision += 1;
            let revision = inner.revision;
            inner.keys.insert(
                key.to_string(),
                KeyValue {
                    key: key.to_string(),
                    value,
                    create_revision: revision,
                    mod_revision: revision,
                    lease,
                },
            );
            (Ok(Some(revision)), true)
        })
    }

    /// Delete a key. Returns whether it existed.
    pub fn delete(&self, key: &str) -> bool {
        self.with_inner(|inner| match inner.keys.remove(key) {
            Some(kv) => {
                inner.revision += 1;
                if let Some(lease_id) = kv.lease {
                    if let Some(lease) = inner.leases.get_mut(&lease_id) {
                        lease.keys.remove(key);
                    }
                }
                (true, true)
            }
            None => (false, false),
        })
    }

    /// Delete a key only when it is attached to the given lease.
    pub fn delete_if_lease(&self, key: &str, lease_id: LeaseId) -> bool {
        self.with_inner(|inner| {
            let held = inner
                .keys
                .get(key)
                .map(|kv| kv.lease == Some(lease_id))
                .unwrap_or(false);
            if !held {
                return (false, false);
            }
            inner.keys.remove(key);
            inner.revision += 1;
            if let Some(lease) = inner.leases.get_mut(&lease_id) {
                lease.keys.remove(key);
            }
            (true, true)
        })
    }

    /// Read one key.
    pub fn get(&self, key: &str) -> Option<KeyValue> {
        self.with_inner(|inner| (inner.keys.get(key).cloned(), false))
    }

    /// Read every key under a prefix.
    pub fn get_prefix(&self, prefix: &str) -> Vec<KeyValue> {
        self.with_inner(|inner| {
            let kvs = inner
                .keys
                .range(prefix.to_string()..)
                .take_while(|(key, _)| key.starts_with(prefix))
                .map(|(_, kv)| kv.clone())
                .collect();
            (kvs, false)
        })
    }

    /// The current global revision.
    pub fn current_revision(&self) -> u64 {
        self.with_inner(|inner| (inner.revision, false))
    }

    /// Raise the compaction floor. Waiters parked below it fail with a
    /// compacted error on their next wakeup.
    pub fn compact(&self, revision: u64) {
        self.with_inner(|inner| {
            inner.compaction_floor = inner.compaction_floor.max(revision);
            ((), true)
        })
    }

    /// The current compaction floor.
    pub fn compaction_floor(&self) -> u64 {
        self.with_inner(|inner| (inner.compaction_floor, false))
    }

    /// Subscribe to mutation notifications.
    ///
    /// Subscribe first, then check the condition, then await `changed()`:
    /// a mutation racing the check is reported by the next await.
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.changed.subscribe()
    }
}
