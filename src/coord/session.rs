//! Coordination session bound to a lease.
//!
//! A session grants a lease and keeps it alive from a background task.
//! Everything registered under the lease (capture info, ownership) exists
//! exactly as long as the session does: when keepalives stop reaching the
//! store, the lease expires and the registrations vanish atomically.

use crate::core::error::{SluiceError, SluiceResult};
use crate::coord::store::{CoordStore, LeaseId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// A live lease plus its keepalive task.
///
/// `done()` fires when a keepalive observes the lease gone. That signal can
/// lag real expiry by up to one keepalive interval, so callers that must
/// not trust a silent channel probe [`Session::time_to_live`] as well.
pub struct Session {
    store: Arc<CoordStore>,
    lease_id: LeaseId,
    done_rx: watch::Receiver<bool>,
    keepalive_task: JoinHandle<()>,
}

impl Session {
    /// Grant a lease with the given TTL and start keeping it alive.
    pub async fn new(store: Arc<CoordStore>, ttl: Duration) -> SluiceResult<Self> {
        if ttl.is_zero() {
            return Err(SluiceError::coord_api("session ttl must be nonzero"));
        }
        let lease_id = store.grant_lease(ttl);
        let (done_tx, done_rx) = watch::channel(false);

        let keepalive_store = Arc::clone(&store);
        let keepalive_task = tokio::spawn(async move {
            // Refresh at a third of the TTL, the customary margin for
            // surviving one missed beat.
            let mut ticker = tokio::time::interval(ttl / 3);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if keepalive_store.keepalive(lease_id).is_err() {
                    tracing::warn!(lease_id, "session lease is gone, marking session done");
                    let _ = done_tx.send(true);
                    return;
                }
            }
        });

        Ok(Self {
            store,
            lease_id,
            done_rx,
            keepalive_task,
        })
    }

    /// The lease backing this session.
    pub fn lease_id(&self) -> LeaseId {
        self.lease_id
    }

    /// A receiver that flips to `true` when the session is done.
    pub fn done(&self) -> watch::Receiver<bool> {
        self.done_rx.clone()
    }

    /// Remaining lease TTL straight from the store; `None` when the lease
    /// is gone even if `done()` has not fired yet.
    pub fn time_to_live(&self) -> Option<Duration> {
        self.store.time_to_live(self.lease_id)
    }

    /// Stop the keepalive task and revoke the lease.
    ///
    /// Revocation failure is ignored: a lease that is already gone is the
    /// outcome we wanted.
    pub fn close(&self) {
        self.keepalive_task.abort();
        let _ = self.store.revoke_lease(self.lease_id);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.keepalive_task.abort();
    }
}
