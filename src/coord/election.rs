//! Owner election over the coordination store.
//!
//! The owner key is held under the campaigner's session lease, so the store
//! serializes ownership cluster-wide: at any instant at most one capture
//! holds the key, and a vanished session vacates it without cooperation.

use crate::core::error::{SluiceError, SluiceResult};
use crate::coord::store::{CoordStore, LeaseId};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Campaign/resign handle bound to one session lease.
///
/// Rebuilt at every capture reset together with its session.
pub struct Election {
    store: Arc<CoordStore>,
    lease_id: LeaseId,
    owner_key: String,
    /// Prefix of the per-owner revision keys:
    /// `<prefix>/<capture_id>/revision`.
    revision_key_prefix: String,
}

impl Election {
    /// Create an election handle over the given keys.
    pub fn new(
        store: Arc<CoordStore>,
        lease_id: LeaseId,
        owner_key: String,
        revision_key_prefix: String,
    ) -> Self {
        Self {
            store,
            lease_id,
            owner_key,
            revision_key_prefix,
        }
    }

    fn revision_key(&self, capture_id: &str) -> String {
        format!("{}/{}/revision", self.revision_key_prefix, capture_id)
    }

    /// Block until this session holds the owner key.
    ///
    /// Failure classes:
    /// - a compaction past the revision observed while waiting returns
    ///   [`SluiceError::Compacted`]; callers retry after a brief backoff;
    /// - cancellation returns [`SluiceError::Canceled`] with no ownership
    ///   side effects;
    /// - a dead session lease returns [`SluiceError::LeaseExpired`], which
    ///   the campaign loop escalates to suicide.
    pub async fn campaign(
        &self,
        capture_id: &str,
        cancel: &CancellationToken,
    ) -> SluiceResult<()> {
        let mut changes = self.store.watch();
        // The campaign waits at the revision observed on entry, like an
        // election waiting on the proclamations ahead of it; compacting
        // past that revision invalidates the wait.
        let observed_revision = self.store.current_revision();
        loop {
            if cancel.is_cancelled() {
                return Err(SluiceError::Canceled);
            }

            // Already the holder (a retried campaign after a partial
            // failure): make sure the revision key exists and return.
            if let Some(holder) = self.store.get(&self.owner_key) {
                if holder.lease == Some(self.lease_id) {
                    self.store.put(
                        &self.revision_key(capture_id),
                        holder.mod_revision.to_string().into_bytes(),
                        Some(self.lease_id),
                    )?;
                    return Ok(());
                }
            }

            if let Some(revision) = self.store.put_if_absent(
                &self.owner_key,
                capture_id.as_bytes().to_vec(),
                Some(self.lease_id),
            )? {
                // Expose the acquisition revision so downstream consumers
                // can fence writes from a stale owner.
                self.store.put(
                    &self.revision_key(capture_id),
                    revision.to_string().into_bytes(),
                    Some(self.lease_id),
                )?;
                return Ok(());
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(SluiceError::Canceled),
                _ = changes.changed() => {
                    let floor = self.store.compaction_floor();
                    if floor > observed_revision {
                        return Err(SluiceError::Compacted {
                            revision: observed_revision,
                            floor,
                        });
                    }
                }
            }
        }
    }

    /// Vacate the owner key if this session holds it.
    ///
    /// A no-op when not the holder, so a late resign after lease expiry is
    /// harmless.
    pub async fn resign(&self) -> SluiceResult<()> {
        let held = self.store.delete_if_lease(&self.owner_key, self.lease_id);
        if held {
            tracing::debug!(owner_key = %self.owner_key, "resigned ownership");
        }
        Ok(())
    }
}
