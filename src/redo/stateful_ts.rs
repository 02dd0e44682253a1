//! Flushed/unflushed timestamp pair.
//!
//! Producers advance `unflushed` at wire speed; the flush loop raises
//! `flushed` only after the value is durable on external storage. Readers
//! that need a strictly durable view (downstream-sink eligibility, GC) look
//! at `flushed` only. Invariant: `flushed ≤ unflushed`.

use crate::model::Ts;
use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonic timestamp with separate unflushed and flushed views.
#[derive(Debug, Default)]
pub struct StatefulTs {
    unflushed: AtomicU64,
    flushed: AtomicU64,
}

impl StatefulTs {
    /// Both views at zero, meaning "not initialized yet".
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the unflushed view.
    ///
    /// Returns `false` and changes nothing when `ts` would regress the
    /// current value.
    pub fn check_and_set_unflushed(&self, ts: Ts) -> bool {
        self.unflushed
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                if ts < current {
                    None
                } else {
                    Some(ts)
                }
            })
            .is_ok()
    }

    /// The latest value accepted by [`Self::check_and_set_unflushed`].
    pub fn unflushed(&self) -> Ts {
        self.unflushed.load(Ordering::SeqCst)
    }

    /// Publish a durably persisted value. Never lowers `flushed`.
    ///
    /// Only the flush loop calls this, after the write to external storage
    /// has succeeded.
    pub fn set_flushed(&self, ts: Ts) {
        let _ = self
            .flushed
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                if ts < current {
                    None
                } else {
                    Some(ts)
                }
            });
    }

    /// The latest durably persisted value.
    pub fn flushed(&self) -> Ts {
        self.flushed.load(Ordering::SeqCst)
    }
}
