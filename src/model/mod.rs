//! Core identifiers shared across the capture runtime.
//!
//! A *capture* is one worker process in the CDC cluster; a *changefeed* is a
//! replication pipeline identified by `(namespace, id)`. Timestamps (`Ts`)
//! are upstream commit timestamps and are totally ordered.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};

/// Upstream commit timestamp.
pub type Ts = u64;

/// Unique identifier of a capture process, regenerated at every reset.
pub type CaptureId = String;

/// The namespace elided from storage key paths and file matchers.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Build tag reported by this capture.
pub const RELEASE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Identity of one worker process, registered in the coordination store
/// for the duration of its session lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureInfo {
    /// Globally unique id, generated at each reset.
    pub id: CaptureId,

    /// Network endpoint peers connect to.
    pub advertise_addr: String,

    /// Build tag.
    pub version: String,
}

/// Identifier of a changefeed: `(namespace, id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangefeedId {
    pub namespace: String,
    pub id: String,
}

impl ChangefeedId {
    /// Create a changefeed id in an explicit namespace.
    pub fn new(namespace: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            id: id.into(),
        }
    }

    /// Create a changefeed id in the default namespace.
    pub fn in_default_namespace(id: impl Into<String>) -> Self {
        Self::new(DEFAULT_NAMESPACE, id)
    }

    /// Whether this changefeed lives in the default namespace.
    pub fn is_default_namespace(&self) -> bool {
        self.namespace == DEFAULT_NAMESPACE
    }

    /// Key-path form: the default namespace is elided.
    pub fn key_path(&self) -> String {
        if self.is_default_namespace() {
            self.id.clone()
        } else {
            format!("{}/{}", self.namespace, self.id)
        }
    }
}

impl std::fmt::Display for ChangefeedId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.id)
    }
}

/// Liveness of a capture process.
///
/// The transition is one-way for the lifetime of the process: once a capture
/// is `Stopping` it never goes back to `Alive`, and it must not campaign for
/// ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Stopping,
}

/// Atomically shared [`Liveness`] flag.
///
/// Shared between the run loop, the campaign loop, and the drain path, so it
/// lives behind an atomic rather than the capture lock.
#[derive(Debug)]
pub struct AtomicLiveness(AtomicU8);

const LIVENESS_ALIVE: u8 = 0;
const LIVENESS_STOPPING: u8 = 1;

impl AtomicLiveness {
    /// A fresh flag in the `Alive` state.
    pub fn new() -> Self {
        Self(AtomicU8::new(LIVENESS_ALIVE))
    }

    /// Read the current liveness.
    pub fn load(&self) -> Liveness {
        match self.0.load(Ordering::SeqCst) {
            LIVENESS_ALIVE => Liveness::Alive,
            _ => Liveness::Stopping,
        }
    }

    /// Transition to `Stopping`. One-way: there is no way back to `Alive`.
    pub fn store_stopping(&self) {
        self.0.store(LIVENESS_STOPPING, Ordering::SeqCst);
    }

    /// Shorthand for `load() == Liveness::Stopping`.
    pub fn is_stopping(&self) -> bool {
        self.load() == Liveness::Stopping
    }
}

impl Default for AtomicLiveness {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn changefeed_key_path_elides_default_namespace() {
        let default_ns = ChangefeedId::in_default_namespace("feed-1");
        assert_eq!(default_ns.key_path(), "feed-1");

        let named = ChangefeedId::new("team-a", "feed-1");
        assert_eq!(named.key_path(), "team-a/feed-1");
    }

    #[test]
    fn liveness_transition_is_one_way() {
        let liveness = AtomicLiveness::new();
        assert_eq!(liveness.load(), Liveness::Alive);

        liveness.store_stopping();
        assert_eq!(liveness.load(), Liveness::Stopping);
        assert!(liveness.is_stopping());
    }
}
