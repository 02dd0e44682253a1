//! Upstream database handle management.
//!
//! One manager owns the client handles toward the upstream cluster for the
//! lifetime of a capture incarnation. It is re-instantiated at every reset,
//! so a restarted capture never reuses connections from a failed run.

use std::sync::atomic::{AtomicBool, Ordering};

/// Handles toward the upstream cluster.
#[derive(Debug)]
pub struct UpstreamManager {
    endpoints: Vec<String>,
    closed: AtomicBool,
}

impl UpstreamManager {
    /// Create a manager for the given endpoints.
    pub fn new(endpoints: Vec<String>) -> Self {
        Self {
            endpoints,
            closed: AtomicBool::new(false),
        }
    }

    /// The configured upstream endpoints.
    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Release the upstream handles. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!(endpoints = ?self.endpoints, "upstream manager closed");
        }
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
