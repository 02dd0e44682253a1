//! Sluice - distributed change-data-capture worker runtime.
//!
//! A sluice cluster ingests row-level change events from an upstream
//! transactional database and replicates them to a downstream sink. Each
//! worker process is a *capture*: it registers itself in a coordination
//! store, competes for the single cluster-wide *owner* lease, and runs
//! reactor loops that converge cluster state. The elected owner
//! additionally tracks each changefeed's durable recovery barrier (the
//! `(checkpoint_ts, resolved_ts)` pair) on external storage and reclaims
//! redo log files that fell behind the checkpoint.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Capture runtime                           │
//! │   restart loop │ reset/register │ drain │ async close           │
//! └─────────────────────────────────────────────────────────────────┘
//!          │                  │                     │
//! ┌──────────────────┐ ┌──────────────────┐ ┌──────────────────────┐
//! │  Owner campaign  │ │ Processor reactor│ │   Message server     │
//! │  (≤ 1 try / s)   │ │ (task positions) │ │  (peer transport)    │
//! └──────────────────┘ └──────────────────┘ └──────────────────────┘
//!          │
//! ┌──────────────────────────────────────────────┐
//! │ Owner: watermark aggregation + redo meta     │
//! │   bg flush (uuid-named meta files)           │
//! │   bg GC (logs behind the checkpoint)         │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! - [`core::config`] - Configuration parsing and validation
//! - [`core::error`] - Error taxonomy and restart classification
//! - [`core::limiter`] - Token-bucket rate limiting
//! - [`model`] - Capture/changefeed identifiers and liveness
//! - [`coord::store`] - Embedded revisioned store with TTL leases
//! - [`coord::session`] - Session lease with background keepalive
//! - [`coord::election`] - Owner campaign and resignation
//! - [`coord::reactor`] - Reactor trait and the cluster tick loop
//! - [`capture`] - The capture process runtime
//! - [`owner`] / [`processor`] - Owner and processor-manager components
//! - [`redo`] - Durable watermarks, meta files, log GC
//! - [`storage::external`] - External-storage abstraction
//! - [`net`] - Peer messaging transport
//!
//! # Key Invariants
//!
//! - Flushed watermarks are monotone and `checkpoint_ts ≤ resolved_ts`
//! - At most one capture holds the owner key at any store observation
//! - `set_flushed` runs only after the meta write is durable
//! - Restart ≤ 1 per 20 s (burst 2); campaign ≤ 1 per second

// Core infrastructure
pub mod core;

// Identifiers and liveness
pub mod model;

// Coordination store, sessions, election, reactor loop
pub mod coord;

// Capture runtime and its collaborators
pub mod capture;
pub mod owner;
pub mod processor;
pub mod upstream;

// Redo subsystem
pub mod redo;

// Storage backends
pub mod storage;

// Peer messaging
pub mod net;

// CLI
pub mod cli;

// Re-exports for convenience
pub use self::core::config::Config;
pub use self::core::error::{SluiceError, SluiceResult};
pub use capture::Capture;
pub use coord::{ClusterState, CoordClient, CoordStore, CoordWorker, Election, Reactor, Session};
pub use model::{CaptureInfo, ChangefeedId, Liveness};
pub use redo::{LogMeta, MetaManager, StatefulTs};
