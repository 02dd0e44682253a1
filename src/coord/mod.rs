//! Coordination layer: embedded store, sessions, election, reactor loop.

pub mod client;
pub mod election;
pub mod reactor;
pub mod session;
pub mod store;

pub use client::CoordClient;
pub use election::Election;
pub use reactor::{ClusterState, CoordWorker, Reactor};
pub use session::Session;
pub use store::CoordStore;
