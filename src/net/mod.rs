//! Peer messaging transport between captures.

pub mod codec;
pub mod router;
pub mod server;

pub use codec::PeerMessage;
pub use router::MessageRouter;
pub use server::{MessageServer, ServiceWrapper};
