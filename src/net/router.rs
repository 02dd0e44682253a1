//! Peer message router.
//!
//! Tracks the advertise address of every peer capture and lazily opens one
//! connection per peer. Membership is driven by the reactor's capture
//! added/removed hooks.

use crate::core::error::{SluiceError, SluiceResult};
use crate::model::CaptureId;
use crate::net::codec::{encode_frame, PeerMessage};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

struct Peer {
    addr: String,
    stream: tokio::sync::Mutex<Option<TcpStream>>,
}

/// Client side of the peer mesh for one capture incarnation.
pub struct MessageRouter {
    local_id: CaptureId,
    peers: RwLock<HashMap<CaptureId, Arc<Peer>>>,
}

impl MessageRouter {
    /// Create a router sending on behalf of `local_id`.
    pub fn new(local_id: CaptureId) -> Self {
        Self {
            local_id,
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Track a peer. Replaces the address (and drops the connection) if the
    /// peer re-registered somewhere else.
    pub fn add_peer(&self, capture_id: &CaptureId, addr: &str) {
        if capture_id == &self.local_id {
            return;
        }
        let mut peers = self.peers.write();
        let stale = peers
            .get(capture_id)
            .map(|peer| peer.addr != addr)
            .unwrap_or(true);
        if stale {
            tracing::info!(peer = %capture_id, addr = %addr, "peer added");
            peers.insert(
                capture_id.clone(),
                Arc::new(Peer {
                    addr: addr.to_string(),
                    stream: tokio::sync::Mutex::new(None),
                }),
            );
        }
    }

    /// Forget a peer and drop its connection.
    pub fn remove_peer(&self, capture_id: &CaptureId) {
        if self.peers.write().remove(capture_id).is_some() {
            tracing::info!(peer = %capture_id, "peer removed");
        }
    }

    /// Number of tracked peers.
    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    /// Send one message to a peer, connecting on first use.
    pub async fn send_to(
        &self,
        capture_id: &CaptureId,
        topic: impl Into<String>,
        payload: Vec<u8>,
    ) -> SluiceResult<()> {
        let peer = self
            .peers
            .read()
            .get(capture_id)
            .cloned()
            .ok_or_else(|| SluiceError::PeerMessaging {
                message: format!("unknown peer {capture_id}"),
            })?;

        let frame = encode_frame(&PeerMessage {
            from: self.local_id.clone(),
            topic: topic.into(),
            payload,
        })?;

        let mut stream = peer.stream.lock().await;
        if stream.is_none() {
            let connected =
                TcpStream::connect(&peer.addr)
                    .await
                    .map_err(|err| SluiceError::PeerMessaging {
                        message: format!("connect {}: {err}", peer.addr),
                    })?;
            *stream = Some(connected);
        }

        let result = stream
            .as_mut()
            .expect("connection established above")
            .write_all(&frame)
            .await;
        if let Err(err) = result {
            // Drop the broken connection; the next send reconnects.
            *stream = None;
            return Err(SluiceError::PeerMessaging {
                message: format!("send to {capture_id}: {err}"),
            });
        }
        Ok(())
    }

    /// Drop every peer and connection.
    pub fn close(&self) {
        self.peers.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn membership_is_tracked_and_self_is_ignored() {
        let router = MessageRouter::new("cap-1".into());
        router.add_peer(&"cap-1".into(), "127.0.0.1:1");
        assert_eq!(router.peer_count(), 0);

        router.add_peer(&"cap-2".into(), "127.0.0.1:2");
        router.add_peer(&"cap-2".into(), "127.0.0.1:2");
        assert_eq!(router.peer_count(), 1);

        router.remove_peer(&"cap-2".into());
        assert_eq!(router.peer_count(), 0);
    }

    #[tokio::test]
    async fn sending_to_an_unknown_peer_fails() {
        let router = MessageRouter::new("cap-1".into());
        let err = router
            .send_to(&"cap-9".into(), "dispatch", Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SluiceError::PeerMessaging { .. }));
    }

    #[tokio::test]
    async fn close_clears_all_peers() {
        let router = MessageRouter::new("cap-1".into());
        router.add_peer(&"cap-2".into(), "127.0.0.1:2");
        router.add_peer(&"cap-3".into(), "127.0.0.1:3");
        router.close();
        assert_eq!(router.peer_count(), 0);
    }
}
