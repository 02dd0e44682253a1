//! Peer message server.
//!
//! The TCP listener lives in a [`ServiceWrapper`] for the whole life of the
//! process, while the [`MessageServer`] bound to one capture incarnation is
//! swapped in and out of it across restarts. Frames arriving while no
//! server is installed are dropped.

use crate::core::error::{SluiceError, SluiceResult};
use crate::model::CaptureId;
use crate::net::codec::{decode_frame, PeerMessage};
use bytes::BytesMut;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Handler invoked for every message on a topic.
pub type TopicHandler = Box<dyn Fn(PeerMessage) + Send + Sync>;

const INCOMING_QUEUE_DEPTH: usize = 1024;

/// Receiver of messages from the other captures.
///
/// Recreated at every capture reset; the listener socket is not (see
/// [`ServiceWrapper`]).
pub struct MessageServer {
    capture_id: CaptureId,
    incoming_tx: mpsc::Sender<PeerMessage>,
    incoming_rx: tokio::sync::Mutex<mpsc::Receiver<PeerMessage>>,
    handlers: RwLock<HashMap<String, TopicHandler>>,
}

impl MessageServer {
    /// Create a server for one capture incarnation.
    pub fn new(capture_id: CaptureId) -> Arc<Self> {
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_QUEUE_DEPTH);
        Arc::new(Self {
            capture_id,
            incoming_tx,
            incoming_rx: tokio::sync::Mutex::new(incoming_rx),
            handlers: RwLock::new(HashMap::new()),
        })
    }

    /// The capture this server belongs to.
    pub fn capture_id(&self) -> &CaptureId {
        &self.capture_id
    }

    /// Register the handler for one topic, replacing any previous one.
    pub fn register_handler(&self, topic: impl Into<String>, handler: TopicHandler) {
        self.handlers.write().insert(topic.into(), handler);
    }

    /// Queue an incoming message for dispatch. Drops on backpressure.
    pub(crate) fn enqueue(&self, message: PeerMessage) {
        if let Err(err) = self.incoming_tx.try_send(message) {
            tracing::warn!(
                capture_id = %self.capture_id,
                error = %err,
                "incoming peer message dropped"
            );
        }
    }

    /// Dispatch queued messages until cancellation.
    pub async fn run(&self, cancel: CancellationToken) -> SluiceResult<()> {
        let mut incoming = self.incoming_rx.lock().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(SluiceError::Canceled),
                message = incoming.recv() => {
                    let Some(message) = message else {
                        return Ok(());
                    };
                    let handlers = self.handlers.read();
                    match handlers.get(&message.topic) {
                        Some(handler) => handler(message),
                        None => tracing::debug!(
                            topic = %message.topic,
                            from = %message.from,
                            "no handler for peer message topic"
                        ),
                    }
                }
            }
        }
    }
}

/// Process-lifetime holder of the listener socket.
///
/// The listener cannot be gracefully unregistered and re-bound per capture
/// incarnation, so it outlives restarts; only the [`MessageServer`] behind
/// it is swapped.
pub struct ServiceWrapper {
    local_addr: SocketAddr,
    current: Arc<RwLock<Option<Arc<MessageServer>>>>,
    shutdown: CancellationToken,
}

impl ServiceWrapper {
    /// Bind the listener and start accepting connections.
    pub async fn bind(addr: &str) -> SluiceResult<Arc<Self>> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|err| SluiceError::PeerMessaging {
                message: format!("failed to bind {addr}: {err}"),
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| SluiceError::PeerMessaging {
                message: err.to_string(),
            })?;

        let current: Arc<RwLock<Option<Arc<MessageServer>>>> = Arc::new(RwLock::new(None));
        let shutdown = CancellationToken::new();

        let accept_current = Arc::clone(&current);
        let accept_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_shutdown.cancelled() => return,
                    accepted = listener.accept() => {
                        let (stream, peer_addr) = match accepted {
                            Ok(pair) => pair,
                            Err(err) => {
                                tracing::warn!(error = %err, "accept failed");
                                continue;
                            }
                        };
                        let conn_current = Arc::clone(&accept_current);
                        let conn_shutdown = accept_shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(err) =
                                serve_connection(stream, conn_current, conn_shutdown).await
                            {
                                tracing::debug!(
                                    peer_addr = %peer_addr,
                                    error = %err,
                                    "peer connection closed"
                                );
                            }
                        });
                    }
                }
            }
        });

        tracing::info!(local_addr = %local_addr, "peer message listener started");
        Ok(Arc::new(Self {
            local_addr,
            current,
            shutdown,
        }))
    }

    /// The bound address, resolved if the configuration asked for port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Install or clear the current message server.
    pub fn reset(&self, server: Option<Arc<MessageServer>>) {
        *self.current.write() = server;
    }

    /// Stop accepting connections.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for ServiceWrapper {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn serve_connection(
    mut stream: tokio::net::TcpStream,
    current: Arc<RwLock<Option<Arc<MessageServer>>>>,
    shutdown: CancellationToken,
) -> SluiceResult<()> {
    let mut buffer = BytesMut::with_capacity(4096);
    loop {
        while let Some(message) = decode_frame(&mut buffer)? {
            let server = current.read().clone();
            match server {
                Some(server) => server.enqueue(message),
                None => tracing::debug!("no message server installed, frame dropped"),
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            read = stream.read_buf(&mut buffer) => {
                let n = read.map_err(|err| SluiceError::PeerMessaging {
                    message: err.to_string(),
                })?;
                if n == 0 {
                    return Ok(());
                }
            }
        }
    }
}
