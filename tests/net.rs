//! Tests for the peer messaging transport.

use sluice::net::router::MessageRouter;
use sluice::net::server::{MessageServer, ServiceWrapper};
use sluice::net::PeerMessage;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn collecting_server(
    capture_id: &str,
) -> (Arc<MessageServer>, mpsc::UnboundedReceiver<PeerMessage>) {
    let server = MessageServer::new(capture_id.to_string());
    let (tx, rx) = mpsc::unbounded_channel();
    server.register_handler(
        "dispatch",
        Box::new(move |message| {
            let _ = tx.send(message);
        }),
    );
    (server, rx)
}

#[tokio::test]
async fn messages_flow_between_router_and_server() {
    let wrapper = ServiceWrapper::bind("127.0.0.1:0").await.unwrap();
    let (server, mut received) = collecting_server("cap-b");
    wrapper.reset(Some(Arc::clone(&server)));

    let cancel = CancellationToken::new();
    let dispatch = tokio::spawn({
        let server = Arc::clone(&server);
        let cancel = cancel.clone();
        async move { server.run(cancel).await }
    });

    let router = MessageRouter::new("cap-a".to_string());
    router.add_peer(&"cap-b".to_string(), &wrapper.local_addr().to_string());
    router
        .send_to(&"cap-b".to_string(), "dispatch", b"table 7".to_vec())
        .await
        .unwrap();

    let message = tokio::time::timeout(Duration::from_secs(3), received.recv())
        .await
        .expect("message must arrive")
        .unwrap();
    assert_eq!(message.from, "cap-a");
    assert_eq!(message.payload, b"table 7");

    cancel.cancel();
    let _ = dispatch.await.unwrap();
    wrapper.shutdown();
}

#[tokio::test]
async fn the_wrapper_survives_server_swaps() {
    let wrapper = ServiceWrapper::bind("127.0.0.1:0").await.unwrap();
    let cancel = CancellationToken::new();

    // First incarnation.
    let (first, mut first_rx) = collecting_server("cap-b");
    wrapper.reset(Some(Arc::clone(&first)));
    let first_task = tokio::spawn({
        let server = Arc::clone(&first);
        let cancel = cancel.clone();
        async move { server.run(cancel).await }
    });

    let router = MessageRouter::new("cap-a".to_string());
    router.add_peer(&"cap-b".to_string(), &wrapper.local_addr().to_string());
    router
        .send_to(&"cap-b".to_string(), "dispatch", b"one".to_vec())
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(3), first_rx.recv())
        .await
        .expect("first server must receive")
        .unwrap();

    // Restart: the wrapper keeps the socket, the server is swapped.
    wrapper.reset(None);
    let (second, mut second_rx) = collecting_server("cap-b");
    wrapper.reset(Some(Arc::clone(&second)));
    let second_task = tokio::spawn({
        let server = Arc::clone(&second);
        let cancel = cancel.clone();
        async move { server.run(cancel).await }
    });

    // The router reconnects lazily if its old connection broke; retry
    // until the new incarnation sees a frame.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let _ = router
            .send_to(&"cap-b".to_string(), "dispatch", b"two".to_vec())
            .await;
        if let Ok(Some(_)) =
            tokio::time::timeout(Duration::from_millis(100), second_rx.recv()).await
        {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("second server never received a frame");
        }
    }

    cancel.cancel();
    let _ = first_task.await.unwrap();
    let _ = second_task.await.unwrap();
    wrapper.shutdown();
}
