//! Tests for the coordination layer: leases, sessions, election.

mod common;

use sluice::coord::election::Election;
use sluice::coord::session::Session;
use sluice::coord::store::CoordStore;
use sluice::CoordClient;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const OWNER_KEY: &str = "/cdc/test/owner";

fn election_for(store: &Arc<CoordStore>, session: &Session) -> Election {
    Election::new(
        Arc::clone(store),
        session.lease_id(),
        OWNER_KEY.to_string(),
        OWNER_KEY.to_string(),
    )
}

#[tokio::test]
async fn at_most_one_holder_under_concurrent_campaigns() {
    let store = CoordStore::new();
    let cancel = CancellationToken::new();

    // Every campaigner holds ownership briefly, checks it is the unique
    // holder, then resigns. Any double-grant would trip the assertion.
    let mut contenders = Vec::new();
    for i in 0..4 {
        let store = Arc::clone(&store);
        let cancel = cancel.clone();
        contenders.push(tokio::spawn(async move {
            let capture_id = format!("cap-{i}");
            let session = Session::new(Arc::clone(&store), Duration::from_secs(60))
                .await
                .unwrap();
            let election = Election::new(
                Arc::clone(&store),
                session.lease_id(),
                OWNER_KEY.to_string(),
                OWNER_KEY.to_string(),
            );
            for _ in 0..5 {
                election.campaign(&capture_id, &cancel).await.unwrap();

                let holder = store.get(OWNER_KEY).expect("owner key must exist");
                assert_eq!(holder.value, capture_id.as_bytes());

                tokio::time::sleep(Duration::from_millis(5)).await;
                election.resign().await.unwrap();
            }
            session.close();
        }));
    }
    for contender in contenders {
        contender.await.unwrap();
    }
    assert!(store.get(OWNER_KEY).is_none());
}

#[tokio::test]
async fn session_expiry_vacates_ownership() {
    let store = CoordStore::new();
    let owner_session = Session::new(Arc::clone(&store), Duration::from_secs(60))
        .await
        .unwrap();
    let owner_election = election_for(&store, &owner_session);
    owner_election
        .campaign("cap-owner", &CancellationToken::new())
        .await
        .unwrap();

    // A second capture is parked in campaign.
    let waiter_session = Session::new(Arc::clone(&store), Duration::from_secs(60))
        .await
        .unwrap();
    let waiter_store = Arc::clone(&store);
    let waiter_lease = waiter_session.lease_id();
    let waiter = tokio::spawn(async move {
        let election = Election::new(
            waiter_store,
            waiter_lease,
            OWNER_KEY.to_string(),
            OWNER_KEY.to_string(),
        );
        election
            .campaign("cap-waiter", &CancellationToken::new())
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    // Losing the lease vacates the key without the owner's cooperation.
    store.revoke_lease(owner_session.lease_id()).unwrap();

    waiter.await.unwrap().unwrap();
    assert_eq!(store.get(OWNER_KEY).unwrap().value, b"cap-waiter");
}

#[tokio::test]
async fn owner_revision_increases_across_terms() {
    let store = CoordStore::new();
    let client = CoordClient::new(Arc::clone(&store), "test");

    let mut last_revision = 0;
    for term in 0..3 {
        let session = Session::new(Arc::clone(&store), Duration::from_secs(60))
            .await
            .unwrap();
        let election = Election::new(
            Arc::clone(&store),
            session.lease_id(),
            client.owner_key(),
            client.owner_key(),
        );
        let capture_id = format!("cap-{term}");
        election
            .campaign(&capture_id, &CancellationToken::new())
            .await
            .unwrap();

        let revision = client.owner_revision(&capture_id).await.unwrap();
        assert!(revision > last_revision);
        last_revision = revision;

        election.resign().await.unwrap();
        session.close();
    }
}
