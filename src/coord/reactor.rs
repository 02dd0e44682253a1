//! Cluster reactor loop.
//!
//! A [`Reactor`] converges some piece of cluster state (the owner, or a
//! capture's processor manager) against the coordination store. The
//! [`CoordWorker`] drives it: each tick reads the current state, invokes
//! the reactor, and writes back only what the reactor mutated.
//!
//! The worker also watches the health of the session it runs under. A
//! declared session-done or an expired lease raises a suicide error so the
//! capture restarts; compacted revisions are deliberately not handled at
//! this level.

use crate::coord::client::CoordClient;
use crate::coord::session::Session;
use crate::core::error::{SluiceError, SluiceResult};
use crate::model::{CaptureId, CaptureInfo, ChangefeedId, Ts};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Replication progress one capture reports for one changefeed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPosition {
    pub checkpoint_ts: Ts,
    pub resolved_ts: Ts,
}

/// Aggregated watermarks of a changefeed, written by the owner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangefeedStatus {
    pub checkpoint_ts: Ts,
    pub resolved_ts: Ts,
}

/// A mutation queued by a reactor, flushed by the worker after the tick.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    PutTaskPosition {
        capture_id: CaptureId,
        changefeed: ChangefeedId,
        position: TaskPosition,
    },
    DeleteTaskPosition {
        capture_id: CaptureId,
        changefeed: ChangefeedId,
    },
    PutChangefeedStatus {
        changefeed: ChangefeedId,
        status: ChangefeedStatus,
    },
}

/// Callback invoked when a capture joins the cluster.
pub type CaptureAddedHook = Box<dyn Fn(&CaptureId, &str) + Send>;
/// Callback invoked when a capture leaves the cluster.
pub type CaptureRemovedHook = Box<dyn Fn(&CaptureId) + Send>;

/// In-memory view of the cluster, refreshed from the store every tick.
#[derive(Default)]
pub struct ClusterState {
    /// Registered captures by id.
    pub captures: HashMap<CaptureId, CaptureInfo>,

    /// Task positions by capture, then changefeed.
    pub task_positions: HashMap<CaptureId, HashMap<ChangefeedId, TaskPosition>>,

    /// Aggregated changefeed statuses.
    pub changefeeds: HashMap<ChangefeedId, ChangefeedStatus>,

    /// Revision carried by an owner-scoped state, used to fence writes
    /// from a stale owner.
    owner_revision: Option<u64>,

    pending: Vec<WriteOp>,
    on_capture_added: Option<CaptureAddedHook>,
    on_capture_removed: Option<CaptureRemovedHook>,
}

impl ClusterState {
    /// An empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty state carrying the revision of an ownership acquisition.
    pub fn with_owner_revision(revision: u64) -> Self {
        Self {
            owner_revision: Some(revision),
            ..Self::default()
        }
    }

    /// The ownership revision, when this state drives an owner.
    pub fn owner_revision(&self) -> Option<u64> {
        self.owner_revision
    }

    /// Install the capture-joined hook.
    pub fn set_on_capture_added(&mut self, hook: CaptureAddedHook) {
        self.on_capture_added = Some(hook);
    }

    /// Install the capture-left hook.
    pub fn set_on_capture_removed(&mut self, hook: CaptureRemovedHook) {
        self.on_capture_removed = Some(hook);
    }

    /// Refresh from a store snapshot, firing membership hooks on diffs.
    pub fn update_from(&mut self, client: &CoordClient) -> SluiceResult<()> {
        let base = client.base_key();
        let capture_prefix = format!("{base}/capture/");
        let task_prefix = format!("{base}/task/");
        let changefeed_prefix = format!("{base}/changefeed/");

        let mut captures = HashMap::new();
        let mut task_positions: HashMap<CaptureId, HashMap<ChangefeedId, TaskPosition>> =
            HashMap::new();
        let mut changefeeds = HashMap::new();

        for kv in client.snapshot() {
            if let Some(capture_id) = kv.key.strip_prefix(&capture_prefix) {
                let info: CaptureInfo =
                    serde_json::from_slice(&kv.value).map_err(SluiceError::marshal)?;
                captures.insert(capture_id.to_string(), info);
            } else if let Some(rest) = kv.key.strip_prefix(&task_prefix) {
                let Some((capture_id, feed_path)) = rest.split_once('/') else {
                    continue;
                };
                let Some(changefeed) = parse_feed_path(feed_path) else {
                    continue;
                };
                let position: TaskPosition =
                    serde_json::from_slice(&kv.value).map_err(SluiceError::marshal)?;
                task_positions
                    .entry(capture_id.to_string())
                    .or_default()
                    .insert(changefeed, position);
            } else if let Some(rest) = kv.key.strip_prefix(&changefeed_prefix) {
                let Some(feed_path) = rest.strip_suffix("/status") else {
                    continue;
                };
                let Some(changefeed) = parse_feed_path(feed_path) else {
                    continue;
                };
                let status: ChangefeedStatus =
                    serde_json::from_slice(&kv.value).map_err(SluiceError::marshal)?;
                changefeeds.insert(changefeed, status);
            }
        }

        for (capture_id, info) in &captures {
            if !self.captures.contains_key(capture_id) {
                if let Some(hook) = &self.on_capture_added {
                    hook(capture_id, &info.advertise_addr);
                }
            }
        }
        for capture_id in self.captures.keys() {
            if !captures.contains_key(capture_id) {
                if let Some(hook) = &self.on_capture_removed {
                    hook(capture_id);
                }
            }
        }

        self.captures = captures;
        self.task_positions = task_positions;
        self.changefeeds = changefeeds;
        Ok(())
    }

    /// Record a task position and queue its write-back.
    pub fn put_task_position(
        &mut self,
        capture_id: CaptureId,
        changefeed: ChangefeedId,
        position: TaskPosition,
    ) {
        self.task_positions
            .entry(capture_id.clone())
            .or_default()
            .insert(changefeed.clone(), position);
        self.pending.push(WriteOp::PutTaskPosition {
            capture_id,
            changefeed,
            position,
        });
    }

    /// Drop a task position and queue its deletion.
    pub fn delete_task_position(&mut self, capture_id: CaptureId, changefeed: ChangefeedId) {
        if let Some(positions) = self.task_positions.get_mut(&capture_id) {
            positions.remove(&changefeed);
        }
        self.pending.push(WriteOp::DeleteTaskPosition {
            capture_id,
            changefeed,
        });
    }

    /// Record a changefeed status and queue its write-back.
    pub fn put_changefeed_status(&mut self, changefeed: ChangefeedId, status: ChangefeedStatus) {
        self.changefeeds.insert(changefeed.clone(), status);
        self.pending
            .push(WriteOp::PutChangefeedStatus { changefeed, status });
    }

    /// Whether the last tick queued any mutation.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Take the queued mutations.
    pub fn take_pending(&mut self) -> Vec<WriteOp> {
        std::mem::take(&mut self.pending)
    }

    /// Apply queued mutations to the store.
    pub fn flush_pending(&mut self, client: &CoordClient) -> SluiceResult<()> {
        for op in self.take_pending() {
            match op {
                WriteOp::PutTaskPosition {
                    capture_id,
                    changefeed,
                    position,
                } => {
                    let key = client.task_position_key(&capture_id, &changefeed);
                    let value = serde_json::to_vec(&position).map_err(SluiceError::marshal)?;
                    client.store().put(&key, value, None)?;
                }
                WriteOp::DeleteTaskPosition {
                    capture_id,
                    changefeed,
                } => {
                    client
                        .store()
                        .delete(&client.task_position_key(&capture_id, &changefeed));
                }
                WriteOp::PutChangefeedStatus { changefeed, status } => {
                    let key = client.changefeed_status_key(&changefeed);
                    let value = serde_json::to_vec(&status).map_err(SluiceError::marshal)?;
                    client.store().put(&key, value, None)?;
                }
            }
        }
        Ok(())
    }
}

fn parse_feed_path(path: &str) -> Option<ChangefeedId> {
    let mut segments = path.split('/');
    match (segments.next(), segments.next(), segments.next()) {
        (Some(id), None, _) if !id.is_empty() => Some(ChangefeedId::in_default_namespace(id)),
        (Some(namespace), Some(id), None) if !namespace.is_empty() && !id.is_empty() => {
            Some(ChangefeedId::new(namespace, id))
        }
        _ => None,
    }
}

/// A state machine driven against the cluster by a [`CoordWorker`].
///
/// Returning [`SluiceError::ReactorFinished`] ends the loop without error;
/// any other error surfaces to the capture.
#[async_trait]
pub trait Reactor: Send {
    async fn tick(&mut self, state: &mut ClusterState) -> SluiceResult<()>;
}

/// Drives a reactor at a fixed tick interval under one session.
pub struct CoordWorker {
    client: CoordClient,
    role: &'static str,
    interval: Duration,
}

impl CoordWorker {
    /// Create a worker for the given role (used only for logging).
    pub fn new(client: CoordClient, role: &'static str, interval: Duration) -> Self {
        Self {
            client,
            role,
            interval,
        }
    }

    /// Run the tick loop until the reactor finishes, the session dies, or
    /// the token is cancelled.
    pub async fn run<R>(
        &self,
        reactor: &mut R,
        state: &mut ClusterState,
        session: &Session,
        cancel: &CancellationToken,
    ) -> SluiceResult<()>
    where
        R: Reactor + ?Sized,
    {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut done = session.done();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(SluiceError::Canceled),
                changed = done.changed() => {
                    if changed.is_err() || *done.borrow() {
                        tracing::warn!(role = self.role, "session is disconnected");
                        return Err(SluiceError::CaptureSuicide);
                    }
                }
                _ = ticker.tick() => {
                    match self.tick_once(reactor, state).await {
                        Ok(()) => {}
                        Err(SluiceError::ReactorFinished) => return Ok(()),
                        Err(err) => return Err(self.classify(err, session)),
                    }
                }
            }
        }
    }

    async fn tick_once<R>(
        &self,
        reactor: &mut R,
        state: &mut ClusterState,
    ) -> SluiceResult<()>
    where
        R: Reactor + ?Sized,
    {
        state.update_from(&self.client)?;
        reactor.tick(state).await?;
        state.flush_pending(&self.client)
    }

    /// Map tick errors onto the restart contract.
    ///
    /// `done()` can lag a revoked lease by a keepalive interval, so an
    /// erroring tick also probes the lease TTL directly before the error
    /// is allowed to propagate as-is.
    fn classify(&self, err: SluiceError, session: &Session) -> SluiceError {
        match err.root() {
            SluiceError::SessionDone | SluiceError::LeaseExpired { .. } => {
                tracing::warn!(role = self.role, error = %err, "session is disconnected");
                SluiceError::CaptureSuicide
            }
            _ => {
                if session.time_to_live().is_none() {
                    tracing::warn!(role = self.role, error = %err, "session lease is gone");
                    return SluiceError::CaptureSuicide;
                }
                err
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::store::CoordStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingReactor {
        ticks: usize,
        finish_after: usize,
    }

    #[async_trait]
    impl Reactor for CountingReactor {
        async fn tick(&mut self, _state: &mut ClusterState) -> SluiceResult<()> {
            self.ticks += 1;
            if self.ticks >= self.finish_after {
                return Err(SluiceError::ReactorFinished);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn worker_exits_cleanly_when_the_reactor_finishes() {
        let store = CoordStore::new();
        let client = CoordClient::new(Arc::clone(&store), "main");
        let session = Session::new(Arc::clone(&store), Duration::from_secs(60))
            .await
            .unwrap();

        let worker = CoordWorker::new(client, "test", Duration::from_millis(10));
        let mut reactor = CountingReactor {
            ticks: 0,
            finish_after: 3,
        };
        let mut state = ClusterState::new();
        worker
            .run(&mut reactor, &mut state, &session, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reactor.ticks, 3);
        session.close();
    }

    #[tokio::test]
    async fn worker_raises_suicide_when_the_session_dies() {
        let store = CoordStore::new();
        let client = CoordClient::new(Arc::clone(&store), "main");
        let session = Session::new(Arc::clone(&store), Duration::from_millis(200))
            .await
            .unwrap();
        store.revoke_lease(session.lease_id()).unwrap();

        let worker = CoordWorker::new(client, "test", Duration::from_millis(10));
        let mut reactor = CountingReactor {
            ticks: 0,
            finish_after: usize::MAX,
        };
        let mut state = ClusterState::new();
        let err = worker
            .run(&mut reactor, &mut state, &session, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SluiceError::CaptureSuicide));
    }

    #[tokio::test]
    async fn membership_hooks_fire_on_diffs() {
        let store = CoordStore::new();
        let client = CoordClient::new(Arc::clone(&store), "main");
        let lease = store.grant_lease(Duration::from_secs(60));

        let added = Arc::new(AtomicUsize::new(0));
        let removed = Arc::new(AtomicUsize::new(0));
        let mut state = ClusterState::new();
        {
            let added = Arc::clone(&added);
            state.set_on_capture_added(Box::new(move |_, _| {
                added.fetch_add(1, Ordering::SeqCst);
            }));
            let removed = Arc::clone(&removed);
            state.set_on_capture_removed(Box::new(move |_| {
                removed.fetch_add(1, Ordering::SeqCst);
            }));
        }

        let info = CaptureInfo {
            id: "cap-1".into(),
            advertise_addr: "127.0.0.1:1".into(),
            version: "test".into(),
        };
        client.put_capture_info(&info, lease).await.unwrap();
        state.update_from(&client).unwrap();
        assert_eq!(added.load(Ordering::SeqCst), 1);

        client.delete_capture_info("cap-1").await.unwrap();
        state.update_from(&client).unwrap();
        assert_eq!(removed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn queued_writes_round_trip_through_the_store() {
        let store = CoordStore::new();
        let client = CoordClient::new(Arc::clone(&store), "main");
        let feed = ChangefeedId::in_default_namespace("orders");

        let mut state = ClusterState::new();
        state.put_task_position(
            "cap-1".into(),
            feed.clone(),
            TaskPosition {
                checkpoint_ts: 10,
                resolved_ts: 20,
            },
        );
        state.put_changefeed_status(
            feed.clone(),
            ChangefeedStatus {
                checkpoint_ts: 10,
                resolved_ts: 20,
            },
        );
        state.flush_pending(&client).unwrap();
        assert!(!state.has_pending());

        let mut fresh = ClusterState::new();
        fresh.update_from(&client).unwrap();
        assert_eq!(
            fresh.task_positions["cap-1"][&feed],
            TaskPosition {
                checkpoint_ts: 10,
                resolved_ts: 20
            }
        );
        assert_eq!(
            fresh.changefeeds[&feed],
            ChangefeedStatus {
                checkpoint_ts: 10,
                resolved_ts: 20
            }
        );
    }

    #[test]
    fn feed_paths_parse_with_and_without_namespace() {
        assert_eq!(
            parse_feed_path("orders"),
            Some(ChangefeedId::in_default_namespace("orders"))
        );
        assert_eq!(
            parse_feed_path("team-a/orders"),
            Some(ChangefeedId::new("team-a", "orders"))
        );
        assert_eq!(parse_feed_path(""), None);
        assert_eq!(parse_feed_path("a/b/c"), None);
    }
}
