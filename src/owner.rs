//! Cluster owner.
//!
//! The owner is the single capture coordinating the cluster: it aggregates
//! per-capture task positions into global changefeed watermarks, writes the
//! aggregated status back, and feeds the redo meta managers whose flush/GC
//! loops it runs for its ownership term.

use crate::coord::reactor::{ChangefeedStatus, ClusterState, Reactor};
use crate::core::config::{ChangefeedConfig, ConsistentConfig, SchedulerConfig};
use crate::core::error::{SluiceError, SluiceResult};
use crate::model::{CaptureInfo, ChangefeedId};
use crate::redo::MetaManager;
use crate::upstream::UpstreamManager;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Control surface of an owner held by the capture.
///
/// Stopping is asynchronous: the flag is observed at the owner's next tick,
/// which finishes the reactor loop.
#[derive(Clone)]
pub struct OwnerHandle {
    stopped: Arc<AtomicBool>,
}

impl OwnerHandle {
    /// Ask the owner to finish at its next tick. Idempotent.
    pub fn async_stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// Whether `async_stop` has been called.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// An owner drivable by the reactor loop.
pub trait Owner: Reactor {
    /// The control handle the capture keeps while this owner runs.
    fn handle(&self) -> OwnerHandle;
}

/// Factory for owners, invoked after every successful campaign.
pub type OwnerFactory = Arc<
    dyn Fn(&CaptureInfo, Arc<UpstreamManager>, &SchedulerConfig) -> Box<dyn Owner + Send>
        + Send
        + Sync,
>;

/// Default owner: watermark aggregation plus redo meta management for the
/// changefeeds declared in the configuration.
pub struct ChangefeedOwner {
    capture_id: String,
    #[allow(dead_code)]
    upstream: Arc<UpstreamManager>,
    consistent: ConsistentConfig,
    declared: Vec<ChangefeedConfig>,

    redo: HashMap<ChangefeedId, Arc<MetaManager>>,
    redo_cancel: CancellationToken,
    /// First failure of a background redo loop, surfaced at the next tick.
    redo_failure: Arc<Mutex<Option<SluiceError>>>,

    stopped: Arc<AtomicBool>,
}

impl ChangefeedOwner {
    /// Create an owner for one ownership term.
    pub fn new(
        info: &CaptureInfo,
        upstream: Arc<UpstreamManager>,
        consistent: ConsistentConfig,
        declared: Vec<ChangefeedConfig>,
    ) -> Self {
        Self {
            capture_id: info.id.clone(),
            upstream,
            consistent,
            declared,
            redo: HashMap::new(),
            redo_cancel: CancellationToken::new(),
            redo_failure: Arc::new(Mutex::new(None)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The redo meta manager of a changefeed, once initialized.
    pub fn redo_manager(&self, changefeed: &ChangefeedId) -> Option<&Arc<MetaManager>> {
        self.redo.get(changefeed)
    }

    /// Lazily initialize the redo manager of one changefeed and start its
    /// background loops for this ownership term.
    async fn ensure_redo_manager(&mut self, feed: &ChangefeedConfig) -> SluiceResult<()> {
        let changefeed = feed.changefeed_id();
        if !self.consistent.is_enabled() || self.redo.contains_key(&changefeed) {
            return Ok(());
        }

        let manager = Arc::new(
            MetaManager::new_with_init(
                self.capture_id.clone(),
                changefeed.clone(),
                &self.consistent,
                feed.start_ts,
            )
            .await?,
        );

        let task_manager = Arc::clone(&manager);
        let task_cancel = self.redo_cancel.child_token();
        let failure = Arc::clone(&self.redo_failure);
        tokio::spawn(async move {
            if let Err(err) = task_manager.run(task_cancel).await {
                if !err.is_canceled() {
                    tracing::error!(
                        changefeed = %task_manager.changefeed(),
                        error = %err,
                        "redo meta manager failed"
                    );
                    failure.lock().get_or_insert(err);
                }
            }
        });

        self.redo.insert(changefeed, manager);
        Ok(())
    }
}

#[async_trait]
impl Reactor for ChangefeedOwner {
    async fn tick(&mut self, state: &mut ClusterState) -> SluiceResult<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SluiceError::ReactorFinished);
        }
        if let Some(err) = self.redo_failure.lock().take() {
            return Err(err);
        }

        // Task positions are not lease-attached; prune the ones left behind
        // by captures that are no longer registered so a dead capture does
        // not pin the global minima.
        let orphaned: Vec<(String, ChangefeedId)> = state
            .task_positions
            .iter()
            .filter(|(capture_id, _)| !state.captures.contains_key(*capture_id))
            .flat_map(|(capture_id, by_feed)| {
                by_feed
                    .keys()
                    .map(|feed| (capture_id.clone(), feed.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();
        for (capture_id, changefeed) in orphaned {
            tracing::info!(
                capture_id = %capture_id,
                changefeed = %changefeed,
                "pruning task position of a vanished capture"
            );
            state.delete_task_position(capture_id, changefeed);
        }

        let declared = self.declared.clone();
        for feed in &declared {
            self.ensure_redo_manager(feed).await?;
            let changefeed = feed.changefeed_id();

            // Global watermarks are the minima across every capture still
            // replicating this feed; a capture without a position yet does
            // not hold the feed back.
            let positions: Vec<_> = state
                .task_positions
                .values()
                .filter_map(|by_feed| by_feed.get(&changefeed))
                .copied()
                .collect();
            if positions.is_empty() {
                continue;
            }
            let checkpoint_ts = positions.iter().map(|p| p.checkpoint_ts).min().unwrap_or(0);
            let resolved_ts = positions
                .iter()
                .map(|p| p.resolved_ts)
                .min()
                .unwrap_or(0)
                .max(checkpoint_ts);

            let current = state
                .changefeeds
                .get(&changefeed)
                .copied()
                .unwrap_or_default();
            let next = ChangefeedStatus {
                checkpoint_ts: current.checkpoint_ts.max(checkpoint_ts),
                resolved_ts: current.resolved_ts.max(resolved_ts),
            };
            if next != current {
                state.put_changefeed_status(changefeed.clone(), next);
            }
            if let Some(redo) = self.redo.get(&changefeed) {
                redo.update_meta(next.checkpoint_ts, next.resolved_ts);
            }
        }
        Ok(())
    }
}

impl Owner for ChangefeedOwner {
    fn handle(&self) -> OwnerHandle {
        OwnerHandle {
            stopped: Arc::clone(&self.stopped),
        }
    }
}

impl Drop for ChangefeedOwner {
    fn drop(&mut self) {
        // The redo loops belong to this ownership term only.
        self.redo_cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::reactor::TaskPosition;

    fn info() -> CaptureInfo {
        CaptureInfo {
            id: "cap-1".into(),
            advertise_addr: "127.0.0.1:1".into(),
            version: "test".into(),
        }
    }

    fn owner_without_redo(declared: Vec<ChangefeedConfig>) -> ChangefeedOwner {
        ChangefeedOwner::new(
            &info(),
            Arc::new(UpstreamManager::new(Vec::new())),
            ConsistentConfig::default(),
            declared,
        )
    }

    fn feed_config(id: &str, start_ts: u64) -> ChangefeedConfig {
        ChangefeedConfig {
            namespace: "default".into(),
            id: id.into(),
            start_ts,
        }
    }

    fn register(state: &mut ClusterState, capture_id: &str) {
        state.captures.insert(
            capture_id.to_string(),
            CaptureInfo {
                id: capture_id.to_string(),
                advertise_addr: "127.0.0.1:1".into(),
                version: "test".into(),
            },
        );
    }

    #[tokio::test]
    async fn aggregates_minima_across_captures() {
        let feed = ChangefeedId::in_default_namespace("orders");
        let mut owner = owner_without_redo(vec![feed_config("orders", 1)]);
        let mut state = ClusterState::new();
        register(&mut state, "cap-1");
        register(&mut state, "cap-2");

        state.task_positions.insert(
            "cap-1".into(),
            [(
                feed.clone(),
                TaskPosition {
                    checkpoint_ts: 100,
                    resolved_ts: 140,
                },
            )]
            .into_iter()
            .collect(),
        );
        state.task_positions.insert(
            "cap-2".into(),
            [(
                feed.clone(),
                TaskPosition {
                    checkpoint_ts: 90,
                    resolved_ts: 160,
                },
            )]
            .into_iter()
            .collect(),
        );

        owner.tick(&mut state).await.unwrap();
        assert_eq!(
            state.changefeeds[&feed],
            ChangefeedStatus {
                checkpoint_ts: 90,
                resolved_ts: 140
            }
        );
    }

    #[tokio::test]
    async fn status_never_regresses_when_a_capture_rejoins_low() {
        let feed = ChangefeedId::in_default_namespace("orders");
        let mut owner = owner_without_redo(vec![feed_config("orders", 1)]);
        let mut state = ClusterState::new();
        register(&mut state, "cap-late");
        state.changefeeds.insert(
            feed.clone(),
            ChangefeedStatus {
                checkpoint_ts: 100,
                resolved_ts: 150,
            },
        );
        state.task_positions.insert(
            "cap-late".into(),
            [(
                feed.clone(),
                TaskPosition {
                    checkpoint_ts: 40,
                    resolved_ts: 60,
                },
            )]
            .into_iter()
            .collect(),
        );

        owner.tick(&mut state).await.unwrap();
        assert_eq!(
            state.changefeeds[&feed],
            ChangefeedStatus {
                checkpoint_ts: 100,
                resolved_ts: 150
            }
        );
        assert!(!state.has_pending());
    }

    #[tokio::test]
    async fn positions_of_vanished_captures_are_pruned() {
        let feed = ChangefeedId::in_default_namespace("orders");
        let mut owner = owner_without_redo(vec![feed_config("orders", 1)]);
        let mut state = ClusterState::new();

        // cap-dead is not registered; its stale position must not pin the
        // aggregated minima.
        state.captures.insert(
            "cap-live".into(),
            CaptureInfo {
                id: "cap-live".into(),
                advertise_addr: "127.0.0.1:2".into(),
                version: "test".into(),
            },
        );
        state.task_positions.insert(
            "cap-live".into(),
            [(
                feed.clone(),
                TaskPosition {
                    checkpoint_ts: 100,
                    resolved_ts: 120,
                },
            )]
            .into_iter()
            .collect(),
        );
        state.task_positions.insert(
            "cap-dead".into(),
            [(
                feed.clone(),
                TaskPosition {
                    checkpoint_ts: 10,
                    resolved_ts: 12,
                },
            )]
            .into_iter()
            .collect(),
        );

        owner.tick(&mut state).await.unwrap();
        assert_eq!(
            state.changefeeds[&feed],
            ChangefeedStatus {
                checkpoint_ts: 100,
                resolved_ts: 120
            }
        );
        assert!(state
            .task_positions
            .get("cap-dead")
            .map(|by_feed| by_feed.is_empty())
            .unwrap_or(true));
    }

    #[tokio::test]
    async fn async_stop_finishes_the_reactor() {
        let mut owner = owner_without_redo(Vec::new());
        let handle = owner.handle();
        assert!(!handle.is_stopped());
        handle.async_stop();

        let mut state = ClusterState::new();
        let err = owner.tick(&mut state).await.unwrap_err();
        assert!(matches!(err, SluiceError::ReactorFinished));
    }
}
