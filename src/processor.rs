//! Per-capture processor manager.
//!
//! The processor side of a capture publishes this node's replication
//! progress (one task position per changefeed) into the cluster state. The
//! actual event pipeline that advances those positions is an external
//! collaborator; it feeds progress through a [`ProgressSink`].

use crate::coord::reactor::{ClusterState, Reactor, TaskPosition};
use crate::core::error::{SluiceError, SluiceResult};
use crate::model::{AtomicLiveness, CaptureInfo, ChangefeedId, Ts};
use crate::upstream::UpstreamManager;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Control surface of a processor manager held by the capture.
#[derive(Clone)]
pub struct ProcessorHandle {
    closed: Arc<AtomicBool>,
}

impl ProcessorHandle {
    /// Ask the manager to finish at its next tick. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Writable view of this capture's replication progress.
#[derive(Clone)]
pub struct ProgressSink {
    positions: Arc<RwLock<HashMap<ChangefeedId, TaskPosition>>>,
}

impl ProgressSink {
    /// Advance a changefeed's position. Regressions are kept as reported;
    /// the owner-side aggregation and the redo manager guard monotonicity.
    pub fn update(&self, changefeed: ChangefeedId, checkpoint_ts: Ts, resolved_ts: Ts) {
        self.positions.write().insert(
            changefeed,
            TaskPosition {
                checkpoint_ts,
                resolved_ts,
            },
        );
    }
}

/// A processor manager drivable by the reactor loop.
pub trait ProcessorManager: Reactor {
    /// The control handle the capture keeps across the manager's lifetime.
    fn handle(&self) -> ProcessorHandle;
}

/// Factory for processor managers, invoked at every capture reset.
pub type ProcessorManagerFactory = Arc<
    dyn Fn(
            &CaptureInfo,
            Arc<UpstreamManager>,
            Arc<AtomicLiveness>,
            &crate::core::config::SchedulerConfig,
        ) -> Box<dyn ProcessorManager + Send>
        + Send
        + Sync,
>;

/// Default processor manager: publishes task positions for the declared
/// changefeeds and sheds them once the capture is stopping.
pub struct ProcessorRuntime {
    capture_id: String,
    liveness: Arc<AtomicLiveness>,
    positions: Arc<RwLock<HashMap<ChangefeedId, TaskPosition>>>,
    closed: Arc<AtomicBool>,
    shed: bool,
    #[allow(dead_code)]
    upstream: Arc<UpstreamManager>,
}

impl ProcessorRuntime {
    /// Create a runtime seeded with each changefeed's start position.
    pub fn new(
        info: &CaptureInfo,
        upstream: Arc<UpstreamManager>,
        liveness: Arc<AtomicLiveness>,
        seeds: Vec<(ChangefeedId, Ts)>,
    ) -> Self {
        let positions = seeds
            .into_iter()
            .map(|(feed, start_ts)| {
                (
                    feed,
                    TaskPosition {
                        checkpoint_ts: start_ts,
                        resolved_ts: start_ts,
                    },
                )
            })
            .collect();
        Self {
            capture_id: info.id.clone(),
            liveness,
            positions: Arc::new(RwLock::new(positions)),
            closed: Arc::new(AtomicBool::new(false)),
            shed: false,
            upstream,
        }
    }

    /// The sink the event pipeline advances positions through.
    pub fn progress_sink(&self) -> ProgressSink {
        ProgressSink {
            positions: Arc::clone(&self.positions),
        }
    }
}

#[async_trait]
impl Reactor for ProcessorRuntime {
    async fn tick(&mut self, state: &mut ClusterState) -> SluiceResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SluiceError::ReactorFinished);
        }

        if self.liveness.is_stopping() {
            // Shed this node's work so the owner reschedules it, let the
            // deletions flush, then finish at the following tick.
            if self.shed {
                return Err(SluiceError::ReactorFinished);
            }
            self.shed = true;
            let feeds: Vec<ChangefeedId> = state
                .task_positions
                .get(&self.capture_id)
                .map(|positions| positions.keys().cloned().collect())
                .unwrap_or_default();
            for feed in feeds {
                tracing::info!(
                    capture_id = %self.capture_id,
                    changefeed = %feed,
                    "shedding task position, capture is stopping"
                );
                state.delete_task_position(self.capture_id.clone(), feed);
            }
            return Ok(());
        }

        let positions = self.positions.read().clone();
        for (feed, position) in positions {
            let published = state
                .task_positions
                .get(&self.capture_id)
                .and_then(|by_feed| by_feed.get(&feed))
                .copied();
            if published != Some(position) {
                state.put_task_position(self.capture_id.clone(), feed, position);
            }
        }
        Ok(())
    }
}

impl ProcessorManager for ProcessorRuntime {
    fn handle(&self) -> ProcessorHandle {
        ProcessorHandle {
            closed: Arc::clone(&self.closed),
        }
    }
}
