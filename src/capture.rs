//! Capture process runtime.
//!
//! A capture registers itself in the coordination store, campaigns for the
//! cluster-wide owner lease, and runs its reactor loops until something
//! goes wrong. Failures split into two classes: the suicide class (session
//! lost, cancellation, deadline overruns) resets the capture and runs it
//! again under a restart rate limit; anything else terminates the process.
//!
//! Per-incarnation resources (session, election, upstream manager,
//! processor manager, message server and router) are rebuilt by `reset`;
//! only the listener socket survives restarts inside the service wrapper.

use crate::coord::client::CoordClient;
use crate::coord::election::Election;
use crate::coord::reactor::{ClusterState, CoordWorker};
use crate::coord::session::Session;
use crate::coord::store::CoordStore;
use crate::core::config::Config;
use crate::core::error::{SluiceError, SluiceResult};
use crate::core::limiter::RateLimiter;
use crate::model::{
    AtomicLiveness, CaptureInfo, ChangefeedId, Liveness, Ts, RELEASE_VERSION,
};
use crate::net::router::MessageRouter;
use crate::net::server::{MessageServer, ServiceWrapper};
use crate::owner::{ChangefeedOwner, OwnerFactory, OwnerHandle};
use crate::processor::{ProcessorHandle, ProcessorManager, ProcessorManagerFactory, ProcessorRuntime};
use crate::upstream::UpstreamManager;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Bound on the detached context used to deregister a graceful exit.
pub const CLEAN_META_DURATION: Duration = Duration::from_secs(10);

/// Bound on the detached context used to resign after an ownership term.
pub const RESIGN_TIMEOUT: Duration = Duration::from_secs(5);

/// Restart limiter: one token per 20 seconds, burst 2.
const RESTART_REFILL_PER_SEC: f64 = 0.05;

/// Campaign limiter: one election attempt per second.
const CAMPAIGN_REFILL_PER_SEC: f64 = 1.0;

/// Per-incarnation runtime state, rebuilt by `reset`.
#[derive(Default)]
struct CaptureState {
    info: Option<CaptureInfo>,
    session: Option<Arc<Session>>,
    election: Option<Arc<Election>>,
    upstream: Option<Arc<UpstreamManager>>,
    processor: Option<Box<dyn ProcessorManager + Send>>,
    processor_handle: Option<ProcessorHandle>,
    message_server: Option<Arc<MessageServer>>,
    router: Option<Arc<MessageRouter>>,
}

struct RunParts {
    info: CaptureInfo,
    session: Arc<Session>,
    election: Arc<Election>,
    upstream: Arc<UpstreamManager>,
    processor: Box<dyn ProcessorManager + Send>,
    message_server: Arc<MessageServer>,
    router: Arc<MessageRouter>,
}

/// A capture server: one worker process of the CDC cluster.
pub struct Capture {
    config: Arc<Config>,
    coord: CoordClient,
    liveness: Arc<AtomicLiveness>,

    state: Mutex<CaptureState>,
    owner: Mutex<Option<OwnerHandle>>,
    run_cancel: Mutex<Option<CancellationToken>>,

    /// Process-lifetime listener; message servers are swapped through it.
    service: Arc<ServiceWrapper>,

    owner_factory: OwnerFactory,
    processor_factory: ProcessorManagerFactory,
}

impl Capture {
    /// Create a capture with the default owner and processor-manager
    /// factories derived from the configuration.
    pub async fn new(config: Config, store: Arc<CoordStore>) -> SluiceResult<Arc<Self>> {
        let owner_factory = default_owner_factory(&config);
        let processor_factory = default_processor_factory(&config);
        Self::with_factories(config, store, owner_factory, processor_factory).await
    }

    /// Create a capture with injected factories (used by tests and by
    /// deployments embedding their own scheduling).
    pub async fn with_factories(
        config: Config,
        store: Arc<CoordStore>,
        owner_factory: OwnerFactory,
        processor_factory: ProcessorManagerFactory,
    ) -> SluiceResult<Arc<Self>> {
        let service = ServiceWrapper::bind(&config.server.advertise_addr).await?;
        let coord = CoordClient::new(store, config.server.cluster_id.clone());
        Ok(Arc::new(Self {
            config: Arc::new(config),
            coord,
            liveness: Arc::new(AtomicLiveness::new()),
            state: Mutex::new(CaptureState::default()),
            owner: Mutex::new(None),
            run_cancel: Mutex::new(None),
            service,
            owner_factory,
            processor_factory,
        }))
    }

    /// The coordination client of this capture.
    pub fn coord(&self) -> &CoordClient {
        &self.coord
    }

    /// Info of the current incarnation.
    ///
    /// [`SluiceError::CaptureNotInitialized`] before the first reset.
    pub fn info(&self) -> SluiceResult<CaptureInfo> {
        self.state
            .lock()
            .info
            .clone()
            .ok_or(SluiceError::CaptureNotInitialized)
    }

    /// Current liveness.
    pub fn liveness(&self) -> Liveness {
        self.liveness.load()
    }

    /// Whether this capture currently holds ownership.
    pub fn is_owner(&self) -> bool {
        self.owner.lock().is_some()
    }

    /// Registration info of the cluster's current owner.
    pub async fn owner_capture_info(&self) -> SluiceResult<CaptureInfo> {
        self.coord.owner_capture_info().await
    }

    /// Run the capture until it terminates.
    ///
    /// The outer loop is rate-limited; suicide, cancellation and deadline
    /// errors reset the capture and run it again, anything else is fatal.
    pub async fn run(&self, cancel: CancellationToken) -> SluiceResult<()> {
        let restart_limiter = RateLimiter::new(RESTART_REFILL_PER_SEC, 2);
        loop {
            if cancel.is_cancelled() {
                tracing::info!("the capture routine has exited");
                return Ok(());
            }
            match restart_limiter.acquire(&cancel).await {
                Ok(()) => {}
                Err(err) if err.is_canceled() => return Ok(()),
                Err(err) => return Err(err),
            }

            let run_cancel = cancel.child_token();
            *self.run_cancel.lock() = Some(run_cancel.clone());

            match self.run_inner(run_cancel).await {
                Ok(()) => {
                    tracing::info!("the capture routine has exited");
                    return Ok(());
                }
                Err(err) if err.restarts_capture() => {
                    let capture_id = self
                        .info()
                        .map(|info| info.id)
                        .unwrap_or_else(|_| "<uninitialized>".into());
                    tracing::info!(capture_id = %capture_id, error = %err, "capture recovered");
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn run_inner(&self, cancel: CancellationToken) -> SluiceResult<()> {
        if let Err(err) = self.reset().await {
            tracing::error!(error = %err, "reset capture failed");
            return Err(err);
        }
        self.register().await?;

        let parts = self.take_run_parts();
        let capture_id = parts.info.id.clone();
        let result = self.run_group(parts, cancel).await;

        // Graceful deregistration on a detached, bounded context so a
        // cancelled run cannot leave a stale registration behind.
        let deregister = tokio::time::timeout(
            CLEAN_META_DURATION,
            self.coord.delete_capture_info(&capture_id),
        )
        .await;
        match deregister {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::warn!(capture_id = %capture_id, error = %err,
                    "failed to delete capture info on exit");
            }
            Err(_) => {
                tracing::warn!(capture_id = %capture_id,
                    "timed out deleting capture info on exit");
            }
        }

        self.async_close();
        result
    }

    fn take_run_parts(&self) -> RunParts {
        let mut state = self.state.lock();
        RunParts {
            info: state.info.clone().expect("reset ran before the group"),
            session: state.session.clone().expect("reset ran before the group"),
            election: state.election.clone().expect("reset ran before the group"),
            upstream: state.upstream.clone().expect("reset ran before the group"),
            processor: state.processor.take().expect("reset ran before the group"),
            message_server: state
                .message_server
                .clone()
                .expect("reset ran before the group"),
            router: state.router.clone().expect("reset ran before the group"),
        }
    }

    async fn run_group(&self, parts: RunParts, cancel: CancellationToken) -> SluiceResult<()> {
        let RunParts {
            info,
            session,
            election,
            upstream,
            mut processor,
            message_server,
            router,
        } = parts;

        let campaign = async {
            let result = self
                .campaign_owner(&info, &session, &election, &upstream, &router, &cancel)
                .await;
            // The campaign loop only exits cleanly while stopping; any
            // other exit restarts the capture.
            if result.is_err() || !self.liveness.is_stopping() {
                let cause = result.err().map(|e| e.to_string()).unwrap_or_default();
                tracing::warn!(
                    capture_id = %info.id,
                    error = %cause,
                    "campaign owner routine exited, restart the capture"
                );
                return Err(SluiceError::CaptureSuicide);
            }
            Ok(())
        };

        let processor_loop = async {
            let mut state = ClusterState::new();
            install_peer_hooks(&mut state, &router);
            let worker = CoordWorker::new(
                self.coord.clone(),
                "processor",
                self.config.processor_flush_interval(),
            );
            let result = worker
                .run(processor.as_mut(), &mut state, &session, &cancel)
                .await;
            let cause = result
                .as_ref()
                .err()
                .map(|e| e.to_string())
                .unwrap_or_default();
            tracing::info!(
                capture_id = %info.id,
                error = %cause,
                "processor routine exited"
            );
            result
        };

        // First error among the critical tasks cancels the whole group;
        // the message server is torn down with it.
        tokio::select! {
            result = async { tokio::try_join!(campaign, processor_loop).map(|_| ()) } => result,
            result = message_server.run(cancel.clone()) => result,
        }
    }

    /// Rebuild every per-incarnation resource.
    async fn reset(&self) -> SluiceResult<()> {
        let session = Session::new(
            Arc::clone(self.coord.store()),
            self.config.session_ttl(),
        )
        .await?;

        let info = CaptureInfo {
            id: Uuid::new_v4().to_string(),
            advertise_addr: self.service.local_addr().to_string(),
            version: RELEASE_VERSION.to_string(),
        };

        let mut state = self.state.lock();

        if let Some(old) = state.upstream.take() {
            old.close();
        }
        let upstream = Arc::new(UpstreamManager::new(
            self.config.server.upstream_endpoints.clone(),
        ));
        state.upstream = Some(Arc::clone(&upstream));

        let processor = (self.processor_factory)(
            &info,
            upstream,
            Arc::clone(&self.liveness),
            &self.config.scheduler,
        );
        state.processor_handle = Some(processor.handle());
        state.processor = Some(processor);

        if let Some(old) = state.session.replace(Arc::new(session)) {
            old.close();
        }
        let lease_id = state
            .session
            .as_ref()
            .expect("just installed")
            .lease_id();
        state.election = Some(Arc::new(Election::new(
            Arc::clone(self.coord.store()),
            lease_id,
            self.coord.owner_key(),
            self.coord.owner_key(),
        )));

        self.service.reset(None);
        if let Some(old) = state.router.take() {
            old.close();
        }
        let message_server = MessageServer::new(info.id.clone());
        self.service.reset(Some(Arc::clone(&message_server)));
        state.message_server = Some(message_server);
        state.router = Some(Arc::new(MessageRouter::new(info.id.clone())));

        state.info = Some(info.clone());
        drop(state);

        tracing::info!(
            capture_id = %info.id,
            advertise_addr = %info.advertise_addr,
            "capture initialized"
        );
        Ok(())
    }

    /// Register this incarnation under its session lease.
    async fn register(&self) -> SluiceResult<()> {
        let (info, lease_id) = {
            let state = self.state.lock();
            (
                state.info.clone().expect("reset ran before register"),
                state
                    .session
                    .as_ref()
                    .expect("reset ran before register")
                    .lease_id(),
            )
        };
        self.coord
            .put_capture_info(&info, lease_id)
            .await
            .map_err(|err| SluiceError::CaptureRegister(Box::new(err)))
    }

    /// Rate-limited owner election loop.
    #[allow(clippy::too_many_arguments)]
    async fn campaign_owner(
        &self,
        info: &CaptureInfo,
        session: &Arc<Session>,
        election: &Arc<Election>,
        upstream: &Arc<UpstreamManager>,
        router: &Arc<MessageRouter>,
        cancel: &CancellationToken,
    ) -> SluiceResult<()> {
        let campaign_limiter = RateLimiter::new(CAMPAIGN_REFILL_PER_SEC, 1);
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            match campaign_limiter.acquire(cancel).await {
                Ok(()) => {}
                Err(err) if err.is_canceled() => return Ok(()),
                Err(err) => return Err(err),
            }

            // Check liveness before campaigning: a stopping capture must
            // not acquire ownership.
            if self.liveness.is_stopping() {
                tracing::info!(capture_id = %info.id, "do not campaign owner, liveness is stopping");
                return Ok(());
            }

            if let Err(err) = self.campaign(election, &info.id, cancel).await {
                if err.is_canceled() {
                    return Ok(());
                }
                if err.is_compacted() {
                    tracing::warn!(
                        capture_id = %info.id,
                        error = %err,
                        "campaign owner failed, store revision has been compacted, retry later"
                    );
                    continue;
                }
                tracing::warn!(capture_id = %info.id, error = %err, "campaign owner failed");
                return Err(SluiceError::CaptureSuicide);
            }

            // Re-check after winning: the signal to stop may have arrived
            // while the campaign was blocked.
            if self.liveness.is_stopping() {
                tracing::info!(capture_id = %info.id, "resign owner actively, liveness is stopping");
                if let Err(err) = self.resign(election).await {
                    tracing::warn!(capture_id = %info.id, error = %err,
                        "active resign failed");
                }
                return Ok(());
            }

            let owner_revision = match self.coord.owner_revision(&info.id).await {
                Ok(revision) => revision,
                Err(err) if err.is_canceled() => return Ok(()),
                Err(err) => return Err(err),
            };
            tracing::info!(
                capture_id = %info.id,
                owner_revision,
                "campaign owner successfully"
            );

            let mut owner = (self.owner_factory)(info, Arc::clone(upstream), &self.config.scheduler);
            let handle = owner.handle();
            *self.owner.lock() = Some(handle.clone());

            let mut state = ClusterState::with_owner_revision(owner_revision);
            install_peer_hooks(&mut state, router);
            let worker = CoordWorker::new(
                self.coord.clone(),
                "owner",
                self.config.owner_flush_interval(),
            );
            let result = worker.run(owner.as_mut(), &mut state, session, cancel).await;

            handle.async_stop();
            *self.owner.lock() = None;
            drop(owner);

            // Always resign, on a fresh detached context with a bounded
            // timeout, so a cancelled parent cannot skip resignation.
            match tokio::time::timeout(RESIGN_TIMEOUT, self.resign(election)).await {
                Ok(Ok(())) => {
                    tracing::info!(capture_id = %info.id, owner_revision, "owner resigned successfully");
                }
                Ok(Err(err)) => {
                    tracing::info!(capture_id = %info.id, owner_revision, error = %err,
                        "owner resign failed");
                    return Err(err);
                }
                Err(_) => {
                    tracing::warn!(capture_id = %info.id, owner_revision, "owner resign timeout");
                }
            }

            match result {
                Ok(()) => {
                    tracing::info!(capture_id = %info.id, owner_revision, "run owner exited normally");
                }
                Err(err) => {
                    tracing::warn!(capture_id = %info.id, owner_revision, error = %err,
                        "run owner exited with error");
                    return Err(err);
                }
            }
        }
    }

    async fn campaign(
        &self,
        election: &Election,
        capture_id: &str,
        cancel: &CancellationToken,
    ) -> SluiceResult<()> {
        election
            .campaign(capture_id, cancel)
            .await
            .map_err(|err| SluiceError::CampaignOwner(Box::new(err)))
    }

    async fn resign(&self, election: &Election) -> SluiceResult<()> {
        election
            .resign()
            .await
            .map_err(|err| SluiceError::ResignOwner(Box::new(err)))
    }

    /// Signal that this node should shed work and stop acquiring more.
    ///
    /// Liveness flips to `Stopping` synchronously; the owner (if any) is
    /// stopped asynchronously. The returned channel resolves once the stop
    /// has been issued; the run loop then winds down on its own.
    pub fn drain(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.liveness.store_stopping();
        let owner = self.owner.lock().clone();
        tokio::spawn(async move {
            if let Some(owner) = owner {
                owner.async_stop();
            }
            let _ = tx.send(());
        });
        rx
    }

    /// Tear down the running incarnation. Re-entrant.
    pub fn async_close(&self) {
        if let Some(cancel) = self.run_cancel.lock().take() {
            cancel.cancel();
        }

        if let Some(owner) = self.owner.lock().clone() {
            owner.async_stop();
            tracing::info!("owner closed");
        }

        let mut state = self.state.lock();
        if let Some(handle) = state.processor_handle.take() {
            handle.close();
            tracing::info!("processor manager closed");
        }

        self.service.reset(None);
        if let Some(router) = state.router.take() {
            router.close();
            tracing::info!("message router closed");
        }
    }
}

fn install_peer_hooks(state: &mut ClusterState, router: &Arc<MessageRouter>) {
    let on_added = Arc::clone(router);
    state.set_on_capture_added(Box::new(move |capture_id, addr| {
        on_added.add_peer(capture_id, addr);
    }));
    let on_removed = Arc::clone(router);
    state.set_on_capture_removed(Box::new(move |capture_id| {
        on_removed.remove_peer(capture_id);
    }));
}

/// The default owner factory: watermark aggregation plus redo management
/// for the changefeeds declared in the configuration.
pub fn default_owner_factory(config: &Config) -> OwnerFactory {
    let consistent = config.consistent.clone();
    let declared = config.changefeeds.clone();
    Arc::new(
        move |info: &CaptureInfo,
              upstream: Arc<UpstreamManager>,
              _scheduler: &crate::core::config::SchedulerConfig| {
            let owner: Box<dyn crate::owner::Owner + Send> = Box::new(ChangefeedOwner::new(
                info,
                upstream,
                consistent.clone(),
                declared.clone(),
            ));
            owner
        },
    )
}

/// The default processor-manager factory, seeded with the declared
/// changefeeds' start positions.
pub fn default_processor_factory(config: &Config) -> ProcessorManagerFactory {
    let seeds: Vec<(ChangefeedId, Ts)> = config
        .changefeeds
        .iter()
        .map(|feed| (feed.changefeed_id(), feed.start_ts))
        .collect();
    Arc::new(
        move |info: &CaptureInfo,
              upstream: Arc<UpstreamManager>,
              liveness: Arc<AtomicLiveness>,
              _scheduler: &crate::core::config::SchedulerConfig| {
            let manager: Box<dyn ProcessorManager + Send> = Box::new(ProcessorRuntime::new(
                info,
                upstream,
                liveness,
                seeds.clone(),
            ));
            manager
        },
    )
}
