//! Owner-side redo meta manager.
//!
//! Tracks the durable `(checkpoint_ts, resolved_ts)` pair of one changefeed
//! on external storage and garbage-collects redo log files that fell behind
//! the checkpoint. The pair is the recovery barrier of the changefeed: a
//! restarted sink resumes from the flushed checkpoint and replays up to the
//! flushed resolved timestamp.

use crate::core::config::ConsistentConfig;
use crate::core::error::{SluiceError, SluiceResult};
use crate::model::{CaptureId, ChangefeedId, Ts};
use crate::redo::meta::{
    changefeed_matcher, deletion_marker, meta_file_name, parse_log_file_name, reduce_metas,
    LogFileType, LogMeta, DELETION_MARKER_CONTENT, LOG_EXT, META_EXT,
};
use crate::redo::stateful_ts::StatefulTs;
use crate::storage::external::{delete_files, open_storage, remove_files_if, ExternalStorage};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Period of the garbage-collection loop.
pub const DEFAULT_GC_INTERVAL_MS: u64 = 5000;

/// How long the meta may sit unchanged before the flush loop suspects a
/// stuck owner and warns.
pub const FLUSH_WARN_DURATION: Duration = Duration::from_secs(60);

/// Durable watermark manager for one changefeed.
///
/// `run` drives two background loops (meta flush and log GC) under one
/// error group; the first error cancels the other loop and surfaces to the
/// capture, which restarts.
pub struct MetaManager {
    capture_id: CaptureId,
    changefeed: ChangefeedId,
    enabled: bool,

    checkpoint_ts: StatefulTs,
    resolved_ts: StatefulTs,
    /// Snapshot of the last durably flushed pair; guarded as one value so
    /// readers never observe fields from different flush generations.
    flushed: Mutex<LogMeta>,

    storage: Option<Arc<dyn ExternalStorage>>,
    /// Meta file written by the previous flush generation. Touched only by
    /// the flush loop.
    pre_meta_file: Mutex<Option<String>>,

    last_flush: Mutex<Instant>,
    flush_interval: Duration,
    gc_interval: Duration,
}

impl MetaManager {
    /// Create a manager without touching storage.
    ///
    /// `level = "none"` yields a disabled manager whose operations all
    /// no-op. The `blackhole` scheme yields an enabled manager whose
    /// storage accepts everything and holds nothing.
    pub fn new(
        capture_id: CaptureId,
        changefeed: ChangefeedId,
        cfg: &ConsistentConfig,
    ) -> SluiceResult<Self> {
        let (enabled, storage) = if cfg.is_enabled() {
            (true, Some(open_storage(&cfg.storage)?))
        } else {
            (false, None)
        };

        Ok(Self {
            capture_id,
            changefeed,
            enabled,
            checkpoint_ts: StatefulTs::new(),
            resolved_ts: StatefulTs::new(),
            flushed: Mutex::new(LogMeta::default()),
            storage,
            pre_meta_file: Mutex::new(None),
            last_flush: Mutex::new(Instant::now()),
            flush_interval: cfg.flush_interval(),
            gc_interval: Duration::from_millis(DEFAULT_GC_INTERVAL_MS),
        })
    }

    /// Create a manager and initialize the meta from storage.
    ///
    /// Recovers from interrupted cleanups (deletion marker) and interrupted
    /// flushes (multiple meta files), seeds the watermarks with the reduced
    /// recovery point, and force-flushes it.
    pub async fn new_with_init(
        capture_id: CaptureId,
        changefeed: ChangefeedId,
        cfg: &ConsistentConfig,
        start_ts: Ts,
    ) -> SluiceResult<Self> {
        let manager = Self::new(capture_id, changefeed, cfg)?;
        if manager.storage.is_some() {
            if let Err(err) = manager.pre_cleanup().await {
                tracing::warn!(
                    changefeed = %manager.changefeed,
                    error = %err,
                    "pre-clean of redo logs failed"
                );
                return Err(err);
            }
            if let Err(err) = manager.init_meta(start_ts).await {
                tracing::warn!(
                    changefeed = %manager.changefeed,
                    error = %err,
                    "init redo meta failed"
                );
                return Err(err);
            }
        }
        Ok(manager)
    }

    /// Whether the redo subsystem is enabled for this changefeed.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// The changefeed this manager serves.
    pub fn changefeed(&self) -> &ChangefeedId {
        &self.changefeed
    }

    /// Advance the unflushed watermarks. Never blocks and never fails.
    ///
    /// Each field is check-and-set independently; a regression is logged
    /// and dropped while the other field still advances.
    pub fn update_meta(&self, checkpoint_ts: Ts, resolved_ts: Ts) {
        if !self.resolved_ts.check_and_set_unflushed(resolved_ts) {
            tracing::warn!(
                current = self.resolved_ts.flushed(),
                received = resolved_ts,
                changefeed = %self.changefeed,
                "dropping regressed resolved ts"
            );
        }
        if !self.checkpoint_ts.check_and_set_unflushed(checkpoint_ts) {
            tracing::warn!(
                current = self.checkpoint_ts.flushed(),
                received = checkpoint_ts,
                changefeed = %self.changefeed,
                "dropping regressed checkpoint ts"
            );
        }
    }

    /// The durably persisted pair, both fields from the same generation.
    pub fn flushed_meta(&self) -> LogMeta {
        *self.flushed.lock()
    }

    /// Run the flush and GC loops until cancellation or first error.
    pub async fn run(&self, cancel: CancellationToken) -> SluiceResult<()> {
        if !self.enabled || self.storage.is_none() {
            tracing::warn!(
                changefeed = %self.changefeed,
                "redo meta manager has no storage, skip running"
            );
            return Ok(());
        }
        *self.last_flush.lock() = Instant::now();
        tokio::try_join!(self.bg_flush_meta(&cancel), self.bg_gc(&cancel)).map(|_| ())
    }

    /// Remove every redo object of this changefeed.
    ///
    /// Called when the changefeed is dropped. Writes the deletion marker
    /// first so a crash mid-sweep is recovered by the next startup.
    pub async fn cleanup(&self) -> SluiceResult<()> {
        let Some(storage) = self.storage.as_ref() else {
            return Ok(());
        };

        let marker = deletion_marker(&self.changefeed);
        storage
            .write_file(&marker, DELETION_MARKER_CONTENT)
            .await?;
        tracing::info!(changefeed = %self.changefeed, "wrote redo deletion marker");

        let matcher = changefeed_matcher(&self.changefeed);
        remove_files_if(storage.as_ref(), |path| {
            path != marker && path.contains(&matcher)
        })
        .await?;
        Ok(())
    }

    /// Recover the meta from storage and force-flush the resume point.
    async fn init_meta(&self, start_ts: Ts) -> SluiceResult<()> {
        let storage = self.storage.as_ref().expect("storage checked by caller");
        let matcher = changefeed_matcher(&self.changefeed);

        let mut metas = vec![LogMeta {
            checkpoint_ts: start_ts,
            resolved_ts: start_ts,
        }];
        let mut stale_files = Vec::new();

        let entries = storage.walk_dir(None).await.map_err(wrap_init)?;
        for entry in entries {
            if !entry.path.ends_with(META_EXT) || !entry.path.contains(&matcher) {
                continue;
            }
            stale_files.push(entry.path.clone());
            match storage.read_file(&entry.path).await {
                Ok(data) if !data.is_empty() => {
                    metas.push(LogMeta::decode(&data).map_err(wrap_init)?);
                }
                Ok(_) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(wrap_init(err)),
            }
        }

        let merged = reduce_metas(&metas);
        if merged.checkpoint_ts == 0 || merged.resolved_ts == 0 {
            panic!(
                "redo meta initialized with zero watermark: checkpoint_ts={} resolved_ts={}",
                merged.checkpoint_ts, merged.resolved_ts
            );
        }
        self.resolved_ts.check_and_set_unflushed(merged.resolved_ts);
        self.checkpoint_ts
            .check_and_set_unflushed(merged.checkpoint_ts);

        self.maybe_flush().await.map_err(wrap_init)?;
        delete_files(storage.as_ref(), &stale_files).await
    }

    /// Finish an interrupted cleanup if its marker is present.
    async fn pre_cleanup(&self) -> SluiceResult<()> {
        let storage = self.storage.as_ref().expect("storage checked by caller");
        let marker = deletion_marker(&self.changefeed);
        if !storage.file_exists(&marker).await? {
            return Ok(());
        }
        tracing::info!(
            changefeed = %self.changefeed,
            "found redo deletion marker, sweeping leftover files"
        );

        let matcher = changefeed_matcher(&self.changefeed);
        remove_files_if(storage.as_ref(), |path| {
            path != marker && path.contains(&matcher)
        })
        .await?;

        match storage.delete_file(&marker).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Flush the unflushed pair if any field advanced since the last flush.
    async fn maybe_flush(&self) -> SluiceResult<()> {
        let (has_change, unflushed) = self.prepare_flush();
        if !has_change {
            let idle = self.last_flush.lock().elapsed();
            if idle > FLUSH_WARN_DURATION {
                tracing::warn!(
                    changefeed = %self.changefeed,
                    idle_secs = idle.as_secs(),
                    checkpoint_ts = unflushed.checkpoint_ts,
                    resolved_ts = unflushed.resolved_ts,
                    "redo meta unchanged for a long time, owner may be stuck"
                );
            }
            return Ok(());
        }

        tracing::debug!(
            changefeed = %self.changefeed,
            checkpoint_ts = unflushed.checkpoint_ts,
            resolved_ts = unflushed.resolved_ts,
            "flushing redo meta"
        );
        self.flush(unflushed).await?;
        self.post_flush(unflushed);
        *self.last_flush.lock() = Instant::now();
        Ok(())
    }

    fn prepare_flush(&self) -> (bool, LogMeta) {
        let flushed = LogMeta {
            checkpoint_ts: self.checkpoint_ts.flushed(),
            resolved_ts: self.resolved_ts.flushed(),
        };
        let unflushed = LogMeta {
            checkpoint_ts: self.checkpoint_ts.unflushed(),
            resolved_ts: self.resolved_ts.unflushed(),
        };
        let has_change = flushed.checkpoint_ts < unflushed.checkpoint_ts
            || flushed.resolved_ts < unflushed.resolved_ts;
        (has_change, unflushed)
    }

    /// Publish a flushed pair. Called only after the write succeeded.
    fn post_flush(&self, meta: LogMeta) {
        self.resolved_ts.set_flushed(meta.resolved_ts);
        self.checkpoint_ts.set_flushed(meta.checkpoint_ts);
        *self.flushed.lock() = meta;
    }

    /// Write a new uuid-named meta file, then delete the previous one.
    ///
    /// A crash between the two steps leaves two files; `init_meta` resolves
    /// that idempotently by max-reduction.
    async fn flush(&self, meta: LogMeta) -> SluiceResult<()> {
        let storage = self.storage.as_ref().expect("storage checked by caller");
        let start = Instant::now();

        let data = meta.encode()?;
        let meta_file = meta_file_name(&self.capture_id, &self.changefeed);
        storage.write_file(&meta_file, &data).await?;

        let previous = self.pre_meta_file.lock().replace(meta_file.clone());
        if let Some(previous) = previous {
            if previous != meta_file {
                match storage.delete_file(&previous).await {
                    Ok(()) => {}
                    Err(err) if err.is_not_found() => {}
                    Err(err) => return Err(err),
                }
            }
        }

        tracing::debug!(
            meta_file = %meta_file,
            cost_ms = start.elapsed().as_millis() as u64,
            "flushed redo meta to storage"
        );
        Ok(())
    }

    async fn bg_flush_meta(&self, cancel: &CancellationToken) -> SluiceResult<()> {
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(changefeed = %self.changefeed, "redo meta flush loop exits");
                    return Err(SluiceError::Canceled);
                }
                _ = ticker.tick() => {
                    self.maybe_flush().await?;
                }
            }
        }
    }

    async fn bg_gc(&self, cancel: &CancellationToken) -> SluiceResult<()> {
        let mut ticker = tokio::time::interval(self.gc_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut pre_checkpoint: Ts = 0;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(changefeed = %self.changefeed, "redo gc loop exits");
                    return Err(SluiceError::Canceled);
                }
                _ = ticker.tick() => {
                    let checkpoint = self.checkpoint_ts.flushed();
                    if checkpoint == pre_checkpoint {
                        continue;
                    }
                    pre_checkpoint = checkpoint;
                    tracing::debug!(
                        changefeed = %self.changefeed,
                        checkpoint_ts = checkpoint,
                        "redo gc triggered"
                    );
                    if let Err(err) = self.gc_stale_logs(checkpoint).await {
                        tracing::warn!(
                            changefeed = %self.changefeed,
                            error = %err,
                            "redo log gc failed"
                        );
                        return Err(err);
                    }
                }
            }
        }
    }

    /// Remove every log file of this changefeed whose highest commit
    /// timestamp fell behind `checkpoint_ts`.
    pub async fn gc_stale_logs(&self, checkpoint_ts: Ts) -> SluiceResult<()> {
        let Some(storage) = self.storage.as_ref() else {
            return Ok(());
        };
        remove_files_if(storage.as_ref(), |path| {
            self.should_remove(path, checkpoint_ts)
        })
        .await?;
        Ok(())
    }

    fn should_remove(&self, path: &str, checkpoint_ts: Ts) -> bool {
        let matcher = changefeed_matcher(&self.changefeed);
        if !path.contains(&matcher) || !path.ends_with(LOG_EXT) {
            return false;
        }

        let (commit_ts, file_type) = match parse_log_file_name(path) {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::error!(path = %path, error = %err, "failed to parse redo log file name");
                return false;
            }
        };
        if LogFileType::parse(&file_type).is_none() {
            panic!("unknown redo log file type {file_type:?} in {path:?}");
        }

        // A file at the checkpoint boundary is retained: a DDL with that
        // commit timestamp may still be executing in the owner.
        commit_ts < checkpoint_ts
    }
}

fn wrap_init(err: SluiceError) -> SluiceError {
    SluiceError::RedoMetaInitialize(Box::new(err))
}
