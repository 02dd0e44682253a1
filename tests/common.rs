//! Common test utilities.
//!
//! Shared helpers for integration tests. Import with `mod common;` in test
//! files.

#![allow(dead_code)]

use sluice::core::config::{ChangefeedConfig, Config, ConsistentConfig};
use sluice::model::ChangefeedId;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

/// A scratch storage root and its `file://` URL.
pub fn temp_storage() -> (TempDir, String) {
    let dir = tempfile::tempdir().expect("failed to create temp directory");
    let url = format!("file://{}", dir.path().display());
    (dir, url)
}

/// A redo configuration pointing at the given storage URL.
pub fn consistent_config(storage: &str, flush_interval_in_ms: u64) -> ConsistentConfig {
    ConsistentConfig {
        level: "eventual".to_string(),
        storage: storage.to_string(),
        flush_interval_in_ms,
    }
}

/// The default changefeed used across redo tests.
pub fn orders_feed() -> ChangefeedId {
    ChangefeedId::in_default_namespace("orders")
}

/// A capture configuration tuned for fast tests: ephemeral port, 1s
/// session TTL, 10ms reactor ticks, redo disabled.
pub fn capture_config(cluster_id: &str) -> Config {
    let mut config = Config::default();
    config.server.advertise_addr = "127.0.0.1:0".to_string();
    config.server.cluster_id = cluster_id.to_string();
    config.server.capture_session_ttl = 1;
    config.server.owner_flush_interval_ms = 10;
    config.server.processor_flush_interval_ms = 10;
    config
}

/// A capture configuration that also declares one changefeed.
pub fn capture_config_with_feed(cluster_id: &str, feed_id: &str, start_ts: u64) -> Config {
    let mut config = capture_config(cluster_id);
    config.changefeeds.push(ChangefeedConfig {
        namespace: "default".to_string(),
        id: feed_id.to_string(),
        start_ts,
    });
    config
}

/// Names of all regular files under a storage root, relative to it.
pub fn list_files(root: &Path) -> Vec<String> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir).expect("failed to read storage root") {
            let entry = entry.expect("failed to read dir entry");
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else {
                files.push(
                    path.strip_prefix(root)
                        .expect("entry under root")
                        .to_string_lossy()
                        .into_owned(),
                );
            }
        }
    }
    files.sort();
    files
}

/// Poll `check` until it returns true or the timeout elapses.
pub async fn wait_for<F, Fut>(what: &str, timeout: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
