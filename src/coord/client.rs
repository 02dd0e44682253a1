//! Typed client over the coordination store's key schema.
//!
//! All keys live under a cluster-id prefix:
//!
//! - `capture/<id>`: serialized [`CaptureInfo`], attached to the session
//!   lease so a vanished session removes the registration atomically;
//! - `owner`: the owner's capture id, lease-attached;
//! - `owner/<id>/revision`: decimal revision assigned at acquisition;
//! - `task/<capture>/<feed>`: per-capture replication progress;
//! - `changefeed/<feed>/status`: aggregated changefeed watermarks.

use crate::core::error::{SluiceError, SluiceResult};
use crate::coord::store::{CoordStore, KeyValue, LeaseId};
use crate::model::{CaptureId, CaptureInfo, ChangefeedId};
use std::sync::Arc;

/// Key-schema client bound to one cluster id.
#[derive(Clone)]
pub struct CoordClient {
    store: Arc<CoordStore>,
    cluster_id: String,
}

impl CoordClient {
    /// Create a client for the given cluster.
    pub fn new(store: Arc<CoordStore>, cluster_id: impl Into<String>) -> Self {
        Self {
            store,
            cluster_id: cluster_id.into(),
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<CoordStore> {
        &self.store
    }

    /// The cluster id this client is scoped to.
    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    /// Root of this cluster's key space.
    pub fn base_key(&self) -> String {
        format!("/cdc/{}", self.cluster_id)
    }

    /// Key of one capture registration.
    pub fn capture_key(&self, capture_id: &str) -> String {
        format!("{}/capture/{}", self.base_key(), capture_id)
    }

    /// The owner election key.
    pub fn owner_key(&self) -> String {
        format!("{}/owner", self.base_key())
    }

    /// Key of one capture's task position for a changefeed.
    pub fn task_position_key(&self, capture_id: &str, changefeed: &ChangefeedId) -> String {
        format!(
            "{}/task/{}/{}",
            self.base_key(),
            capture_id,
            changefeed.key_path()
        )
    }

    /// Key of a changefeed's aggregated status.
    pub fn changefeed_status_key(&self, changefeed: &ChangefeedId) -> String {
        format!("{}/changefeed/{}/status", self.base_key(), changefeed.key_path())
    }

    /// Register a capture under its session lease.
    pub async fn put_capture_info(&self, info: &CaptureInfo, lease: LeaseId) -> SluiceResult<()> {
        let value = serde_json::to_vec(info).map_err(SluiceError::marshal)?;
        self.store
            .put(&self.capture_key(&info.id), value, Some(lease))?;
        Ok(())
    }

    /// Remove a capture registration.
    pub async fn delete_capture_info(&self, capture_id: &str) -> SluiceResult<()> {
        self.store.delete(&self.capture_key(capture_id));
        Ok(())
    }

    /// All currently registered captures.
    pub async fn captures(&self) -> SluiceResult<Vec<CaptureInfo>> {
        let prefix = format!("{}/capture/", self.base_key());
        let mut captures = Vec::new();
        for kv in self.store.get_prefix(&prefix) {
            captures.push(serde_json::from_slice(&kv.value).map_err(SluiceError::marshal)?);
        }
        Ok(captures)
    }

    /// The capture id currently holding the owner key, if any.
    pub async fn owner_id(&self) -> SluiceResult<Option<CaptureId>> {
        Ok(self.store.get(&self.owner_key()).map(|kv| {
            String::from_utf8_lossy(&kv.value).into_owned()
        }))
    }

    /// Revision at which `capture_id` acquired ownership.
    ///
    /// [`SluiceError::NotOwner`] when another capture holds the key,
    /// [`SluiceError::OwnerNotFound`] when nobody does.
    pub async fn owner_revision(&self, capture_id: &str) -> SluiceResult<u64> {
        let holder = self
            .store
            .get(&self.owner_key())
            .ok_or(SluiceError::OwnerNotFound)?;
        if holder.value != capture_id.as_bytes() {
            return Err(SluiceError::NotOwner);
        }
        Ok(holder.mod_revision)
    }

    /// Registration info of the current owner.
    pub async fn owner_capture_info(&self) -> SluiceResult<CaptureInfo> {
        let owner_id = self.owner_id().await?.ok_or(SluiceError::OwnerNotFound)?;
        self.captures()
            .await?
            .into_iter()
            .find(|capture| capture.id == owner_id)
            .ok_or(SluiceError::OwnerNotFound)
    }

    /// Snapshot of every key under this cluster's prefix.
    pub fn snapshot(&self) -> Vec<KeyValue> {
        self.store.get_prefix(&format!("{}/", self.base_key()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn info(id: &str) -> CaptureInfo {
        CaptureInfo {
            id: id.into(),
            advertise_addr: "127.0.0.1:8300".into(),
            version: "test".into(),
        }
    }

    #[tokio::test]
    async fn registration_round_trips() {
        let store = CoordStore::new();
        let client = CoordClient::new(Arc::clone(&store), "main");
        let lease = store.grant_lease(Duration::from_secs(60));

        client.put_capture_info(&info("cap-1"), lease).await.unwrap();
        client.put_capture_info(&info("cap-2"), lease).await.unwrap();

        let mut captures = client.captures().await.unwrap();
        captures.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(captures.len(), 2);
        assert_eq!(captures[0].id, "cap-1");

        client.delete_capture_info("cap-1").await.unwrap();
        assert_eq!(client.captures().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn registration_vanishes_with_its_lease() {
        let store = CoordStore::new();
        let client = CoordClient::new(Arc::clone(&store), "main");
        let lease = store.grant_lease(Duration::from_secs(60));

        client.put_capture_info(&info("cap-1"), lease).await.unwrap();
        store.revoke_lease(lease).unwrap();
        assert!(client.captures().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn owner_revision_distinguishes_holder_and_stranger() {
        let store = CoordStore::new();
        let client = CoordClient::new(Arc::clone(&store), "main");

        assert!(matches!(
            client.owner_revision("cap-1").await,
            Err(SluiceError::OwnerNotFound)
        ));

        let revision = store
            .put(&client.owner_key(), b"cap-1".to_vec(), None)
            .unwrap();
        assert_eq!(client.owner_revision("cap-1").await.unwrap(), revision);
        assert!(matches!(
            client.owner_revision("cap-2").await,
            Err(SluiceError::NotOwner)
        ));
        assert_eq!(client.owner_id().await.unwrap().as_deref(), Some("cap-1"));
    }

    #[tokio::test]
    async fn owner_capture_info_joins_election_and_registry() {
        let store = CoordStore::new();
        let client = CoordClient::new(Arc::clone(&store), "main");
        let lease = store.grant_lease(Duration::from_secs(60));

        client.put_capture_info(&info("cap-1"), lease).await.unwrap();
        store
            .put(&client.owner_key(), b"cap-1".to_vec(), Some(lease))
            .unwrap();

        let owner = client.owner_capture_info().await.unwrap();
        assert_eq!(owner.id, "cap-1");
    }
}
