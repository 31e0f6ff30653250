use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{PendingRide, PendingStore};
use crate::error::StoreError;

/// Outbox persisted as one JSON array on disk.
///
/// Every mutation rewrites the whole file through a temporary sibling and a
/// rename, so a crash leaves either the old or the new contents.
#[derive(Debug)]
pub struct JsonFilePendingStore {
    path: PathBuf,
    // Serializes read-modify-write cycles.
    lock: Mutex<()>,
}

impl JsonFilePendingStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        self.path.with_extension("json.tmp")
    }

    async fn load(&self) -> Result<Vec<PendingRide>, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(Vec::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, entries: &[PendingRide]) -> Result<(), StoreError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        let data = serde_json::to_vec_pretty(entries)?;
        let tmp_path = self.tmp_path();

        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp_path, &self.path).await?;
        tracing::debug!(path = %self.path.display(), entries = entries.len(), "outbox saved");
        Ok(())
    }
}

#[async_trait]
impl PendingStore for JsonFilePendingStore {
    async fn put(&self, entry: &PendingRide) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;
        match entries.iter_mut().find(|e| e.local_id == entry.local_id) {
            Some(existing) => *existing = entry.clone(),
            None => entries.push(entry.clone()),
        }
        self.save(&entries).await
    }

    async fn remove(&self, local_id: &str) -> Result<bool, StoreError> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;
        let before = entries.len();
        entries.retain(|e| e.local_id != local_id);
        if entries.len() == before {
            return Ok(false);
        }
        self.save(&entries).await?;
        Ok(true)
    }

    async fn list(&self) -> Result<Vec<PendingRide>, StoreError> {
        let _guard = self.lock.lock().await;
        self.load().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::location::{LatLng, Place};
    use crate::models::ride::{NewRide, VehicleType};

    fn ride(rider: &str) -> NewRide {
        NewRide {
            rider_id: rider.to_string(),
            pickup: Place::new(LatLng::new(40.0, -73.0), None),
            destination: Place::new(LatLng::new(40.1, -73.1), Some("Airport".into())),
            fare_estimate: 23.5,
            vehicle_type: VehicleType::Economy,
        }
    }

    #[tokio::test]
    async fn missing_file_is_an_empty_outbox() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFilePendingStore::new(dir.path().join("outbox.json"));
        assert!(store.list().await.unwrap().is_empty());
        assert!(!store.remove("nope").await.unwrap());
    }

    #[tokio::test]
    async fn entries_survive_a_new_store_instance() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("outbox.json");

        let store = JsonFilePendingStore::new(&path);
        store.put(&PendingRide::new("local-1", ride("r1"))).await.unwrap();
        store.put(&PendingRide::new("local-2", ride("r2"))).await.unwrap();
        drop(store);

        let reopened = JsonFilePendingStore::new(&path);
        let ids: Vec<_> = reopened
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.local_id)
            .collect();
        assert_eq!(ids, vec!["local-1", "local-2"]);
        assert!(!reopened.tmp_path().exists());
    }

    #[tokio::test]
    async fn put_replaces_by_local_id_and_remove_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFilePendingStore::new(dir.path().join("outbox.json"));

        let mut entry = PendingRide::new("local-1", ride("r1"));
        store.put(&entry).await.unwrap();
        entry.attempts = 3;
        store.put(&entry).await.unwrap();

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].attempts, 3);

        assert!(store.remove("local-1").await.unwrap());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outbox.json");
        std::fs::write(&path, b"{not json").unwrap();

        let store = JsonFilePendingStore::new(&path);
        assert!(matches!(store.list().await, Err(StoreError::Serde(_))));
    }
}
