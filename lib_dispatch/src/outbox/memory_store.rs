use std::sync::Mutex;

use async_trait::async_trait;

use super::{PendingRide, PendingStore};
use crate::error::StoreError;

/// Keeps entries for the lifetime of the process only.
#[derive(Debug, Default)]
pub struct MemoryPendingStore {
    entries: Mutex<Vec<PendingRide>>,
}

impl MemoryPendingStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, Vec<PendingRide>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl PendingStore for MemoryPendingStore {
    async fn put(&self, entry: &PendingRide) -> Result<(), StoreError> {
        let mut entries = self.entries();
        match entries.iter_mut().find(|e| e.local_id == entry.local_id) {
            Some(existing) => *existing = entry.clone(),
            None => entries.push(entry.clone()),
        }
        Ok(())
    }

    async fn remove(&self, local_id: &str) -> Result<bool, StoreError> {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|e| e.local_id != local_id);
        Ok(entries.len() != before)
    }

    async fn list(&self) -> Result<Vec<PendingRide>, StoreError> {
        Ok(self.entries().clone())
    }
}
