//! # Outbox
//!
//! Durable queue of ride requests the backend has not acknowledged yet.
//!
//! ## Core Components:
//!
//! - **`PendingStore`**: storage seam. Entries are written before the ride is
//!   reported to the caller and removed only after the backend accepted the
//!   resubmission.
//! - **`MemoryPendingStore`** / **`JsonFilePendingStore`**: in-process and
//!   file-backed implementations.
//! - **`ResyncBackoff`**: delay schedule for resubmission attempts.

#![forbid(unsafe_code)]

mod backoff;
mod file_store;
mod memory_store;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::models::ride::NewRide;

pub use backoff::ResyncBackoff;
pub use file_store::JsonFilePendingStore;
pub use memory_store::MemoryPendingStore;

/// A ride request waiting to be resubmitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRide {
    /// Client-generated id the ride is known by until the backend assigns one.
    pub local_id: String,
    pub ride: NewRide,
    pub queued_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
}

impl PendingRide {
    pub fn new(local_id: impl Into<String>, ride: NewRide) -> Self {
        Self {
            local_id: local_id.into(),
            ride,
            queued_at: Utc::now(),
            attempts: 0,
        }
    }
}

#[async_trait]
pub trait PendingStore: Send + Sync + 'static {
    /// Inserts or replaces the entry with the same `local_id`.
    async fn put(&self, entry: &PendingRide) -> Result<(), StoreError>;
    /// Returns whether an entry was removed.
    async fn remove(&self, local_id: &str) -> Result<bool, StoreError>;
    /// Entries in the order they were first queued.
    async fn list(&self) -> Result<Vec<PendingRide>, StoreError>;
}
