//! Persistence contracts for admission state.
//!
//! The in-memory structures are authoritative; these contracts mirror their
//! mutations into a durable store and repopulate them on process start.
//! Implementations are expected to be cheap on the write path (buffered or
//! asynchronous internally), since upserts happen inline with admission.

use std::{
    collections::HashMap,
    fmt,
    sync::Mutex,
    time::SystemTime,
};

use thiserror::Error;

use crate::greylist::GreylistEntry;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Optional mirror for rate-limit events.
pub trait RateLimitStore: Send + Sync + fmt::Debug {
    /// An event was admitted for `key`.
    fn record(&self, key: &str, at: SystemTime);

    /// Everything before `cutoff` has left the window and can be dropped.
    fn expire_before(&self, cutoff: SystemTime);
}

/// Optional mirror for greylist rows, keyed by the stable triplet hash.
pub trait GreylistStore: Send + Sync + fmt::Debug {
    fn upsert(&self, key: u64, entry: &GreylistEntry) -> Result<(), StoreError>;

    fn remove(&self, key: u64) -> Result<(), StoreError>;

    fn load(&self) -> Result<Vec<(u64, GreylistEntry)>, StoreError>;
}

/// In-process [`GreylistStore`] used by tests to exercise the
/// persist/repopulate cycle without a real backend.
#[derive(Debug, Default)]
pub struct MemoryGreylistStore {
    rows: Mutex<HashMap<u64, GreylistEntry>>,
}

impl GreylistStore for MemoryGreylistStore {
    fn upsert(&self, key: u64, entry: &GreylistEntry) -> Result<(), StoreError> {
        self.rows
            .lock()
            .map_err(|_| StoreError::Backend("rows mutex poisoned".to_string()))?
            .insert(key, entry.clone());
        Ok(())
    }

    fn remove(&self, key: u64) -> Result<(), StoreError> {
        self.rows
            .lock()
            .map_err(|_| StoreError::Backend("rows mutex poisoned".to_string()))?
            .remove(&key);
        Ok(())
    }

    fn load(&self) -> Result<Vec<(u64, GreylistEntry)>, StoreError> {
        Ok(self
            .rows
            .lock()
            .map_err(|_| StoreError::Backend("rows mutex poisoned".to_string()))?
            .iter()
            .map(|(key, entry)| (*key, entry.clone()))
            .collect())
    }
}
