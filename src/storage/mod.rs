// ============================================================================
// Storage Backend
// ============================================================================
//
// `StorageBackend` is what the lifecycle manager consumes: async record
// loads, cache lookups, finalization and load-issue signalling.
// `RecordStore` is what a live `Record` calls back into when it saves,
// clears or wipes itself.
//
// `DataNetwork` implements both over key-scoped JSON blobs kept in memory
// and optionally mirrored to a directory.
//
// ============================================================================

pub mod network;
pub mod persistence;
pub mod stored;

pub use network::DataNetwork;
pub use persistence::{BlobDirectory, BlobSlot};
pub use stored::{SessionLock, StoredRecord};

use crate::core::{FieldMap, Result};
use crate::record::Record;
use crate::signal::Signal;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// How a load treats a session lock held by another job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadMethod {
    /// Give up and report the record as absent.
    Cancel,
    /// Take the lock over.
    #[default]
    Steal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadIssueKind {
    Corruption,
    Error,
}

/// Fired on [`StorageBackend::load_issues`] when a stored record cannot be
/// read as-is.
#[derive(Debug, Clone)]
pub struct LoadIssue {
    pub key: String,
    pub kind: LoadIssueKind,
    pub reason: String,
}

impl fmt::Display for LoadIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            LoadIssueKind::Corruption => "corruption",
            LoadIssueKind::Error => "error",
        };
        write!(f, "{} while loading '{}': {}", kind, self.key, self.reason)
    }
}

/// Reaction to a [`LoadIssue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadFallback {
    LoadBackup,
    Fail,
}

pub type FallbackPolicy = Arc<dyn Fn(&LoadIssue) -> LoadFallback + Send + Sync>;

#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Loads the record for `key`, or returns the cached one.
    ///
    /// `Ok(None)` means the record is unavailable (for instance locked by
    /// another job under [`LoadMethod::Cancel`]).
    async fn load_record(
        &self,
        key: &str,
        method: LoadMethod,
        read_only: bool,
    ) -> Result<Option<Arc<Record>>>;

    /// Cache lookup only; never performs I/O.
    fn get_cached_record(&self, key: &str) -> Option<Arc<Record>>;

    /// Marks the record terminal and saves it.
    async fn finalize_record(&self, record: &Arc<Record>) -> Result<()> {
        record.clear().await
    }

    /// Canonical default record shape, in stored (plain) form.
    fn default_shape(&self) -> FieldMap;

    fn load_issues(&self) -> &Signal<LoadIssue>;

    fn set_fallback_policy(&self, policy: FallbackPolicy);
}

/// Callbacks a [`Record`] uses to reach its storage.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Writes `stored` as the primary copy of `key`.
    async fn persist(&self, key: &str, stored: StoredRecord) -> Result<()>;

    /// Removes every stored copy of `key`.
    async fn erase(&self, key: &str) -> Result<()>;

    /// Evicts `key` from the cache and drops the session lock held by
    /// `job_id`, if any.
    async fn release(&self, key: &str, job_id: Option<Uuid>);

    fn default_shape(&self) -> FieldMap;
}
