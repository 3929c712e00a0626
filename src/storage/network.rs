use super::persistence::{BlobDirectory, BlobSlot};
use super::stored::{SessionLock, StoredRecord};
use super::{
    FallbackPolicy, LoadFallback, LoadIssue, LoadIssueKind, LoadMethod, RecordStore,
    StorageBackend,
};
use crate::codec;
use crate::config::DataOptions;
use crate::core::{DataError, FieldMap, Result};
use crate::record::{Record, RecordMetadata};
use crate::signal::Signal;
use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tracing::{Level, event};
use uuid::Uuid;

#[derive(Debug, Default, Clone)]
struct BlobPair {
    primary: Option<Vec<u8>>,
    backup: Option<Vec<u8>>,
}

impl BlobPair {
    fn slot(&self, slot: BlobSlot) -> Option<&Vec<u8>> {
        match slot {
            BlobSlot::Primary => self.primary.as_ref(),
            BlobSlot::Backup => self.backup.as_ref(),
        }
    }

    fn slot_mut(&mut self, slot: BlobSlot) -> &mut Option<Vec<u8>> {
        match slot {
            BlobSlot::Primary => &mut self.primary,
            BlobSlot::Backup => &mut self.backup,
        }
    }
}

/// Serializes loads of one key. The gate entry is dropped from the map
/// once nobody else is waiting on it.
struct LoadGate<'a> {
    gates: &'a Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    key: String,
    _held: OwnedMutexGuard<()>,
}

impl Drop for LoadGate<'_> {
    fn drop(&mut self) {
        let mut gates = self.gates.lock().unwrap_or_else(|p| p.into_inner());
        // The map and `_held` account for two references.
        if gates.get(&self.key).is_some_and(|gate| Arc::strong_count(gate) <= 2) {
            gates.remove(&self.key);
        }
    }
}

/// Key-scoped record storage with session locks and backup copies.
///
/// Blobs live in memory, or in `<data_dir>/<name>/` when a data directory
/// is configured. Two networks pointed at the same directory behave like
/// two servers sharing one store.
pub struct DataNetwork {
    name: String,
    job_id: Uuid,
    default_shape: FieldMap,
    session_lock_timeout: Duration,
    memory: tokio::sync::Mutex<HashMap<String, BlobPair>>,
    directory: Option<BlobDirectory>,
    cache: Mutex<HashMap<String, Arc<Record>>>,
    load_gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    issues: Signal<LoadIssue>,
    fallback: RwLock<FallbackPolicy>,
    me: Weak<DataNetwork>,
}

impl DataNetwork {
    /// `default_shape` is in stored (plain) form.
    pub fn new(options: &DataOptions, default_shape: FieldMap) -> Arc<Self> {
        let directory = options
            .data_dir
            .as_ref()
            .map(|dir| BlobDirectory::new(dir, &options.name));
        Arc::new_cyclic(|me| Self {
            name: options.name.clone(),
            job_id: Uuid::new_v4(),
            default_shape,
            session_lock_timeout: options.session_lock_timeout_duration(),
            memory: tokio::sync::Mutex::new(HashMap::new()),
            directory,
            cache: Mutex::new(HashMap::new()),
            load_gates: Mutex::new(HashMap::new()),
            issues: Signal::new(),
            fallback: RwLock::new(Arc::new(|_: &LoadIssue| LoadFallback::Fail) as FallbackPolicy),
            me: me.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identifies this network in the session locks it writes.
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn cached_records(&self) -> Vec<Arc<Record>> {
        self.lock_cache().values().cloned().collect()
    }

    /// Raw blob access, bypassing records and locks.
    pub async fn get_raw(&self, key: &str, slot: BlobSlot) -> Result<Option<Vec<u8>>> {
        self.read_blob(key, slot).await
    }

    pub async fn put_raw(&self, key: &str, slot: BlobSlot, bytes: &[u8]) -> Result<()> {
        self.write_blob(key, slot, bytes).await
    }

    /// Reads the stored primary copy without loading a record.
    pub async fn peek(&self, key: &str) -> Result<Option<StoredRecord>> {
        match self.read_blob(key, BlobSlot::Primary).await? {
            Some(bytes) => StoredRecord::from_bytes(key, &bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Force-saves every cached active record each `interval`. The saves
    /// refresh the session locks this network holds.
    ///
    /// The task stops by itself once the network is dropped.
    pub fn spawn_autosave(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let network = Arc::downgrade(self);
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            loop {
                ticker.tick().await;
                let Some(network) = network.upgrade() else {
                    break;
                };
                let records = network.cached_records();
                event!(Level::DEBUG, network = %network.name, records = records.len(), "autosave");
                for record in records {
                    if !record.is_active() {
                        continue;
                    }
                    if let Err(err) = record.save(true).await {
                        warn!("Autosave of '{}' failed: {}", record.key(), err);
                    }
                }
            }
        })
    }

    async fn read_blob(&self, key: &str, slot: BlobSlot) -> Result<Option<Vec<u8>>> {
        match &self.directory {
            Some(directory) => directory.read(key, slot).await,
            None => Ok(self
                .memory
                .lock()
                .await
                .get(key)
                .and_then(|pair| pair.slot(slot).cloned())),
        }
    }

    async fn write_blob(&self, key: &str, slot: BlobSlot, bytes: &[u8]) -> Result<()> {
        match &self.directory {
            Some(directory) => directory.write(key, slot, bytes).await,
            None => {
                let mut memory = self.memory.lock().await;
                *memory.entry(key.to_string()).or_default().slot_mut(slot) = Some(bytes.to_vec());
                Ok(())
            }
        }
    }

    async fn remove_blobs(&self, key: &str) -> Result<()> {
        match &self.directory {
            Some(directory) => {
                directory.remove(key, BlobSlot::Primary).await?;
                directory.remove(key, BlobSlot::Backup).await
            }
            None => {
                self.memory.lock().await.remove(key);
                Ok(())
            }
        }
    }

    async fn read_stored(
        &self,
        key: &str,
        slot: BlobSlot,
    ) -> std::result::Result<Option<StoredRecord>, LoadIssue> {
        let bytes = self.read_blob(key, slot).await.map_err(|err| LoadIssue {
            key: key.to_string(),
            kind: LoadIssueKind::Error,
            reason: err.to_string(),
        })?;
        match bytes {
            Some(bytes) => StoredRecord::from_bytes(key, &bytes)
                .map(Some)
                .map_err(|err| LoadIssue {
                    key: key.to_string(),
                    kind: LoadIssueKind::Corruption,
                    reason: err.to_string(),
                }),
            None => Ok(None),
        }
    }

    /// Primary copy, or the backup when the primary is unusable and the
    /// fallback policy allows it. The flag is true for backup data.
    async fn read_with_fallback(&self, key: &str) -> Result<(Option<StoredRecord>, bool)> {
        let issue = match self.read_stored(key, BlobSlot::Primary).await {
            Ok(stored) => return Ok((stored, false)),
            Err(issue) => issue,
        };

        warn!("{}", issue);
        self.issues.fire(&issue);
        let policy = self.fallback_policy();
        let fallback = policy(&issue);

        if fallback == LoadFallback::LoadBackup {
            match self.read_stored(key, BlobSlot::Backup).await {
                Ok(Some(stored)) => {
                    info!("Loaded backup data for '{}'", key);
                    return Ok((Some(stored), true));
                }
                Ok(None) => debug!("No backup stored for '{}'", key),
                Err(backup_issue) => warn!("{}", backup_issue),
            }
        }

        Err(match issue.kind {
            LoadIssueKind::Corruption => DataError::Corrupted {
                key: issue.key,
                reason: issue.reason,
            },
            LoadIssueKind::Error => DataError::LoadFailure {
                key: issue.key,
                reason: issue.reason,
            },
        })
    }

    async fn enter_gate(&self, key: &str) -> LoadGate<'_> {
        let gate = {
            let mut gates = self.load_gates.lock().unwrap_or_else(|p| p.into_inner());
            Arc::clone(gates.entry(key.to_string()).or_default())
        };
        LoadGate {
            gates: &self.load_gates,
            key: key.to_string(),
            _held: gate.lock_owned().await,
        }
    }

    fn held_by_other(&self, lock: &SessionLock) -> bool {
        lock.job_id != self.job_id && !lock.is_stale(self.session_lock_timeout, Utc::now())
    }

    fn fallback_policy(&self) -> FallbackPolicy {
        match self.fallback.read() {
            Ok(policy) => Arc::clone(&policy),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn store_handle(&self) -> Weak<dyn RecordStore> {
        self.me.clone()
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Record>>> {
        self.cache.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl StorageBackend for DataNetwork {
    async fn load_record(
        &self,
        key: &str,
        method: LoadMethod,
        read_only: bool,
    ) -> Result<Option<Arc<Record>>> {
        if !read_only {
            if let Some(cached) = self.get_cached_record(key) {
                return Ok(Some(cached));
            }
        }

        let _gate = self.enter_gate(key).await;
        if !read_only {
            if let Some(cached) = self.get_cached_record(key) {
                return Ok(Some(cached));
            }
        }

        let (stored, backup) = self.read_with_fallback(key).await?;

        if !read_only && !backup {
            if let Some(lock) = stored.as_ref().and_then(|s| s.session.as_ref()) {
                if self.held_by_other(lock) {
                    match method {
                        LoadMethod::Cancel => {
                            info!("'{}' is locked by job {}; load cancelled", key, lock.job_id);
                            return Ok(None);
                        }
                        LoadMethod::Steal => {
                            warn!("Stealing session lock on '{}' from job {}", key, lock.job_id);
                        }
                    }
                }
            }
        }

        let plain = match &stored {
            Some(stored) => stored.fields.clone(),
            None => codec::fields_to_json(&self.default_shape)?,
        };
        let fields = codec::fields_from_json(&plain);

        let job_id = if read_only { None } else { Some(self.job_id) };
        let mut meta = RecordMetadata::new(key, job_id);
        if backup {
            meta = meta.backup();
        }
        let record = Record::new(fields, meta, self.store_handle());

        if !read_only {
            // Cached before the lock lands: if this load is cancelled midway,
            // finalizing the cached record still releases the lock.
            self.lock_cache().insert(key.to_string(), Arc::clone(&record));
            if !backup {
                let locked = StoredRecord::new(plain, Some(SessionLock::new(self.job_id)));
                let written = match locked.to_bytes() {
                    Ok(bytes) => self.write_blob(key, BlobSlot::Primary, &bytes).await,
                    Err(err) => Err(err),
                };
                if let Err(err) = written {
                    self.lock_cache().remove(key);
                    return Err(err);
                }
            }
        }

        event!(Level::DEBUG, key, backup, read_only, "record loaded");
        Ok(Some(record))
    }

    fn get_cached_record(&self, key: &str) -> Option<Arc<Record>> {
        self.lock_cache().get(key).cloned()
    }

    fn default_shape(&self) -> FieldMap {
        self.default_shape.clone()
    }

    fn load_issues(&self) -> &Signal<LoadIssue> {
        &self.issues
    }

    fn set_fallback_policy(&self, policy: FallbackPolicy) {
        match self.fallback.write() {
            Ok(mut current) => *current = policy,
            Err(poisoned) => *poisoned.into_inner() = policy,
        }
    }
}

#[async_trait]
impl RecordStore for DataNetwork {
    async fn persist(&self, key: &str, stored: StoredRecord) -> Result<()> {
        let bytes = stored.to_bytes()?;
        if let Some(previous) = self.read_blob(key, BlobSlot::Primary).await? {
            if let Ok(current) = StoredRecord::from_bytes(key, &previous) {
                if let Some(lock) = &current.session {
                    if self.held_by_other(lock) {
                        return Err(DataError::Storage(format!(
                            "session lock on '{}' is held by job {}",
                            key, lock.job_id
                        )));
                    }
                }
                // Only a readable primary is worth keeping as the backup.
                self.write_blob(key, BlobSlot::Backup, &previous).await?;
            }
        }
        self.write_blob(key, BlobSlot::Primary, &bytes).await
    }

    async fn erase(&self, key: &str) -> Result<()> {
        self.remove_blobs(key).await
    }

    async fn release(&self, key: &str, job_id: Option<Uuid>) {
        self.lock_cache().remove(key);
        let Some(job_id) = job_id else {
            return;
        };
        let mut stored = match self.peek(key).await {
            Ok(Some(stored)) => stored,
            Ok(None) => return,
            Err(err) => {
                warn!("Could not release lock on '{}': {}", key, err);
                return;
            }
        };
        if stored.session.as_ref().map(|lock| lock.job_id) != Some(job_id) {
            return;
        }
        stored.session = None;
        let result = match stored.to_bytes() {
            Ok(bytes) => self.write_blob(key, BlobSlot::Primary, &bytes).await,
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            warn!("Could not release lock on '{}': {}", key, err);
        }
    }

    fn default_shape(&self) -> FieldMap {
        self.default_shape.clone()
    }
}
