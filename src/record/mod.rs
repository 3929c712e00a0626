// ============================================================================
// Record
// ============================================================================
//
// In-memory state for one storage key while it is checked out by a session.
//
// Lifecycle:
// ```text
// loaded ──set/set_table/wipe/save──> loaded ──clear──> cleared (terminal)
// ```
//
// A cleared record rejects every mutation and is never saved again.
// Field state sits behind a std mutex that is never held across an await
// or while a signal fires; saves, clears and wipes are serialized by a
// separate async lock.
//
// ============================================================================

use crate::codec;
use crate::core::{DataError, FieldMap, FieldValue, Result};
use crate::signal::Signal;
use crate::storage::{RecordStore, SessionLock, StoredRecord};
use chrono::{DateTime, Utc};
use log::debug;
use std::sync::{Arc, Mutex, Weak};
use uuid::Uuid;

/// Payload of [`Record::updates`].
#[derive(Debug, Clone, PartialEq)]
pub struct FieldUpdate {
    /// Last segment of `path`.
    pub key: String,
    pub path: Vec<String>,
    pub value: FieldValue,
}

#[derive(Debug, Clone)]
pub struct RecordMetadata {
    pub key: String,
    pub loaded: bool,
    pub updated: bool,
    pub cleared: bool,
    pub backup: bool,
    pub read_only: bool,
    pub session_job_id: Option<Uuid>,
    pub loaded_at: DateTime<Utc>,
    pub saved_at: Option<DateTime<Utc>>,
}

impl RecordMetadata {
    pub fn new(key: &str, session_job_id: Option<Uuid>) -> Self {
        Self {
            key: key.to_string(),
            loaded: true,
            updated: false,
            cleared: false,
            backup: false,
            read_only: session_job_id.is_none(),
            session_job_id,
            loaded_at: Utc::now(),
            saved_at: None,
        }
    }

    pub fn backup(mut self) -> Self {
        self.backup = true;
        self
    }
}

struct RecordState {
    fields: FieldMap,
    meta: RecordMetadata,
    revision: u64,
    saved_revision: u64,
}

impl RecordState {
    fn touch(&mut self) {
        self.revision += 1;
        self.meta.updated = true;
    }

    fn ensure_mutable(&self) -> Result<()> {
        if self.meta.cleared {
            return Err(DataError::RecordCleared(self.meta.key.clone()));
        }
        if self.meta.read_only {
            return Err(DataError::ReadOnly(self.meta.key.clone()));
        }
        Ok(())
    }
}

pub struct Record {
    key: String,
    state: Mutex<RecordState>,
    io: tokio::sync::Mutex<()>,
    store: Weak<dyn RecordStore>,
    updates: Signal<FieldUpdate>,
    saves: Signal<bool>,
    wipes: Signal<bool>,
    clears: Signal<()>,
}

impl Record {
    pub(crate) fn new(fields: FieldMap, meta: RecordMetadata, store: Weak<dyn RecordStore>) -> Arc<Self> {
        Arc::new(Self {
            key: meta.key.clone(),
            state: Mutex::new(RecordState {
                fields,
                meta,
                revision: 0,
                saved_revision: 0,
            }),
            io: tokio::sync::Mutex::new(()),
            store,
            updates: Signal::new(),
            saves: Signal::new(),
            wipes: Signal::new(),
            clears: Signal::new(),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn get(&self, field: &str) -> Option<FieldValue> {
        self.lock_state().fields.get(field).cloned()
    }

    pub fn fields(&self) -> FieldMap {
        self.lock_state().fields.clone()
    }

    pub fn metadata(&self) -> RecordMetadata {
        self.lock_state().meta.clone()
    }

    pub fn is_active(&self) -> bool {
        !self.lock_state().meta.cleared
    }

    pub fn is_backup(&self) -> bool {
        self.lock_state().meta.backup
    }

    pub fn is_updated(&self) -> bool {
        self.lock_state().meta.updated
    }

    /// Fired after every `set` / `set_table`.
    pub fn updates(&self) -> &Signal<FieldUpdate> {
        &self.updates
    }

    /// Fired after a save with the record's backup flag.
    pub fn saves(&self) -> &Signal<bool> {
        &self.saves
    }

    /// Fired after a wipe with the record's former backup flag.
    pub fn wipes(&self) -> &Signal<bool> {
        &self.wipes
    }

    pub fn clears(&self) -> &Signal<()> {
        &self.clears
    }

    /// Replaces a top-level field.
    pub fn set(&self, field: &str, value: impl Into<FieldValue>) -> Result<()> {
        let value = value.into();
        {
            let mut state = self.state.lock()?;
            state.ensure_mutable()?;
            state.fields.insert(field.to_string(), value.clone());
            state.touch();
        }
        self.updates.fire(&FieldUpdate {
            key: field.to_string(),
            path: vec![field.to_string()],
            value,
        });
        Ok(())
    }

    /// Sets a nested field, e.g. `set_table(100, &["Inventory", "Coins"])`.
    /// Missing intermediate maps are created.
    pub fn set_table(&self, value: impl Into<FieldValue>, path: &[&str]) -> Result<()> {
        let Some((last, parents)) = path.split_last() else {
            return Err(DataError::InvalidPath("empty path".to_string()));
        };
        let value = value.into();
        {
            let mut state = self.state.lock()?;
            state.ensure_mutable()?;
            let mut target = &mut state.fields;
            for (depth, segment) in parents.iter().enumerate() {
                let entry = target
                    .entry(segment.to_string())
                    .or_insert_with(|| FieldValue::Map(FieldMap::new()));
                target = entry.as_map_mut().ok_or_else(|| {
                    DataError::InvalidPath(format!(
                        "'{}' is not a map",
                        path[..=depth].join(".")
                    ))
                })?;
            }
            target.insert(last.to_string(), value.clone());
            state.touch();
        }
        self.updates.fire(&FieldUpdate {
            key: last.to_string(),
            path: path.iter().map(|s| s.to_string()).collect(),
            value,
        });
        Ok(())
    }

    /// Adds every field of `template` the record lacks, descending into
    /// nested maps. Existing values are never touched.
    pub fn reconcile(&self, template: &FieldMap) -> Result<()> {
        let mut state = self.state.lock()?;
        if state.meta.cleared {
            return Err(DataError::RecordCleared(self.key.clone()));
        }
        if fill_missing(&mut state.fields, template) {
            state.touch();
        }
        Ok(())
    }

    /// Encodes poses and colors in place.
    pub fn serialize(&self) -> Result<()> {
        let mut state = self.state.lock()?;
        codec::serialize_record(&mut state.fields);
        Ok(())
    }

    /// Decodes stored pose/color shapes in place; all-or-nothing.
    pub fn deserialize(&self) -> Result<()> {
        let mut state = self.state.lock()?;
        codec::deserialize_record(&mut state.fields)
    }

    /// Saves the record. Without `force` nothing happens unless a field
    /// changed since the last save. Read-only and backup records are never
    /// written.
    pub async fn save(&self, force: bool) -> Result<()> {
        let _io = self.io.lock().await;
        let (stored, revision) = {
            let state = self.state.lock()?;
            if state.meta.cleared {
                return Err(DataError::RecordCleared(self.key.clone()));
            }
            if state.meta.read_only || state.meta.backup {
                debug!("skipping save of '{}' (read-only or backup)", self.key);
                return Ok(());
            }
            if !state.meta.updated && !force {
                return Ok(());
            }
            (self.stored_form(&state, true)?, state.revision)
        };

        self.store()?.persist(&self.key, stored).await?;

        {
            let mut state = self.state.lock()?;
            state.saved_revision = revision;
            state.meta.updated = state.revision != revision;
            state.meta.saved_at = Some(Utc::now());
        }
        self.saves.fire(&false);
        Ok(())
    }

    /// Finalizes the record: one last save, then cleared and the session
    /// lock released. Calling it again does nothing.
    pub async fn clear(&self) -> Result<()> {
        self.finish(true).await
    }

    /// Like [`clear`](Self::clear) without the final save.
    pub async fn discard(&self) -> Result<()> {
        self.finish(false).await
    }

    async fn finish(&self, save: bool) -> Result<()> {
        let _io = self.io.lock().await;
        let (stored, job_id, read_only) = {
            let mut state = self.state.lock()?;
            if state.meta.cleared {
                return Ok(());
            }
            state.meta.cleared = true;
            let writable = save && !state.meta.read_only && !state.meta.backup;
            let stored = if writable {
                Some(self.stored_form(&state, false)?)
            } else {
                None
            };
            (stored, state.meta.session_job_id, state.meta.read_only)
        };

        let store = self.store()?;
        let persisted = match stored {
            Some(stored) => store.persist(&self.key, stored).await,
            None => Ok(()),
        };
        if !read_only {
            store.release(&self.key, job_id).await;
        }
        if persisted.is_ok() {
            if let Ok(mut state) = self.state.lock() {
                state.meta.updated = false;
                state.meta.saved_at = Some(Utc::now());
            }
        }
        self.clears.fire(&());
        persisted
    }

    /// Erases the stored record and resets the fields to the default shape.
    /// Backup records are only wiped with `force`.
    pub async fn wipe(&self, force: bool) -> Result<()> {
        let _io = self.io.lock().await;
        let was_backup = {
            let state = self.state.lock()?;
            state.ensure_mutable()?;
            if state.meta.backup && !force {
                return Err(DataError::BackupRecord(self.key.clone()));
            }
            state.meta.backup
        };

        let store = self.store()?;
        store.erase(&self.key).await?;
        let mut defaults = store.default_shape();
        codec::deserialize_record(&mut defaults)?;

        {
            let mut state = self.state.lock()?;
            state.fields = defaults;
            state.meta.backup = false;
            state.touch();
        }
        self.wipes.fire(&was_backup);
        Ok(())
    }

    /// Turns backup data into regular data so it can be saved again.
    pub fn clear_backup(&self) -> Result<()> {
        let mut state = self.state.lock()?;
        if state.meta.backup {
            state.meta.backup = false;
            state.touch();
        }
        Ok(())
    }

    fn stored_form(&self, state: &RecordState, keep_lock: bool) -> Result<StoredRecord> {
        let fields = codec::fields_to_json(&state.fields)?;
        let session = if keep_lock {
            state.meta.session_job_id.map(SessionLock::new)
        } else {
            None
        };
        Ok(StoredRecord::new(fields, session))
    }

    fn store(&self) -> Result<Arc<dyn RecordStore>> {
        self.store
            .upgrade()
            .ok_or_else(|| DataError::Storage(format!("storage for '{}' is gone", self.key)))
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, RecordState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl std::fmt::Debug for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock_state();
        f.debug_struct("Record")
            .field("key", &self.key)
            .field("fields", &state.fields)
            .field("cleared", &state.meta.cleared)
            .field("backup", &state.meta.backup)
            .finish()
    }
}

fn fill_missing(fields: &mut FieldMap, template: &FieldMap) -> bool {
    let mut changed = false;
    for (name, default) in template {
        match fields.get_mut(name) {
            None => {
                fields.insert(name.clone(), default.clone());
                changed = true;
            }
            Some(FieldValue::Map(existing)) => {
                if let FieldValue::Map(nested) = default {
                    // Stored pose/color shapes are complete values, not
                    // partial maps to top up.
                    if !is_stored_shape(nested) {
                        changed |= fill_missing(existing, nested);
                    }
                }
            }
            Some(_) => {}
        }
    }
    changed
}

fn is_stored_shape(map: &FieldMap) -> bool {
    map.contains_key(codec::shapes::RED) || map.contains_key(codec::shapes::POSITION)
}
