use crate::core::{DataError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::time::Duration;
use uuid::Uuid;

pub const STORED_FORMAT_VERSION: u32 = 1;

/// Exclusive-access lease on a stored record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionLock {
    pub job_id: Uuid,
    pub locked_at: DateTime<Utc>,
}

impl SessionLock {
    pub fn new(job_id: Uuid) -> Self {
        Self {
            job_id,
            locked_at: Utc::now(),
        }
    }

    pub fn is_stale(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.locked_at);
        match chrono::Duration::from_std(timeout) {
            Ok(limit) => age > limit,
            Err(_) => false,
        }
    }
}

/// The persisted form of one record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRecord {
    #[serde(default = "default_format_version")]
    pub version: u32,
    pub fields: JsonMap<String, JsonValue>,
    #[serde(default)]
    pub session: Option<SessionLock>,
    pub saved_at: DateTime<Utc>,
}

fn default_format_version() -> u32 {
    STORED_FORMAT_VERSION
}

impl StoredRecord {
    pub fn new(fields: JsonMap<String, JsonValue>, session: Option<SessionLock>) -> Self {
        Self {
            version: STORED_FORMAT_VERSION,
            fields,
            session,
            saved_at: Utc::now(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(DataError::from)
    }

    /// Parses a stored blob. Anything that is not a well-formed record
    /// document is reported as corruption.
    pub fn from_bytes(key: &str, bytes: &[u8]) -> Result<Self> {
        let stored: StoredRecord =
            serde_json::from_slice(bytes).map_err(|err| DataError::Corrupted {
                key: key.to_string(),
                reason: err.to_string(),
            })?;
        if stored.version > STORED_FORMAT_VERSION {
            return Err(DataError::Corrupted {
                key: key.to_string(),
                reason: format!(
                    "stored format version {} is newer than supported {}",
                    stored.version, STORED_FORMAT_VERSION
                ),
            });
        }
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_garbage_is_corruption() {
        let err = StoredRecord::from_bytes("k", b"{not json").unwrap_err();
        assert!(matches!(err, DataError::Corrupted { ref key, .. } if key == "k"));
    }

    #[test]
    fn test_future_version_is_corruption() {
        let mut stored = StoredRecord::new(JsonMap::new(), None);
        stored.version = STORED_FORMAT_VERSION + 1;
        let bytes = stored.to_bytes().unwrap();
        assert!(StoredRecord::from_bytes("k", &bytes).is_err());
    }

    #[test]
    fn test_lock_staleness() {
        let lock = SessionLock::new(Uuid::new_v4());
        let later = lock.locked_at + chrono::Duration::seconds(120);
        assert!(lock.is_stale(Duration::from_secs(60), later));
        assert!(!lock.is_stale(Duration::from_secs(600), later));
    }
}
