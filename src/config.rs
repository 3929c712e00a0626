use crate::core::{DataError, Result};
use crate::storage::LoadMethod;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_PREFIX: &str = "playerOfIndex[";
pub const DEFAULT_SUFFIX: &str = "]";

/// Options for one data network and the sessions built on top of it.
///
/// Loadable from JSON; every field is optional there:
///
/// ```json
/// { "name": "PlayerData", "min_account_age_days": 3, "load_method": "cancel" }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataOptions {
    /// Network name; also the subdirectory under `data_dir`
    pub name: String,

    /// Storage key prefix
    pub prefix: String,

    /// Storage key suffix
    pub suffix: String,

    /// Accounts younger than this are refused
    pub min_account_age_days: u32,

    /// What a load does when another job holds the session lock
    pub load_method: LoadMethod,

    /// Locks older than this are treated as abandoned
    pub session_lock_timeout_secs: u64,

    /// Autosave period; `None` disables autosave
    pub autosave_interval_secs: Option<u64>,

    /// Mirror records to JSON files under this directory
    pub data_dir: Option<PathBuf>,
}

impl Default for DataOptions {
    fn default() -> Self {
        Self {
            name: "PlayerData".to_string(),
            prefix: DEFAULT_PREFIX.to_string(),
            suffix: DEFAULT_SUFFIX.to_string(),
            min_account_age_days: 7,
            load_method: LoadMethod::Steal,
            session_lock_timeout_secs: 30 * 60,
            autosave_interval_secs: Some(60),
            data_dir: None,
        }
    }
}

impl DataOptions {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_string();
        self
    }

    pub fn suffix(mut self, suffix: &str) -> Self {
        self.suffix = suffix.to_string();
        self
    }

    pub fn min_account_age_days(mut self, days: u32) -> Self {
        self.min_account_age_days = days;
        self
    }

    pub fn load_method(mut self, method: LoadMethod) -> Self {
        self.load_method = method;
        self
    }

    pub fn session_lock_timeout(mut self, timeout: Duration) -> Self {
        self.session_lock_timeout_secs = timeout.as_secs();
        self
    }

    pub fn autosave_interval(mut self, interval: Option<Duration>) -> Self {
        self.autosave_interval_secs = interval.map(|d| d.as_secs());
        self
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.data_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn session_lock_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.session_lock_timeout_secs)
    }

    pub fn autosave_duration(&self) -> Option<Duration> {
        self.autosave_interval_secs.map(Duration::from_secs)
    }

    /// Storage key for a user id: `prefix + id + suffix`.
    pub fn format_key(&self, user_id: u64) -> String {
        format!("{}{}{}", self.prefix, user_id, self.suffix)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|err| {
            DataError::Config(format!("cannot read '{}': {}", path.display(), err))
        })?;
        let options: DataOptions = serde_json::from_str(&text).map_err(|err| {
            DataError::Config(format!("invalid options in '{}': {}", path.display(), err))
        })?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(DataError::Config("name cannot be empty".to_string()));
        }
        if self.prefix.is_empty() && self.suffix.is_empty() {
            return Err(DataError::Config(
                "prefix and suffix cannot both be empty".to_string(),
            ));
        }
        if self.session_lock_timeout_secs == 0 {
            return Err(DataError::Config(
                "session_lock_timeout_secs must be > 0".to_string(),
            ));
        }
        if self.autosave_interval_secs == Some(0) {
            return Err(DataError::Config(
                "autosave_interval_secs must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}
