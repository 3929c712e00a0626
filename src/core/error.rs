use crate::rules::Rule;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Malformed shape in field '{field}': {reason}")]
    MalformedShape { field: String, reason: String },

    #[error("Record '{0}' has been cleared")]
    RecordCleared(String),

    #[error("Record '{0}' is read-only")]
    ReadOnly(String),

    #[error("Record '{0}' is backup data")]
    BackupRecord(String),

    #[error("Eligibility violation: {0}")]
    EligibilityViolation(Rule),

    #[error("Failed to load record '{key}': {reason}")]
    LoadFailure { key: String, reason: String },

    #[error("Record '{key}' is corrupted: {reason}")]
    Corrupted { key: String, reason: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Lock error: {0}")]
    LockError(String),
}

pub type Result<T> = std::result::Result<T, DataError>;

impl DataError {
    pub(crate) fn malformed(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedShape {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for DataError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<std::io::Error> for DataError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for DataError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
