//! On-disk mirror for `DataNetwork` blobs.

use crate::core::{DataError, Result};
use std::path::{Path, PathBuf};
use tokio::fs;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobSlot {
    Primary,
    Backup,
}

impl BlobSlot {
    fn extension(&self) -> &'static str {
        match self {
            BlobSlot::Primary => "json",
            BlobSlot::Backup => "backup.json",
        }
    }
}

/// One file per key and slot: `<root>/<name>/<key>.json` and
/// `<root>/<name>/<key>.backup.json`.
#[derive(Debug, Clone)]
pub struct BlobDirectory {
    root: PathBuf,
}

impl BlobDirectory {
    pub fn new<P: AsRef<Path>>(data_dir: P, network_name: &str) -> Self {
        Self {
            root: data_dir.as_ref().join(file_safe(network_name)),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &str, slot: BlobSlot) -> PathBuf {
        self.root
            .join(format!("{}.{}", file_safe(key), slot.extension()))
    }

    pub async fn read(&self, key: &str, slot: BlobSlot) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key, slot);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(DataError::IoError(format!(
                "Failed to read '{}': {}",
                path.display(),
                err
            ))),
        }
    }

    pub async fn write(&self, key: &str, slot: BlobSlot, bytes: &[u8]) -> Result<()> {
        atomic_write(&self.path_for(key, slot), bytes).await
    }

    pub async fn remove(&self, key: &str, slot: BlobSlot) -> Result<()> {
        let path = self.path_for(key, slot);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(DataError::IoError(format!(
                "Failed to remove '{}': {}",
                path.display(),
                err
            ))),
        }
    }
}

/// Keys keep ASCII alphanumerics and `[]-_.`; anything else becomes `_`.
fn file_safe(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '[' | ']' | '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

async fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(|err| {
            DataError::IoError(format!(
                "Failed to create parent directory '{}': {}",
                parent.display(),
                err
            ))
        })?;
    }

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).await.map_err(|err| {
        DataError::IoError(format!(
            "Failed to write temp file '{}': {}",
            tmp.display(),
            err
        ))
    })?;

    fs::rename(&tmp, path).await.map_err(|err| {
        DataError::IoError(format!(
            "Failed to rename temp file '{}' -> '{}': {}",
            tmp.display(),
            path.display(),
            err
        ))
    })?;
    Ok(())
}
