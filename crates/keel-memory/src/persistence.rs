//! Durable backing for the memory store.

use chrono::Utc;
use keel_core::{MemoryEntry, MemoryError, MemoryResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Load-at-startup, flush-on-demand persistence contract.
///
/// `flush` receives the complete set of live entries and replaces whatever
/// was stored before.
pub trait MemoryPersistence: Send + Sync {
    fn load(&self) -> MemoryResult<Vec<MemoryEntry>>;

    fn flush(&self, entries: &[MemoryEntry]) -> MemoryResult<()>;
}

const FORMAT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    entries: Vec<MemoryEntry>,
}

/// Stores every entry in a single JSON file.
///
/// Writes go to a temporary sibling file that is then renamed over the
/// target, so a crash mid-write leaves the previous file intact. A file that
/// fails to parse is copied aside as `<name>.corrupted.<unix-ts>` and the
/// store starts empty.
#[derive(Debug, Clone)]
pub struct JsonFilePersistence {
    path: PathBuf,
}

impl JsonFilePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn backup_corrupted(&self) {
        let Some(parent) = self.path.parent() else {
            return;
        };
        let backup = parent.join(format!(
            "{}.corrupted.{}",
            self.path.file_name().unwrap_or_default().to_string_lossy(),
            Utc::now().timestamp()
        ));
        if let Err(e) = fs::copy(&self.path, &backup) {
            tracing::warn!(path = ?self.path, error = %e, "Failed to back up corrupted memory file");
        }
    }
}

impl MemoryPersistence for JsonFilePersistence {
    fn load(&self) -> MemoryResult<Vec<MemoryEntry>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = ?self.path, "Memory file not found, starting fresh");
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(MemoryError::Persistence(format!(
                    "failed to read {}: {e}",
                    self.path.display()
                )));
            }
        };

        match serde_json::from_str::<Snapshot>(&contents) {
            Ok(snapshot) if snapshot.version == FORMAT_VERSION => {
                tracing::debug!(
                    path = ?self.path,
                    entries = snapshot.entries.len(),
                    "Loaded memory file"
                );
                Ok(snapshot.entries)
            }
            Ok(snapshot) => Err(MemoryError::Persistence(format!(
                "unsupported memory file version {} in {}",
                snapshot.version,
                self.path.display()
            ))),
            Err(e) => {
                tracing::error!(
                    path = ?self.path,
                    error = %e,
                    "Failed to parse memory file, starting fresh"
                );
                self.backup_corrupted();
                Ok(Vec::new())
            }
        }
    }

    fn flush(&self, entries: &[MemoryEntry]) -> MemoryResult<()> {
        let snapshot = Snapshot {
            version: FORMAT_VERSION,
            entries: entries.to_vec(),
        };
        let json = serde_json::to_string_pretty(&snapshot)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                MemoryError::Persistence(format!("failed to create {}: {e}", parent.display()))
            })?;
        }

        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, json).map_err(|e| {
            tracing::error!(path = ?tmp_path, error = %e, "Failed to write memory file");
            MemoryError::Persistence(format!("failed to write {}: {e}", tmp_path.display()))
        })?;
        fs::rename(&tmp_path, &self.path).map_err(|e| {
            tracing::error!(
                from = ?tmp_path,
                to = ?self.path,
                error = %e,
                "Failed to atomically rename memory file"
            );
            MemoryError::Persistence(format!(
                "failed to rename {} to {}: {e}",
                tmp_path.display(),
                self.path.display()
            ))
        })?;

        tracing::debug!(path = ?self.path, entries = entries.len(), "Flushed memory file");
        Ok(())
    }
}
