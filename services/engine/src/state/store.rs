//! JSON file store with backup-and-rollback writes.
//!
//! The whole store is one JSON document. A write copies the current file to
//! `<file>.bkp`, writes and syncs the new content to a temporary file beside
//! it, then renames that over the target and deletes the backup. Readers only
//! ever see a complete document. If the target turns out empty or unparseable
//! and a backup is present, the backup wins.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::changeset::Changeset;
use super::model::StoreDocument;

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to {action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize store: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Unreadable content that could not be moved out of the way.
    #[error("corrupt store {} could not be removed: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    fn io(action: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// What a single file on disk holds.
enum Contents {
    Missing,
    Unusable(&'static str),
    Document(StoreDocument),
}

/// File-backed store.
#[derive(Debug, Clone)]
pub struct Store {
    path: PathBuf,
}

impl Store {
    /// Open the store at `path`, creating its directory if needed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| StoreError::io("create directory", parent, e))?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn backup_path(&self) -> PathBuf {
        self.sibling(".bkp")
    }

    /// Per-process temporary file, so two writers never share one.
    fn temp_path(&self) -> PathBuf {
        self.sibling(&format!(".{}.tmp", std::process::id()))
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(suffix);
        PathBuf::from(name)
    }

    /// Read the document.
    ///
    /// `None` means there is no prior state. When the target is missing,
    /// empty or unparseable, a readable backup is restored and returned;
    /// otherwise bad content is deleted and also reported as `None`.
    pub fn load(&self) -> Result<Option<StoreDocument>, StoreError> {
        let problem = match read_document(&self.path)? {
            Contents::Document(doc) => {
                debug!(
                    path = %self.path.display(),
                    request_count = doc.requests.len(),
                    "Loaded store"
                );
                return Ok(Some(doc));
            }
            Contents::Missing => None,
            Contents::Unusable(reason) => Some(reason),
        };

        if let Some(doc) = self.restore_backup()? {
            return Ok(Some(doc));
        }

        match problem {
            None => {
                debug!(path = %self.path.display(), "No store file, starting fresh");
            }
            Some(reason) => {
                warn!(
                    path = %self.path.display(),
                    reason,
                    "Store file is unusable and no backup exists, starting fresh"
                );
                self.quarantine()?;
            }
        }
        Ok(None)
    }

    /// Put a readable backup back in place of the target.
    fn restore_backup(&self) -> Result<Option<StoreDocument>, StoreError> {
        let backup = self.backup_path();
        match read_document(&backup)? {
            Contents::Missing => Ok(None),
            Contents::Unusable(reason) => {
                warn!(path = %backup.display(), reason, "Discarding unusable store backup");
                if let Err(e) = fs::remove_file(&backup) {
                    warn!(path = %backup.display(), error = %e, "Failed to delete store backup");
                }
                Ok(None)
            }
            Contents::Document(doc) => {
                warn!(
                    path = %self.path.display(),
                    request_count = doc.requests.len(),
                    "Restoring store from backup left by an interrupted write"
                );
                fs::rename(&backup, &self.path)
                    .map_err(|e| StoreError::io("restore backup", &backup, e))?;
                Ok(Some(doc))
            }
        }
    }

    /// Read the document, treating no prior state as an empty store.
    pub fn load_or_default(&self) -> Result<StoreDocument, StoreError> {
        Ok(self.load()?.unwrap_or_default())
    }

    fn quarantine(&self) -> Result<(), StoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Corrupt {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Replace the document on disk.
    pub fn save(&self, doc: &StoreDocument) -> Result<(), StoreError> {
        let content = serde_json::to_vec_pretty(doc)?;

        let existing = fs::read(&self.path).ok();
        if existing.as_deref() == Some(content.as_slice()) {
            debug!(path = %self.path.display(), "Store unchanged, skipping write");
            return Ok(());
        }

        let backup = self.backup_path();
        let had_previous = existing.is_some();
        if had_previous {
            fs::copy(&self.path, &backup)
                .map_err(|e| StoreError::io("back up", &self.path, e))?;
        }

        let temp = self.temp_path();
        let written = write_synced(&temp, &content)
            .map_err(|e| StoreError::io("write", &temp, e))
            .and_then(|()| {
                fs::rename(&temp, &self.path)
                    .map_err(|e| StoreError::io("replace", &self.path, e))
            });

        if let Err(e) = written {
            let _ = fs::remove_file(&temp);
            if had_previous {
                self.roll_back(&backup);
            }
            return Err(e);
        }

        if had_previous {
            if let Err(e) = fs::remove_file(&backup) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %backup.display(), error = %e, "Failed to delete store backup");
                }
            }
        }
        debug!(
            path = %self.path.display(),
            request_count = doc.requests.len(),
            "Saved store"
        );
        Ok(())
    }

    /// Undo a failed write. The target still holds the previous document
    /// unless the rename itself went wrong, in which case the backup returns.
    fn roll_back(&self, backup: &Path) {
        if matches!(read_document(&self.path), Ok(Contents::Document(_))) {
            let _ = fs::remove_file(backup);
            return;
        }
        if let Err(restore) = fs::rename(backup, &self.path) {
            error!(
                path = %self.path.display(),
                error = %restore,
                "Failed to roll back store from backup"
            );
        }
    }

    /// Apply `changes` to the freshest document and save it.
    ///
    /// Returns the document as written.
    pub fn commit(&self, changes: &Changeset) -> Result<StoreDocument, StoreError> {
        let mut doc = self.load_or_default()?;
        if changes.is_empty() {
            return Ok(doc);
        }

        changes.apply(&mut doc);
        self.save(&doc)?;
        info!(
            path = %self.path.display(),
            change_count = changes.len(),
            request_count = doc.requests.len(),
            "Committed store changes"
        );
        Ok(doc)
    }
}

fn read_document(path: &Path) -> Result<Contents, StoreError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Contents::Missing),
        Err(e) => return Err(StoreError::io("read", path, e)),
    };
    if content.trim().is_empty() {
        return Ok(Contents::Unusable("empty"));
    }
    match serde_json::from_str::<StoreDocument>(&content) {
        Ok(doc) => Ok(Contents::Document(doc)),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Unparseable store content");
            Ok(Contents::Unusable("unparseable"))
        }
    }
}

fn write_synced(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(content)?;
    file.sync_all()
}
