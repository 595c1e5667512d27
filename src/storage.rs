//! State persistence
//!
//! One JSON file per watched user. Saves write a temp file next to the
//! target, fsync it, and rename it into place, so a crash mid-save leaves
//! either the old file or the new one and never a mix.

use std::ffi::OsStr;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::StateError;
use crate::state::UserState;

/// Loads and saves [`UserState`] by key.
pub trait StateStore: Send + Sync {
    /// `StateError::NotFound` on first run, `StateError::Corrupted` when the
    /// file exists but cannot be trusted.
    fn load(&self, path: &Path) -> Result<UserState, StateError>;

    /// Either the whole state is written or the previous file is untouched.
    fn save(&self, path: &Path, state: &UserState) -> Result<(), StateError>;
}

/// `<state_dir>/<username>.json`
pub fn default_state_path(state_dir: &Path, username: &str) -> PathBuf {
    state_dir.join(format!("{}.json", username))
}

/// `<path>.bak`
pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".bak");
    PathBuf::from(name)
}

/// JSON files on the local filesystem
#[derive(Debug, Clone)]
pub struct JsonStateStore {
    keep_backup: bool,
}

impl Default for JsonStateStore {
    fn default() -> Self {
        Self { keep_backup: true }
    }
}

impl JsonStateStore {
    pub fn new(keep_backup: bool) -> Self {
        Self { keep_backup }
    }
}

impl StateStore for JsonStateStore {
    fn load(&self, path: &Path) -> Result<UserState, StateError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StateError::NotFound {
                    path: path.to_path_buf(),
                })
            }
            Err(e) => return Err(StateError::Io(e)),
        };

        let state: UserState =
            serde_json::from_str(&content).map_err(|e| StateError::Corrupted {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        state
            .validate(Utc::now())
            .map_err(|e| StateError::Corrupted {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        debug!(
            "Loaded state for {} ({} repositories)",
            state.username,
            state.repositories.len()
        );
        Ok(state)
    }

    fn save(&self, path: &Path, state: &UserState) -> Result<(), StateError> {
        state.validate(Utc::now())?;

        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(|source| StateError::Write {
            path: dir.clone(),
            source,
        })?;

        if self.keep_backup && path.exists() {
            let backup = backup_path(path);
            if let Err(e) = std::fs::copy(path, &backup) {
                warn!("Could not back up {}: {}", path.display(), e);
            }
        }

        let json = serde_json::to_vec_pretty(state)?;
        let write_err = |source| StateError::Write {
            path: path.to_path_buf(),
            source,
        };

        let mut tmp = NamedTempFile::new_in(&dir).map_err(write_err)?;
        tmp.write_all(&json).map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;
        tmp.persist(path).map_err(|e| write_err(e.error))?;

        debug!("Saved state for {} to {}", state.username, path.display());
        Ok(())
    }
}

fn remove_if_exists(path: &Path, removed: &mut Vec<PathBuf>) -> Result<(), StateError> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            removed.push(path.to_path_buf());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StateError::Io(e)),
    }
}

/// Delete a state file and its backup. Returns the files that existed.
pub fn remove_state(path: &Path) -> Result<Vec<PathBuf>, StateError> {
    let mut removed = Vec::new();
    remove_if_exists(path, &mut removed)?;
    remove_if_exists(&backup_path(path), &mut removed)?;
    Ok(removed)
}

/// Delete every state and backup file in `state_dir`, then the directory
/// itself if nothing else is left in it.
pub fn remove_all(state_dir: &Path) -> Result<Vec<PathBuf>, StateError> {
    let mut removed = Vec::new();

    let entries = match std::fs::read_dir(state_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(removed),
        Err(e) => return Err(StateError::Io(e)),
    };

    for entry in entries {
        let path = entry?.path();
        let is_state = matches!(
            path.extension().and_then(OsStr::to_str),
            Some("json") | Some("bak")
        );
        if is_state && path.is_file() {
            remove_if_exists(&path, &mut removed)?;
        }
    }

    if std::fs::remove_dir(state_dir).is_ok() {
        debug!("Removed empty state directory {}", state_dir.display());
    }

    Ok(removed)
}
