/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Relay configuration store.
//!
//! [`ConfigStore`] owns the JSON configuration file and the last snapshot it
//! successfully loaded or wrote.  A load always produces a usable snapshot
//! unless the store can no longer write to disk:
//!
//! | File state | Result | File afterwards | [`LoadSource`] |
//! |---|---|---|---|
//! | valid | parsed snapshot | unchanged | `Disk` |
//! | missing | built-in default | default | `Missing` |
//! | corrupt, earlier load succeeded | last good snapshot | last good | `CorruptRestored` |
//! | corrupt, nothing loaded yet | built-in default | default | `CorruptDefaulted` |
//!
//! "Corrupt" covers unreadable files, malformed JSON and documents that fail
//! [`Snapshot::validate`].  Writes are atomic: a temporary file in the same
//! directory is renamed over the target.

pub mod error;

pub use error::ConfigError;

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::relay::{Snapshot, SnapshotError};

/// Where the snapshot returned by [`ConfigStore::load_classified`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    Disk,
    Missing,
    CorruptRestored,
    CorruptDefaulted,
}

impl fmt::Display for LoadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LoadSource::Disk => "disk",
            LoadSource::Missing => "missing",
            LoadSource::CorruptRestored => "corrupt-with-backup",
            LoadSource::CorruptDefaulted => "corrupt-no-backup",
        })
    }
}

#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    default: Snapshot,
    /// Last snapshot successfully loaded or persisted.
    saved: Option<Snapshot>,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>, default: Snapshot) -> Self {
        Self {
            path: path.into(),
            default,
            saved: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn saved(&self) -> Option<&Snapshot> {
        self.saved.as_ref()
    }

    pub fn default_snapshot(&self) -> &Snapshot {
        &self.default
    }

    /// Reads and validates the file without any fallback or side effect.
    pub fn read_disk(&self) -> Result<Snapshot, ConfigError> {
        let bytes = fs::read(&self.path).map_err(|source| ConfigError::Read {
            path: self.path.clone(),
            source,
        })?;
        Snapshot::from_json(&bytes).map_err(|source| ConfigError::Invalid {
            path: self.path.clone(),
            source,
        })
    }

    /// Loads the configuration, falling back as described in the module docs.
    ///
    /// # Errors
    /// Only [`ConfigError::Persist`] / [`ConfigError::Serialize`]: a fallback
    /// was needed and could not be written back.
    pub fn load(&mut self) -> Result<Snapshot, ConfigError> {
        self.load_classified().map(|(snapshot, _)| snapshot)
    }

    pub fn load_classified(&mut self) -> Result<(Snapshot, LoadSource), ConfigError> {
        let err = match self.read_disk() {
            Ok(snapshot) => {
                self.saved = Some(snapshot.clone());
                return Ok((snapshot, LoadSource::Disk));
            }
            Err(e) => e,
        };

        let (fallback, source) = if err.is_missing() {
            (self.default.clone(), LoadSource::Missing)
        } else {
            match &self.saved {
                Some(saved) => (saved.clone(), LoadSource::CorruptRestored),
                None => (self.default.clone(), LoadSource::CorruptDefaulted),
            }
        };
        warn!(
            path = %self.path.display(),
            case = %source,
            error = %err,
            "relay configuration unusable, rewriting fallback"
        );

        self.persist(&fallback)?;
        Ok((fallback, source))
    }

    /// Atomically overwrites the file with `snapshot`.
    pub fn persist(&mut self, snapshot: &Snapshot) -> Result<(), ConfigError> {
        let bytes = snapshot.to_json_pretty().map_err(ConfigError::Serialize)?;
        self.write_atomic(&bytes)
            .map_err(|source| ConfigError::Persist {
                path: self.path.clone(),
                source,
            })?;
        debug!(path = %self.path.display(), relays = snapshot.len(), "relay configuration persisted");
        self.saved = Some(snapshot.clone());
        Ok(())
    }

    fn write_atomic(&self, bytes: &[u8]) -> std::io::Result<()> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;

        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Switches one relay and persists the result.
    pub fn set_state(&mut self, id: &str, state: bool) -> Result<Snapshot, ConfigError> {
        let current = self.load()?;
        let next = current.with_state(id, state).map_err(|e| match e {
            SnapshotError::UnknownRelay(id) => ConfigError::UnknownRelay(id),
            other => ConfigError::Invalid {
                path: self.path.clone(),
                source: other,
            },
        })?;
        self.persist(&next)?;
        info!(
            relay_id = id,
            state = if state { "ON" } else { "OFF" },
            "relay state written to configuration"
        );
        Ok(next)
    }

    /// Persists the current configuration with every relay switched off.
    pub fn all_off(&mut self) -> Result<Snapshot, ConfigError> {
        let next = self.load()?.all_off();
        self.persist(&next)?;
        info!(path = %self.path.display(), "all relays set OFF in configuration");
        Ok(next)
    }

    /// Deletes the configuration file.  A missing file is not an error.
    pub fn remove(&self) -> Result<(), ConfigError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "relay configuration removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ConfigError::Remove {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
