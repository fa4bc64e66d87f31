/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Status publishing.
//!
//! Units and the supervisor render their state through a [`StatusSink`].  The
//! daemon uses [`JsonFileSink`], which keeps one small JSON document per relay
//! for web front-ends to poll:
//!
//! ```text
//! <status_dir>/ID<id>_<pin>.json   one per relay
//! <status_dir>/supervisor.json     daemon state
//! ```
//!
//! A relay that is removed from the configuration or moved to another pin
//! has its old file withdrawn, so readers never see a stale entry.
//!
//! Publishing never blocks reconciliation: callers log a [`StatusError`] and
//! carry on.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::relay::{Pin, RelayId};

/// Layout of every `last updated` field.
pub const TIMESTAMP_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

/// Local wall-clock time in [`TIMESTAMP_FORMAT`].
pub fn timestamp() -> String {
    Local::now().format(TIMESTAMP_FORMAT).to_string()
}

// ── Documents ─────────────────────────────────────────────────────────────────

/// Per-relay status document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitStatus {
    pub relay_id: RelayId,
    pub name: String,
    pub pin: Pin,
    /// Last level successfully driven, as a logical ON/OFF.
    pub status: bool,
    /// PWM channels only.
    #[serde(rename = "PWM Frequency", default, skip_serializing_if = "Option::is_none")]
    pub pwm_frequency: Option<u32>,
    /// PWM channels only; 0 while the channel is off.
    #[serde(rename = "PWM Duty Cycle", default, skip_serializing_if = "Option::is_none")]
    pub pwm_duty_cycle: Option<u8>,
    #[serde(rename = "last updated")]
    pub last_updated: String,
}

/// Daemon-level status document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorStatus {
    pub state: String,
    pub cycle: u64,
    pub units: usize,
    #[serde(rename = "last updated")]
    pub last_updated: String,
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("cannot write status file {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot remove status file {}: {source}", path.display())]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot serialise status: {0}")]
    Serialize(#[from] serde_json::Error),
}

// ── Sinks ─────────────────────────────────────────────────────────────────────

/// Destination for status documents.
pub trait StatusSink: Send + Sync + std::fmt::Debug {
    fn publish_unit(&self, status: &UnitStatus) -> Result<(), StatusError>;

    /// Drops whatever was published for `relay_id` on `pin`.
    fn withdraw_unit(&self, relay_id: &RelayId, pin: Pin) -> Result<(), StatusError>;

    fn publish_supervisor(&self, status: &SupervisorStatus) -> Result<(), StatusError>;
}

/// Writes status documents as JSON files into one directory.
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    dir: PathBuf,
}

impl JsonFileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File a relay's status is written to.
    pub fn unit_path(&self, id: &RelayId, pin: Pin) -> PathBuf {
        self.dir.join(format!("ID{id}_{pin}.json"))
    }

    pub fn supervisor_path(&self) -> PathBuf {
        self.dir.join("supervisor.json")
    }

    fn write_json<T: Serialize>(&self, path: PathBuf, value: &T) -> Result<(), StatusError> {
        let mut bytes = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut bytes, formatter);
        value.serialize(&mut ser)?;

        fs::create_dir_all(&self.dir)
            .and_then(|()| fs::write(&path, &bytes))
            .map_err(|source| StatusError::Write { path, source })
    }
}

impl StatusSink for JsonFileSink {
    fn publish_unit(&self, status: &UnitStatus) -> Result<(), StatusError> {
        self.write_json(self.unit_path(&status.relay_id, status.pin), status)
    }

    fn withdraw_unit(&self, relay_id: &RelayId, pin: Pin) -> Result<(), StatusError> {
        let path = self.unit_path(relay_id, pin);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StatusError::Remove { path, source }),
        }
    }

    fn publish_supervisor(&self, status: &SupervisorStatus) -> Result<(), StatusError> {
        self.write_json(self.supervisor_path(), status)
    }
}

/// Reads every per-relay status document in `dir`, ordered by file name.
///
/// Files that do not parse are skipped.
pub fn read_unit_statuses(dir: &Path) -> io::Result<Vec<UnitStatus>> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("ID") && n.ends_with(".json"))
        })
        .collect();
    paths.sort();

    Ok(paths
        .iter()
        .filter_map(|p| fs::read(p).ok())
        .filter_map(|b| serde_json::from_slice(&b).ok())
        .collect())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
