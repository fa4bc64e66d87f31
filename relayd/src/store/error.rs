/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Error types for the relay configuration store.
//!
//! | Variant | Recovered by |
//! |---|---|
//! | `Read` / `Invalid` | the load fallback chain (never escapes `load`) |
//! | `Persist` / `Serialize` | nobody: the caller must stop reconciling |
//! | `UnknownRelay` | operator (bad id on the command line) |
//! | `Remove` | nobody: logged during force-quit |

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::relay::{RelayId, SnapshotError};

#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.  `NotFound` is the "missing" case.
    #[error("cannot read relay configuration {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The file was read but does not hold a valid configuration.
    #[error("relay configuration {} is corrupt: {source}", path.display())]
    Invalid {
        path: PathBuf,
        #[source]
        source: SnapshotError,
    },

    /// Writing the file (or its temporary sibling) failed.
    #[error("cannot persist relay configuration {}: {source}", path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot serialise relay configuration: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("relay '{0}' is not configured")]
    UnknownRelay(RelayId),

    #[error("cannot remove relay configuration {}: {source}", path.display())]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ConfigError {
    /// `true` when the configuration file simply does not exist.
    pub fn is_missing(&self) -> bool {
        matches!(self, ConfigError::Read { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}
