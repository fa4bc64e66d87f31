/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Errors surfaced by the supervisor.
//!
//! | Variant | Raised when | Consequence |
//! |---|---|---|
//! | `Driver` | numbering mode cannot be selected at start | supervisor never runs |
//! | `Reconciliation` | a cycle cannot load or persist the configuration | safe-shutdown |
//! | `Shutdown` | safe-shutdown cannot persist "all off" | force-quit |
//! | `ForceQuit` | force-quit ran | terminal; binary exits non-zero |
//! | `Panicked` | the supervisor task itself died | terminal |

use thiserror::Error;

use crate::gpio::DriverError;
use crate::store::ConfigError;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("cannot prepare GPIO driver: {0}")]
    Driver(#[source] DriverError),

    #[error("reconciliation cycle {cycle} failed: {source}")]
    Reconciliation {
        cycle: u64,
        #[source]
        source: ConfigError,
    },

    #[error("safe shutdown failed at '{step}': {source}")]
    Shutdown {
        step: &'static str,
        #[source]
        source: ConfigError,
    },

    /// Hardware was released unconditionally and the configuration file
    /// discarded.
    #[error("force-quit after: {cause}")]
    ForceQuit {
        #[source]
        cause: Box<SupervisorError>,
    },

    #[error("supervisor task ended abnormally: {0}")]
    Panicked(String),
}
