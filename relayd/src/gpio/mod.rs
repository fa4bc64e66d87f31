/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Hardware driver capability consumed by the reconciliation core.
//!
//! The core never talks to a GPIO chip directly.  It receives an
//! `Arc<dyn PinDriver>` and uses exactly these operations:
//!
//! | Operation | Used by |
//! |---|---|
//! | `numbering` / `set_numbering` | [`Supervisor::start`](crate::supervisor::Supervisor::start), once |
//! | `acquire_output` / `write` / `read` / `release` | relay workers |
//! | `acquire_pwm` / `set_pwm` / `read_pwm` / `release` | PWM workers |
//! | `write` / `set_pwm` / `release` | retirement and force-quit of a stuck worker |
//! | `release_all` | force-quit |
//!
//! Two drivers ship with the crate: [`SysfsDriver`] for real hardware and
//! [`MockDriver`] for tests and `--driver mock` dry runs.
//!
//! The pin namespace is process-wide.  Both drivers refuse to hand the same
//! pin to two owners ([`DriverError::AlreadyClaimed`]).

mod claims;
pub mod mock;
pub mod sysfs;

pub use mock::MockDriver;
pub use sysfs::SysfsDriver;

use std::fmt;
use std::io;
use std::ops::Not;
use std::str::FromStr;
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::relay::{Pin, PwmSettings};

// ── Levels & numbering ────────────────────────────────────────────────────────

/// Electrical level of an output pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    Low,
    High,
}

impl Not for Level {
    type Output = Level;

    fn not(self) -> Level {
        match self {
            Level::Low => Level::High,
            Level::High => Level::Low,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Low => f.write_str("LOW"),
            Level::High => f.write_str("HIGH"),
        }
    }
}

/// Pin numbering scheme.  Relay configurations always use BCM numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Numbering {
    Bcm,
    Board,
}

/// Maps the logical relay state onto an electrical level.
///
/// Most Pi relay boards energise the coil when the input is pulled LOW, so
/// `active_low` is the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Polarity {
    active_low: bool,
}

impl Polarity {
    pub const ACTIVE_LOW: Polarity = Polarity { active_low: true };
    pub const ACTIVE_HIGH: Polarity = Polarity { active_low: false };

    pub fn new(active_low: bool) -> Self {
        Self { active_low }
    }

    /// Level that switches the relay ON.
    pub fn active(self) -> Level {
        if self.active_low {
            Level::Low
        } else {
            Level::High
        }
    }

    /// Level that leaves the relay OFF.
    pub fn inactive(self) -> Level {
        !self.active()
    }
}

impl Default for Polarity {
    fn default() -> Self {
        Self::ACTIVE_LOW
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Driver-level failure.  Callers attach relay context when they log it.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("pin {pin} is already claimed")]
    AlreadyClaimed { pin: Pin },

    #[error("pin {pin} is not claimed")]
    NotClaimed { pin: Pin },

    #[error("{op} failed for pin {pin}: {source}")]
    Io {
        pin: Pin,
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{op} failed: {source}")]
    Chip {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("unexpected value {value:?} read from pin {pin}")]
    BadValue { pin: Pin, value: String },

    #[error("pin {pin} has no hardware PWM channel")]
    PwmUnsupported { pin: Pin },

    #[error("PWM channel {channel} is already driven by another pin (requested for pin {pin})")]
    ChannelBusy { pin: Pin, channel: u32 },

    #[error("numbering mode {0:?} is not supported by this driver")]
    UnsupportedNumbering(Numbering),

    #[error("injected fault on pin {pin}: {reason}")]
    Injected { pin: Pin, reason: &'static str },
}

// ── PinDriver ─────────────────────────────────────────────────────────────────

/// GPIO capability injected into the supervisor and every unit worker.
///
/// All operations are short, synchronous calls made inline from unit worker
/// tasks; none may block for longer than a few hundred milliseconds.
/// Implementations must be safe to call from several workers at once.
pub trait PinDriver: Send + Sync + fmt::Debug {
    /// Currently selected numbering scheme, if one was set.
    fn numbering(&self) -> Option<Numbering>;

    /// Selects the numbering scheme.
    fn set_numbering(&self, mode: Numbering) -> Result<(), DriverError>;

    /// Claims `pin` as an output and drives it to `initial`.
    fn acquire_output(&self, pin: Pin, initial: Level) -> Result<(), DriverError>;

    /// Releases a claimed pin back to the system.
    fn release(&self, pin: Pin) -> Result<(), DriverError>;

    fn write(&self, pin: Pin, level: Level) -> Result<(), DriverError>;

    fn read(&self, pin: Pin) -> Result<Level, DriverError>;

    /// Claims `pin` as a PWM output running at `frequency` Hz with a 0 %
    /// duty cycle.
    fn acquire_pwm(&self, pin: Pin, frequency: u32) -> Result<(), DriverError>;

    fn set_pwm(&self, pin: Pin, settings: PwmSettings) -> Result<(), DriverError>;

    fn read_pwm(&self, pin: Pin) -> Result<PwmSettings, DriverError>;

    /// Releases every pin claimed through this driver, regardless of owner.
    fn release_all(&self) -> Result<(), DriverError>;
}

/// Selects `mode` unless it is already active.
///
/// Returns `true` when the mode had to be changed.
pub fn ensure_numbering(driver: &dyn PinDriver, mode: Numbering) -> Result<bool, DriverError> {
    if driver.numbering() == Some(mode) {
        debug!(?mode, "GPIO numbering already selected");
        return Ok(false);
    }
    driver.set_numbering(mode)?;
    info!(?mode, "GPIO numbering selected");
    Ok(true)
}

// ── Driver selection ──────────────────────────────────────────────────────────

/// Which [`PinDriver`] implementation the daemon should build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    #[default]
    Sysfs,
    Mock,
}

impl FromStr for DriverKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sysfs" => Ok(DriverKind::Sysfs),
            "mock" => Ok(DriverKind::Mock),
            other => Err(format!("unknown driver '{other}' (valid: sysfs, mock)")),
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverKind::Sysfs => f.write_str("sysfs"),
            DriverKind::Mock => f.write_str("mock"),
        }
    }
}

/// Builds the driver described by the daemon settings.
pub fn build_driver(settings: &crate::config::Settings) -> Arc<dyn PinDriver> {
    match settings.driver {
        DriverKind::Sysfs => Arc::new(
            SysfsDriver::new(&settings.sysfs_root, settings.chip_base)
                .with_pwm_chip(&settings.pwm_chip),
        ),
        DriverKind::Mock => Arc::new(MockDriver::new()),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
