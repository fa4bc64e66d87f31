/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Daemon settings loading and management.
//!
//! These are the daemon's own knobs, not the relay configuration (that lives
//! in the JSON file managed by [`ConfigStore`](crate::store::ConfigStore)).
//!
//! The expected YAML structure is:
//! ```yaml
//! config_file: ./relay_config.json
//! status_dir: ./api
//! log_dir: ./logs
//! refresh_interval_ms: 1000
//! unit_refresh_interval_ms: 1000
//! shutdown_grace_ms: 10000
//! active_low: true
//! driver: sysfs
//! sysfs_root: /sys/class/gpio
//! chip_base: 0
//! pwm_chip: /sys/class/pwm/pwmchip0
//! default_relays:
//!   "1": { name: name1, pin: 26, state: false }
//! ```
//!
//! Every key is optional.  Relay ids under `default_relays` must be quoted so
//! YAML reads them as strings.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::gpio::DriverKind;
use crate::relay::{Pin, RelayConfigEntry, RelayId, Snapshot, SnapshotError};

// ── Defaults ──────────────────────────────────────────────────────────────────

pub const DEFAULT_CONFIG_FILE: &str = "./relay_config.json";
pub const DEFAULT_STATUS_DIR: &str = "./api";
pub const DEFAULT_SYSFS_ROOT: &str = "/sys/class/gpio";
pub const DEFAULT_PWM_CHIP: &str = "/sys/class/pwm/pwmchip0";
pub const DEFAULT_REFRESH_MS: u64 = 1000;
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 10_000;

/// Relay set written when no configuration file exists yet.
pub fn default_relays() -> Snapshot {
    let entries = [("1", "name1", 26), ("2", "name2", 20), ("3", "name3", 21)]
        .into_iter()
        .map(|(id, name, pin)| {
            (
                RelayId::from(id),
                RelayConfigEntry::new(name, Pin::new(pin), false),
            )
        });
    // Distinct in-range pins, so validation cannot fail.
    Snapshot::new(entries).unwrap_or_default()
}

// ── Private YAML deserialization types ────────────────────────────────────────

/// Maps directly onto the YAML file layout.  Kept private; callers work with
/// [`Settings`].
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SettingsFile {
    config_file: Option<PathBuf>,
    status_dir: Option<PathBuf>,
    log_dir: Option<PathBuf>,
    refresh_interval_ms: Option<u64>,
    unit_refresh_interval_ms: Option<u64>,
    shutdown_grace_ms: Option<u64>,
    active_low: Option<bool>,
    driver: Option<DriverKind>,
    sysfs_root: Option<PathBuf>,
    chip_base: Option<u32>,
    pwm_chip: Option<PathBuf>,
    default_relays: Option<Snapshot>,
}

// ── Public data structures ────────────────────────────────────────────────────

/// Validation failure for an otherwise well-formed settings file.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("{field} must be greater than zero")]
    ZeroInterval { field: &'static str },

    #[error("default_relays is invalid: {0}")]
    DefaultRelays(#[from] SnapshotError),
}

/// Effective daemon settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Relay configuration file (JSON).
    pub config_file: PathBuf,
    /// Directory receiving the per-relay status files.
    pub status_dir: PathBuf,
    /// Daily-rolling log files go here when set.
    pub log_dir: Option<PathBuf>,
    /// Supervisor cycle period.
    pub refresh_interval: Duration,
    /// Worker poll period while a relay is ON.
    pub unit_refresh_interval: Duration,
    /// Lower bound on how long safe-shutdown waits for workers.
    pub shutdown_grace: Duration,
    pub active_low: bool,
    pub driver: DriverKind,
    pub sysfs_root: PathBuf,
    /// Added to BCM numbers to get the kernel's sysfs line number.
    pub chip_base: u32,
    /// sysfs PWM chip driving hardware PWM channels.
    pub pwm_chip: PathBuf,
    pub default_relays: Snapshot,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config_file: PathBuf::from(DEFAULT_CONFIG_FILE),
            status_dir: PathBuf::from(DEFAULT_STATUS_DIR),
            log_dir: None,
            refresh_interval: Duration::from_millis(DEFAULT_REFRESH_MS),
            unit_refresh_interval: Duration::from_millis(DEFAULT_REFRESH_MS),
            shutdown_grace: Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MS),
            active_low: true,
            driver: DriverKind::default(),
            sysfs_root: PathBuf::from(DEFAULT_SYSFS_ROOT),
            chip_base: 0,
            pwm_chip: PathBuf::from(DEFAULT_PWM_CHIP),
            default_relays: default_relays(),
        }
    }
}

impl Settings {
    /// Checks constraints serde cannot express.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.refresh_interval.is_zero() {
            return Err(SettingsError::ZeroInterval {
                field: "refresh_interval_ms",
            });
        }
        if self.unit_refresh_interval.is_zero() {
            return Err(SettingsError::ZeroInterval {
                field: "unit_refresh_interval_ms",
            });
        }
        self.default_relays.validate()?;
        Ok(())
    }

    fn from_file(file: SettingsFile) -> Self {
        let d = Settings::default();
        Self {
            config_file: file.config_file.unwrap_or(d.config_file),
            status_dir: file.status_dir.unwrap_or(d.status_dir),
            log_dir: file.log_dir,
            refresh_interval: file
                .refresh_interval_ms
                .map_or(d.refresh_interval, Duration::from_millis),
            unit_refresh_interval: file
                .unit_refresh_interval_ms
                .map_or(d.unit_refresh_interval, Duration::from_millis),
            shutdown_grace: file
                .shutdown_grace_ms
                .map_or(d.shutdown_grace, Duration::from_millis),
            active_low: file.active_low.unwrap_or(d.active_low),
            driver: file.driver.unwrap_or(d.driver),
            sysfs_root: file.sysfs_root.unwrap_or(d.sysfs_root),
            chip_base: file.chip_base.unwrap_or(d.chip_base),
            pwm_chip: file.pwm_chip.unwrap_or(d.pwm_chip),
            default_relays: file.default_relays.unwrap_or(d.default_relays),
        }
    }
}

// ── SettingsManager ───────────────────────────────────────────────────────────

/// Loads and holds the daemon settings.
#[derive(Debug, Default)]
pub struct SettingsManager {
    settings: Settings,

    /// Set to `true` after a successful [`load_from_file`](Self::load_from_file).
    loaded: bool,
}

impl SettingsManager {
    /// Creates a manager holding the built-in defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses and validates `path`, replacing the current settings.
    ///
    /// On error the previous settings are kept.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, the YAML is structurally
    /// invalid, or a value fails validation.
    pub fn load_from_file(&mut self, path: &Path) -> Result<()> {
        info!("Loading daemon settings from: {}", path.display());

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot open settings file: {}", path.display()))?;

        // An empty document means "all defaults".
        let file: SettingsFile = if content.trim().is_empty() {
            SettingsFile::default()
        } else {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML file: {}", path.display()))?
        };

        let settings = Settings::from_file(file);
        settings
            .validate()
            .with_context(|| format!("Invalid settings in {}", path.display()))?;

        debug!(?settings, "settings parsed");
        info!(
            config_file = %settings.config_file.display(),
            status_dir = %settings.status_dir.display(),
            driver = %settings.driver,
            relays = settings.default_relays.len(),
            "Settings loaded"
        );

        self.settings = settings;
        self.loaded = true;
        Ok(())
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn into_settings(self) -> Settings {
        self.settings
    }

    /// Returns `true` after a successful call to [`load_from_file`](Self::load_from_file).
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
