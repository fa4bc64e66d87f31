/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Relay configuration data model.
//!
//! The persisted configuration maps a relay id onto its wiring and desired
//! state:
//!
//! ```text
//! { "<id>": {"name": "<string>", "pin": <int>, "state": <bool>}, ... }
//! ```
//!
//! An entry carrying a `"pwm": {"frequency": <hz>, "duty_cycle": <percent>}`
//! object describes a PWM channel instead of a relay.  For a PWM channel
//! `state` means "running at the configured duty cycle".
//!
//! A [`Snapshot`] is the validated, immutable form of one such document.  It
//! is the single source of truth handed from the
//! [`ConfigStore`](crate::store::ConfigStore) to the
//! [`Supervisor`](crate::supervisor::Supervisor) every cycle.

use std::borrow::Borrow;
use std::collections::btree_map;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

// ── Constants ─────────────────────────────────────────────────────────────────

/// Highest usable BCM GPIO number on the 40-pin Raspberry Pi header.
pub const MAX_BCM_PIN: u8 = 27;

/// Highest accepted PWM carrier frequency, in Hz.
pub const MAX_PWM_FREQUENCY: u32 = 10_000;

// ── Identity types ────────────────────────────────────────────────────────────

/// Externally assigned relay identifier (the JSON object key).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelayId(String);

impl RelayId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RelayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl Borrow<str> for RelayId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RelayId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// BCM GPIO number a relay is wired to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pin(u8);

impl Pin {
    pub const fn new(bcm: u8) -> Self {
        Self(bcm)
    }

    pub const fn bcm(self) -> u8 {
        self.0
    }
}

impl fmt::Display for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

// ── Output kind ───────────────────────────────────────────────────────────────

/// What kind of output a configuration entry drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// On/off GPIO line.
    Relay,
    /// Hardware PWM channel.
    Pwm,
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OutputKind::Relay => "relay",
            OutputKind::Pwm => "pwm",
        })
    }
}

/// Carrier frequency and duty cycle of a PWM output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PwmSettings {
    /// Hz, `1..=MAX_PWM_FREQUENCY`.
    pub frequency: u32,
    /// Percent, `0..=100`.
    pub duty_cycle: u8,
}

impl PwmSettings {
    pub const fn new(frequency: u32, duty_cycle: u8) -> Self {
        Self {
            frequency,
            duty_cycle,
        }
    }

    /// Same carrier, no output.
    pub const fn idle(self) -> Self {
        Self {
            duty_cycle: 0,
            ..self
        }
    }
}

// ── RelayConfigEntry ──────────────────────────────────────────────────────────

/// One relay as it appears in the configuration file.
///
/// The id is the key of the enclosing map and is not repeated here.  Keys
/// this daemon does not understand are kept in `extra` and written back
/// unchanged, so a UI can annotate entries without losing its data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayConfigEntry {
    pub name: String,
    pub pin: Pin,
    #[serde(rename = "state")]
    pub desired_state: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pwm: Option<PwmSettings>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RelayConfigEntry {
    pub fn new(name: impl Into<String>, pin: Pin, desired_state: bool) -> Self {
        Self {
            name: name.into(),
            pin,
            desired_state,
            pwm: None,
            extra: Map::new(),
        }
    }

    /// Turns the entry into a PWM channel.
    pub fn with_pwm(mut self, pwm: PwmSettings) -> Self {
        self.pwm = Some(pwm);
        self
    }

    pub fn kind(&self) -> OutputKind {
        match self.pwm {
            Some(_) => OutputKind::Pwm,
            None => OutputKind::Relay,
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Why a configuration document was rejected.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("malformed relay configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("relay id must not be empty")]
    EmptyId,

    #[error("relay '{id}' uses pin {pin}, outside BCM range 0..=27")]
    PinOutOfRange { id: RelayId, pin: Pin },

    #[error("pin {pin} is assigned to both relay '{first}' and relay '{second}'")]
    DuplicatePin {
        pin: Pin,
        first: RelayId,
        second: RelayId,
    },

    #[error("relay '{id}' has invalid PWM settings: {reason}")]
    InvalidPwm { id: RelayId, reason: &'static str },

    #[error("relay '{0}' is not configured")]
    UnknownRelay(RelayId),
}

// ── Snapshot ──────────────────────────────────────────────────────────────────

/// Validated, immutable relay configuration.
///
/// Entries are ordered by id so serialisation is deterministic.  Every
/// constructor runs [`Snapshot::validate`]; the only way to hold an invalid
/// snapshot is to deserialize one directly, which is why [`Snapshot::from_json`]
/// exists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot {
    entries: BTreeMap<RelayId, RelayConfigEntry>,
}

impl Snapshot {
    /// Builds a snapshot from `entries`, rejecting empty ids, out-of-range pins
    /// and pins shared between relays.
    pub fn new(
        entries: impl IntoIterator<Item = (RelayId, RelayConfigEntry)>,
    ) -> Result<Self, SnapshotError> {
        let snapshot = Self {
            entries: entries.into_iter().collect(),
        };
        snapshot.validate()?;
        Ok(snapshot)
    }

    /// Parses and validates a JSON configuration document.
    pub fn from_json(bytes: &[u8]) -> Result<Self, SnapshotError> {
        let snapshot: Snapshot = serde_json::from_slice(bytes)?;
        snapshot.validate()?;
        Ok(snapshot)
    }

    /// Serialises with four-space indentation, the layout operators are used
    /// to editing by hand.
    pub fn to_json_pretty(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut out = Vec::with_capacity(64 * self.entries.len().max(1));
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
        self.serialize(&mut ser)?;
        out.push(b'\n');
        Ok(out)
    }

    pub fn validate(&self) -> Result<(), SnapshotError> {
        let mut owners: BTreeMap<Pin, &RelayId> = BTreeMap::new();
        for (id, entry) in &self.entries {
            if id.as_str().is_empty() {
                return Err(SnapshotError::EmptyId);
            }
            if entry.pin.bcm() > MAX_BCM_PIN {
                return Err(SnapshotError::PinOutOfRange {
                    id: id.clone(),
                    pin: entry.pin,
                });
            }
            if let Some(first) = owners.insert(entry.pin, id) {
                return Err(SnapshotError::DuplicatePin {
                    pin: entry.pin,
                    first: first.clone(),
                    second: id.clone(),
                });
            }
            if let Some(pwm) = entry.pwm {
                let reason = if pwm.frequency == 0 || pwm.frequency > MAX_PWM_FREQUENCY {
                    Some("frequency must be within 1..=10000 Hz")
                } else if pwm.duty_cycle > 100 {
                    Some("duty_cycle must be within 0..=100")
                } else {
                    None
                };
                if let Some(reason) = reason {
                    return Err(SnapshotError::InvalidPwm {
                        id: id.clone(),
                        reason,
                    });
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&RelayConfigEntry> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, RelayId, RelayConfigEntry> {
        self.entries.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = &RelayId> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns a copy with relay `id` switched to `state`.
    pub fn with_state(&self, id: &str, state: bool) -> Result<Self, SnapshotError> {
        let mut next = self.clone();
        match next.entries.get_mut(id) {
            Some(entry) => entry.desired_state = state,
            None => return Err(SnapshotError::UnknownRelay(RelayId::from(id))),
        }
        Ok(next)
    }

    /// Returns a copy with every relay switched off.
    pub fn all_off(&self) -> Self {
        let mut next = self.clone();
        for entry in next.entries.values_mut() {
            entry.desired_state = false;
        }
        next
    }
}

impl<'a> IntoIterator for &'a Snapshot {
    type Item = (&'a RelayId, &'a RelayConfigEntry);
    type IntoIter = btree_map::Iter<'a, RelayId, RelayConfigEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
