/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! One output (a relay or a PWM channel): its intent, its worker and its
//! status.
//!
//! The supervisor owns every [`ActuatorUnit`] and is the only writer of its
//! intent.  [`apply`](ActuatorUnit::apply) and [`update`](ActuatorUnit::update)
//! never touch hardware; they replace the [`Intent`] held in a `watch`
//! channel and the unit's worker reacts on its own task.
//!
//! | Field | Written by | Read by |
//! |---|---|---|
//! | intent (`name`, `desired_state`, `pwm`) | supervisor | worker |
//! | `observed_state` | worker | supervisor, status |
//! | worker handle | supervisor | supervisor |

mod error;
mod worker;

pub use error::UnitError;
pub use worker::WorkerHandle;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::gpio::{DriverError, PinDriver, Polarity};
use crate::relay::{OutputKind, Pin, PwmSettings, RelayConfigEntry, RelayId, MAX_BCM_PIN};
use crate::status::{timestamp, StatusSink, UnitStatus};

use worker::Worker;

// ── Settings & intent ─────────────────────────────────────────────────────────

/// Per-unit tunables shared by every relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitSettings {
    /// Poll period while the relay is ON.
    pub refresh_interval: Duration,
    pub polarity: Polarity,
}

impl UnitSettings {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            refresh_interval: settings.unit_refresh_interval,
            polarity: Polarity::new(settings.active_low),
        }
    }
}

impl Default for UnitSettings {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(1),
            polarity: Polarity::default(),
        }
    }
}

/// What the supervisor wants from a relay.  Replaced as a whole.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Intent {
    pub name: String,
    pub desired_state: bool,
    /// Frequency and duty while ON; `None` for a relay.
    pub pwm: Option<PwmSettings>,
}

/// A partial change to a unit.  `None` fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitUpdate {
    pub name: Option<String>,
    pub pin: Option<Pin>,
    pub desired_state: Option<bool>,
    pub pwm: Option<PwmSettings>,
}

impl From<&RelayConfigEntry> for UnitUpdate {
    fn from(entry: &RelayConfigEntry) -> Self {
        Self {
            name: Some(entry.name.clone()),
            pin: Some(entry.pin),
            desired_state: Some(entry.desired_state),
            pwm: entry.pwm,
        }
    }
}

/// How a unit's worker ended when it was stopped.
#[derive(Debug)]
pub enum Retired {
    /// There was no worker.
    Idle,
    /// The worker switched off and released its pin.
    Clean,
    /// The worker had already ended with an error.
    Failed(UnitError),
    /// The worker missed the deadline, was aborted and its pin released
    /// at driver level.
    Forced,
}

/// Drives `pin` to its safe level: inactive for a relay, 0 % duty for PWM.
pub(crate) fn drive_idle(
    driver: &dyn PinDriver,
    pin: Pin,
    polarity: Polarity,
    pwm: Option<PwmSettings>,
) -> Result<(), DriverError> {
    match pwm {
        None => driver.write(pin, polarity.inactive()),
        Some(pwm) => driver.set_pwm(pin, pwm.idle()),
    }
}

// ── ActuatorUnit ──────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ActuatorUnit {
    id: RelayId,
    pin: Pin,
    kind: OutputKind,
    settings: UnitSettings,
    driver: Arc<dyn PinDriver>,
    intent: watch::Sender<Intent>,
    observed: Arc<AtomicBool>,
    worker: Option<WorkerHandle>,
    starts: u64,
    last_status_write: Option<Instant>,
}

impl ActuatorUnit {
    pub fn new(
        id: RelayId,
        entry: &RelayConfigEntry,
        settings: UnitSettings,
        driver: Arc<dyn PinDriver>,
    ) -> Result<Self, UnitError> {
        if entry.pin.bcm() > MAX_BCM_PIN {
            return Err(UnitError::PinOutOfRange {
                relay_id: id,
                pin: entry.pin,
            });
        }
        let (intent, _) = watch::channel(Intent {
            name: entry.name.clone(),
            desired_state: entry.desired_state,
            pwm: entry.pwm,
        });
        Ok(Self {
            id,
            pin: entry.pin,
            kind: entry.kind(),
            settings,
            driver,
            intent,
            observed: Arc::new(AtomicBool::new(false)),
            worker: None,
            starts: 0,
            last_status_write: None,
        })
    }

    pub fn id(&self) -> &RelayId {
        &self.id
    }

    pub fn pin(&self) -> Pin {
        self.pin
    }

    pub fn kind(&self) -> OutputKind {
        self.kind
    }

    pub fn pwm(&self) -> Option<PwmSettings> {
        self.intent.borrow().pwm
    }

    pub fn name(&self) -> String {
        self.intent.borrow().name.clone()
    }

    pub fn desired_state(&self) -> bool {
        self.intent.borrow().desired_state
    }

    /// Last level successfully written, as ON/OFF.
    pub fn observed_state(&self) -> bool {
        self.observed.load(Ordering::Acquire)
    }

    /// Number of workers spawned over the unit's life.
    pub fn starts(&self) -> u64 {
        self.starts
    }

    pub fn last_status_write(&self) -> Option<Instant> {
        self.last_status_write
    }

    /// Records a new desired state.  Returns `true` if it changed.
    pub fn apply(&self, desired_state: bool) -> bool {
        self.intent.send_if_modified(|intent| {
            if intent.desired_state == desired_state {
                return false;
            }
            intent.desired_state = desired_state;
            true
        })
    }

    /// Applies every field of `update` or none of them.
    ///
    /// Returns `true` if anything changed.
    pub fn update(&self, update: UnitUpdate) -> Result<bool, UnitError> {
        if let Some(requested) = update.pin {
            if requested != self.pin {
                return Err(UnitError::PinImmutable {
                    relay_id: self.id.clone(),
                    current: self.pin,
                    requested,
                });
            }
        }
        if update.pwm.is_some() && self.kind == OutputKind::Relay {
            return Err(UnitError::KindImmutable {
                relay_id: self.id.clone(),
                current: OutputKind::Relay,
                requested: OutputKind::Pwm,
            });
        }
        let changed = self.intent.send_if_modified(|intent| {
            let mut changed = false;
            if let Some(name) = update.name {
                if intent.name != name {
                    intent.name = name;
                    changed = true;
                }
            }
            if let Some(state) = update.desired_state {
                if intent.desired_state != state {
                    intent.desired_state = state;
                    changed = true;
                }
            }
            if let Some(pwm) = update.pwm {
                if intent.pwm != Some(pwm) {
                    intent.pwm = Some(pwm);
                    changed = true;
                }
            }
            changed
        });
        if changed {
            debug!(relay_id = %self.id, intent = ?*self.intent.borrow(), "unit intent updated");
        }
        Ok(changed)
    }

    pub fn is_alive(&self) -> bool {
        self.worker.as_ref().is_some_and(WorkerHandle::is_alive)
    }

    /// Spawns a worker unless one is still running.
    ///
    /// Must be called from within a Tokio runtime.  Returns `true` if a
    /// worker was spawned.
    pub fn start(&mut self) -> bool {
        if self.is_alive() {
            return false;
        }
        let worker = Worker {
            relay_id: self.id.clone(),
            pin: self.pin,
            polarity: self.settings.polarity,
            refresh_interval: self.settings.refresh_interval,
            driver: Arc::clone(&self.driver),
            intent: self.intent.subscribe(),
            observed: Arc::clone(&self.observed),
        };
        self.worker = Some(worker.spawn());
        self.starts += 1;
        debug!(relay_id = %self.id, pin = %self.pin, starts = self.starts, "worker spawned");
        true
    }

    /// Collects a finished worker.
    ///
    /// Returns `None` while the worker runs or if there is none.
    pub async fn reap(&mut self) -> Option<Result<(), UnitError>> {
        if self.is_alive() {
            return None;
        }
        let result = self.worker.as_mut()?.wait(Duration::ZERO).await;
        if result.is_some() {
            self.worker = None;
        }
        result
    }

    /// Switches the output off and waits up to `grace` for the worker to
    /// release its pin.  A worker that misses the deadline is aborted and
    /// its pin released directly.
    ///
    /// Cancel-safe: dropped before completion, the unit keeps its worker
    /// handle and the stop request stays in force.
    pub async fn stop_worker(&mut self, grace: Duration) -> Retired {
        self.apply(false);
        let Some(handle) = self.worker.as_mut() else {
            return Retired::Idle;
        };
        handle.request_stop();
        let outcome = handle.wait(grace).await;
        let handle = self.worker.take();
        match outcome {
            Some(Ok(())) => Retired::Clean,
            Some(Err(e)) => Retired::Failed(e),
            None => {
                warn!(relay_id = %self.id, name = %self.name(), pin = %self.pin, phase = "stop", ?grace, "worker did not stop in time, aborting");
                if let Some(handle) = handle {
                    handle.abort();
                }
                self.force_release();
                Retired::Forced
            }
        }
    }

    /// Aborts the worker without waiting, drives the output idle and
    /// releases it at driver level.
    pub fn force_off(&mut self) {
        self.apply(false);
        if let Some(handle) = self.worker.take() {
            handle.request_stop();
            handle.abort();
        }
        self.force_release();
    }

    fn force_release(&self) {
        if let Err(e) = drive_idle(self.driver.as_ref(), self.pin, self.settings.polarity, self.pwm()) {
            debug!(relay_id = %self.id, pin = %self.pin, error = %e, "forced switch off failed");
        }
        match self.driver.release(self.pin) {
            Ok(()) | Err(DriverError::NotClaimed { .. }) => {}
            Err(e) => warn!(relay_id = %self.id, pin = %self.pin, phase = "release", error = %e, "forced release failed"),
        }
        self.observed.store(false, Ordering::Release);
    }

    pub fn status(&self) -> UnitStatus {
        let observed = self.observed_state();
        let pwm = self.pwm();
        UnitStatus {
            relay_id: self.id.clone(),
            name: self.name(),
            pin: self.pin,
            status: observed,
            pwm_frequency: pwm.map(|p| p.frequency),
            pwm_duty_cycle: pwm.map(|p| if observed { p.duty_cycle } else { 0 }),
            last_updated: timestamp(),
        }
    }

    /// Publishes the current status.  Errors are logged, never returned.
    pub fn push_status(&mut self, sink: &dyn StatusSink) {
        match sink.publish_unit(&self.status()) {
            Ok(()) => self.last_status_write = Some(Instant::now()),
            Err(e) => {
                warn!(relay_id = %self.id, name = %self.name(), pin = %self.pin, phase = "publish", error = %e, "status publish failed")
            }
        }
    }

    /// Removes the published status of a retired unit.  Errors are logged.
    pub fn withdraw_status(&self, sink: &dyn StatusSink) {
        if let Err(e) = sink.withdraw_unit(&self.id, self.pin) {
            warn!(relay_id = %self.id, pin = %self.pin, phase = "publish", error = %e, "status withdrawal failed");
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
