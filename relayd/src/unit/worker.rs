/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! The per-relay worker task and its handle.
//!
//! Lifecycle of one worker:
//!
//! ```text
//! desired off ──────────────────────────────► exit Ok (nothing to do)
//! desired on ─► acquire(idle) ─► drive on ─► poll ─┐
//!                    │ fail           ▲            │ drift: drive on again
//!                    ▼                └────────────┘
//!              exit PinAcquisition          │ desired off / stop
//!                                           ▼
//!                           drive idle ─► release ─► exit Ok
//! ```
//!
//! "On" is the active level for a relay and the configured duty cycle for a
//! PWM channel; "idle" is the inactive level or a 0 % duty cycle.  An intent
//! change wakes the poll early, so new PWM settings apply at once.
//!
//! An I/O failure while polling drives the output idle (best effort),
//! releases it and exits with [`UnitError::PinIo`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{drive_idle, Intent, UnitError};
use crate::gpio::{DriverError, PinDriver, Polarity};
use crate::relay::{Pin, PwmSettings, RelayId};

// ── WorkerHandle ──────────────────────────────────────────────────────────────

/// Owning handle to a running worker task.
#[derive(Debug)]
pub struct WorkerHandle {
    relay_id: RelayId,
    pin: Pin,
    join: JoinHandle<Result<(), UnitError>>,
    stop: watch::Sender<bool>,
}

impl WorkerHandle {
    pub fn is_alive(&self) -> bool {
        !self.join.is_finished()
    }

    /// Asks the worker to switch off and exit.  Does not wait.
    pub fn request_stop(&self) {
        self.stop.send_replace(true);
    }

    /// Cancels the task at its next suspension point.
    pub fn abort(&self) {
        self.join.abort();
    }

    /// Waits up to `timeout` for the worker to exit and returns its result.
    ///
    /// `None` means it is still running.  A finished worker is collected
    /// even with a zero timeout.  Cancel-safe; once this has returned
    /// `Some`, the handle must not be waited on again.
    pub async fn wait(&mut self, timeout: Duration) -> Option<Result<(), UnitError>> {
        match tokio::time::timeout(timeout, &mut self.join).await {
            Ok(Ok(result)) => Some(result),
            Ok(Err(join_err)) => Some(Err(UnitError::Crashed {
                relay_id: self.relay_id.clone(),
                pin: self.pin,
                reason: join_err.to_string(),
            })),
            Err(_elapsed) => None,
        }
    }
}

// ── Worker ────────────────────────────────────────────────────────────────────

pub(crate) struct Worker {
    pub relay_id: RelayId,
    pub pin: Pin,
    pub polarity: Polarity,
    pub refresh_interval: Duration,
    pub driver: Arc<dyn PinDriver>,
    pub intent: watch::Receiver<Intent>,
    pub observed: Arc<AtomicBool>,
}

impl Worker {
    /// Spawns the worker on the current runtime.
    pub(crate) fn spawn(self) -> WorkerHandle {
        let (stop, stop_rx) = watch::channel(false);
        let relay_id = self.relay_id.clone();
        let pin = self.pin;
        let join = tokio::spawn(self.run(stop_rx));
        WorkerHandle {
            relay_id,
            pin,
            join,
            stop,
        }
    }

    fn name(&self) -> String {
        self.intent.borrow().name.clone()
    }

    /// Requested PWM settings; `None` for a plain relay.
    fn pwm(&self) -> Option<PwmSettings> {
        self.intent.borrow().pwm
    }

    fn wanted(&self, stop: &watch::Receiver<bool>) -> bool {
        self.intent.borrow().desired_state && !*stop.borrow()
    }

    /// Claims the output without switching it on.
    fn acquire(&self) -> Result<(), DriverError> {
        match self.pwm() {
            None => self.driver.acquire_output(self.pin, self.polarity.inactive()),
            Some(pwm) => self.driver.acquire_pwm(self.pin, pwm.frequency),
        }
    }

    fn drive_on(&self) -> Result<(), DriverError> {
        match self.pwm() {
            None => self.driver.write(self.pin, self.polarity.active()),
            Some(pwm) => self.driver.set_pwm(self.pin, pwm),
        }
    }

    /// `true` when the hardware still matches the intent.
    fn holds_on(&self) -> Result<bool, DriverError> {
        match self.pwm() {
            None => Ok(self.driver.read(self.pin)? == self.polarity.active()),
            Some(pwm) => Ok(self.driver.read_pwm(self.pin)? == pwm),
        }
    }

    async fn run(mut self, mut stop: watch::Receiver<bool>) -> Result<(), UnitError> {
        self.intent.borrow_and_update();
        if !self.wanted(&stop) {
            debug!(relay_id = %self.relay_id, pin = %self.pin, "worker started with relay off, nothing to do");
            return Ok(());
        }

        // Claim idle first so the output never glitches on before the claim
        // is confirmed.
        if let Err(source) = self.acquire() {
            let err = UnitError::PinAcquisition {
                relay_id: self.relay_id.clone(),
                name: self.name(),
                pin: self.pin,
                source,
            };
            error!(relay_id = %self.relay_id, name = %self.name(), pin = %self.pin, phase = "acquire", error = %err, "cannot switch relay on");
            return Err(err);
        }

        if let Err(source) = self.drive_on() {
            return Err(self.fail("switch on", source));
        }
        self.observed.store(true, Ordering::Release);
        info!(relay_id = %self.relay_id, name = %self.name(), pin = %self.pin, pwm = ?self.pwm(), "relay switched ON");

        loop {
            tokio::select! {
                changed = self.intent.changed() => {
                    // Sender gone: the unit was dropped.
                    if changed.is_err() {
                        break;
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.refresh_interval) => {}
            }

            if !self.wanted(&stop) {
                break;
            }

            match self.holds_on() {
                Ok(true) => {}
                Ok(false) => {
                    warn!(relay_id = %self.relay_id, name = %self.name(), pin = %self.pin, pwm = ?self.pwm(), "output does not match intent, re-asserting");
                    if let Err(source) = self.drive_on() {
                        return Err(self.fail("re-assert", source));
                    }
                }
                Err(source) => return Err(self.fail("poll", source)),
            }
        }

        self.switch_off();
        info!(relay_id = %self.relay_id, name = %self.name(), pin = %self.pin, "relay switched OFF");
        Ok(())
    }

    /// Drives the output idle and releases it.  Failures are logged only.
    fn switch_off(&self) {
        if let Err(e) = drive_idle(self.driver.as_ref(), self.pin, self.polarity, self.pwm()) {
            warn!(relay_id = %self.relay_id, pin = %self.pin, phase = "switch off", error = %e, "cannot drive output idle");
        }
        if let Err(e) = self.driver.release(self.pin) {
            warn!(relay_id = %self.relay_id, pin = %self.pin, phase = "release", error = %e, "cannot release pin");
        }
        self.observed.store(false, Ordering::Release);
    }

    fn fail(&self, phase: &'static str, source: DriverError) -> UnitError {
        let err = UnitError::PinIo {
            relay_id: self.relay_id.clone(),
            name: self.name(),
            pin: self.pin,
            phase,
            source,
        };
        error!(relay_id = %self.relay_id, name = %self.name(), pin = %self.pin, phase, error = %err, "pin I/O failed, releasing relay");
        self.switch_off();
        err
    }
}
