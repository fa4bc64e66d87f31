/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! In-memory GPIO driver.
//!
//! Behaves like a real chip as far as the core can tell (exclusive claims,
//! levels that persist until written) and adds knobs for fault injection:
//!
//! * [`MockDriver::fail_acquire`] – the next acquisitions of a pin fail;
//! * [`MockDriver::fail_io`] – reads and writes of a claimed pin fail;
//! * [`MockDriver::perturb`] – an outside force flips a pin's level;
//! * [`MockDriver::perturb_pwm`] – the same for a PWM channel's settings.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::trace;

use super::claims::ClaimSet;
use super::{DriverError, Level, Numbering, PinDriver};
use crate::relay::{Pin, PwmSettings};

#[derive(Debug, Default)]
struct MockState {
    numbering: Option<Numbering>,
    numbering_sets: usize,
    levels: BTreeMap<Pin, Level>,
    pwm: BTreeMap<Pin, PwmSettings>,
    acquisitions: BTreeMap<Pin, usize>,
    writes: BTreeMap<Pin, usize>,
    fail_acquire: BTreeSet<Pin>,
    fail_io: BTreeSet<Pin>,
    release_all_calls: usize,
}

/// GPIO driver that keeps all pin state in memory.
#[derive(Debug, Default)]
pub struct MockDriver {
    claims: ClaimSet,
    state: Mutex<MockState>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Fault injection ───────────────────────────────────────────────────────

    /// Makes acquisitions of `pin` fail while `fail` is set.
    pub fn fail_acquire(&self, pin: Pin, fail: bool) {
        let mut st = self.state();
        if fail {
            st.fail_acquire.insert(pin);
        } else {
            st.fail_acquire.remove(&pin);
        }
    }

    /// Makes reads and writes of `pin` fail while `fail` is set.
    pub fn fail_io(&self, pin: Pin, fail: bool) {
        let mut st = self.state();
        if fail {
            st.fail_io.insert(pin);
        } else {
            st.fail_io.remove(&pin);
        }
    }

    /// Changes the level of `pin` behind the owner's back.
    pub fn perturb(&self, pin: Pin, level: Level) {
        self.state().levels.insert(pin, level);
    }

    /// Changes the PWM settings of `pin` behind the owner's back.
    pub fn perturb_pwm(&self, pin: Pin, settings: PwmSettings) {
        self.state().pwm.insert(pin, settings);
    }

    fn count_acquisition(&self, pin: Pin) -> Result<(), DriverError> {
        let mut st = self.state();
        *st.acquisitions.entry(pin).or_default() += 1;
        if st.fail_acquire.contains(&pin) {
            return Err(DriverError::Injected {
                pin,
                reason: "acquisition refused",
            });
        }
        Ok(())
    }

    /// Locks the state for I/O on a claimed, healthy pin.
    fn checked_io(
        &self,
        pin: Pin,
        reason: &'static str,
    ) -> Result<MutexGuard<'_, MockState>, DriverError> {
        self.claims.ensure(pin)?;
        let st = self.state();
        if st.fail_io.contains(&pin) {
            return Err(DriverError::Injected { pin, reason });
        }
        Ok(st)
    }

    // ── Inspection ────────────────────────────────────────────────────────────

    /// Last level driven onto `pin`, or `None` if it was never touched.
    pub fn level(&self, pin: Pin) -> Option<Level> {
        self.state().levels.get(&pin).copied()
    }

    /// Last PWM settings applied to `pin`, or `None` if it never ran PWM.
    pub fn pwm(&self, pin: Pin) -> Option<PwmSettings> {
        self.state().pwm.get(&pin).copied()
    }

    pub fn is_claimed(&self, pin: Pin) -> bool {
        self.claims.contains(pin)
    }

    pub fn claimed(&self) -> Vec<Pin> {
        self.claims.snapshot()
    }

    /// Number of acquisition attempts for `pin`, failed ones included.
    pub fn acquisitions(&self, pin: Pin) -> usize {
        self.state().acquisitions.get(&pin).copied().unwrap_or(0)
    }

    /// Number of successful writes to `pin`, including the initial level.
    pub fn writes(&self, pin: Pin) -> usize {
        self.state().writes.get(&pin).copied().unwrap_or(0)
    }

    pub fn numbering_sets(&self) -> usize {
        self.state().numbering_sets
    }

    pub fn release_all_calls(&self) -> usize {
        self.state().release_all_calls
    }
}

impl PinDriver for MockDriver {
    fn numbering(&self) -> Option<Numbering> {
        self.state().numbering
    }

    fn set_numbering(&self, mode: Numbering) -> Result<(), DriverError> {
        let mut st = self.state();
        st.numbering = Some(mode);
        st.numbering_sets += 1;
        Ok(())
    }

    fn acquire_output(&self, pin: Pin, initial: Level) -> Result<(), DriverError> {
        self.count_acquisition(pin)?;
        self.claims.claim(pin)?;
        let mut st = self.state();
        st.levels.insert(pin, initial);
        *st.writes.entry(pin).or_default() += 1;
        trace!(%pin, %initial, "mock: acquired");
        Ok(())
    }

    fn release(&self, pin: Pin) -> Result<(), DriverError> {
        self.claims.release(pin)?;
        trace!(%pin, "mock: released");
        Ok(())
    }

    fn write(&self, pin: Pin, level: Level) -> Result<(), DriverError> {
        let mut st = self.checked_io(pin, "write failed")?;
        st.levels.insert(pin, level);
        *st.writes.entry(pin).or_default() += 1;
        Ok(())
    }

    fn read(&self, pin: Pin) -> Result<Level, DriverError> {
        let st = self.checked_io(pin, "read failed")?;
        Ok(st.levels.get(&pin).copied().unwrap_or(Level::Low))
    }

    fn acquire_pwm(&self, pin: Pin, frequency: u32) -> Result<(), DriverError> {
        self.count_acquisition(pin)?;
        self.claims.claim(pin)?;
        let mut st = self.state();
        st.pwm.insert(pin, PwmSettings::new(frequency, 0));
        *st.writes.entry(pin).or_default() += 1;
        trace!(%pin, frequency, "mock: acquired PWM");
        Ok(())
    }

    fn set_pwm(&self, pin: Pin, settings: PwmSettings) -> Result<(), DriverError> {
        let mut st = self.checked_io(pin, "PWM update failed")?;
        st.pwm.insert(pin, settings);
        *st.writes.entry(pin).or_default() += 1;
        Ok(())
    }

    fn read_pwm(&self, pin: Pin) -> Result<PwmSettings, DriverError> {
        let st = self.checked_io(pin, "PWM read failed")?;
        st.pwm
            .get(&pin)
            .copied()
            .ok_or(DriverError::PwmUnsupported { pin })
    }

    fn release_all(&self) -> Result<(), DriverError> {
        let released = self.claims.drain();
        self.state().release_all_calls += 1;
        trace!(count = released.len(), "mock: released all pins");
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_write_read_release_cycle() {
        let d = MockDriver::new();
        let pin = Pin::new(26);

        d.acquire_output(pin, Level::High).unwrap();
        assert!(d.is_claimed(pin));
        assert_eq!(d.read(pin).unwrap(), Level::High);

        d.write(pin, Level::Low).unwrap();
        assert_eq!(d.read(pin).unwrap(), Level::Low);

        d.release(pin).unwrap();
        assert!(!d.is_claimed(pin));
        assert!(matches!(d.read(pin), Err(DriverError::NotClaimed { .. })));
    }

    #[test]
    fn pin_cannot_be_claimed_twice() {
        let d = MockDriver::new();
        d.acquire_output(Pin::new(4), Level::High).unwrap();
        assert!(matches!(
            d.acquire_output(Pin::new(4), Level::High),
            Err(DriverError::AlreadyClaimed { .. })
        ));
        assert_eq!(d.acquisitions(Pin::new(4)), 2);
    }

    #[test]
    fn injected_acquire_failure_is_counted_and_leaves_pin_free() {
        let d = MockDriver::new();
        d.fail_acquire(Pin::new(4), true);
        assert!(d.acquire_output(Pin::new(4), Level::High).is_err());
        assert!(!d.is_claimed(Pin::new(4)));
        assert_eq!(d.acquisitions(Pin::new(4)), 1);

        d.fail_acquire(Pin::new(4), false);
        d.acquire_output(Pin::new(4), Level::High).unwrap();
    }

    #[test]
    fn injected_io_failure_hits_reads_and_writes() {
        let d = MockDriver::new();
        d.acquire_output(Pin::new(4), Level::High).unwrap();
        d.fail_io(Pin::new(4), true);
        assert!(d.read(Pin::new(4)).is_err());
        assert!(d.write(Pin::new(4), Level::Low).is_err());
        assert_eq!(d.level(Pin::new(4)), Some(Level::High));
    }

    #[test]
    fn pwm_starts_idle_and_follows_updates() {
        let d = MockDriver::new();
        let pin = Pin::new(18);

        d.acquire_pwm(pin, 50).unwrap();
        assert_eq!(d.read_pwm(pin).unwrap(), PwmSettings::new(50, 0));
        d.set_pwm(pin, PwmSettings::new(100, 40)).unwrap();
        assert_eq!(d.pwm(pin), Some(PwmSettings::new(100, 40)));

        d.fail_io(pin, true);
        assert!(d.set_pwm(pin, PwmSettings::new(100, 0)).is_err());
        assert_eq!(d.pwm(pin), Some(PwmSettings::new(100, 40)));
    }

    #[test]
    fn release_all_frees_every_pin() {
        let d = MockDriver::new();
        d.acquire_output(Pin::new(4), Level::High).unwrap();
        d.acquire_output(Pin::new(5), Level::High).unwrap();
        d.release_all().unwrap();
        assert!(d.claimed().is_empty());
        assert_eq!(d.release_all_calls(), 1);
    }
}
