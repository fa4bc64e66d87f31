/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Linux sysfs GPIO and PWM driver.
//!
//! ```text
//! <root>/export                  ← "<n>"        claim line n
//! <root>/gpio<n>/direction       ← "high"|"low" output with initial level
//!                                ← "in"         back to input on release
//! <root>/gpio<n>/value           ↔ "1"|"0"
//! <root>/unexport                ← "<n>"        release line n
//!
//! <pwm_chip>/export              ← "<c>"        claim channel c
//! <pwm_chip>/pwm<c>/period       ↔ ns
//! <pwm_chip>/pwm<c>/duty_cycle   ↔ ns
//! <pwm_chip>/pwm<c>/enable       ← "1"|"0"
//! <pwm_chip>/unexport            ← "<c>"
//! ```
//!
//! `n` is `chip_base + bcm`.  On recent Raspberry Pi kernels the header pins
//! live on a chip whose base is 512; older kernels use 0.
//!
//! Hardware PWM needs the `pwm-2chan` overlay, which routes channel 0 to BCM
//! 12 or 18 and channel 1 to BCM 13 or 19.
//!
//! Released lines are switched back to input, so nothing keeps driving a
//! relay coil once the daemon lets go of it.
//!
//! Every call is a handful of small attribute writes.  The one exception is
//! an export: udev needs a moment to make the new attributes writable, and
//! the driver blocks the calling worker for at most [`EXPORT_SETTLE_LIMIT`]
//! while it waits.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use super::claims::ClaimSet;
use super::{DriverError, Level, Numbering, PinDriver};
use crate::config::DEFAULT_PWM_CHIP;
use crate::relay::{Pin, PwmSettings};

const EXPORT_SETTLE_ATTEMPTS: u64 = 20;
const EXPORT_SETTLE_STEP_MS: u64 = 5;
const EXPORT_SETTLE_STEP: Duration = Duration::from_millis(EXPORT_SETTLE_STEP_MS);

/// Longest time an export waits for its attributes to appear.
pub const EXPORT_SETTLE_LIMIT: Duration =
    Duration::from_millis(EXPORT_SETTLE_STEP_MS * EXPORT_SETTLE_ATTEMPTS);

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Hardware PWM channel wired to a BCM pin, if any.
fn pwm_channel(pin: Pin) -> Option<u32> {
    match pin.bcm() {
        12 | 18 => Some(0),
        13 | 19 => Some(1),
        _ => None,
    }
}

#[derive(Debug)]
pub struct SysfsDriver {
    root: PathBuf,
    chip_base: u32,
    pwm_chip: PathBuf,
    claims: ClaimSet,
    /// Claimed pins running as PWM, with their channel.
    pwm_channels: Mutex<BTreeMap<Pin, u32>>,
    numbering: Mutex<Option<Numbering>>,
}

impl SysfsDriver {
    pub fn new(root: impl Into<PathBuf>, chip_base: u32) -> Self {
        Self {
            root: root.into(),
            chip_base,
            pwm_chip: PathBuf::from(DEFAULT_PWM_CHIP),
            claims: ClaimSet::default(),
            pwm_channels: Mutex::new(BTreeMap::new()),
            numbering: Mutex::new(None),
        }
    }

    /// Uses `chip` (a `/sys/class/pwm/pwmchipN` directory) for PWM outputs.
    pub fn with_pwm_chip(mut self, chip: impl Into<PathBuf>) -> Self {
        self.pwm_chip = chip.into();
        self
    }

    fn line(&self, pin: Pin) -> u32 {
        self.chip_base + u32::from(pin.bcm())
    }

    fn line_dir(&self, pin: Pin) -> PathBuf {
        self.root.join(format!("gpio{}", self.line(pin)))
    }

    fn pwm_dir(&self, channel: u32) -> PathBuf {
        self.pwm_chip.join(format!("pwm{channel}"))
    }

    fn channels(&self) -> MutexGuard<'_, BTreeMap<Pin, u32>> {
        self.pwm_channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_attr(path: &Path, value: &str, pin: Pin, op: &'static str) -> Result<(), DriverError> {
        fs::write(path, value).map_err(|source| DriverError::Io { pin, op, source })
    }

    fn read_attr(path: &Path, pin: Pin, op: &'static str) -> Result<String, DriverError> {
        fs::read_to_string(path)
            .map(|raw| raw.trim().to_string())
            .map_err(|source| DriverError::Io { pin, op, source })
    }

    fn read_nanos(path: &Path, pin: Pin, op: &'static str) -> Result<u64, DriverError> {
        let raw = Self::read_attr(path, pin, op)?;
        raw.parse()
            .map_err(|_| DriverError::BadValue { pin, value: raw })
    }

    /// Waits up to [`EXPORT_SETTLE_LIMIT`] for `attr` to appear.
    fn settle(attr: &Path, pin: Pin) -> Result<(), DriverError> {
        for _ in 0..EXPORT_SETTLE_ATTEMPTS {
            if attr.exists() {
                return Ok(());
            }
            thread::sleep(EXPORT_SETTLE_STEP);
        }
        Err(DriverError::Io {
            pin,
            op: "export",
            source: io::Error::new(
                io::ErrorKind::TimedOut,
                format!("{} never appeared", attr.display()),
            ),
        })
    }

    fn export(&self, pin: Pin) -> Result<(), DriverError> {
        let dir = self.line_dir(pin);
        if dir.exists() {
            debug!(%pin, line = self.line(pin), "line already exported");
            return Ok(());
        }
        Self::write_attr(
            &self.root.join("export"),
            &self.line(pin).to_string(),
            pin,
            "export",
        )?;
        Self::settle(&dir.join("direction"), pin)
    }

    fn unexport(&self, pin: Pin) -> Result<(), DriverError> {
        Self::write_attr(
            &self.root.join("unexport"),
            &self.line(pin).to_string(),
            pin,
            "unexport",
        )
    }

    fn export_pwm(&self, pin: Pin, channel: u32) -> Result<(), DriverError> {
        let dir = self.pwm_dir(channel);
        if dir.exists() {
            debug!(%pin, channel, "PWM channel already exported");
            return Ok(());
        }
        Self::write_attr(
            &self.pwm_chip.join("export"),
            &channel.to_string(),
            pin,
            "export",
        )?;
        Self::settle(&dir.join("period"), pin)
    }

    fn program_pwm(&self, pin: Pin, channel: u32, settings: PwmSettings) -> Result<(), DriverError> {
        let period = NANOS_PER_SEC
            .checked_div(u64::from(settings.frequency))
            .ok_or_else(|| DriverError::Io {
                pin,
                op: "set period",
                source: io::Error::new(io::ErrorKind::InvalidInput, "zero PWM frequency"),
            })?;
        let duty = period * u64::from(settings.duty_cycle.min(100)) / 100;
        let dir = self.pwm_dir(channel);

        // The kernel refuses a duty cycle longer than the period, so clear it
        // before moving the period.
        Self::write_attr(&dir.join("duty_cycle"), "0", pin, "set duty cycle")?;
        Self::write_attr(&dir.join("period"), &period.to_string(), pin, "set period")?;
        Self::write_attr(&dir.join("duty_cycle"), &duty.to_string(), pin, "set duty cycle")
    }

    fn claimed_channel(&self, pin: Pin) -> Result<u32, DriverError> {
        self.claims.ensure(pin)?;
        self.channels()
            .get(&pin)
            .copied()
            .ok_or(DriverError::PwmUnsupported { pin })
    }

    /// Returns a claimed pin's hardware to its idle state and gives it back
    /// to the kernel.  Both steps run; the first error is returned.
    fn free(&self, pin: Pin) -> Result<(), DriverError> {
        let channel = self.channels().remove(&pin);
        match channel {
            Some(channel) => {
                let disabled = Self::write_attr(
                    &self.pwm_dir(channel).join("enable"),
                    "0",
                    pin,
                    "disable PWM",
                );
                let unexported = Self::write_attr(
                    &self.pwm_chip.join("unexport"),
                    &channel.to_string(),
                    pin,
                    "unexport",
                );
                disabled.and(unexported)
            }
            None => {
                let input = Self::write_attr(
                    &self.line_dir(pin).join("direction"),
                    "in",
                    pin,
                    "set direction",
                );
                let unexported = self.unexport(pin);
                input.and(unexported)
            }
        }
    }
}

impl PinDriver for SysfsDriver {
    fn numbering(&self) -> Option<Numbering> {
        *self.numbering.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_numbering(&self, mode: Numbering) -> Result<(), DriverError> {
        // sysfs only knows kernel line numbers; BCM maps onto them via chip_base.
        if mode != Numbering::Bcm {
            return Err(DriverError::UnsupportedNumbering(mode));
        }
        *self.numbering.lock().unwrap_or_else(PoisonError::into_inner) = Some(mode);
        Ok(())
    }

    fn acquire_output(&self, pin: Pin, initial: Level) -> Result<(), DriverError> {
        self.claims.claim(pin)?;

        let result = self.export(pin).and_then(|()| {
            let direction = match initial {
                Level::High => "high",
                Level::Low => "low",
            };
            Self::write_attr(
                &self.line_dir(pin).join("direction"),
                direction,
                pin,
                "set direction",
            )
        });

        if let Err(e) = result {
            let _ = self.claims.release(pin);
            return Err(e);
        }
        debug!(%pin, line = self.line(pin), %initial, "sysfs: acquired output");
        Ok(())
    }

    fn release(&self, pin: Pin) -> Result<(), DriverError> {
        self.claims.release(pin)?;
        self.free(pin)
    }

    fn write(&self, pin: Pin, level: Level) -> Result<(), DriverError> {
        self.claims.ensure(pin)?;
        let value = match level {
            Level::High => "1",
            Level::Low => "0",
        };
        Self::write_attr(&self.line_dir(pin).join("value"), value, pin, "write value")
    }

    fn read(&self, pin: Pin) -> Result<Level, DriverError> {
        self.claims.ensure(pin)?;
        let raw = Self::read_attr(&self.line_dir(pin).join("value"), pin, "read value")?;
        match raw.as_str() {
            "1" => Ok(Level::High),
            "0" => Ok(Level::Low),
            other => Err(DriverError::BadValue {
                pin,
                value: other.to_string(),
            }),
        }
    }

    fn acquire_pwm(&self, pin: Pin, frequency: u32) -> Result<(), DriverError> {
        let channel = pwm_channel(pin).ok_or(DriverError::PwmUnsupported { pin })?;
        self.claims.claim(pin)?;

        let reserved = {
            let mut channels = self.channels();
            if channels.values().any(|&c| c == channel) {
                Err(DriverError::ChannelBusy { pin, channel })
            } else {
                channels.insert(pin, channel);
                Ok(())
            }
        };
        let result = reserved
            .and_then(|()| self.export_pwm(pin, channel))
            .and_then(|()| self.program_pwm(pin, channel, PwmSettings::new(frequency, 0)))
            .and_then(|()| {
                Self::write_attr(&self.pwm_dir(channel).join("enable"), "1", pin, "enable PWM")
            });

        if let Err(e) = result {
            if !matches!(e, DriverError::ChannelBusy { .. }) {
                self.channels().remove(&pin);
            }
            let _ = self.claims.release(pin);
            return Err(e);
        }
        debug!(%pin, channel, frequency, "sysfs: acquired PWM channel");
        Ok(())
    }

    fn set_pwm(&self, pin: Pin, settings: PwmSettings) -> Result<(), DriverError> {
        let channel = self.claimed_channel(pin)?;
        self.program_pwm(pin, channel, settings)
    }

    fn read_pwm(&self, pin: Pin) -> Result<PwmSettings, DriverError> {
        let channel = self.claimed_channel(pin)?;
        let dir = self.pwm_dir(channel);
        let period = Self::read_nanos(&dir.join("period"), pin, "read period")?;
        let duty = Self::read_nanos(&dir.join("duty_cycle"), pin, "read duty cycle")?;
        if period == 0 || duty > period {
            return Err(DriverError::BadValue {
                pin,
                value: format!("period={period} duty_cycle={duty}"),
            });
        }

        let frequency = (NANOS_PER_SEC + period / 2) / period;
        let percent = (duty * 100 + period / 2) / period;
        Ok(PwmSettings::new(
            u32::try_from(frequency).unwrap_or(u32::MAX),
            u8::try_from(percent).unwrap_or(100),
        ))
    }

    fn release_all(&self) -> Result<(), DriverError> {
        let mut first_error = None;
        for pin in self.claims.drain() {
            if let Err(e) = self.free(pin) {
                warn!(%pin, error = %e, "release failed during release_all");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tempfile::TempDir;

    /// Fake sysfs tree with line directories already present, the way they
    /// look after the kernel has processed an export.
    fn fake_sysfs(lines: &[u32]) -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        for line in lines {
            let gpio = dir.path().join(format!("gpio{line}"));
            fs::create_dir(&gpio).unwrap();
            fs::write(gpio.join("direction"), "in").unwrap();
            fs::write(gpio.join("value"), "0").unwrap();
        }
        dir
    }

    /// Fake PWM chip with both channels exported.
    fn fake_pwm_chip() -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        for channel in 0..2 {
            let pwm = dir.path().join(format!("pwm{channel}"));
            fs::create_dir(&pwm).unwrap();
            fs::write(pwm.join("period"), "0").unwrap();
            fs::write(pwm.join("duty_cycle"), "0").unwrap();
            fs::write(pwm.join("enable"), "0").unwrap();
        }
        dir
    }

    fn attr(root: &Path, line: u32, name: &str) -> String {
        fs::read_to_string(root.join(format!("gpio{line}")).join(name)).unwrap()
    }

    fn pwm_attr(chip: &Path, channel: u32, name: &str) -> String {
        fs::read_to_string(chip.join(format!("pwm{channel}")).join(name)).unwrap()
    }

    #[test]
    fn acquire_sets_direction_with_initial_level() {
        let root = fake_sysfs(&[26]);
        let d = SysfsDriver::new(root.path(), 0);

        d.acquire_output(Pin::new(26), Level::High).unwrap();
        assert_eq!(attr(root.path(), 26, "direction"), "high");
    }

    #[test]
    fn chip_base_offsets_the_line_number() {
        let root = fake_sysfs(&[538]);
        let d = SysfsDriver::new(root.path(), 512);

        d.acquire_output(Pin::new(26), Level::Low).unwrap();
        d.write(Pin::new(26), Level::High).unwrap();
        assert_eq!(attr(root.path(), 538, "value"), "1");
    }

    #[test]
    fn read_parses_value_attribute() {
        let root = fake_sysfs(&[17]);
        let d = SysfsDriver::new(root.path(), 0);
        d.acquire_output(Pin::new(17), Level::High).unwrap();

        fs::write(root.path().join("gpio17/value"), "1\n").unwrap();
        assert_eq!(d.read(Pin::new(17)).unwrap(), Level::High);

        fs::write(root.path().join("gpio17/value"), "x\n").unwrap();
        assert!(matches!(d.read(Pin::new(17)), Err(DriverError::BadValue { .. })));
    }

    #[test]
    fn release_returns_line_to_input_and_unexports() {
        let root = fake_sysfs(&[20]);
        let d = SysfsDriver::new(root.path(), 0);
        d.acquire_output(Pin::new(20), Level::High).unwrap();

        d.release(Pin::new(20)).unwrap();
        assert_eq!(attr(root.path(), 20, "direction"), "in");
        assert_eq!(fs::read_to_string(root.path().join("unexport")).unwrap(), "20");
        assert!(matches!(d.write(Pin::new(20), Level::Low), Err(DriverError::NotClaimed { .. })));
    }

    #[test]
    fn release_all_stops_driving_an_active_relay() {
        let root = fake_sysfs(&[26]);
        let d = SysfsDriver::new(root.path(), 0);
        d.acquire_output(Pin::new(26), Level::High).unwrap();
        d.write(Pin::new(26), Level::Low).unwrap();

        d.release_all().unwrap();
        assert_eq!(attr(root.path(), 26, "direction"), "in");
        assert_eq!(fs::read_to_string(root.path().join("unexport")).unwrap(), "26");
        assert!(!d.claims.contains(Pin::new(26)));
    }

    #[test]
    fn failed_export_does_not_leave_a_claim_behind() {
        let root = tempfile::tempdir().unwrap();
        // `export` is a directory, so writing to it fails.
        fs::create_dir(root.path().join("export")).unwrap();
        let d = SysfsDriver::new(root.path(), 0);

        assert!(d.acquire_output(Pin::new(5), Level::High).is_err());
        assert!(!d.claims.contains(Pin::new(5)));
    }

    #[test]
    fn export_that_never_settles_gives_up_within_the_limit() {
        // The export is accepted but the line directory never shows up.
        let root = tempfile::tempdir().unwrap();
        let d = SysfsDriver::new(root.path(), 0);

        let started = Instant::now();
        let err = d.acquire_output(Pin::new(5), Level::High).unwrap_err();
        let waited = started.elapsed();

        match err {
            DriverError::Io { op, source, .. } => {
                assert_eq!(op, "export");
                assert_eq!(source.kind(), io::ErrorKind::TimedOut);
            }
            other => panic!("expected Io, got {other}"),
        }
        assert!(waited >= EXPORT_SETTLE_LIMIT, "{waited:?}");
        assert!(waited < EXPORT_SETTLE_LIMIT * 10, "{waited:?}");
        assert!(!d.claims.contains(Pin::new(5)));
    }

    #[test]
    fn only_bcm_numbering_is_supported() {
        let d = SysfsDriver::new("/nonexistent", 0);
        assert_eq!(d.numbering(), None);
        d.set_numbering(Numbering::Bcm).unwrap();
        assert_eq!(d.numbering(), Some(Numbering::Bcm));
        assert!(matches!(
            d.set_numbering(Numbering::Board),
            Err(DriverError::UnsupportedNumbering(Numbering::Board))
        ));
    }

    // ── PWM ───────────────────────────────────────────────────────────────────

    #[test]
    fn pwm_acquire_programs_period_and_enables_idle() {
        let chip = fake_pwm_chip();
        let d = SysfsDriver::new("/nonexistent", 0).with_pwm_chip(chip.path());

        d.acquire_pwm(Pin::new(18), 50).unwrap();
        assert_eq!(pwm_attr(chip.path(), 0, "period"), "20000000");
        assert_eq!(pwm_attr(chip.path(), 0, "duty_cycle"), "0");
        assert_eq!(pwm_attr(chip.path(), 0, "enable"), "1");

        d.set_pwm(Pin::new(18), PwmSettings::new(50, 25)).unwrap();
        assert_eq!(pwm_attr(chip.path(), 0, "duty_cycle"), "5000000");
        assert_eq!(d.read_pwm(Pin::new(18)).unwrap(), PwmSettings::new(50, 25));
    }

    #[test]
    fn pwm_needs_a_hardware_channel() {
        let chip = fake_pwm_chip();
        let d = SysfsDriver::new("/nonexistent", 0).with_pwm_chip(chip.path());

        assert!(matches!(
            d.acquire_pwm(Pin::new(26), 50),
            Err(DriverError::PwmUnsupported { .. })
        ));
        assert!(!d.claims.contains(Pin::new(26)));
    }

    #[test]
    fn pins_sharing_a_channel_cannot_both_run() {
        let chip = fake_pwm_chip();
        let d = SysfsDriver::new("/nonexistent", 0).with_pwm_chip(chip.path());
        d.acquire_pwm(Pin::new(12), 50).unwrap();

        assert!(matches!(
            d.acquire_pwm(Pin::new(18), 50),
            Err(DriverError::ChannelBusy { channel: 0, .. })
        ));
        assert!(!d.claims.contains(Pin::new(18)));
        assert!(d.claims.contains(Pin::new(12)));
        d.read_pwm(Pin::new(12)).unwrap();
    }

    #[test]
    fn pwm_release_disables_and_unexports_the_channel() {
        let chip = fake_pwm_chip();
        let d = SysfsDriver::new("/nonexistent", 0).with_pwm_chip(chip.path());
        d.acquire_pwm(Pin::new(13), 100).unwrap();

        d.release(Pin::new(13)).unwrap();
        assert_eq!(pwm_attr(chip.path(), 1, "enable"), "0");
        assert_eq!(fs::read_to_string(chip.path().join("unexport")).unwrap(), "1");
        assert!(matches!(
            d.read_pwm(Pin::new(13)),
            Err(DriverError::NotClaimed { .. })
        ));
    }
}
