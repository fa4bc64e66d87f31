/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

use std::collections::BTreeSet;
use std::sync::{Mutex, PoisonError};

use crate::relay::Pin;

use super::DriverError;

/// In-process record of which pins are held, shared by both drivers.
#[derive(Debug, Default)]
pub(crate) struct ClaimSet {
    pins: Mutex<BTreeSet<Pin>>,
}

impl ClaimSet {
    pub(crate) fn claim(&self, pin: Pin) -> Result<(), DriverError> {
        let mut pins = self.pins.lock().unwrap_or_else(PoisonError::into_inner);
        if !pins.insert(pin) {
            return Err(DriverError::AlreadyClaimed { pin });
        }
        Ok(())
    }

    pub(crate) fn release(&self, pin: Pin) -> Result<(), DriverError> {
        let mut pins = self.pins.lock().unwrap_or_else(PoisonError::into_inner);
        if !pins.remove(&pin) {
            return Err(DriverError::NotClaimed { pin });
        }
        Ok(())
    }

    pub(crate) fn ensure(&self, pin: Pin) -> Result<(), DriverError> {
        if self.contains(pin) {
            Ok(())
        } else {
            Err(DriverError::NotClaimed { pin })
        }
    }

    pub(crate) fn contains(&self, pin: Pin) -> bool {
        self.pins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&pin)
    }

    pub(crate) fn snapshot(&self) -> Vec<Pin> {
        self.pins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }

    /// Empties the set and returns what it held.
    pub(crate) fn drain(&self) -> Vec<Pin> {
        let mut pins = self.pins.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *pins).into_iter().collect()
    }
}
