/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

use thiserror::Error;

use crate::gpio::DriverError;
use crate::relay::{OutputKind, Pin, RelayId, MAX_BCM_PIN};

/// Failure of one actuator unit or its worker.
///
/// Worker failures (`PinAcquisition`, `PinIo`, `Crashed`) end that worker
/// only; the supervisor's next liveness check restarts it.
#[derive(Debug, Error)]
pub enum UnitError {
    #[error("relay '{relay_id}' ({name}): cannot acquire pin {pin}: {source}")]
    PinAcquisition {
        relay_id: RelayId,
        name: String,
        pin: Pin,
        #[source]
        source: DriverError,
    },

    #[error("relay '{relay_id}' ({name}): pin {pin} I/O failed during {phase}: {source}")]
    PinIo {
        relay_id: RelayId,
        name: String,
        pin: Pin,
        phase: &'static str,
        #[source]
        source: DriverError,
    },

    /// A running unit cannot move to another pin; it has to be recreated.
    #[error("relay '{relay_id}': pin is fixed at {current}, cannot change to {requested}")]
    PinImmutable {
        relay_id: RelayId,
        current: Pin,
        requested: Pin,
    },

    /// A relay cannot turn into a PWM channel in place, nor the reverse.
    #[error("relay '{relay_id}': output is a {current}, cannot change to {requested}")]
    KindImmutable {
        relay_id: RelayId,
        current: OutputKind,
        requested: OutputKind,
    },

    #[error("relay '{relay_id}': pin {pin} is outside 0..={max}", max = MAX_BCM_PIN)]
    PinOutOfRange { relay_id: RelayId, pin: Pin },

    /// The worker task panicked or was cancelled.
    #[error("relay '{relay_id}': worker on pin {pin} crashed: {reason}")]
    Crashed {
        relay_id: RelayId,
        pin: Pin,
        reason: String,
    },
}

impl UnitError {
    /// Phase label used in log events.
    pub fn phase(&self) -> &'static str {
        match self {
            UnitError::PinAcquisition { .. } => "acquire",
            UnitError::PinIo { phase, .. } => phase,
            UnitError::PinImmutable { .. }
            | UnitError::KindImmutable { .. }
            | UnitError::PinOutOfRange { .. } => "update",
            UnitError::Crashed { .. } => "worker",
        }
    }

    pub fn relay_id(&self) -> &RelayId {
        match self {
            UnitError::PinAcquisition { relay_id, .. }
            | UnitError::PinIo { relay_id, .. }
            | UnitError::PinImmutable { relay_id, .. }
            | UnitError::KindImmutable { relay_id, .. }
            | UnitError::PinOutOfRange { relay_id, .. }
            | UnitError::Crashed { relay_id, .. } => relay_id,
        }
    }
}
