/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! relayd – GPIO relay reconciliation daemon
//!
//! Keeps the relays wired to a Raspberry Pi in the state described by a JSON
//! configuration file, and leaves them all OFF when it exits.
//!
//! ```text
//! lib.rs
//! ├── relay        – relay ids, pins, configuration snapshot
//! ├── config/      – YAML daemon settings
//! ├── gpio/        – PinDriver trait, sysfs and in-memory drivers
//! ├── store/       – configuration file with last-known-good fallback
//! ├── status       – JSON status files
//! ├── unit/        – one relay: intent, worker task, status
//! └── supervisor/  – reconciliation loop, safe-shutdown, force-quit
//! ```

pub mod config;
pub mod gpio;
pub mod relay;
pub mod status;
pub mod store;
pub mod supervisor;
pub mod unit;
