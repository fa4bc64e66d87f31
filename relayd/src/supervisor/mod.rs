/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Reconciliation loop.
//!
//! The [`Supervisor`] keeps the live set of [`ActuatorUnit`]s in line with the
//! configuration file.  One cycle:
//!
//! ```text
//! store.load()                       last-known-good on corruption
//!   │
//!   ├─ ids gone from the file  ──►  stop worker, release pin, drop unit
//!   ├─ new ids                 ──►  create unit
//!   ├─ pin or kind changed     ──►  stop old unit, create new one
//!   └─ name / state changed    ──►  unit.update()
//!   │
//! liveness: reap dead workers, restart those whose relay should be ON
//!   │
//! publish unit and supervisor status
//! ```
//!
//! Starting is deferred to the liveness step, after every retirement of the
//! cycle, so two relays can swap pins in a single edit.  A retired unit's
//! status file is withdrawn.  A stop request cuts a retirement's wait short;
//! the unit is parked and finished off by safe-shutdown.
//!
//! # State machine
//!
//! ```text
//! Stopped ──start()──► Running ──stop() / cycle error──► Stopping ──► Stopped
//! ```
//!
//! Leaving `Running` always goes through safe-shutdown (all relays OFF in the
//! file and on the pins).  If that fails, force-quit deletes the file, drives
//! every known output to its safe level and releases every pin at driver
//! level.

pub mod error;

pub use error::SupervisorError;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::Settings;
use crate::gpio::{ensure_numbering, Numbering, PinDriver};
use crate::relay::{RelayConfigEntry, RelayId};
use crate::status::{timestamp, StatusSink, SupervisorStatus};
use crate::store::{ConfigError, ConfigStore, LoadSource};
use crate::unit::{ActuatorUnit, Retired, UnitSettings, UnitUpdate};

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Period between reconciliation cycles.
    pub refresh_interval: Duration,
    /// Minimum time safe-shutdown waits for workers to release.
    pub shutdown_grace: Duration,
    pub unit: UnitSettings,
}

impl SupervisorConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            refresh_interval: settings.refresh_interval,
            shutdown_grace: settings.shutdown_grace,
            unit: UnitSettings::from_settings(settings),
        }
    }

    /// Wait bound for stopping workers: never shorter than one worker poll.
    pub fn grace(&self) -> Duration {
        self.shutdown_grace.max(self.unit.refresh_interval)
    }
}

// ── State & reports ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Stopped,
    Running,
    Stopping,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SupervisorState::Stopped => "stopped",
            SupervisorState::Running => "running",
            SupervisorState::Stopping => "stopping",
        })
    }
}

/// What one reconciliation cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub cycle: u64,
    /// Set when the file was missing or corrupt and a fallback was used.
    pub fallback: Option<LoadSource>,
    pub created: Vec<RelayId>,
    pub updated: Vec<RelayId>,
    pub recreated: Vec<RelayId>,
    pub removed: Vec<RelayId>,
    /// Workers found dead with an error.
    pub failed: Vec<RelayId>,
    pub started: Vec<RelayId>,
}

impl CycleReport {
    /// `true` when the cycle changed nothing.
    pub fn is_quiet(&self) -> bool {
        self.fallback.is_none()
            && self.created.is_empty()
            && self.updated.is_empty()
            && self.recreated.is_empty()
            && self.removed.is_empty()
            && self.failed.is_empty()
            && self.started.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownTrigger {
    Requested,
    /// A cycle failed; the message is the cycle error.
    Fault(String),
}

/// Outcome of a completed safe-shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub trigger: ShutdownTrigger,
    pub cycles: u64,
    /// Units whose workers had to be aborted after the grace period.
    pub forced: Vec<RelayId>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.trigger == ShutdownTrigger::Requested && self.forced.is_empty()
    }
}

// ── Supervisor ────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Supervisor {
    store: ConfigStore,
    driver: Arc<dyn PinDriver>,
    sink: Arc<dyn StatusSink>,
    config: SupervisorConfig,
    units: BTreeMap<RelayId, ActuatorUnit>,
    /// Retired units whose wait was cut short by a stop request.
    retiring: Vec<ActuatorUnit>,
    cycle: u64,
    state: watch::Sender<SupervisorState>,
    /// Set while the run loop is active; cleared by safe-shutdown.
    stop_signal: Option<watch::Receiver<bool>>,
}

impl Supervisor {
    pub fn new(
        store: ConfigStore,
        driver: Arc<dyn PinDriver>,
        sink: Arc<dyn StatusSink>,
        config: SupervisorConfig,
    ) -> Self {
        let (state, _) = watch::channel(SupervisorState::Stopped);
        Self {
            store,
            driver,
            sink,
            config,
            units: BTreeMap::new(),
            retiring: Vec::new(),
            cycle: 0,
            state,
            stop_signal: None,
        }
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    /// Number of cycles run so far.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn unit(&self, id: &str) -> Option<&ActuatorUnit> {
        self.units.get(id)
    }

    pub fn units(&self) -> impl Iterator<Item = &ActuatorUnit> {
        self.units.values()
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    /// Runs one reconciliation cycle.
    ///
    /// Per-unit failures are logged and reported, never returned.  The only
    /// error is a configuration store that can no longer be written.
    pub async fn reconcile(&mut self) -> Result<CycleReport, SupervisorError> {
        let cycle = self.cycle + 1;
        self.cycle_inner()
            .await
            .map_err(|source| SupervisorError::Reconciliation { cycle, source })
    }

    async fn cycle_inner(&mut self) -> Result<CycleReport, ConfigError> {
        self.cycle += 1;
        let mut report = CycleReport {
            cycle: self.cycle,
            ..CycleReport::default()
        };

        let (snapshot, source) = self.store.load_classified()?;
        if source != LoadSource::Disk {
            report.fallback = Some(source);
        }

        // ── Retire ids no longer configured ──────────────────────────────────
        let gone: Vec<RelayId> = self
            .units
            .keys()
            .filter(|id| !snapshot.contains(id.as_str()))
            .cloned()
            .collect();
        for id in gone {
            if let Some(unit) = self.units.remove(&id) {
                info!(relay_id = %id, name = %unit.name(), pin = %unit.pin(), "relay removed from configuration");
                self.retire(unit).await;
                report.removed.push(id);
            }
        }

        // ── Create / diff ────────────────────────────────────────────────────
        for (id, entry) in &snapshot {
            match self.units.get(id).map(|u| (u.pin(), u.kind())) {
                None => {
                    if self.create_unit(id, entry) {
                        report.created.push(id.clone());
                    }
                }
                Some((old_pin, old_kind)) if old_pin != entry.pin || old_kind != entry.kind() => {
                    info!(relay_id = %id, name = %entry.name, %old_pin, new_pin = %entry.pin, %old_kind, new_kind = %entry.kind(), "relay moved to another pin or output kind, recreating unit");
                    if let Some(old) = self.units.remove(id) {
                        self.retire(old).await;
                    }
                    if self.create_unit(id, entry) {
                        report.recreated.push(id.clone());
                    }
                }
                Some(_) => {
                    let Some(unit) = self.units.get(id) else {
                        continue;
                    };
                    match unit.update(UnitUpdate::from(entry)) {
                        Ok(true) => {
                            info!(
                                relay_id = %id,
                                name = %entry.name,
                                pin = %entry.pin,
                                state = if entry.desired_state { "ON" } else { "OFF" },
                                "relay intent changed"
                            );
                            report.updated.push(id.clone());
                        }
                        Ok(false) => {}
                        Err(e) => {
                            warn!(relay_id = %id, pin = %entry.pin, phase = e.phase(), error = %e, "unit update rejected")
                        }
                    }
                }
            }
        }

        // ── Liveness ─────────────────────────────────────────────────────────
        let stopping = self.stop_requested();
        for (id, unit) in self.units.iter_mut() {
            if unit.is_alive() {
                continue;
            }
            if let Some(Err(e)) = unit.reap().await {
                error!(relay_id = %id, name = %unit.name(), pin = %unit.pin(), phase = e.phase(), error = %e, "worker ended with error");
                report.failed.push(id.clone());
            }
            if unit.desired_state() && !stopping && unit.start() {
                report.started.push(id.clone());
            }
        }

        // ── Publish ──────────────────────────────────────────────────────────
        for unit in self.units.values_mut() {
            unit.push_status(self.sink.as_ref());
        }
        self.publish_supervisor();

        Ok(report)
    }

    fn stop_requested(&self) -> bool {
        self.stop_signal.as_ref().is_some_and(|stop| *stop.borrow())
    }

    /// Stops `unit`'s worker, then withdraws its status file.
    ///
    /// The wait races the stop signal.  If a stop arrives first the unit is
    /// parked in `retiring` for safe-shutdown to finish.
    async fn retire(&mut self, mut unit: ActuatorUnit) {
        let grace = self.config.grace();
        let outcome = match self.stop_signal.clone() {
            Some(mut stop) => tokio::select! {
                outcome = unit.stop_worker(grace) => Some(outcome),
                () = stop_requested(&mut stop) => None,
            },
            None => Some(unit.stop_worker(grace).await),
        };
        unit.withdraw_status(self.sink.as_ref());
        match outcome {
            Some(outcome) => log_retired(unit.id(), &outcome),
            None => {
                debug!(relay_id = %unit.id(), pin = %unit.pin(), "stop requested while retiring, deferring to shutdown");
                self.retiring.push(unit);
            }
        }
    }

    fn create_unit(&mut self, id: &RelayId, entry: &RelayConfigEntry) -> bool {
        match ActuatorUnit::new(id.clone(), entry, self.config.unit, Arc::clone(&self.driver)) {
            Ok(unit) => {
                debug!(relay_id = %id, name = %entry.name, pin = %entry.pin, "unit created");
                self.units.insert(id.clone(), unit);
                true
            }
            Err(e) => {
                error!(relay_id = %id, name = %entry.name, pin = %entry.pin, phase = e.phase(), error = %e, "cannot create unit");
                false
            }
        }
    }

    fn publish_supervisor(&self) {
        let status = SupervisorStatus {
            state: self.state().to_string(),
            cycle: self.cycle,
            units: self.units.len(),
            last_updated: timestamp(),
        };
        if let Err(e) = self.sink.publish_supervisor(&status) {
            warn!(phase = "publish", error = %e, "supervisor status publish failed");
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Selects BCM numbering and spawns the reconciliation loop.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(self) -> Result<SupervisorHandle, SupervisorError> {
        ensure_numbering(self.driver.as_ref(), Numbering::Bcm).map_err(SupervisorError::Driver)?;

        self.state.send_replace(SupervisorState::Running);
        let state = self.state.subscribe();
        let (stop, stop_rx) = watch::channel(false);

        info!(
            config_file = %self.store.path().display(),
            refresh_ms = self.config.refresh_interval.as_millis() as u64,
            "supervisor started"
        );
        let join = tokio::spawn(self.run(stop_rx));
        Ok(SupervisorHandle { state, stop, join })
    }

    async fn run(
        mut self,
        mut stop: watch::Receiver<bool>,
    ) -> Result<ShutdownReport, SupervisorError> {
        let mut trigger = ShutdownTrigger::Requested;
        self.stop_signal = Some(stop.clone());

        loop {
            if *stop.borrow_and_update() {
                break;
            }

            match self.reconcile().await {
                Ok(report) if report.is_quiet() => trace!(cycle = report.cycle, "cycle complete"),
                Ok(report) => debug!(?report, "cycle applied changes"),
                Err(e) => {
                    error!(error = %e, "reconciliation failed, shutting down safely");
                    trigger = ShutdownTrigger::Fault(e.to_string());
                    break;
                }
            }

            tokio::select! {
                changed = stop.changed() => {
                    // Handle dropped: nobody can stop us any more, so stop now.
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.refresh_interval) => {}
            }
        }

        self.state.send_replace(SupervisorState::Stopping);
        self.publish_supervisor();

        let result = match self.safe_shutdown().await {
            Ok(forced) => Ok(ShutdownReport {
                trigger,
                cycles: self.cycle,
                forced,
            }),
            Err(e) => Err(self.force_quit(e)),
        };

        self.state.send_replace(SupervisorState::Stopped);
        self.publish_supervisor();
        result
    }

    /// Switches every relay off, in the file and on the pins.
    ///
    /// Returns the ids whose workers had to be aborted.
    pub async fn safe_shutdown(&mut self) -> Result<Vec<RelayId>, SupervisorError> {
        info!(units = self.units.len(), "safe shutdown: switching every relay off");
        self.stop_signal = None;

        self.store
            .all_off()
            .map_err(|source| SupervisorError::Shutdown {
                step: "persist all-off",
                source,
            })?;
        self.cycle_inner()
            .await
            .map_err(|source| SupervisorError::Shutdown {
                step: "final reconciliation",
                source,
            })?;

        let deadline = Instant::now() + self.config.grace();
        let mut forced = Vec::new();
        for (id, unit) in self.units.iter_mut() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let outcome = unit.stop_worker(remaining).await;
            log_retired(id, &outcome);
            if matches!(outcome, Retired::Forced) {
                forced.push(id.clone());
            }
            unit.push_status(self.sink.as_ref());
        }
        self.units.clear();
        for mut unit in std::mem::take(&mut self.retiring) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let outcome = unit.stop_worker(remaining).await;
            log_retired(unit.id(), &outcome);
            if matches!(outcome, Retired::Forced) {
                forced.push(unit.id().clone());
            }
        }

        info!(forced = forced.len(), "safe shutdown complete, all relays off");
        Ok(forced)
    }

    /// Last resort: discards the configuration file, drives every known
    /// output to its safe level and releases every pin.
    pub fn force_quit(&mut self, cause: SupervisorError) -> SupervisorError {
        error!(error = %cause, "force quit: discarding configuration and releasing all pins");

        if let Err(e) = self.store.remove() {
            error!(error = %e, "cannot remove configuration file");
        }
        for unit in self.units.values_mut().chain(self.retiring.iter_mut()) {
            unit.force_off();
        }
        if let Err(e) = self.driver.release_all() {
            error!(error = %e, "driver-level release failed");
        }
        self.units.clear();
        self.retiring.clear();

        SupervisorError::ForceQuit {
            cause: Box::new(cause),
        }
    }
}

/// Resolves once `stop` reads `true` or its sender is gone.
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    while !*stop.borrow_and_update() {
        if stop.changed().await.is_err() {
            return;
        }
    }
}

fn log_retired(id: &RelayId, outcome: &Retired) {
    match outcome {
        Retired::Idle | Retired::Clean => debug!(relay_id = %id, "unit stopped"),
        Retired::Failed(e) => {
            warn!(relay_id = %id, phase = e.phase(), error = %e, "worker had already failed")
        }
        Retired::Forced => warn!(relay_id = %id, phase = "stop", "worker aborted, pin released at driver level"),
    }
}

// ── SupervisorHandle ──────────────────────────────────────────────────────────

/// Control handle for a running supervisor.
#[derive(Debug)]
pub struct SupervisorHandle {
    state: watch::Receiver<SupervisorState>,
    stop: watch::Sender<bool>,
    join: JoinHandle<Result<ShutdownReport, SupervisorError>>,
}

impl SupervisorHandle {
    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Resolves once the supervisor leaves `Running` on its own.
    pub async fn left_running(&mut self) {
        let _ = self
            .state
            .wait_for(|s| *s != SupervisorState::Running)
            .await;
    }

    /// Requests a stop and waits for shutdown to finish.
    pub async fn stop(self) -> Result<ShutdownReport, SupervisorError> {
        self.stop.send_replace(true);
        match self.join.await {
            Ok(result) => result,
            Err(e) => Err(SupervisorError::Panicked(e.to_string())),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    use serde_json::Value;
    use tempfile::TempDir;

    use crate::config::default_relays;
    use crate::gpio::{Level, MockDriver, Polarity};
    use crate::relay::{OutputKind, Pin, PwmSettings, Snapshot};
    use crate::status::JsonFileSink;

    const TICK: Duration = Duration::from_millis(20);

    fn config() -> SupervisorConfig {
        SupervisorConfig {
            refresh_interval: TICK,
            shutdown_grace: Duration::from_millis(200),
            unit: UnitSettings {
                refresh_interval: TICK,
                polarity: Polarity::ACTIVE_LOW,
            },
        }
    }

    struct Rig {
        dir: TempDir,
        driver: Arc<MockDriver>,
    }

    impl Rig {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                driver: Arc::new(MockDriver::new()),
            }
        }

        fn config_path(&self) -> PathBuf {
            self.dir.path().join("relay_config.json")
        }

        fn status_dir(&self) -> PathBuf {
            self.dir.path().join("api")
        }

        fn write_config(&self, entries: &[(&str, &str, u8, bool)]) {
            let snapshot = Snapshot::new(entries.iter().map(|&(id, name, pin, state)| {
                (
                    RelayId::from(id),
                    RelayConfigEntry::new(name, Pin::new(pin), state),
                )
            }))
            .unwrap();
            fs::write(self.config_path(), snapshot.to_json_pretty().unwrap()).unwrap();
        }

        fn write_snapshot(&self, entries: Vec<(&str, RelayConfigEntry)>) {
            let snapshot =
                Snapshot::new(entries.into_iter().map(|(id, e)| (RelayId::from(id), e))).unwrap();
            fs::write(self.config_path(), snapshot.to_json_pretty().unwrap()).unwrap();
        }

        fn has_status(&self, name: &str) -> bool {
            self.status_dir().join(name).exists()
        }

        fn read_config(&self) -> Snapshot {
            Snapshot::from_json(&fs::read(self.config_path()).unwrap()).unwrap()
        }

        fn status(&self, name: &str) -> Value {
            serde_json::from_slice(&fs::read(self.status_dir().join(name)).unwrap()).unwrap()
        }

        fn supervisor(&self) -> Supervisor {
            Supervisor::new(
                ConfigStore::new(self.config_path(), default_relays()),
                self.driver.clone(),
                Arc::new(JsonFileSink::new(self.status_dir())),
                config(),
            )
        }
    }

    fn id(s: &str) -> RelayId {
        RelayId::from(s)
    }

    fn observed(sup: &Supervisor, id: &str) -> bool {
        sup.unit(id).is_some_and(ActuatorUnit::observed_state)
    }

    fn alive(sup: &Supervisor, id: &str) -> bool {
        sup.unit(id).is_some_and(ActuatorUnit::is_alive)
    }

    async fn eventually(mut cond: impl FnMut() -> bool) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached within 2s");
    }

    // ── Scenarios ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn pump_on_pin_26_is_switched_on_and_reported() {
        let rig = Rig::new();
        rig.write_config(&[("1", "pump", 26, true)]);
        let mut sup = rig.supervisor();

        let report = sup.reconcile().await.unwrap();
        assert_eq!(report.created, vec![id("1")]);
        assert_eq!(report.started, vec![id("1")]);

        eventually(|| observed(&sup, "1")).await;
        assert_eq!(rig.driver.level(Pin::new(26)), Some(Level::Low));
        assert!(rig.driver.is_claimed(Pin::new(26)));

        sup.reconcile().await.unwrap();
        let status = rig.status("ID1_26.json");
        assert_eq!(status["relay_id"], "1");
        assert_eq!(status["name"], "pump");
        assert_eq!(status["pin"], 26);
        assert_eq!(status["status"], true);
    }

    #[tokio::test]
    async fn operator_switches_pump_off() {
        let rig = Rig::new();
        rig.write_config(&[("1", "pump", 26, true)]);
        let mut sup = rig.supervisor();
        sup.reconcile().await.unwrap();
        eventually(|| observed(&sup, "1")).await;

        let mut operator = ConfigStore::new(rig.config_path(), default_relays());
        operator.set_state("1", false).unwrap();

        let report = sup.reconcile().await.unwrap();
        assert_eq!(report.updated, vec![id("1")]);
        eventually(|| !observed(&sup, "1")).await;
        assert_eq!(rig.driver.level(Pin::new(26)), Some(Level::High));
        assert!(!rig.driver.is_claimed(Pin::new(26)));

        sup.reconcile().await.unwrap();
        assert_eq!(rig.status("ID1_26.json")["status"], false);
    }

    // ── Properties ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn converges_within_one_cycle() {
        let rig = Rig::new();
        rig.write_config(&[
            ("1", "pump", 26, true),
            ("2", "fan", 20, false),
            ("3", "lamp", 21, true),
        ]);
        let mut sup = rig.supervisor();
        sup.reconcile().await.unwrap();

        eventually(|| sup.units().all(|u| u.observed_state() == u.desired_state())).await;
        assert_eq!(sup.units().count(), 3);
        assert_eq!(rig.driver.level(Pin::new(21)), Some(Level::Low));
        assert_eq!(rig.driver.level(Pin::new(20)), None);
    }

    #[tokio::test]
    async fn reconciliation_is_idempotent() {
        let rig = Rig::new();
        rig.write_config(&[("1", "pump", 26, true), ("2", "fan", 20, false)]);
        let mut sup = rig.supervisor();
        sup.reconcile().await.unwrap();
        eventually(|| observed(&sup, "1")).await;
        let file_before = fs::read(rig.config_path()).unwrap();

        for _ in 0..3 {
            let report = sup.reconcile().await.unwrap();
            assert!(report.is_quiet(), "{report:?}");
        }
        assert_eq!(rig.driver.acquisitions(Pin::new(26)), 1);
        assert_eq!(sup.unit("1").unwrap().starts(), 1);
        assert_eq!(fs::read(rig.config_path()).unwrap(), file_before);
    }

    #[tokio::test]
    async fn dead_worker_is_restarted_once_per_cycle() {
        let rig = Rig::new();
        let pin = Pin::new(26);
        rig.driver.fail_acquire(pin, true);
        rig.write_config(&[("1", "pump", 26, true)]);
        let mut sup = rig.supervisor();
        sup.reconcile().await.unwrap();

        for attempt in 1..=3 {
            eventually(|| !alive(&sup, "1")).await;
            assert_eq!(rig.driver.acquisitions(pin), attempt);

            let report = sup.reconcile().await.unwrap();
            assert_eq!(report.failed, vec![id("1")]);
            assert_eq!(report.started, vec![id("1")]);
        }

        eventually(|| !alive(&sup, "1")).await;
        assert_eq!(rig.driver.acquisitions(pin), 4);
        rig.driver.fail_acquire(pin, false);
        sup.reconcile().await.unwrap();
        eventually(|| observed(&sup, "1")).await;
        assert_eq!(sup.unit("1").unwrap().starts(), 5);
    }

    #[tokio::test]
    async fn pin_change_recreates_the_unit() {
        let rig = Rig::new();
        rig.write_config(&[("1", "pump", 26, true)]);
        let mut sup = rig.supervisor();
        sup.reconcile().await.unwrap();
        eventually(|| observed(&sup, "1")).await;

        rig.write_config(&[("1", "pump", 19, true)]);
        let report = sup.reconcile().await.unwrap();
        assert_eq!(report.recreated, vec![id("1")]);
        assert!(!rig.driver.is_claimed(Pin::new(26)));
        assert_eq!(rig.driver.level(Pin::new(26)), Some(Level::High));

        assert!(!rig.has_status("ID1_26.json"));

        eventually(|| observed(&sup, "1")).await;
        assert_eq!(sup.unit("1").unwrap().pin(), Pin::new(19));
        assert_eq!(rig.driver.level(Pin::new(19)), Some(Level::Low));
        sup.reconcile().await.unwrap();
        assert_eq!(rig.status("ID1_19.json")["status"], true);
        assert!(!rig.has_status("ID1_26.json"));
    }

    #[tokio::test]
    async fn two_relays_can_swap_pins_in_one_edit() {
        let rig = Rig::new();
        rig.write_config(&[("1", "pump", 26, true), ("2", "fan", 20, true)]);
        let mut sup = rig.supervisor();
        sup.reconcile().await.unwrap();
        eventually(|| observed(&sup, "1") && observed(&sup, "2")).await;

        rig.write_config(&[("1", "pump", 20, true), ("2", "fan", 26, true)]);
        let report = sup.reconcile().await.unwrap();
        assert_eq!(report.recreated, vec![id("1"), id("2")]);

        eventually(|| observed(&sup, "1") && observed(&sup, "2")).await;
        assert_eq!(sup.unit("1").unwrap().pin(), Pin::new(20));
        assert_eq!(sup.unit("2").unwrap().pin(), Pin::new(26));
    }

    #[tokio::test]
    async fn removed_relay_is_released() {
        let rig = Rig::new();
        rig.write_config(&[("1", "pump", 26, true), ("2", "fan", 20, true)]);
        let mut sup = rig.supervisor();
        sup.reconcile().await.unwrap();
        eventually(|| observed(&sup, "2")).await;
        sup.reconcile().await.unwrap();
        assert_eq!(rig.status("ID2_20.json")["status"], true);

        rig.write_config(&[("1", "pump", 26, true)]);
        let report = sup.reconcile().await.unwrap();
        assert_eq!(report.removed, vec![id("2")]);
        assert!(!rig.has_status("ID2_20.json"));
        assert!(sup.unit("2").is_none());
        assert!(!rig.driver.is_claimed(Pin::new(20)));
        assert!(rig.driver.is_claimed(Pin::new(26)));
    }

    #[tokio::test]
    async fn pwm_fan_runs_and_reports_its_duty() {
        let rig = Rig::new();
        let pin = Pin::new(18);
        let fan = |duty| RelayConfigEntry::new("fan", pin, true).with_pwm(PwmSettings::new(50, duty));
        rig.write_snapshot(vec![("4", fan(25))]);
        let mut sup = rig.supervisor();
        sup.reconcile().await.unwrap();
        eventually(|| observed(&sup, "4")).await;
        assert_eq!(rig.driver.pwm(pin), Some(PwmSettings::new(50, 25)));

        rig.write_snapshot(vec![("4", fan(70))]);
        let report = sup.reconcile().await.unwrap();
        assert_eq!(report.updated, vec![id("4")]);
        eventually(|| rig.driver.pwm(pin) == Some(PwmSettings::new(50, 70))).await;
        sup.reconcile().await.unwrap();
        let status = rig.status("ID4_18.json");
        assert_eq!(status["PWM Frequency"], 50);
        assert_eq!(status["PWM Duty Cycle"], 70);
        assert_eq!(sup.unit("4").unwrap().starts(), 1);
    }

    #[tokio::test]
    async fn kind_change_recreates_the_unit() {
        let rig = Rig::new();
        let pin = Pin::new(18);
        rig.write_config(&[("4", "fan", 18, true)]);
        let mut sup = rig.supervisor();
        sup.reconcile().await.unwrap();
        eventually(|| observed(&sup, "4")).await;
        assert_eq!(rig.driver.level(pin), Some(Level::Low));

        let pwm = RelayConfigEntry::new("fan", pin, true).with_pwm(PwmSettings::new(100, 40));
        rig.write_snapshot(vec![("4", pwm)]);
        let report = sup.reconcile().await.unwrap();
        assert_eq!(report.recreated, vec![id("4")]);
        assert_eq!(rig.driver.level(pin), Some(Level::High));

        eventually(|| observed(&sup, "4")).await;
        assert_eq!(sup.unit("4").unwrap().kind(), OutputKind::Pwm);
        assert_eq!(rig.driver.pwm(pin), Some(PwmSettings::new(100, 40)));
    }

    #[tokio::test]
    async fn stop_request_cuts_a_retirement_short() {
        let rig = Rig::new();
        rig.write_config(&[("1", "pump", 26, true), ("2", "fan", 20, true)]);
        let mut sup = rig.supervisor();
        sup.reconcile().await.unwrap();
        eventually(|| observed(&sup, "1") && observed(&sup, "2")).await;

        let (stop, stop_rx) = watch::channel(false);
        sup.stop_signal = Some(stop_rx);
        stop.send_replace(true);
        rig.write_config(&[("1", "pump", 26, true)]);
        let report = sup.reconcile().await.unwrap();
        assert_eq!(report.removed, vec![id("2")]);
        assert_eq!(sup.retiring.len(), 1);
        assert!(!rig.has_status("ID2_20.json"));

        sup.safe_shutdown().await.unwrap();
        assert!(sup.retiring.is_empty());
        assert!(rig.driver.claimed().is_empty());
        assert_eq!(rig.driver.level(Pin::new(20)), Some(Level::High));
        assert_eq!(rig.driver.level(Pin::new(26)), Some(Level::High));
    }

    #[tokio::test]
    async fn corrupt_file_keeps_last_good_state() {
        let rig = Rig::new();
        rig.write_config(&[("1", "pump", 26, true)]);
        let mut sup = rig.supervisor();
        sup.reconcile().await.unwrap();
        eventually(|| observed(&sup, "1")).await;

        fs::write(rig.config_path(), b"{ broken").unwrap();
        let report = sup.reconcile().await.unwrap();

        assert_eq!(report.fallback, Some(LoadSource::CorruptRestored));
        assert!(report.updated.is_empty());
        assert!(observed(&sup, "1"));
        assert!(rig.read_config().get("1").unwrap().desired_state);
    }

    #[tokio::test]
    async fn status_publish_failure_does_not_fail_the_cycle() {
        let rig = Rig::new();
        rig.write_config(&[("1", "pump", 26, false)]);
        fs::write(rig.status_dir(), b"not a directory").unwrap();
        let mut sup = rig.supervisor();

        sup.reconcile().await.unwrap();
        assert!(sup.unit("1").unwrap().last_status_write().is_none());
    }

    #[tokio::test]
    async fn missing_file_starts_from_defaults() {
        let rig = Rig::new();
        let mut sup = rig.supervisor();

        let report = sup.reconcile().await.unwrap();
        assert_eq!(report.fallback, Some(LoadSource::Missing));
        assert_eq!(report.created, vec![id("1"), id("2"), id("3")]);
        assert!(report.started.is_empty());
        assert_eq!(rig.read_config(), default_relays());
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn stop_leaves_every_relay_off() {
        let rig = Rig::new();
        rig.write_config(&[("1", "pump", 26, true), ("2", "fan", 20, true)]);
        let handle = rig.supervisor().start().unwrap();
        assert_eq!(handle.state(), SupervisorState::Running);
        assert_eq!(rig.driver.numbering_sets(), 1);

        let driver = rig.driver.clone();
        eventually(|| {
            driver.level(Pin::new(26)) == Some(Level::Low)
                && driver.level(Pin::new(20)) == Some(Level::Low)
        })
        .await;

        let report = handle.stop().await.unwrap();
        assert!(report.is_clean(), "{report:?}");
        assert!(report.cycles >= 2);

        assert!(rig.driver.claimed().is_empty());
        assert_eq!(rig.driver.level(Pin::new(26)), Some(Level::High));
        assert_eq!(rig.driver.level(Pin::new(20)), Some(Level::High));
        assert!(rig.read_config().iter().all(|(_, e)| !e.desired_state));
        assert_eq!(rig.status("ID1_26.json")["status"], false);
        assert_eq!(rig.status("ID2_20.json")["status"], false);
        assert_eq!(rig.status("supervisor.json")["state"], "stopped");
    }

    #[tokio::test]
    async fn unwritable_config_forces_quit() {
        let rig = Rig::new();
        // A non-empty directory can be neither read as a file nor replaced.
        fs::create_dir(rig.config_path()).unwrap();
        fs::write(rig.config_path().join("keep"), b"x").unwrap();
        // Held outside any unit; force-quit must release it anyway.
        rig.driver.acquire_output(Pin::new(5), Level::Low).unwrap();

        let mut handle = rig.supervisor().start().unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle.left_running())
            .await
            .unwrap();
        let err = handle.stop().await.unwrap_err();

        match err {
            SupervisorError::ForceQuit { cause } => {
                assert!(matches!(*cause, SupervisorError::Shutdown { .. }), "{cause}");
            }
            other => panic!("expected ForceQuit, got {other}"),
        }
        assert_eq!(rig.driver.release_all_calls(), 1);
        assert!(rig.driver.claimed().is_empty());
    }

    #[tokio::test]
    async fn failed_safe_shutdown_forces_relays_off() {
        let rig = Rig::new();
        rig.write_config(&[("1", "pump", 26, true)]);
        let mut sup = rig.supervisor();
        sup.reconcile().await.unwrap();
        eventually(|| observed(&sup, "1")).await;
        assert_eq!(rig.driver.level(Pin::new(26)), Some(Level::Low));

        fs::remove_file(rig.config_path()).unwrap();
        fs::create_dir(rig.config_path()).unwrap();
        fs::write(rig.config_path().join("keep"), b"x").unwrap();
        let cause = sup.safe_shutdown().await.unwrap_err();
        let err = sup.force_quit(cause);

        assert!(matches!(err, SupervisorError::ForceQuit { .. }), "{err}");
        assert_eq!(rig.driver.level(Pin::new(26)), Some(Level::High));
        assert!(rig.driver.claimed().is_empty());
        assert_eq!(rig.driver.release_all_calls(), 1);
        assert_eq!(sup.units().count(), 0);
    }

    #[tokio::test]
    async fn stop_wakes_a_long_cycle_sleep() {
        let rig = Rig::new();
        rig.write_config(&[("1", "pump", 26, true)]);
        let mut cfg = config();
        cfg.refresh_interval = Duration::from_secs(60);
        let sup = Supervisor::new(
            ConfigStore::new(rig.config_path(), default_relays()),
            rig.driver.clone(),
            Arc::new(JsonFileSink::new(rig.status_dir())),
            cfg,
        );
        let handle = sup.start().unwrap();
        let driver = rig.driver.clone();
        eventually(|| driver.level(Pin::new(26)) == Some(Level::Low)).await;

        let report = tokio::time::timeout(Duration::from_secs(2), handle.stop())
            .await
            .expect("stop waited for the cycle sleep")
            .unwrap();
        assert!(report.is_clean(), "{report:?}");
        assert_eq!(rig.driver.level(Pin::new(26)), Some(Level::High));
    }

    #[test]
    fn grace_covers_at_least_one_worker_poll() {
        let mut cfg = config();
        assert_eq!(cfg.grace(), Duration::from_millis(200));
        cfg.shutdown_grace = Duration::ZERO;
        assert_eq!(cfg.grace(), TICK);
    }
}
