/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use relayd::config::{Settings, SettingsManager};
use relayd::gpio::{build_driver, DriverKind};
use relayd::status::JsonFileSink;
use relayd::store::ConfigStore;
use relayd::supervisor::{Supervisor, SupervisorConfig, SupervisorError};

// ── CLI argument definition ───────────────────────────────────────────────────

/// GPIO relay reconciliation daemon.
///
/// Example:
///   relayd -s /etc/relayd.yaml --config ./relay_config.json --driver mock
#[derive(Debug, Parser)]
#[command(
    name = "relayd",
    about = "relayd – keeps Raspberry Pi relays in their configured state",
    long_about = None,
)]
struct Cli {
    /// Path to the YAML daemon settings file.
    #[arg(short = 's', long = "settings")]
    settings: Option<PathBuf>,

    /// Relay configuration file (overrides `config_file`).
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Directory for status files (overrides `status_dir`).
    #[arg(long = "status-dir")]
    status_dir: Option<PathBuf>,

    /// Reconciliation period in milliseconds (overrides `refresh_interval_ms`).
    #[arg(short = 'r', long = "refresh-ms")]
    refresh_ms: Option<u64>,

    /// GPIO driver: sysfs or mock (overrides `driver`).
    #[arg(short = 'd', long = "driver")]
    driver: Option<DriverKind>,
}

impl Cli {
    fn load_settings(&self) -> Result<Settings> {
        let mut manager = SettingsManager::new();
        if let Some(path) = &self.settings {
            manager.load_from_file(path)?;
        }
        let mut settings = manager.into_settings();

        if let Some(path) = &self.config {
            settings.config_file = path.clone();
        }
        if let Some(dir) = &self.status_dir {
            settings.status_dir = dir.clone();
        }
        if let Some(ms) = self.refresh_ms {
            settings.refresh_interval = std::time::Duration::from_millis(ms);
        }
        if let Some(driver) = self.driver {
            settings.driver = driver;
        }
        settings.validate().context("Invalid command-line override")?;
        Ok(settings)
    }
}

// ── Logging ───────────────────────────────────────────────────────────────────

/// Console logging, plus a daily-rolling `relayd.log` when `log_dir` is set.
///
/// Level is controlled by the RUST_LOG env-var (e.g. RUST_LOG=relayd=debug).
/// Keep the returned guard alive until exit so buffered lines are flushed.
fn init_logging(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "relayd.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();
    guard
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match cli.load_settings() {
        Ok(s) => s,
        Err(e) => {
            let _guard = init_logging(None);
            error!("Failed to load settings: {:#}", e);
            return ExitCode::FAILURE;
        }
    };
    let _guard = init_logging(settings.log_dir.as_deref());

    info!(
        config_file = %settings.config_file.display(),
        status_dir  = %settings.status_dir.display(),
        driver      = %settings.driver,
        refresh_ms  = settings.refresh_interval.as_millis() as u64,
        active_low  = settings.active_low,
        "relayd starting up"
    );

    match run(settings).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(settings: Settings) -> Result<ExitCode> {
    let driver = build_driver(&settings);
    let store = ConfigStore::new(&settings.config_file, settings.default_relays.clone());
    let sink = Arc::new(JsonFileSink::new(&settings.status_dir));
    let supervisor = Supervisor::new(
        store,
        driver,
        sink,
        SupervisorConfig::from_settings(&settings),
    );

    let mut handle = supervisor.start().context("Failed to start supervisor")?;

    tokio::select! {
        _ = shutdown_signal() => {}
        _ = handle.left_running() => warn!("supervisor left running state on its own"),
    }

    match handle.stop().await {
        Ok(report) if report.is_clean() => {
            info!(cycles = report.cycles, "relayd stopped, all relays off");
            Ok(ExitCode::SUCCESS)
        }
        Ok(report) => {
            warn!(?report, "relayd stopped after a fault, all relays off");
            Ok(ExitCode::FAILURE)
        }
        Err(e @ SupervisorError::ForceQuit { .. }) => {
            error!(error = %e, "relayd force-quit, configuration discarded");
            Ok(ExitCode::FAILURE)
        }
        Err(e) => Err(e).context("Supervisor shutdown failed"),
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("SIGINT received, shutting down"),
            Err(e) => error!(error = %e, "cannot listen for SIGINT, shutting down"),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                info!("SIGTERM received, shutting down");
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
