/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! relayctl – operator tool for relayd.
//!
//! Never talks to the daemon directly.  `set` edits the configuration file
//! (the daemon picks the change up on its next cycle); `list` and `status`
//! read the configuration and status files.

use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use relayd::config::{Settings, SettingsManager};
use relayd::relay::Snapshot;
use relayd::status::{read_unit_statuses, UnitStatus};
use relayd::store::ConfigStore;

// ── CLI argument definition ───────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(
    name = "relayctl",
    about = "relayctl – switch relays and inspect relayd status",
    long_about = None,
)]
struct Cli {
    /// Path to the YAML daemon settings file.
    #[arg(short = 's', long = "settings", global = true)]
    settings: Option<PathBuf>,

    /// Relay configuration file (overrides `config_file`).
    #[arg(short = 'c', long = "config", global = true)]
    config: Option<PathBuf>,

    /// Status directory (overrides `status_dir`).
    #[arg(long = "status-dir", global = true)]
    status_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Switch one relay on or off.
    Set {
        id: String,
        #[arg(value_enum)]
        state: Switch,
    },
    /// Print the relay configuration.
    List {
        #[arg(long)]
        json: bool,
    },
    /// Print the status files written by the daemon.
    Status {
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Switch {
    On,
    Off,
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
        Ok(settings)
    }
}

// ── Rendering ─────────────────────────────────────────────────────────────────

fn on_off(state: bool) -> &'static str {
    if state {
        "ON"
    } else {
        "OFF"
    }
}

fn render_list(snapshot: &Snapshot) -> String {
    let mut out = format!("{:<8} {:<20} {:>4}  {}\n", "ID", "NAME", "PIN", "STATE");
    for (id, entry) in snapshot {
        out.push_str(&format!(
            "{:<8} {:<20} {:>4}  {}{}\n",
            id,
            entry.name,
            entry.pin,
            on_off(entry.desired_state),
            pwm_note(entry.pwm.map(|p| p.frequency), entry.pwm.map(|p| p.duty_cycle))
        ));
    }
    out
}

fn render_status(statuses: &[UnitStatus]) -> String {
    let mut out = format!(
        "{:<8} {:<20} {:>4}  {:<6} {}\n",
        "ID", "NAME", "PIN", "STATUS", "LAST UPDATED"
    );
    for s in statuses {
        out.push_str(&format!(
            "{:<8} {:<20} {:>4}  {:<6} {}{}\n",
            s.relay_id,
            s.name,
            s.pin,
            on_off(s.status),
            s.last_updated,
            pwm_note(s.pwm_frequency, s.pwm_duty_cycle)
        ));
    }
    out
}

/// `"  pwm 50 Hz 25%"` for PWM channels, empty for relays.
fn pwm_note(frequency: Option<u32>, duty_cycle: Option<u8>) -> String {
    match (frequency, duty_cycle) {
        (Some(frequency), Some(duty)) => format!("  pwm {frequency} Hz {duty}%"),
        _ => String::new(),
    }
}

// ── Commands ──────────────────────────────────────────────────────────────────

fn execute(command: &Command, settings: &Settings, out: &mut impl Write) -> Result<()> {
    let mut store = ConfigStore::new(&settings.config_file, settings.default_relays.clone());

    match command {
        Command::Set { id, state } => {
            let on = *state == Switch::On;
            store
                .set_state(id, on)
                .with_context(|| format!("Cannot switch relay '{id}'"))?;
            writeln!(out, "relay {id} set {}", on_off(on))?;
        }
        Command::List { json } => {
            let snapshot = store.read_disk().with_context(|| {
                format!("Cannot read configuration {}", settings.config_file.display())
            })?;
            if *json {
                out.write_all(&snapshot.to_json_pretty()?)?;
            } else {
                out.write_all(render_list(&snapshot).as_bytes())?;
            }
        }
        Command::Status { json } => {
            let statuses = read_unit_statuses(&settings.status_dir).with_context(|| {
                format!("Cannot read status directory {}", settings.status_dir.display())
            })?;
            if *json {
                writeln!(out, "{}", serde_json::to_string_pretty(&statuses)?)?;
            } else {
                out.write_all(render_status(&statuses).as_bytes())?;
            }
        }
    }
    Ok(())
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = cli.load_settings()?;
    tracing::debug!(?settings, "relayctl settings");

    execute(&cli.command, &settings, &mut io::stdout().lock())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
