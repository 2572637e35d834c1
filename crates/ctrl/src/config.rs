// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveDate;
use clap::Parser;

use crate::link::LinkSettings;
use crate::policy::PolicySettings;
use crate::scheduler::SchedulerSettings;

/// RS-485 access-control field controller.
#[derive(Debug, Clone, Parser)]
#[command(name = "wicket", version, about)]
pub struct Config {
    /// Serial device of the RS-485 adapter.
    #[arg(long, env = "WICKET_SERIAL_PORT", default_value = "/dev/ttyUSB0")]
    pub serial_port: String,

    /// Baud rate.
    #[arg(long, env = "WICKET_BAUD", default_value_t = 9600)]
    pub baud: u32,

    /// Parity (N, E or O).
    #[arg(long, env = "WICKET_PARITY", default_value = "N")]
    pub parity: String,

    /// Data bits (5..=8).
    #[arg(long, env = "WICKET_DATA_BITS", default_value_t = 8)]
    pub data_bits: u8,

    /// Stop bits (1 or 2).
    #[arg(long, env = "WICKET_STOP_BITS", default_value_t = 1)]
    pub stop_bits: u8,

    /// Delay after raising RTS before transmitting, in milliseconds.
    #[arg(long, env = "WICKET_RTS_ENABLE_DELAY_MS", default_value_t = 10)]
    pub rts_enable_delay_ms: u64,

    /// Delay before dropping RTS after transmitting, in milliseconds.
    #[arg(long, env = "WICKET_RTS_DISABLE_DELAY_MS", default_value_t = 10)]
    pub rts_disable_delay_ms: u64,

    /// Default reply deadline in milliseconds.
    #[arg(long, env = "WICKET_REPLY_TIMEOUT_MS", default_value_t = 2000)]
    pub reply_timeout_ms: u64,

    /// The adapter drives RS-485 direction in hardware; skip per-frame RTS
    /// toggling.
    #[arg(long, env = "WICKET_HARDWARE_RTS")]
    pub hardware_rts: bool,

    /// Delay between successive bus turns, in milliseconds.
    #[arg(long, env = "WICKET_POLLING_INTERVAL_MS", default_value_t = 1000)]
    pub polling_interval_ms: u64,

    /// Failed polls before a module is marked in error.
    #[arg(long, env = "WICKET_MAX_RETRIES", default_value_t = 3)]
    pub max_retries: u32,

    /// Consecutive bus errors before the port is reopened.
    #[arg(long, env = "WICKET_BUS_REOPEN_THRESHOLD", default_value_t = 10)]
    pub bus_reopen_threshold: u32,

    /// Minimum seconds between two movements of the same person.
    #[arg(long, env = "WICKET_MIN_STAY_SECONDS", default_value_t = 300)]
    pub min_stay_seconds: u64,

    /// Hours the anti-passback check looks back.
    #[arg(long, env = "WICKET_ANTIPASSBACK_WINDOW_HOURS", default_value_t = 48)]
    pub antipassback_window_hours: u64,

    /// Epoch base date for movement ids (YYYY-MM-DD).
    #[arg(long, env = "WICKET_MOVEMENT_EPOCH_BASE", default_value = "2007-06-01")]
    pub movement_epoch_base: String,

    /// JSON seed file with modules, persons and identifiers.
    #[arg(long, env = "WICKET_SEED")]
    pub seed: Option<PathBuf>,

    /// Grace period for shutdown, in seconds.
    #[arg(long, env = "WICKET_SHUTDOWN_GRACE_SECS", default_value_t = 10)]
    pub shutdown_grace_secs: u64,

    /// Log format (json or text).
    #[arg(long, env = "WICKET_LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "WICKET_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Validate the configuration after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.serial_port.trim().is_empty() {
            anyhow::bail!("--serial-port must not be empty");
        }
        if self.baud == 0 {
            anyhow::bail!("--baud must be positive");
        }
        if !matches!(self.parity.as_str(), "N" | "E" | "O") {
            anyhow::bail!("--parity must be one of N, E, O");
        }
        if !(5..=8).contains(&self.data_bits) {
            anyhow::bail!("--data-bits must be in 5..=8");
        }
        if !matches!(self.stop_bits, 1 | 2) {
            anyhow::bail!("--stop-bits must be 1 or 2");
        }
        if self.polling_interval_ms == 0 {
            anyhow::bail!("--polling-interval-ms must be positive");
        }
        if self.max_retries == 0 {
            anyhow::bail!("--max-retries must be positive");
        }
        if self.bus_reopen_threshold == 0 {
            anyhow::bail!("--bus-reopen-threshold must be positive");
        }
        self.epoch_base()?;
        Ok(())
    }

    pub fn link_settings(&self) -> LinkSettings {
        LinkSettings {
            port: self.serial_port.clone(),
            baud: self.baud,
            parity: self.parity.chars().next().unwrap_or('N'),
            data_bits: self.data_bits,
            stop_bits: self.stop_bits,
            rts_enable_delay: Duration::from_millis(self.rts_enable_delay_ms),
            rts_disable_delay: Duration::from_millis(self.rts_disable_delay_ms),
            reply_timeout: Duration::from_millis(self.reply_timeout_ms),
            manual_rts: !self.hardware_rts,
        }
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            polling_interval: Duration::from_millis(self.polling_interval_ms),
            max_retries: self.max_retries,
            bus_reopen_threshold: self.bus_reopen_threshold,
        }
    }

    pub fn policy_settings(&self) -> PolicySettings {
        PolicySettings {
            antipassback_window: Duration::from_secs(self.antipassback_window_hours * 3600),
            min_stay: Duration::from_secs(self.min_stay_seconds),
            ..PolicySettings::default()
        }
    }

    pub fn epoch_base(&self) -> anyhow::Result<NaiveDate> {
        NaiveDate::parse_from_str(&self.movement_epoch_base, "%Y-%m-%d").map_err(|e| {
            anyhow::anyhow!("--movement-epoch-base {:?}: {e}", self.movement_epoch_base)
        })
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Defaults for embedding and tests; equivalent to parsing no arguments.
    pub fn for_tests() -> Self {
        Self::parse_from(["wicket"])
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
