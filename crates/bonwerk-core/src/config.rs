// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Orchestrator and application configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for scheduling, reconnection and pairing.
///
/// Durations are stored as milliseconds so the JSON file stays readable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Failed attempts allowed per job before it becomes terminally failed.
    pub max_retries: u32,
    /// Pause between disconnecting the previous device and connecting the next.
    pub settle_delay_ms: u64,
    /// Pause before the second connect attempt.
    pub connect_retry_delay_ms: u64,
    /// Supervisor polling interval after a clean sweep.
    pub supervisor_base_interval_ms: u64,
    /// Upper bound for the supervisor's doubled interval.
    pub supervisor_max_interval_ms: u64,
    /// Fixed interval of the saved-device auto-reconnect loop.
    pub auto_reconnect_interval_ms: u64,
    /// Maximum number of paired devices.
    pub max_saved_devices: usize,
    /// Signal strength below which a reconnect is not worth attempting.
    pub min_signal_dbm: i16,
    /// How long a scan listens for devices.
    pub scan_window_ms: u64,
    /// Buffered events per subscriber before it starts lagging.
    pub event_capacity: usize,
    /// Finished jobs kept in memory for lookups; older ones are dropped.
    /// The job log keeps the full history.
    pub max_finished_jobs: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            settle_delay_ms: 300,
            connect_retry_delay_ms: 1_000,
            supervisor_base_interval_ms: 15_000,
            supervisor_max_interval_ms: 240_000,
            auto_reconnect_interval_ms: 30_000,
            max_saved_devices: 3,
            min_signal_dbm: -95,
            scan_window_ms: 5_000,
            event_capacity: 256,
            max_finished_jobs: 500,
        }
    }
}

impl OrchestratorConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_delay_ms)
    }

    pub fn supervisor_base_interval(&self) -> Duration {
        Duration::from_millis(self.supervisor_base_interval_ms)
    }

    pub fn supervisor_max_interval(&self) -> Duration {
        Duration::from_millis(self.supervisor_max_interval_ms)
    }

    pub fn auto_reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.auto_reconnect_interval_ms)
    }

    pub fn scan_window(&self) -> Duration {
        Duration::from_millis(self.scan_window_ms)
    }
}

/// Which transport the daemon drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Raw TCP to network printers, mDNS discovery.
    RawTcp,
    /// In-process transport that accepts everything. For demos and dry runs.
    Simulated,
}

/// A printer the daemon registers at startup without scanning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownPrinter {
    pub name: String,
    /// `host:port`, a Bluetooth MAC or a USB device path.
    pub address: String,
}

/// Persistent daemon settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub transport: TransportKind,
    /// Overrides the platform data directory.
    pub data_dir: Option<PathBuf>,
    /// Scan once at startup.
    pub scan_on_start: bool,
    /// Printers registered at startup, for networks where discovery is blocked.
    pub known_printers: Vec<KnownPrinter>,
    pub orchestrator: OrchestratorConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::RawTcp,
            data_dir: None,
            scan_on_start: true,
            known_printers: Vec::new(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}
