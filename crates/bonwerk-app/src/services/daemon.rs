// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Daemon wiring: config file, stores, transport selection and event logging.
//
// Storage failures never stop the daemon. A store that can't be opened is
// replaced by an in-memory one and the problem is logged as an error, so the
// kitchen keeps printing even if pairings won't survive a restart.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, warn};

use bonwerk_core::config::{KnownPrinter, TransportKind};
use bonwerk_core::AppConfig;
use bonwerk_core::error::{BonwerkError, Result};
use bonwerk_core::human_errors::humanize_error;
use bonwerk_core::types::{EventKind, PrintEvent};
use bonwerk_print::encoding::PassthroughEncoder;
use bonwerk_print::scanner::{DeviceScanner, MdnsScanner, StaticScanner, guess_kind};
use bonwerk_print::transport::{MemoryTransport, RawTcpTransport, Transport};
use bonwerk_print::Orchestrator;
use bonwerk_store::{JobLog, KeyValueStore, MemoryStore, SqliteStore};

const CONFIG_FILE: &str = "config.json";
const STORE_FILE: &str = "bonwerk.db";
const JOB_LOG_FILE: &str = "jobs.db";

/// Load `config.json`, writing the defaults on first run.
///
/// A file that can't be parsed is left alone and the defaults are used.
pub fn load_config(data_dir: &Path) -> AppConfig {
    let path = data_dir.join(CONFIG_FILE);
    match std::fs::read_to_string(&path) {
        Ok(data) => match serde_json::from_str(&data) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "config unreadable, using defaults");
                AppConfig::default()
            }
        },
        Err(_) => {
            let config = AppConfig::default();
            if let Err(e) = persist_config(data_dir, &config) {
                warn!(error = %e, "could not write default config");
            }
            config
        }
    }
}

pub fn persist_config(data_dir: &Path, config: &AppConfig) -> Result<()> {
    let path = data_dir.join(CONFIG_FILE);
    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(&path, json)?;
    Ok(())
}

/// Open the settings store and job log under `data_dir`.
pub fn open_stores(data_dir: &Path) -> (Arc<dyn KeyValueStore>, Option<Arc<JobLog>>) {
    let store: Arc<dyn KeyValueStore> = match SqliteStore::open(data_dir.join(STORE_FILE)) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, "persistent storage failed, pairings will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };

    let job_log = match JobLog::open(data_dir.join(JOB_LOG_FILE)) {
        Ok(log) => Some(log),
        Err(e) => {
            error!(error = %e, "job log failed, keeping history in memory");
            JobLog::open_in_memory()
                .inspect_err(|e| error!(error = %e, "in-memory job log failed too"))
                .ok()
        }
    };

    (store, job_log.map(Arc::new))
}

/// Build the orchestrator for the configured transport.
pub fn build_orchestrator(config: &AppConfig, data_dir: &Path) -> Orchestrator {
    let (store, job_log) = open_stores(data_dir);
    let (transport, scanner): (Arc<dyn Transport>, Arc<dyn DeviceScanner>) = match config.transport
    {
        TransportKind::RawTcp => (Arc::new(RawTcpTransport::new()), Arc::new(MdnsScanner::new())),
        TransportKind::Simulated => {
            info!("simulated transport, nothing will reach a real printer");
            (
                Arc::new(MemoryTransport::new()),
                Arc::new(StaticScanner::default()),
            )
        }
    };

    Orchestrator::with_parts(
        config.orchestrator.clone(),
        store,
        transport,
        scanner,
        Arc::new(PassthroughEncoder),
        job_log,
    )
}

/// Put configured printers in the directory. The kind follows the address
/// shape. Returns how many were registered.
pub fn register_known_printers(orchestrator: &Orchestrator, printers: &[KnownPrinter]) -> usize {
    for printer in printers {
        let kind = guess_kind(&printer.address);
        let device = orchestrator
            .directory()
            .register_manually(&printer.name, &printer.address, kind);
        debug!(device = %device.id, name = %printer.name, "known printer registered");
    }
    printers.len()
}

/// Staff-facing text for a failed job's error message.
pub fn describe_failure(message: &str) -> String {
    let human = humanize_error(&BonwerkError::Transmission(message.to_string()));
    format!("{} {}", human.message, human.suggestion)
}

pub fn log_event(event: &PrintEvent) {
    let job = event.job_id.map(|id| id.to_string()).unwrap_or_default();
    let device = event
        .device_id
        .as_ref()
        .map(|id| id.to_string())
        .unwrap_or_default();
    let message = event.message.as_deref().unwrap_or("");

    match event.kind {
        EventKind::JobFailed => error!(
            job = %job,
            device = %device,
            detail = message,
            "{}",
            describe_failure(message)
        ),
        EventKind::JobStarted => info!(job = %job, device = %device, "printing"),
        EventKind::JobCompleted => info!(job = %job, device = %device, "printed"),
        EventKind::QueueUpdated if message.starts_with("retry") => {
            warn!(job = %job, device = %device, "{message}")
        }
        EventKind::QueueUpdated => debug!(job = %job, device = %device, "{message}"),
        EventKind::PrinterConnected => info!(device = %device, "printer connected"),
        EventKind::PrinterDisconnected => info!(device = %device, "printer disconnected"),
        EventKind::DeviceUpdated => debug!(device = %device, "{message}"),
    }
}

/// Log every event until the bus closes.
pub async fn log_events(mut rx: broadcast::Receiver<PrintEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => log_event(&event),
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "event logger fell behind"),
            Err(RecvError::Closed) => break,
        }
    }
}
