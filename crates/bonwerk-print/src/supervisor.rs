// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Connection supervisor: keeps role-mapped printers warm.
//
// Every sweep looks at each device with at least one enabled mapping:
//   - missing from the directory: re-register from the mapping's device id
//     and reconnect (no scan);
//   - present but not connected, signal not implausibly weak: reconnect.
// A sweep with any failed reconnect doubles the interval up to the cap; a
// clean sweep resets it. The sweep never takes the transport permit: it
// stops at the first device it would reconnect while a job holds the
// transport or waits in a queue, and such a deferred sweep leaves the
// interval alone.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use bonwerk_core::config::OrchestratorConfig;
use bonwerk_core::types::DeviceId;

use crate::backoff::Backoff;
use crate::connection::ConnectionManager;
use crate::directory::DeviceDirectory;
use crate::registry::RoleRegistry;

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    /// A job held or was waiting for the transport; the sweep stopped early.
    pub deferred: bool,
    pub healthy: Vec<DeviceId>,
    pub reconnected: Vec<DeviceId>,
    /// Present but with too weak a signal to bother.
    pub skipped_weak: Vec<DeviceId>,
    pub failed: Vec<(DeviceId, String)>,
}

impl SweepReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

struct SupervisorShared {
    registry: Arc<RoleRegistry>,
    directory: Arc<DeviceDirectory>,
    connections: Arc<ConnectionManager>,
    min_signal_dbm: i16,
    backoff: Mutex<Backoff>,
}

impl SupervisorShared {
    async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        if !self.connections.is_idle() {
            debug!("transport busy, sweep deferred");
            report.deferred = true;
            return report;
        }

        for (id, name) in self.registry.enabled_devices() {
            match self.directory.lookup(&id) {
                Ok(device) if device.connected => {
                    report.healthy.push(id);
                    continue;
                }
                Ok(device) if device.signal_dbm.is_some_and(|s| s < self.min_signal_dbm) => {
                    debug!(device = %id, signal = ?device.signal_dbm, "signal too weak, not reconnecting");
                    report.skipped_weak.push(id);
                    continue;
                }
                Ok(_) => {}
                Err(_) => info!(device = %id, "mapped device missing from directory"),
            }

            match self.connections.reconnect_when_idle(&id, &name).await {
                Ok(true) => report.reconnected.push(id),
                Ok(false) => {
                    debug!(device = %id, "job waiting for transport, sweep deferred");
                    report.deferred = true;
                    return report;
                }
                Err(e) => {
                    warn!(device = %id, error = %e, "supervisor reconnect failed");
                    report.failed.push((id, e.to_string()));
                }
            }
        }

        let mut backoff = self.backoff.lock().expect("supervisor lock poisoned");
        if report.is_clean() {
            backoff.on_success();
        } else {
            backoff.on_failure();
        }
        report
    }

    fn current_interval(&self) -> Duration {
        self.backoff
            .lock()
            .expect("supervisor lock poisoned")
            .current()
    }
}

pub struct ConnectionSupervisor {
    shared: Arc<SupervisorShared>,
    shutdown_signal: Arc<Notify>,
    task_handle: Option<JoinHandle<()>>,
}

impl ConnectionSupervisor {
    pub fn new(
        config: &OrchestratorConfig,
        registry: Arc<RoleRegistry>,
        directory: Arc<DeviceDirectory>,
        connections: Arc<ConnectionManager>,
    ) -> Self {
        Self {
            shared: Arc::new(SupervisorShared {
                registry,
                directory,
                connections,
                min_signal_dbm: config.min_signal_dbm,
                backoff: Mutex::new(Backoff::new(
                    config.supervisor_base_interval(),
                    config.supervisor_max_interval(),
                )),
            }),
            shutdown_signal: Arc::new(Notify::new()),
            task_handle: None,
        }
    }

    /// Run one sweep now.
    pub async fn sweep_once(&self) -> SweepReport {
        self.shared.sweep().await
    }

    /// Wait before the next sweep.
    pub fn current_interval(&self) -> Duration {
        self.shared.current_interval()
    }

    pub fn start(&mut self) {
        if self.task_handle.is_some() {
            debug!("connection supervisor already running");
            return;
        }
        let shared = Arc::clone(&self.shared);
        let shutdown = Arc::clone(&self.shutdown_signal);

        self.task_handle = Some(tokio::spawn(async move {
            loop {
                let interval = shared.current_interval();
                tokio::select! {
                    _ = shutdown.notified() => break,
                    _ = tokio::time::sleep(interval) => {
                        let report = shared.sweep().await;
                        if !report.is_clean() {
                            info!(
                                failed = report.failed.len(),
                                next_ms = u64::try_from(shared.current_interval().as_millis())
                                    .unwrap_or(u64::MAX),
                                "sweep had failures, backing off"
                            );
                        }
                    }
                }
            }
        }));
        info!("connection supervisor started");
    }

    pub async fn stop(&mut self) {
        let Some(handle) = self.task_handle.take() else {
            return;
        };
        self.shutdown_signal.notify_one();
        if let Err(e) = handle.await {
            warn!(error = %e, "supervisor task ended abnormally");
        }
        info!("connection supervisor stopped");
    }

    pub fn is_running(&self) -> bool {
        self.task_handle.is_some()
    }
}
