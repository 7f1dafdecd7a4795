// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Orchestrator: composition root for the print subsystem.
//
// Owns one instance of every service, wires them to a shared event bus, a
// shared transport and a shared store, and drives their start/stop
// lifecycle. There are no globals; a process may run several orchestrators
// (tests do).

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{info, warn};

use bonwerk_core::config::OrchestratorConfig;
use bonwerk_core::error::{BonwerkError, Result};
use bonwerk_core::types::{
    DeviceId, JobId, JobPriority, PrintEvent, PrintPayload, Role, RoleMapping, SavedDeviceConfig,
};
use bonwerk_store::{JobLog, KeyValueStore};

use crate::connection::ConnectionManager;
use crate::directory::DeviceDirectory;
use crate::encoding::{PassthroughEncoder, TicketEncoder};
use crate::events::EventBus;
use crate::registry::RoleRegistry;
use crate::saved::{AutoReconnector, RestoreReport, SavedDeviceStore};
use crate::scanner::DeviceScanner;
use crate::scheduler::JobScheduler;
use crate::supervisor::ConnectionSupervisor;
use crate::transport::Transport;

pub struct Orchestrator {
    events: EventBus,
    directory: Arc<DeviceDirectory>,
    registry: Arc<RoleRegistry>,
    saved: Arc<SavedDeviceStore>,
    connections: Arc<ConnectionManager>,
    scheduler: JobScheduler,
    supervisor: ConnectionSupervisor,
    auto_reconnect: AutoReconnector,
    job_log: Option<Arc<JobLog>>,
    started: bool,
}

impl Orchestrator {
    /// Orchestrator with the passthrough encoder and no job log.
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn KeyValueStore>,
        transport: Arc<dyn Transport>,
        scanner: Arc<dyn DeviceScanner>,
    ) -> Self {
        Self::with_parts(
            config,
            store,
            transport,
            scanner,
            Arc::new(PassthroughEncoder),
            None,
        )
    }

    pub fn with_parts(
        config: OrchestratorConfig,
        store: Arc<dyn KeyValueStore>,
        transport: Arc<dyn Transport>,
        scanner: Arc<dyn DeviceScanner>,
        encoder: Arc<dyn TicketEncoder>,
        job_log: Option<Arc<JobLog>>,
    ) -> Self {
        let events = EventBus::new(config.event_capacity);
        let directory = Arc::new(DeviceDirectory::new(
            scanner,
            events.clone(),
            config.scan_window(),
        ));
        let saved = Arc::new(SavedDeviceStore::new(
            Arc::clone(&store),
            config.max_saved_devices,
        ));
        let registry = Arc::new(RoleRegistry::load(store, Arc::clone(&saved)));
        let connections = Arc::new(ConnectionManager::new(
            transport,
            Arc::clone(&directory),
            Arc::clone(&saved),
        ));
        let supervisor = ConnectionSupervisor::new(
            &config,
            Arc::clone(&registry),
            Arc::clone(&directory),
            Arc::clone(&connections),
        );
        let auto_reconnect = AutoReconnector::new(
            Arc::clone(&saved),
            Arc::clone(&directory),
            Arc::clone(&connections),
            config.auto_reconnect_interval(),
        );
        let scheduler = JobScheduler::new(
            config,
            Arc::clone(&registry),
            Arc::clone(&directory),
            Arc::clone(&connections),
            encoder,
            events.clone(),
            job_log.clone(),
        );

        Self {
            events,
            directory,
            registry,
            saved,
            connections,
            scheduler,
            supervisor,
            auto_reconnect,
            job_log,
            started: false,
        }
    }

    /// Restore saved devices, then start the scheduler and background loops.
    ///
    /// An unreadable saved-device list is logged and treated as empty.
    pub async fn start(&mut self) -> RestoreReport {
        if self.started {
            return RestoreReport::default();
        }
        let report = match self.saved.restore(&self.directory, &self.connections).await {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "saved devices not restored");
                RestoreReport::default()
            }
        };

        self.scheduler.start();
        self.supervisor.start();
        self.auto_reconnect.start();
        self.started = true;
        info!(
            devices = self.directory.list_devices().len(),
            mappings = self.registry.mappings().len(),
            "orchestrator started"
        );
        report
    }

    /// Stop background loops, let in-flight jobs finish, drop the link.
    pub async fn stop(&mut self) {
        if !self.started {
            return;
        }
        self.supervisor.stop().await;
        self.auto_reconnect.stop().await;
        self.scheduler.stop().await;
        if let Ok(_permit) = self.connections.acquire_exclusive().await {
            self.connections.release_link().await;
        }
        self.started = false;
        info!("orchestrator stopped");
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Save a device and route `roles` to it.
    ///
    /// The device must be in the directory. The saved-device limit is
    /// checked before any mapping changes.
    pub fn pair(&self, device_id: &DeviceId, roles: &[Role]) -> Result<SavedDeviceConfig> {
        let device = self.directory.lookup(device_id)?;
        self.saved.save(
            device_id,
            device.display_name(),
            &self.registry.roles_for(device_id),
        )?;
        for role in roles {
            self.registry.set_mapping(*role, &device, true)?;
        }
        self.saved
            .get(device_id)?
            .ok_or_else(|| BonwerkError::DeviceNotFound(device_id.clone()))
    }

    /// Forget a pairing. Refused while any role still routes to the device.
    pub fn unpair(&self, device_id: &DeviceId) -> Result<()> {
        let roles = self.registry.roles_for(device_id);
        if !roles.is_empty() {
            return Err(BonwerkError::DeviceInUse {
                device: device_id.clone(),
                roles,
            });
        }
        if !self.saved.remove(device_id)? {
            return Err(BonwerkError::DeviceNotFound(device_id.clone()));
        }
        Ok(())
    }

    /// Route `role` to a directory device.
    pub fn assign(&self, role: Role, device_id: &DeviceId, enabled: bool) -> Result<RoleMapping> {
        let device = self.directory.lookup(device_id)?;
        self.registry.set_mapping(role, &device, enabled)
    }

    pub fn submit(&self, role: Role, payload: PrintPayload, priority: JobPriority) -> Result<JobId> {
        self.scheduler.submit(role, payload, priority)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PrintEvent> {
        self.events.subscribe()
    }

    pub fn directory(&self) -> &Arc<DeviceDirectory> {
        &self.directory
    }

    pub fn registry(&self) -> &Arc<RoleRegistry> {
        &self.registry
    }

    pub fn saved_devices(&self) -> &Arc<SavedDeviceStore> {
        &self.saved
    }

    pub fn scheduler(&self) -> &JobScheduler {
        &self.scheduler
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.supervisor
    }

    pub fn job_log(&self) -> Option<&Arc<JobLog>> {
        self.job_log.as_ref()
    }
}
