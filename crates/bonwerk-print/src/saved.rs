// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Saved devices: printers the user explicitly paired.
//
// The list lives in the key-value store under one document and survives
// restarts independently of discovery. At startup every saved device is
// seeded into the directory so reconnection needs no scan. A background
// loop keeps auto-connect devices linked on a fixed interval.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use bonwerk_core::error::{BonwerkError, Result};
use bonwerk_core::types::{DeviceId, Role, SavedDeviceConfig};
use bonwerk_store::KeyValueStore;

use crate::connection::ConnectionManager;
use crate::directory::DeviceDirectory;

/// Store key of the saved-device document.
const SAVED_DEVICES_KEY: &str = "saved_devices";

fn decode(doc: Option<Value>) -> Result<Vec<SavedDeviceConfig>> {
    match doc {
        None => Ok(Vec::new()),
        Some(value) => Ok(serde_json::from_value(value)?),
    }
}

pub struct SavedDeviceStore {
    store: Arc<dyn KeyValueStore>,
    max_devices: usize,
}

impl SavedDeviceStore {
    pub fn new(store: Arc<dyn KeyValueStore>, max_devices: usize) -> Self {
        Self { store, max_devices }
    }

    /// Insert or update a saved device.
    ///
    /// Updating keeps `auto_connect` and `last_connected`. A new entry beyond
    /// the limit fails with `SavedDeviceLimit`.
    pub fn save(&self, id: &DeviceId, name: &str, roles: &[Role]) -> Result<SavedDeviceConfig> {
        let max = self.max_devices;
        let saved = self.modify(|list| {
            if let Some(existing) = list.iter_mut().find(|c| &c.device_id == id) {
                existing.name = name.to_owned();
                existing.roles = roles.to_vec();
                return Ok(existing.clone());
            }
            if list.len() >= max {
                return Err(BonwerkError::SavedDeviceLimit(max));
            }
            let config = SavedDeviceConfig {
                device_id: id.clone(),
                name: name.to_owned(),
                roles: roles.to_vec(),
                last_connected: None,
                auto_connect: true,
            };
            list.push(config.clone());
            Ok(config)
        })?;
        info!(device = %id, roles = ?roles, "device saved");
        Ok(saved)
    }

    pub fn load_all(&self) -> Result<Vec<SavedDeviceConfig>> {
        decode(self.store.get(SAVED_DEVICES_KEY)?)
    }

    pub fn get(&self, id: &DeviceId) -> Result<Option<SavedDeviceConfig>> {
        Ok(self.load_all()?.into_iter().find(|c| &c.device_id == id))
    }

    /// Forget a pairing. Returns whether anything was removed.
    pub fn remove(&self, id: &DeviceId) -> Result<bool> {
        let removed = self.modify(|list| {
            let before = list.len();
            list.retain(|c| &c.device_id != id);
            Ok(list.len() != before)
        })?;
        if removed {
            info!(device = %id, "saved device removed");
        }
        Ok(removed)
    }

    pub fn set_auto_connect(&self, id: &DeviceId, enabled: bool) -> Result<()> {
        self.modify(|list| {
            let config = list
                .iter_mut()
                .find(|c| &c.device_id == id)
                .ok_or_else(|| BonwerkError::DeviceNotFound(id.clone()))?;
            config.auto_connect = enabled;
            Ok(())
        })
    }

    /// Refresh the denormalised role list of a saved device.
    ///
    /// Returns `false` when the device is not saved.
    pub fn update_roles(&self, id: &DeviceId, roles: &[Role]) -> Result<bool> {
        if self.get(id)?.is_none() {
            return Ok(false);
        }
        self.modify(|list| {
            Ok(match list.iter_mut().find(|c| &c.device_id == id) {
                Some(config) => {
                    config.roles = roles.to_vec();
                    true
                }
                None => false,
            })
        })
    }

    /// Stamp the last successful connection of a saved device.
    pub fn mark_connected(&self, id: &DeviceId) -> Result<()> {
        if self.get(id)?.is_none() {
            return Ok(());
        }
        self.modify(|list| {
            if let Some(config) = list.iter_mut().find(|c| &c.device_id == id) {
                config.last_connected = Some(Utc::now());
            }
            Ok(())
        })
    }

    pub fn max_devices(&self) -> usize {
        self.max_devices
    }

    /// Atomic read-modify-write of the whole list.
    fn modify<T>(
        &self,
        mut f: impl FnMut(&mut Vec<SavedDeviceConfig>) -> Result<T>,
    ) -> Result<T> {
        let mut out = None;
        self.store.update(SAVED_DEVICES_KEY, &mut |doc: Option<Value>| {
            let mut list = decode(doc)?;
            out = Some(f(&mut list)?);
            Ok(serde_json::to_value(&list)?)
        })?;
        out.ok_or_else(|| BonwerkError::Database("saved device update did not run".into()))
    }

    /// Seed every saved device into the directory, then reconnect the
    /// auto-connect ones. Reconnect failures are reported, not returned.
    /// Reconnects stop once a job holds or waits for the transport; the
    /// auto-reconnect loop picks up the rest.
    pub async fn restore(
        &self,
        directory: &DeviceDirectory,
        connections: &ConnectionManager,
    ) -> Result<RestoreReport> {
        let configs = self.load_all()?;
        let mut report = RestoreReport::default();

        for config in &configs {
            if !directory.contains(&config.device_id) {
                directory.register_known(&config.device_id, &config.name);
                report.seeded.push(config.device_id.clone());
            }
        }

        for config in configs.iter().filter(|c| c.auto_connect) {
            match connections
                .reconnect_when_idle(&config.device_id, &config.name)
                .await
            {
                Ok(true) => report.connected.push(config.device_id.clone()),
                Ok(false) => {
                    info!("transport in use, leaving the rest to auto-reconnect");
                    break;
                }
                Err(e) => {
                    warn!(device = %config.device_id, error = %e, "saved device did not reconnect");
                    report.failed.push((config.device_id.clone(), e.to_string()));
                }
            }
        }

        info!(
            saved = configs.len(),
            seeded = report.seeded.len(),
            connected = report.connected.len(),
            "saved devices restored"
        );
        Ok(report)
    }
}

/// Outcome of a startup restore.
#[derive(Debug, Default, Clone)]
pub struct RestoreReport {
    /// Devices added to the directory from the saved list.
    pub seeded: Vec<DeviceId>,
    pub connected: Vec<DeviceId>,
    pub failed: Vec<(DeviceId, String)>,
}

// ---------------------------------------------------------------------------
// Auto-reconnect loop
// ---------------------------------------------------------------------------

struct AutoReconnectShared {
    saved: Arc<SavedDeviceStore>,
    directory: Arc<DeviceDirectory>,
    connections: Arc<ConnectionManager>,
}

impl AutoReconnectShared {
    async fn run_once(&self) -> usize {
        let configs = match self.saved.load_all() {
            Ok(configs) => configs,
            Err(e) => {
                warn!(error = %e, "could not read saved devices");
                return 0;
            }
        };

        let mut reconnected = 0;
        for config in configs.iter().filter(|c| c.auto_connect) {
            let linked = self
                .directory
                .lookup(&config.device_id)
                .is_ok_and(|d| d.connected);
            if linked {
                continue;
            }
            match self
                .connections
                .reconnect_when_idle(&config.device_id, &config.name)
                .await
            {
                Ok(true) => reconnected += 1,
                Ok(false) => {
                    debug!("transport busy, auto-reconnect deferred");
                    break;
                }
                Err(e) => debug!(device = %config.device_id, error = %e, "auto-reconnect failed"),
            }
        }
        reconnected
    }
}

/// Fixed-interval loop reconnecting saved auto-connect devices.
pub struct AutoReconnector {
    shared: Arc<AutoReconnectShared>,
    interval: Duration,
    shutdown_signal: Arc<Notify>,
    task_handle: Option<JoinHandle<()>>,
}

impl AutoReconnector {
    pub fn new(
        saved: Arc<SavedDeviceStore>,
        directory: Arc<DeviceDirectory>,
        connections: Arc<ConnectionManager>,
        interval: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(AutoReconnectShared {
                saved,
                directory,
                connections,
            }),
            interval,
            shutdown_signal: Arc::new(Notify::new()),
            task_handle: None,
        }
    }

    /// One pass over the saved list. Returns how many devices were brought
    /// back.
    pub async fn run_once(&self) -> usize {
        self.shared.run_once().await
    }

    pub fn start(&mut self) {
        if self.task_handle.is_some() {
            debug!("auto-reconnect already running");
            return;
        }
        let shared = Arc::clone(&self.shared);
        let shutdown = Arc::clone(&self.shutdown_signal);
        let interval = self.interval;

        self.task_handle = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.notified() => break,
                    _ = tokio::time::sleep(interval) => {
                        let n = shared.run_once().await;
                        if n > 0 {
                            info!(count = n, "saved devices reconnected");
                        }
                    }
                }
            }
        }));
        info!(
            interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
            "auto-reconnect started"
        );
    }

    pub async fn stop(&mut self) {
        let Some(handle) = self.task_handle.take() else {
            return;
        };
        self.shutdown_signal.notify_one();
        if let Err(e) = handle.await {
            warn!(error = %e, "auto-reconnect task ended abnormally");
        }
        info!("auto-reconnect stopped");
    }

    pub fn is_running(&self) -> bool {
        self.task_handle.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bonwerk_core::types::DeviceKind;
    use bonwerk_store::{MemoryStore, SqliteStore};

    use crate::events::EventBus;
    use crate::scanner::StaticScanner;
    use crate::transport::MemoryTransport;

    fn bt(addr: &str) -> DeviceId {
        DeviceId::from_parts(DeviceKind::Bluetooth, addr)
    }

    fn memory_saved(max: usize) -> SavedDeviceStore {
        SavedDeviceStore::new(Arc::new(MemoryStore::new()), max)
    }

    struct Rig {
        transport: Arc<MemoryTransport>,
        directory: Arc<DeviceDirectory>,
        saved: Arc<SavedDeviceStore>,
        connections: Arc<ConnectionManager>,
    }

    fn rig(saved: SavedDeviceStore) -> Rig {
        let transport = Arc::new(MemoryTransport::new());
        let scanner = Arc::new(StaticScanner::default());
        // Restore must not depend on the radio.
        scanner.set_radio_enabled(false);
        let directory = Arc::new(DeviceDirectory::new(
            scanner,
            EventBus::new(64),
            Duration::from_millis(1),
        ));
        let saved = Arc::new(saved);
        let connections = Arc::new(ConnectionManager::new(
            transport.clone(),
            directory.clone(),
            saved.clone(),
        ));
        Rig {
            transport,
            directory,
            saved,
            connections,
        }
    }

    #[test]
    fn save_is_an_upsert_and_keeps_flags() {
        let saved = memory_saved(3);
        let id = bt("00:11:22:33:44:55");

        saved.save(&id, "BT-58", &[Role::Receipt]).unwrap();
        saved.set_auto_connect(&id, false).unwrap();
        let updated = saved
            .save(&id, "Receipts", &[Role::Receipt, Role::BarOrder])
            .unwrap();

        assert_eq!(updated.name, "Receipts");
        assert_eq!(updated.roles, vec![Role::Receipt, Role::BarOrder]);
        assert!(!updated.auto_connect);
        assert_eq!(saved.load_all().unwrap().len(), 1);
    }

    #[test]
    fn limit_is_enforced_for_new_devices_only() {
        let saved = memory_saved(2);
        saved.save(&bt("00:00:00:00:00:01"), "a", &[]).unwrap();
        saved.save(&bt("00:00:00:00:00:02"), "b", &[]).unwrap();

        assert!(matches!(
            saved.save(&bt("00:00:00:00:00:03"), "c", &[]),
            Err(BonwerkError::SavedDeviceLimit(2))
        ));
        saved.save(&bt("00:00:00:00:00:02"), "b2", &[]).unwrap();
        assert_eq!(saved.load_all().unwrap().len(), 2);
    }

    #[test]
    fn remove_and_unknown_device_errors() {
        let saved = memory_saved(3);
        let id = bt("00:11:22:33:44:55");
        assert!(!saved.remove(&id).unwrap());
        assert!(matches!(
            saved.set_auto_connect(&id, true),
            Err(BonwerkError::DeviceNotFound(_))
        ));
        assert!(!saved.update_roles(&id, &[Role::Receipt]).unwrap());

        saved.save(&id, "BT-58", &[]).unwrap();
        assert!(saved.update_roles(&id, &[Role::Receipt]).unwrap());
        assert!(saved.remove(&id).unwrap());
        assert!(saved.get(&id).unwrap().is_none());
    }

    #[test]
    fn survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.db");
        let id = bt("00:11:22:33:44:55");
        {
            let saved = SavedDeviceStore::new(Arc::new(SqliteStore::open(&path).unwrap()), 3);
            saved.save(&id, "BT-58", &[Role::KitchenOrder]).unwrap();
        }
        let saved = SavedDeviceStore::new(Arc::new(SqliteStore::open(&path).unwrap()), 3);
        let all = saved.load_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].roles, vec![Role::KitchenOrder]);
    }

    #[tokio::test]
    async fn restore_seeds_directory_without_scan() {
        let saved = memory_saved(3);
        let kitchen = bt("00:00:00:00:00:0A");
        let bar = bt("00:00:00:00:00:0B");
        saved.save(&kitchen, "Kitchen", &[Role::KitchenOrder]).unwrap();
        saved.save(&bar, "Bar", &[Role::BarOrder]).unwrap();
        let rig = rig(saved);

        let report = rig
            .saved
            .restore(&rig.directory, &rig.connections)
            .await
            .unwrap();

        assert_eq!(report.seeded.len(), 2);
        assert!(rig.directory.contains(&kitchen));
        assert!(rig.directory.contains(&bar));
        assert_eq!(rig.directory.lookup(&kitchen).unwrap().name, "Kitchen");
        assert_eq!(report.connected.len(), 2);
        assert!(report.failed.is_empty());
        // Single link: the last one restored holds it.
        assert_eq!(rig.directory.connected_devices(), vec![bar.clone()]);
        assert!(rig.saved.get(&bar).unwrap().unwrap().last_connected.is_some());
    }

    #[tokio::test]
    async fn restore_reports_unreachable_devices() {
        let saved = memory_saved(3);
        let gone = bt("00:00:00:00:00:0C");
        let manual = bt("00:00:00:00:00:0D");
        saved.save(&gone, "Gone", &[]).unwrap();
        saved.save(&manual, "Manual", &[]).unwrap();
        saved.set_auto_connect(&manual, false).unwrap();
        let rig = rig(saved);
        rig.transport.set_unreachable(&gone, true);

        let report = rig
            .saved
            .restore(&rig.directory, &rig.connections)
            .await
            .unwrap();

        assert_eq!(report.seeded.len(), 2);
        assert!(report.connected.is_empty());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, gone);
    }

    #[tokio::test]
    async fn auto_reconnect_pass_skips_connected_and_busy() {
        let saved = memory_saved(3);
        let id = bt("00:00:00:00:00:0A");
        saved.save(&id, "Kitchen", &[]).unwrap();
        let rig = rig(saved);
        let auto = AutoReconnector::new(
            rig.saved.clone(),
            rig.directory.clone(),
            rig.connections.clone(),
            Duration::from_millis(10),
        );

        let permit = rig.connections.acquire_exclusive().await.unwrap();
        assert_eq!(auto.run_once().await, 0);
        drop(permit);

        rig.connections.set_backlog(1);
        assert_eq!(auto.run_once().await, 0);
        rig.connections.set_backlog(0);
        assert_eq!(rig.transport.connect_attempts(), 0);

        assert_eq!(auto.run_once().await, 1);
        assert!(rig.directory.lookup(&id).unwrap().connected);
        assert_eq!(auto.run_once().await, 0);
    }

    #[tokio::test]
    async fn auto_reconnect_loop_start_stop() {
        let saved = memory_saved(3);
        let id = bt("00:00:00:00:00:0A");
        saved.save(&id, "Kitchen", &[]).unwrap();
        let rig = rig(saved);
        let mut auto = AutoReconnector::new(
            rig.saved.clone(),
            rig.directory.clone(),
            rig.connections.clone(),
            Duration::from_millis(5),
        );

        auto.start();
        assert!(auto.is_running());
        for _ in 0..200 {
            if rig.directory.lookup(&id).is_ok_and(|d| d.connected) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        auto.stop().await;
        assert!(!auto.is_running());
        assert!(rig.directory.lookup(&id).unwrap().connected);
    }
}
