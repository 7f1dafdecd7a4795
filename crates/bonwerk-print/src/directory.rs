// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Device directory: the live set of known printers.
//
// The directory is the only writer of device records. Everyone else reads
// snapshots. Records come from scans or manual registration and stay until
// explicitly forgotten; a printer that drops out of a scan keeps its record
// and only its `last_seen` stops advancing.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use bonwerk_core::error::{BonwerkError, Result};
use bonwerk_core::types::{
    Device, DeviceId, DeviceKind, DeviceStatus, EventKind, PrintEvent,
};

use crate::events::EventBus;
use crate::scanner::{DeviceScanner, Observation};

pub struct DeviceDirectory {
    devices: Mutex<HashMap<DeviceId, Device>>,
    scanner: Arc<dyn DeviceScanner>,
    events: EventBus,
    scan_window: Duration,
    scanning: AtomicBool,
}

impl DeviceDirectory {
    pub fn new(scanner: Arc<dyn DeviceScanner>, events: EventBus, scan_window: Duration) -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
            scanner,
            events,
            scan_window,
            scanning: AtomicBool::new(false),
        }
    }

    /// Scan for printers and merge the results.
    ///
    /// Returns how many devices were seen. Fails with `RadioDisabled` when
    /// the radio is off; the caller decides whether to ask the user to turn
    /// it on. A scan already in progress makes this a no-op.
    pub async fn start_scan(&self) -> Result<usize> {
        if !self.scanner.radio_enabled() {
            return Err(BonwerkError::RadioDisabled);
        }
        if self.scanning.swap(true, Ordering::SeqCst) {
            debug!("scan already in progress");
            return Ok(0);
        }

        let result = self.scanner.scan(self.scan_window).await;
        self.scanning.store(false, Ordering::SeqCst);
        let observations = result?;

        let count = observations.len();
        let touched: Vec<DeviceId> = {
            let mut devices = self.devices.lock().expect("directory lock poisoned");
            observations
                .into_iter()
                .map(|obs| merge_observation(&mut devices, obs))
                .collect()
        };
        for id in &touched {
            self.events
                .emit(PrintEvent::device(EventKind::DeviceUpdated, id).with_message("scanned"));
        }

        info!(count, "device scan merged");
        Ok(count)
    }

    /// Snapshot of every known device, sorted by display name.
    pub fn list_devices(&self) -> Vec<Device> {
        let mut list: Vec<Device> = self
            .devices
            .lock()
            .expect("directory lock poisoned")
            .values()
            .cloned()
            .collect();
        list.sort_by(|a, b| a.display_name().cmp(b.display_name()).then(a.id.cmp(&b.id)));
        list
    }

    /// Add a device without scanning.
    ///
    /// If the device is already known its record is left alone.
    pub fn register_manually(&self, name: &str, address: &str, kind: DeviceKind) -> Device {
        self.register_known(&DeviceId::from_parts(kind, address), name)
    }

    /// Seed a device from a known identity (restored pairing, last-known
    /// mapping target).
    pub fn register_known(&self, id: &DeviceId, name: &str) -> Device {
        let (device, inserted) = {
            let mut devices = self.devices.lock().expect("directory lock poisoned");
            match devices.get(id) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let device = Device::new(id.clone(), name);
                    devices.insert(id.clone(), device.clone());
                    (device, true)
                }
            }
        };
        if inserted {
            info!(device = %id, name, "device registered");
            self.events.emit(
                PrintEvent::device(EventKind::DeviceUpdated, id).with_message("registered"),
            );
        }
        device
    }

    /// Set or clear the operator-chosen name.
    pub fn set_friendly_name(&self, id: &DeviceId, name: Option<String>) -> Result<()> {
        {
            let mut devices = self.devices.lock().expect("directory lock poisoned");
            let device = devices
                .get_mut(id)
                .ok_or_else(|| BonwerkError::DeviceNotFound(id.clone()))?;
            device.friendly_name = name.filter(|n| !n.trim().is_empty());
        }
        self.events
            .emit(PrintEvent::device(EventKind::DeviceUpdated, id).with_message("renamed"));
        Ok(())
    }

    /// Record a connection lifecycle change.
    ///
    /// Emits `DeviceUpdated`, plus `PrinterConnected` / `PrinterDisconnected`
    /// when the connected flag flips.
    pub fn update_status(
        &self,
        id: &DeviceId,
        status: DeviceStatus,
        error: Option<String>,
    ) -> Result<()> {
        let was_connected = {
            let mut devices = self.devices.lock().expect("directory lock poisoned");
            let device = devices
                .get_mut(id)
                .ok_or_else(|| BonwerkError::DeviceNotFound(id.clone()))?;
            let was_connected = device.connected;
            device.status = status;
            device.connected = status == DeviceStatus::Connected;
            match status {
                DeviceStatus::Connected => {
                    device.last_seen = Utc::now();
                    device.last_error = None;
                }
                DeviceStatus::Error => device.last_error = error.clone(),
                DeviceStatus::Available | DeviceStatus::Connecting => {}
            }
            was_connected
        };

        let now_connected = status == DeviceStatus::Connected;
        debug!(device = %id, ?status, "device status updated");

        let mut event = PrintEvent::device(EventKind::DeviceUpdated, id);
        if let Some(error) = &error {
            event = event.with_message(error.clone());
        }
        self.events.emit(event);

        if now_connected && !was_connected {
            self.events
                .emit(PrintEvent::device(EventKind::PrinterConnected, id));
        } else if was_connected && !now_connected {
            let mut event = PrintEvent::device(EventKind::PrinterDisconnected, id);
            if let Some(error) = error {
                event = event.with_message(error);
            }
            self.events.emit(event);
        }
        Ok(())
    }

    /// Mark every connected device as available again.
    ///
    /// Called after the transport link has been torn down. Returns the
    /// devices that were connected.
    pub fn mark_all_disconnected(&self) -> Vec<DeviceId> {
        let dropped = self.connected_devices();
        for id in &dropped {
            if let Err(e) = self.update_status(id, DeviceStatus::Available, None) {
                // Forgotten between the snapshot and the update.
                debug!(device = %id, error = %e, "skip disconnect mark");
            }
        }
        dropped
    }

    pub fn lookup(&self, id: &DeviceId) -> Result<Device> {
        self.devices
            .lock()
            .expect("directory lock poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| BonwerkError::DeviceNotFound(id.clone()))
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.devices
            .lock()
            .expect("directory lock poisoned")
            .contains_key(id)
    }

    /// Remove a device record.
    pub fn forget(&self, id: &DeviceId) -> Result<Device> {
        let removed = self
            .devices
            .lock()
            .expect("directory lock poisoned")
            .remove(id)
            .ok_or_else(|| BonwerkError::DeviceNotFound(id.clone()))?;
        if removed.connected {
            warn!(device = %id, "forgot a connected device");
        }
        self.events
            .emit(PrintEvent::device(EventKind::DeviceUpdated, id).with_message("forgotten"));
        Ok(removed)
    }

    pub fn connected_devices(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self
            .devices
            .lock()
            .expect("directory lock poisoned")
            .values()
            .filter(|d| d.connected)
            .map(|d| d.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PrintEvent> {
        self.events.subscribe()
    }
}

/// Insert or refresh a device from a scan observation.
fn merge_observation(devices: &mut HashMap<DeviceId, Device>, obs: Observation) -> DeviceId {
    let id = obs.id.clone();
    match devices.get_mut(&id) {
        Some(device) => {
            device.name = obs.name;
            device.capabilities = obs.capabilities;
            device.signal_dbm = obs.signal_dbm;
            device.last_seen = Utc::now();
        }
        None => {
            let mut device = Device::new(id.clone(), obs.name);
            device.capabilities = obs.capabilities;
            device.signal_dbm = obs.signal_dbm;
            devices.insert(id.clone(), device);
        }
    }
    id
}
