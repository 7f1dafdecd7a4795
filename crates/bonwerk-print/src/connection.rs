// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Connection manager: the reconnect primitive shared by the scheduler, the
// supervisor and the saved-device auto-reconnect loop.
//
// It also owns the exclusive region guarding the transport: a semaphore
// with a single permit. The scheduler waits for the permit around
// connect-through-transmit. Background loops never take the permit. They
// reconnect through `reconnect_when_idle`, which gives up as soon as a job
// holds the transport or the scheduler has work queued. A separate link
// lock serialises the individual disconnect and connect calls, so a job
// that arrives mid-reconnect waits for that one connect, at its own
// connect step.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use bonwerk_core::error::{BonwerkError, Result};
use bonwerk_core::types::{DeviceId, DeviceStatus};

use crate::directory::DeviceDirectory;
use crate::saved::SavedDeviceStore;
use crate::transport::Transport;

pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    directory: Arc<DeviceDirectory>,
    saved: Arc<SavedDeviceStore>,
    exclusive: Arc<Semaphore>,
    link: Mutex<()>,
    backlog: AtomicUsize,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        directory: Arc<DeviceDirectory>,
        saved: Arc<SavedDeviceStore>,
    ) -> Self {
        Self {
            transport,
            directory,
            saved,
            exclusive: Arc::new(Semaphore::new(1)),
            link: Mutex::new(()),
            backlog: AtomicUsize::new(0),
        }
    }

    /// Wait for the transport. The permit releases the region on drop.
    pub async fn acquire_exclusive(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.exclusive)
            .acquire_owned()
            .await
            .map_err(|_| BonwerkError::SchedulerStopped)
    }

    /// Whether a job currently holds the transport.
    pub fn is_busy(&self) -> bool {
        self.exclusive.available_permits() == 0
    }

    /// Number of jobs waiting in scheduler queues, as last published.
    pub fn backlog(&self) -> usize {
        self.backlog.load(Ordering::SeqCst)
    }

    pub fn set_backlog(&self, pending: usize) {
        self.backlog.store(pending, Ordering::SeqCst);
    }

    /// No job holds the transport and none is waiting for it.
    pub fn is_idle(&self) -> bool {
        !self.is_busy() && self.backlog() == 0
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Tear down the link and mark whatever was connected as available.
    ///
    /// Caller must hold the exclusive permit.
    pub async fn release_link(&self) {
        let _link = self.link.lock().await;
        self.release_locked().await;
    }

    /// Single connect attempt with directory status bookkeeping.
    ///
    /// Caller must hold the exclusive permit.
    pub async fn connect(&self, id: &DeviceId) -> Result<()> {
        let _link = self.link.lock().await;
        self.connect_locked(id).await
    }

    /// Bring `id` back: seed it into the directory from its last-known
    /// identity if it is missing, drop any other link, then connect.
    ///
    /// Caller must hold the exclusive permit.
    pub async fn reconnect(&self, id: &DeviceId, name: &str) -> Result<()> {
        let _link = self.link.lock().await;
        self.reconnect_locked(id, name).await
    }

    /// `reconnect` for background loops, which never hold the permit.
    ///
    /// Returns `Ok(false)` without touching the link when a job holds the
    /// transport or is queued for it. Idleness is checked again once the
    /// link lock is held, so a job that got in first is never overtaken.
    pub async fn reconnect_when_idle(&self, id: &DeviceId, name: &str) -> Result<bool> {
        if !self.is_idle() {
            return Ok(false);
        }
        let _link = self.link.lock().await;
        if !self.is_idle() {
            debug!(device = %id, "transport claimed, background reconnect skipped");
            return Ok(false);
        }
        self.reconnect_locked(id, name).await.map(|()| true)
    }

    async fn reconnect_locked(&self, id: &DeviceId, name: &str) -> Result<()> {
        if !self.directory.contains(id) {
            info!(device = %id, "re-registering device from last-known identity");
            self.directory.register_known(id, name);
        }

        let linked = self.transport.connected_device().as_ref() == Some(id);
        if linked && self.directory.lookup(id).is_ok_and(|d| d.connected) {
            debug!(device = %id, "already connected");
            return Ok(());
        }

        self.release_locked().await;
        self.connect_locked(id).await
    }

    async fn release_locked(&self) {
        if let Err(e) = self.transport.disconnect().await {
            warn!(error = %e, "transport disconnect failed");
        }
        let dropped = self.directory.mark_all_disconnected();
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "link released");
        }
    }

    async fn connect_locked(&self, id: &DeviceId) -> Result<()> {
        self.set_status(id, DeviceStatus::Connecting, None);
        match self.transport.connect(id).await {
            Ok(()) => {
                self.set_status(id, DeviceStatus::Connected, None);
                if let Err(e) = self.saved.mark_connected(id) {
                    warn!(device = %id, error = %e, "could not record last connection");
                }
                info!(device = %id, "printer connected");
                Ok(())
            }
            Err(e) => {
                self.set_status(id, DeviceStatus::Error, Some(e.to_string()));
                Err(e)
            }
        }
    }

    fn set_status(&self, id: &DeviceId, status: DeviceStatus, error: Option<String>) {
        if let Err(e) = self.directory.update_status(id, status, error) {
            debug!(device = %id, error = %e, "status update skipped");
        }
    }
}
