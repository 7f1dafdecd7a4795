// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Printer transports.
//
// The orchestrator drives exactly one physical link. A transport holds at
// most one open connection; connecting to a device implicitly replaces the
// previous one. `disconnect` is idempotent.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use bonwerk_core::error::{BonwerkError, Result};
use bonwerk_core::types::{DeviceId, DeviceKind};

/// Call contract for the hardware link.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a link to `device`, replacing any existing one.
    async fn connect(&self, device: &DeviceId) -> Result<()>;

    /// Close the current link. Succeeds when nothing is connected.
    async fn disconnect(&self) -> Result<()>;

    /// Send formatted bytes over the current link.
    async fn transmit(&self, bytes: &[u8]) -> Result<()>;

    /// Device the link currently points at.
    fn connected_device(&self) -> Option<DeviceId>;
}

// ---------------------------------------------------------------------------
// Raw TCP (JetDirect)
// ---------------------------------------------------------------------------

/// Timeout for opening a raw TCP connection.
const RAW_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Chunk size for writes, so progress shows up in debug logs.
const RAW_CHUNK_SIZE: usize = 8192;

/// Transport for network printers on the raw print port (9100).
///
/// There is no protocol negotiation: the printer must understand the bytes
/// the encoder produced (typically ESC/POS).
#[derive(Default)]
pub struct RawTcpTransport {
    link: tokio::sync::Mutex<Option<TcpStream>>,
    current: Mutex<Option<DeviceId>>,
}

impl RawTcpTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for RawTcpTransport {
    async fn connect(&self, device: &DeviceId) -> Result<()> {
        if device.kind() != DeviceKind::Network {
            return Err(BonwerkError::Connection(format!(
                "raw TCP cannot reach {} device {device}",
                device.kind()
            )));
        }

        let addr = device.address();
        let mut link = self.link.lock().await;
        if let Some(mut old) = link.take() {
            let _ = old.shutdown().await;
        }
        *self.current.lock().expect("transport lock poisoned") = None;

        info!(addr = %addr, "connecting via raw TCP");
        let stream = tokio::time::timeout(RAW_CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| {
                BonwerkError::Connection(format!(
                    "connect to {addr} timed out after {}s",
                    RAW_CONNECT_TIMEOUT.as_secs()
                ))
            })?
            .map_err(|e| BonwerkError::Connection(format!("connect to {addr}: {e}")))?;

        *link = Some(stream);
        *self.current.lock().expect("transport lock poisoned") = Some(device.clone());
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut link = self.link.lock().await;
        let previous = self.current.lock().expect("transport lock poisoned").take();
        if let Some(mut stream) = link.take() {
            if let Err(e) = stream.shutdown().await {
                debug!(error = %e, "raw TCP shutdown");
            }
            if let Some(device) = previous {
                debug!(device = %device, "raw TCP link closed");
            }
        }
        Ok(())
    }

    async fn transmit(&self, bytes: &[u8]) -> Result<()> {
        let mut link = self.link.lock().await;
        let stream = link
            .as_mut()
            .ok_or_else(|| BonwerkError::Transmission("not connected".into()))?;

        let mut sent = 0usize;
        let mut outcome = Ok(());
        for chunk in bytes.chunks(RAW_CHUNK_SIZE) {
            if let Err(e) = stream.write_all(chunk).await {
                outcome = Err(BonwerkError::Transmission(format!(
                    "send failed at byte {sent}: {e}"
                )));
                break;
            }
            sent += chunk.len();
            debug!(sent, total = bytes.len(), "raw TCP progress");
        }
        if outcome.is_ok() {
            if let Err(e) = stream.flush().await {
                outcome = Err(BonwerkError::Transmission(format!("flush: {e}")));
            }
        }

        if outcome.is_err() {
            // A half-written link is useless; force a fresh connect next time.
            link.take();
            *self.current.lock().expect("transport lock poisoned") = None;
            warn!(sent, total = bytes.len(), "raw TCP link dropped after failed send");
        }
        outcome
    }

    fn connected_device(&self) -> Option<DeviceId> {
        self.current.lock().expect("transport lock poisoned").clone()
    }
}

// ---------------------------------------------------------------------------
// In-memory transport
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryLinkState {
    connected: Option<DeviceId>,
    unreachable: HashSet<DeviceId>,
    fail_connects: u32,
    fail_transmits: u32,
    connect_attempts: u32,
    sent: Vec<(DeviceId, Vec<u8>)>,
}

/// Scriptable in-process transport.
///
/// Used by tests and by the daemon's simulated mode. Tracks how many
/// transmissions overlap so callers can check the single-link invariant.
#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<MemoryLinkState>,
    connect_delay: Duration,
    transmit_delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every transmission take `delay`.
    pub fn with_transmit_delay(delay: Duration) -> Self {
        Self {
            transmit_delay: delay,
            ..Self::default()
        }
    }

    /// Make every connect attempt take `delay` before it resolves.
    pub fn with_connect_delay(delay: Duration) -> Self {
        Self {
            connect_delay: delay,
            ..Self::default()
        }
    }

    /// Refuse (or accept again) connections to `device`.
    pub fn set_unreachable(&self, device: &DeviceId, unreachable: bool) {
        let mut state = self.state.lock().expect("transport lock poisoned");
        if unreachable {
            state.unreachable.insert(device.clone());
        } else {
            state.unreachable.remove(device);
        }
    }

    /// Fail the next `n` connect attempts regardless of target.
    pub fn fail_next_connects(&self, n: u32) {
        self.state.lock().expect("transport lock poisoned").fail_connects = n;
    }

    /// Fail the next `n` transmissions.
    pub fn fail_next_transmits(&self, n: u32) {
        self.state.lock().expect("transport lock poisoned").fail_transmits = n;
    }

    /// Everything transmitted so far, in order.
    pub fn transmissions(&self) -> Vec<(DeviceId, Vec<u8>)> {
        self.state.lock().expect("transport lock poisoned").sent.clone()
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state.lock().expect("transport lock poisoned").connect_attempts
    }

    /// Highest number of transmissions observed in flight at once.
    pub fn max_concurrent_transmissions(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, device: &DeviceId) -> Result<()> {
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        let mut state = self.state.lock().expect("transport lock poisoned");
        state.connect_attempts += 1;
        state.connected = None;
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(BonwerkError::Connection(format!("{device}: connect timed out")));
        }
        if state.unreachable.contains(device) {
            return Err(BonwerkError::Connection(format!("{device}: unreachable")));
        }
        state.connected = Some(device.clone());
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.state.lock().expect("transport lock poisoned").connected = None;
        Ok(())
    }

    async fn transmit(&self, bytes: &[u8]) -> Result<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.transmit_delay.is_zero() {
            tokio::time::sleep(self.transmit_delay).await;
        }

        let outcome = {
            let mut state = self.state.lock().expect("transport lock poisoned");
            match state.connected.clone() {
                None => Err(BonwerkError::Transmission("not connected".into())),
                Some(_) if state.fail_transmits > 0 => {
                    state.fail_transmits -= 1;
                    Err(BonwerkError::Transmission("broken pipe".into()))
                }
                Some(device) => {
                    state.sent.push((device, bytes.to_vec()));
                    Ok(())
                }
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome
    }

    fn connected_device(&self) -> Option<DeviceId> {
        self.state.lock().expect("transport lock poisoned").connected.clone()
    }
}
