// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Device scanners.
//
// A scan runs for a bounded window and reports every printer seen during it.
// The directory merges the observations; scanners keep no state of their own
// between scans.
//
// `MdnsScanner` browses for `_pdl-datastream._tcp.local.`, the service type
// raw-port (JetDirect) printers advertise. Receipt printers on Bluetooth or
// USB are added by manual registration or by a platform scanner.

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tracing::{debug, info, warn};

use bonwerk_core::error::{BonwerkError, Result};
use bonwerk_core::types::{Capability, DeviceId, DeviceKind};

/// mDNS service type for raw-port printers.
const RAW_PRINTER_SERVICE: &str = "_pdl-datastream._tcp.local.";

/// One printer seen during a scan.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub id: DeviceId,
    pub name: String,
    pub capabilities: BTreeSet<Capability>,
    pub signal_dbm: Option<i16>,
}

impl Observation {
    /// Observation carrying the default capabilities for the device kind.
    pub fn new(id: DeviceId, name: impl Into<String>) -> Self {
        let capabilities = id.kind().default_capabilities();
        Self {
            id,
            name: name.into(),
            capabilities,
            signal_dbm: None,
        }
    }

    pub fn with_signal(mut self, dbm: i16) -> Self {
        self.signal_dbm = Some(dbm);
        self
    }
}

#[async_trait]
pub trait DeviceScanner: Send + Sync {
    /// Whether the radio (or network stack) is usable right now.
    fn radio_enabled(&self) -> bool;

    /// Scan for `window` and return what was seen.
    async fn scan(&self, window: Duration) -> Result<Vec<Observation>>;
}

// ---------------------------------------------------------------------------
// mDNS
// ---------------------------------------------------------------------------

/// Scanner for network printers using mDNS-SD.
pub struct MdnsScanner {
    /// `None` when the daemon could not start (no usable interface).
    daemon: Option<ServiceDaemon>,
}

impl MdnsScanner {
    pub fn new() -> Self {
        let daemon = match ServiceDaemon::new() {
            Ok(daemon) => Some(daemon),
            Err(e) => {
                warn!(error = %e, "mDNS daemon unavailable, network scanning disabled");
                None
            }
        };
        Self { daemon }
    }
}

impl Default for MdnsScanner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceScanner for MdnsScanner {
    fn radio_enabled(&self) -> bool {
        self.daemon.is_some()
    }

    async fn scan(&self, window: Duration) -> Result<Vec<Observation>> {
        let daemon = self.daemon.as_ref().ok_or(BonwerkError::RadioDisabled)?;
        let receiver = daemon
            .browse(RAW_PRINTER_SERVICE)
            .map_err(|e| BonwerkError::Scan(format!("browse {RAW_PRINTER_SERVICE}: {e}")))?;

        // recv_timeout blocks, keep it off the async workers.
        let found = tokio::task::spawn_blocking(move || drain_browse(receiver, window))
            .await
            .map_err(|e| BonwerkError::Scan(format!("mDNS listener: {e}")))?;

        if let Err(e) = daemon.stop_browse(RAW_PRINTER_SERVICE) {
            debug!(error = %e, "stop browse");
        }

        info!(count = found.len(), "mDNS scan finished");
        Ok(found)
    }
}

fn drain_browse(
    receiver: mdns_sd::Receiver<ServiceEvent>,
    window: Duration,
) -> Vec<Observation> {
    let deadline = Instant::now() + window;
    let mut found: HashMap<String, Observation> = HashMap::new();

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match receiver.recv_timeout(remaining) {
            Ok(ServiceEvent::ServiceResolved(info)) => {
                let fullname = info.get_fullname().to_owned();
                match observation_from_service(&info) {
                    Some(obs) => {
                        debug!(name = %obs.name, id = %obs.id, "printer resolved");
                        found.insert(fullname, obs);
                    }
                    None => warn!(fullname = %fullname, "resolved service has no address"),
                }
            }
            Ok(ServiceEvent::ServiceRemoved(_, fullname)) => {
                found.remove(&fullname);
            }
            Ok(ServiceEvent::SearchStopped(_)) => break,
            Ok(_) => {}
            Err(_) => break,
        }
    }

    found.into_values().collect()
}

/// Convert a resolved service into an observation.
///
/// TXT keys used (case-insensitive):
///   - `ty`  human-readable make and model
///   - `Cut` "T" when the printer has an auto-cutter
fn observation_from_service(info: &ServiceInfo) -> Option<Observation> {
    // Prefer IPv4 for wider printer compatibility.
    let ip: IpAddr = info
        .get_addresses()
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| info.get_addresses().iter().next())
        .copied()?;

    let id = DeviceId::Network {
        host: ip.to_string(),
        port: info.get_port(),
    };
    let name = info
        .get_property_val_str("ty")
        .map(str::to_owned)
        .unwrap_or_else(|| instance_name(info.get_fullname()));

    let mut obs = Observation::new(id, name);
    if info
        .get_property_val_str("Cut")
        .is_some_and(|v| v.eq_ignore_ascii_case("T"))
    {
        obs.capabilities.insert(Capability::Cutter);
    }
    Some(obs)
}

/// `"Kitchen Epson._pdl-datastream._tcp.local."` -> `"Kitchen Epson"`.
fn instance_name(fullname: &str) -> String {
    fullname
        .strip_suffix(RAW_PRINTER_SERVICE)
        .map(|s| s.trim_end_matches('.'))
        .unwrap_or(fullname)
        .to_owned()
}

// ---------------------------------------------------------------------------
// Static
// ---------------------------------------------------------------------------

/// Scanner that reports a fixed, replaceable set of observations.
///
/// Backs the daemon's simulated mode and the tests.
pub struct StaticScanner {
    observations: Mutex<Vec<Observation>>,
    radio: AtomicBool,
}

impl StaticScanner {
    pub fn new(observations: Vec<Observation>) -> Self {
        Self {
            observations: Mutex::new(observations),
            radio: AtomicBool::new(true),
        }
    }

    pub fn set_observations(&self, observations: Vec<Observation>) {
        *self.observations.lock().expect("scanner lock poisoned") = observations;
    }

    pub fn set_radio_enabled(&self, enabled: bool) {
        self.radio.store(enabled, Ordering::SeqCst);
    }
}

impl Default for StaticScanner {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl DeviceScanner for StaticScanner {
    fn radio_enabled(&self) -> bool {
        self.radio.load(Ordering::SeqCst)
    }

    async fn scan(&self, _window: Duration) -> Result<Vec<Observation>> {
        if !self.radio_enabled() {
            return Err(BonwerkError::RadioDisabled);
        }
        Ok(self.observations.lock().expect("scanner lock poisoned").clone())
    }
}

/// Parse an address the way the operator typed it when the kind is implied
/// by its shape: MAC-like strings are Bluetooth, paths are USB, the rest is
/// network.
pub fn guess_kind(address: &str) -> DeviceKind {
    let address = address.trim();
    let is_mac = address.len() == 17
        && address
            .split(':')
            .all(|octet| octet.len() == 2 && octet.chars().all(|c| c.is_ascii_hexdigit()));
    if is_mac {
        DeviceKind::Bluetooth
    } else if address.starts_with('/') {
        DeviceKind::Usb
    } else {
        DeviceKind::Network
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_name_strips_service_type() {
        assert_eq!(
            instance_name("Kitchen Epson._pdl-datastream._tcp.local."),
            "Kitchen Epson"
        );
        assert_eq!(instance_name("odd-name"), "odd-name");
    }

    #[test]
    fn kind_guessing() {
        assert_eq!(guess_kind("66:22:b3:0c:41:9e"), DeviceKind::Bluetooth);
        assert_eq!(guess_kind("/dev/usb/lp0"), DeviceKind::Usb);
        assert_eq!(guess_kind("192.168.1.40:9100"), DeviceKind::Network);
        assert_eq!(guess_kind("fe80::1"), DeviceKind::Network);
    }

    #[tokio::test]
    async fn static_scanner_honours_radio_switch() {
        let id = DeviceId::from_parts(DeviceKind::Bluetooth, "00:11:22:33:44:55");
        let scanner = StaticScanner::new(vec![Observation::new(id.clone(), "BT-58").with_signal(-60)]);

        let seen = scanner.scan(Duration::from_millis(1)).await.unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].id, id);
        assert_eq!(seen[0].signal_dbm, Some(-60));

        scanner.set_radio_enabled(false);
        assert!(matches!(
            scanner.scan(Duration::from_millis(1)).await,
            Err(BonwerkError::RadioDisabled)
        ));
    }
}
