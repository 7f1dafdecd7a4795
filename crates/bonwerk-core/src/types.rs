// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core domain types for the Bonwerk print orchestrator.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Unique identifier for a print job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

/// How a printer is physically reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Bluetooth,
    Network,
    Usb,
}

impl DeviceKind {
    /// Capabilities assumed for a device of this kind when nothing better is
    /// known (manual registration, restored pairings).
    pub fn default_capabilities(&self) -> BTreeSet<Capability> {
        match self {
            Self::Bluetooth | Self::Usb => {
                BTreeSet::from([Capability::TextPrinting, Capability::Thermal])
            }
            Self::Network => BTreeSet::from([Capability::TextPrinting]),
        }
    }
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Bluetooth => "bluetooth",
            Self::Network => "network",
            Self::Usb => "usb",
        };
        f.write_str(s)
    }
}

/// Stable identity of a printer: its kind plus its physical address.
///
/// Kept as a tagged union so that separator characters inside an address
/// (MAC colons, `host:port`) can never be confused with the kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceId {
    /// Bluetooth printer addressed by its MAC (e.g. `"66:22:B3:0C:41:9E"`).
    Bluetooth { address: String },
    /// Network printer speaking raw TCP.
    Network { host: String, port: u16 },
    /// USB printer addressed by its bus path.
    Usb { path: String },
}

impl DeviceId {
    /// Build an id from a kind and a free-form address.
    ///
    /// Network addresses are `host` or `host:port`; the port defaults to the
    /// raw JetDirect port. IPv6 literals must be bracketed to carry a port.
    pub fn from_parts(kind: DeviceKind, address: &str) -> Self {
        let address = address.trim();
        match kind {
            DeviceKind::Bluetooth => Self::Bluetooth {
                address: address.to_ascii_uppercase(),
            },
            DeviceKind::Usb => Self::Usb {
                path: address.to_owned(),
            },
            DeviceKind::Network => {
                let (host, port) = split_host_port(address);
                Self::Network { host, port }
            }
        }
    }

    pub fn kind(&self) -> DeviceKind {
        match self {
            Self::Bluetooth { .. } => DeviceKind::Bluetooth,
            Self::Network { .. } => DeviceKind::Network,
            Self::Usb { .. } => DeviceKind::Usb,
        }
    }

    /// The physical address in the form the transport expects.
    pub fn address(&self) -> String {
        match self {
            Self::Bluetooth { address } => address.clone(),
            Self::Network { host, port } if host.contains(':') => format!("[{host}]:{port}"),
            Self::Network { host, port } => format!("{host}:{port}"),
            Self::Usb { path } => path.clone(),
        }
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind(), self.address())
    }
}

/// Raw JetDirect port used when a network address carries none.
pub const RAW_PRINT_PORT: u16 = 9100;

fn split_host_port(address: &str) -> (String, u16) {
    if let Some(rest) = address.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .unwrap_or(RAW_PRINT_PORT);
            return (host.to_owned(), port);
        }
    }
    match address.rsplit_once(':') {
        // A single colon means host:port; more than one is a bare IPv6 literal.
        Some((host, port)) if !host.contains(':') => match port.parse() {
            Ok(port) => (host.to_owned(), port),
            Err(_) => (address.to_owned(), RAW_PRINT_PORT),
        },
        _ => (address.to_owned(), RAW_PRINT_PORT),
    }
}

/// Something a printer declares it can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    TextPrinting,
    Thermal,
    Graphics,
    Cutter,
    CashDrawer,
}

/// Connection lifecycle of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Available,
    Connecting,
    Connected,
    Error,
}

/// A printer known to the device directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    /// Name reported by discovery (or given at manual registration).
    pub name: String,
    /// Name assigned by the user, shown in preference to `name`.
    pub friendly_name: Option<String>,
    pub capabilities: BTreeSet<Capability>,
    pub status: DeviceStatus,
    pub connected: bool,
    pub last_seen: DateTime<Utc>,
    /// Signal strength in dBm, when the radio reports one.
    pub signal_dbm: Option<i16>,
    pub last_error: Option<String>,
}

impl Device {
    pub fn new(id: DeviceId, name: impl Into<String>) -> Self {
        let capabilities = id.kind().default_capabilities();
        Self {
            id,
            name: name.into(),
            friendly_name: None,
            capabilities,
            status: DeviceStatus::Available,
            connected: false,
            last_seen: Utc::now(),
            signal_dbm: None,
            last_error: None,
        }
    }

    /// Name to show to operators.
    pub fn display_name(&self) -> &str {
        self.friendly_name.as_deref().unwrap_or(&self.name)
    }
}

// ---------------------------------------------------------------------------
// Roles
// ---------------------------------------------------------------------------

/// Logical print destination, independent of the device serving it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
    KitchenOrder,
    BarOrder,
    Receipt,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::KitchenOrder, Role::BarOrder, Role::Receipt];

    /// Minimum capability set a device needs to serve this role.
    pub fn required_capabilities(&self) -> BTreeSet<Capability> {
        BTreeSet::from([Capability::TextPrinting])
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::KitchenOrder => "kitchen_order",
            Self::BarOrder => "bar_order",
            Self::Receipt => "receipt",
        };
        f.write_str(s)
    }
}

/// Binding of a role to a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleMapping {
    pub role: Role,
    pub device_id: DeviceId,
    /// Denormalised device name at the time of assignment.
    pub display_name: String,
    pub enabled: bool,
    pub last_used: Option<DateTime<Utc>>,
}

/// A device the user explicitly paired with the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedDeviceConfig {
    pub device_id: DeviceId,
    pub name: String,
    /// Roles the device served when last updated.
    pub roles: Vec<Role>,
    pub last_connected: Option<DateTime<Utc>>,
    pub auto_connect: bool,
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// Scheduling priority. Ordered so that `High > Normal > Low`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low,
    #[default]
    Normal,
    High,
}

/// Lifecycle states of a print job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting for the transport.
    Pending,
    /// Inside the exclusive region: connecting or transmitting.
    Printing,
    Completed,
    /// Attempt failed. Terminal once retries are exhausted.
    Failed,
    Cancelled,
}

/// Content handed to the printer. Opaque to the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PrintPayload {
    /// Bytes already in the printer's language.
    Raw(Vec<u8>),
    /// Structured ticket content rendered by the encoder.
    Document(serde_json::Value),
}

impl PrintPayload {
    /// SHA-256 hex digest of the payload, used to fingerprint jobs in logs.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        match self {
            Self::Raw(bytes) => hasher.update(bytes),
            Self::Document(value) => hasher.update(value.to_string().as_bytes()),
        }
        hex::encode(hasher.finalize())
    }
}

/// A complete print job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrintJob {
    pub id: JobId,
    pub role: Role,
    pub device_id: DeviceId,
    pub payload: PrintPayload,
    pub priority: JobPriority,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Number of failed attempts so far.
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
}

impl PrintJob {
    pub fn new(
        role: Role,
        device_id: DeviceId,
        payload: PrintPayload,
        priority: JobPriority,
        max_retries: u32,
    ) -> Self {
        Self {
            id: JobId::new(),
            role,
            device_id,
            payload,
            priority,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries,
            last_error: None,
        }
    }

    /// Whether the job will never change again.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            JobStatus::Completed | JobStatus::Cancelled => true,
            JobStatus::Failed => self.retry_count >= self.max_retries,
            JobStatus::Pending | JobStatus::Printing => false,
        }
    }
}

/// One entry of a multi-ticket order submission.
#[derive(Debug, Clone)]
pub struct PrintRequest {
    pub role: Role,
    pub payload: PrintPayload,
    pub priority: JobPriority,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    JobStarted,
    JobCompleted,
    JobFailed,
    PrinterConnected,
    PrinterDisconnected,
    QueueUpdated,
    /// Any device record change (status, name, scan refresh).
    DeviceUpdated,
}

/// Event published to UI and operational tooling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrintEvent {
    pub kind: EventKind,
    pub job_id: Option<JobId>,
    pub device_id: Option<DeviceId>,
    pub role: Option<Role>,
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl PrintEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            job_id: None,
            device_id: None,
            role: None,
            message: None,
            timestamp: Utc::now(),
        }
    }

    pub fn job(kind: EventKind, job: &PrintJob) -> Self {
        Self {
            job_id: Some(job.id),
            device_id: Some(job.device_id.clone()),
            role: Some(job.role),
            ..Self::new(kind)
        }
    }

    pub fn device(kind: EventKind, device_id: &DeviceId) -> Self {
        Self {
            device_id: Some(device_id.clone()),
            ..Self::new(kind)
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_address_parsing() {
        let id = DeviceId::from_parts(DeviceKind::Network, "192.168.1.40:9101");
        assert_eq!(
            id,
            DeviceId::Network {
                host: "192.168.1.40".into(),
                port: 9101
            }
        );

        let id = DeviceId::from_parts(DeviceKind::Network, "kitchen.local");
        assert_eq!(id.address(), "kitchen.local:9100");

        let id = DeviceId::from_parts(DeviceKind::Network, "[fe80::1]:9100");
        assert_eq!(id.address(), "[fe80::1]:9100");
    }

    #[test]
    fn separators_in_addresses_do_not_leak_into_kind() {
        let id = DeviceId::from_parts(DeviceKind::Bluetooth, "66:22:b3:0c:41:9e");
        assert_eq!(id.kind(), DeviceKind::Bluetooth);
        assert_eq!(id.address(), "66:22:B3:0C:41:9E");

        let json = serde_json::to_string(&id).unwrap();
        let back: DeviceId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn priority_ordering() {
        assert!(JobPriority::High > JobPriority::Normal);
        assert!(JobPriority::Normal > JobPriority::Low);
    }

    #[test]
    fn failed_job_is_terminal_only_when_retries_exhausted() {
        let id = DeviceId::from_parts(DeviceKind::Usb, "/dev/usb/lp0");
        let mut job = PrintJob::new(
            Role::Receipt,
            id,
            PrintPayload::Raw(b"x".to_vec()),
            JobPriority::Normal,
            3,
        );
        job.status = JobStatus::Failed;
        job.retry_count = 2;
        assert!(!job.is_terminal());
        job.retry_count = 3;
        assert!(job.is_terminal());
    }

    #[test]
    fn payload_digest_is_stable() {
        let a = PrintPayload::Raw(b"ticket".to_vec());
        let b = PrintPayload::Raw(b"ticket".to_vec());
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.digest().len(), 64);
    }
}
