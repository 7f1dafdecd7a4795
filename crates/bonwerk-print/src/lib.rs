// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Bonwerk Print: device directory, role routing, connection supervision and
// job scheduling over a single shared printer transport.

pub mod backoff;
pub mod connection;
pub mod directory;
pub mod encoding;
pub mod events;
pub mod health;
pub mod orchestrator;
pub mod registry;
pub mod saved;
pub mod scanner;
pub mod scheduler;
pub mod supervisor;
pub mod transport;

pub use connection::ConnectionManager;
pub use directory::DeviceDirectory;
pub use encoding::{PassthroughEncoder, TicketEncoder};
pub use events::EventBus;
pub use orchestrator::Orchestrator;
pub use registry::RoleRegistry;
pub use saved::{AutoReconnector, RestoreReport, SavedDeviceStore};
pub use scanner::{DeviceScanner, MdnsScanner, Observation, StaticScanner};
pub use scheduler::{JobScheduler, JobStatistics, SchedulerStatus};
pub use supervisor::{ConnectionSupervisor, SweepReport};
pub use transport::{MemoryTransport, RawTcpTransport, Transport};
