// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Unified error types for Bonwerk.

use thiserror::Error;

use crate::types::{Capability, DeviceId, JobId, JobStatus, Role};

/// Top-level error type for all Bonwerk operations.
#[derive(Debug, Error)]
pub enum BonwerkError {
    // -- Routing errors (rejected at submission, never retried) --
    #[error("no printer is assigned to role {0}")]
    NoMapping(Role),

    #[error("printing for role {0} is disabled")]
    MappingDisabled(Role),

    #[error("role {role} routes to unknown device {device}")]
    UnknownDevice { role: Role, device: DeviceId },

    // -- Validation --
    #[error("device {device} cannot serve role {role}: missing {missing:?}")]
    InsufficientCapabilities {
        role: Role,
        device: DeviceId,
        missing: Vec<Capability>,
    },

    // -- Directory --
    #[error("device {0} not found")]
    DeviceNotFound(DeviceId),

    #[error("radio is disabled")]
    RadioDisabled,

    #[error("device scan failed: {0}")]
    Scan(String),

    // -- Transport --
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("transmission failed: {0}")]
    Transmission(String),

    #[error("payload encoding failed: {0}")]
    Encoding(String),

    // -- Jobs --
    #[error("job {0} not found")]
    JobNotFound(JobId),

    #[error("job {id} cannot be cancelled while {status:?}")]
    JobNotCancellable { id: JobId, status: JobStatus },

    #[error("scheduler is stopped")]
    SchedulerStopped,

    // -- Pairing --
    #[error("cannot save more than {0} devices")]
    SavedDeviceLimit(usize),

    #[error("device {device} still serves {roles:?}")]
    DeviceInUse { device: DeviceId, roles: Vec<Role> },

    // -- Storage / persistence --
    #[error("database error: {0}")]
    Database(String),

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// How an error should be treated by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Configuration problem detected at submission. Retrying cannot help.
    Routing,
    /// Connection or transmission trouble. Retried within the job budget.
    Transient,
    /// Caller asked for something invalid (bad mapping, cancelling a
    /// printing job, pairing limit).
    Rejected,
    /// Storage failure. Logged, never fatal to printing.
    Persistence,
}

impl BonwerkError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NoMapping(_) | Self::MappingDisabled(_) | Self::UnknownDevice { .. } => {
                ErrorClass::Routing
            }
            Self::Connection(_)
            | Self::Transmission(_)
            | Self::Encoding(_)
            | Self::Scan(_)
            | Self::RadioDisabled => ErrorClass::Transient,
            Self::InsufficientCapabilities { .. }
            | Self::DeviceNotFound(_)
            | Self::JobNotFound(_)
            | Self::JobNotCancellable { .. }
            | Self::SchedulerStopped
            | Self::SavedDeviceLimit(_)
            | Self::DeviceInUse { .. } => ErrorClass::Rejected,
            Self::Database(_) | Self::Io(_) | Self::Serialization(_) => ErrorClass::Persistence,
        }
    }

    /// Whether this error was raised while routing a submission.
    pub fn is_routing(&self) -> bool {
        self.class() == ErrorClass::Routing
    }
}

/// Alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, BonwerkError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeviceKind;

    #[test]
    fn routing_errors_classify_as_routing() {
        assert!(BonwerkError::NoMapping(Role::Receipt).is_routing());
        let device = DeviceId::from_parts(DeviceKind::Network, "10.0.0.5");
        assert!(
            BonwerkError::UnknownDevice {
                role: Role::BarOrder,
                device
            }
            .is_routing()
        );
    }

    #[test]
    fn transport_errors_are_transient() {
        assert_eq!(
            BonwerkError::Connection("refused".into()).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            BonwerkError::Transmission("broken pipe".into()).class(),
            ErrorClass::Transient
        );
    }
}
