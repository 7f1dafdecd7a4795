// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Human-readable error messages for floor staff.
//
// Every technical error is mapped to plain language with a clear suggestion.
// Severity drives how the front-of-house screen presents it.

use crate::error::BonwerkError;

/// Severity of an error from the operator's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Printer hiccup: we retry on our own.
    Transient,
    /// Staff must do something (assign a printer, switch Bluetooth on).
    ActionRequired,
    /// Nothing staff can fix from the till.
    Permanent,
}

/// A human-readable error with plain message and actionable suggestion.
#[derive(Debug, Clone)]
pub struct HumanError {
    pub message: String,
    pub suggestion: String,
    pub severity: Severity,
}

impl HumanError {
    fn new(message: &str, suggestion: impl Into<String>, severity: Severity) -> Self {
        Self {
            message: message.into(),
            suggestion: suggestion.into(),
            severity,
        }
    }
}

/// Convert a `BonwerkError` into a `HumanError` staff can act on.
pub fn humanize_error(err: &BonwerkError) -> HumanError {
    use Severity::*;

    match err {
        BonwerkError::NoMapping(role) => HumanError::new(
            "No printer is set up for this ticket.",
            format!("Open printer settings and choose a printer for {role}."),
            ActionRequired,
        ),
        BonwerkError::MappingDisabled(role) => HumanError::new(
            "Printing is switched off for this ticket.",
            format!("Turn printing back on for {role} in printer settings."),
            ActionRequired,
        ),
        BonwerkError::UnknownDevice { .. } | BonwerkError::DeviceNotFound(_) => HumanError::new(
            "The assigned printer can't be found.",
            "Make sure the printer is switched on, then search for printers again.",
            ActionRequired,
        ),
        BonwerkError::InsufficientCapabilities { .. } => HumanError::new(
            "That printer can't print tickets.",
            "Pick a printer that supports text printing.",
            ActionRequired,
        ),
        BonwerkError::RadioDisabled => HumanError::new(
            "Bluetooth is switched off.",
            "Switch Bluetooth on, then search for printers again.",
            ActionRequired,
        ),
        BonwerkError::Scan(_) => HumanError::new(
            "We couldn't search for printers.",
            "Check the connection to the local network and try again.",
            Transient,
        ),
        BonwerkError::Connection(detail) => humanize_transport(detail, true),
        BonwerkError::Transmission(detail) => humanize_transport(detail, false),
        BonwerkError::Encoding(_) => HumanError::new(
            "This ticket couldn't be prepared for printing.",
            "Try sending it again. If it keeps failing, please report it.",
            Permanent,
        ),
        BonwerkError::JobNotFound(_) => HumanError::new(
            "That print job no longer exists.",
            "It may already have been cleared from the list.",
            Permanent,
        ),
        BonwerkError::JobNotCancellable { .. } => HumanError::new(
            "This ticket is already printing.",
            "It can't be stopped now. Wait for it to finish.",
            Permanent,
        ),
        BonwerkError::SchedulerStopped => HumanError::new(
            "Printing is paused.",
            "Restart the printing service and try again.",
            ActionRequired,
        ),
        BonwerkError::SavedDeviceLimit(max) => HumanError::new(
            "Too many saved printers.",
            format!("Remove one of the {max} saved printers first."),
            ActionRequired,
        ),
        BonwerkError::DeviceInUse { roles, .. } => HumanError::new(
            "This printer is still in use.",
            format!("Assign another printer to {roles:?} before removing it."),
            ActionRequired,
        ),
        BonwerkError::Database(_) | BonwerkError::Io(_) | BonwerkError::Serialization(_) => {
            HumanError::new(
                "Printer settings couldn't be saved.",
                "Printing still works. Try changing the setting again in a moment.",
                Transient,
            )
        }
    }
}

/// Map transport failure details to a message.
fn humanize_transport(detail: &str, connecting: bool) -> HumanError {
    let lower = detail.to_ascii_lowercase();

    if lower.contains("timed out") {
        HumanError::new(
            "The printer didn't answer in time.",
            "It may be switched off or out of range. We'll keep trying.",
            Severity::Transient,
        )
    } else if lower.contains("refused") {
        HumanError::new(
            "The printer refused the connection.",
            "Another device may be using it. Turn the printer off and on again.",
            Severity::Transient,
        )
    } else if lower.contains("paper") {
        HumanError::new(
            "The printer is out of paper.",
            "Load a new roll, then resend the ticket.",
            Severity::ActionRequired,
        )
    } else if connecting {
        HumanError::new(
            "We couldn't connect to the printer.",
            format!("Check it is switched on and nearby. ({detail})"),
            Severity::Transient,
        )
    } else {
        HumanError::new(
            "The ticket didn't reach the printer.",
            format!("We'll try again automatically. ({detail})"),
            Severity::Transient,
        )
    }
}
