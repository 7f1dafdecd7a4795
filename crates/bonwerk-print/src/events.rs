// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Event bus for job lifecycle and printer connectivity.
//
// Delivery contract:
//   - Publishers emit only after the state change is committed and after
//     releasing every internal lock, so a subscriber that reacts by calling
//     back into a service (re-entrancy) never deadlocks the publisher.
//   - Events from one publisher arrive in the order they were emitted.
//   - Delivery is asynchronous. A subscriber that falls more than
//     `capacity` events behind receives `RecvError::Lagged` and skips ahead.

use tokio::sync::broadcast;

use bonwerk_core::types::PrintEvent;

/// Broadcast channel shared by every service of one orchestrator.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PrintEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: PrintEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PrintEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
