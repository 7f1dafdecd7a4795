// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Per-device health tracking.
//
// Counts consecutive failed print attempts per device. A successful print
// resets the counter. The counter is informational: it feeds connection
// status reports and logs, it never blocks a job from being attempted.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use bonwerk_core::types::DeviceId;

/// Failures after which a device is reported as struggling.
const STRUGGLING_THRESHOLD: u32 = 3;

/// Health status for a single device.
#[derive(Debug, Clone, Default)]
pub struct DeviceHealth {
    pub consecutive_failures: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl DeviceHealth {
    pub fn is_struggling(&self) -> bool {
        self.consecutive_failures >= STRUGGLING_THRESHOLD
    }
}

#[derive(Debug, Default)]
pub struct HealthTracker {
    devices: HashMap<DeviceId, DeviceHealth>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful print on `device`.
    pub fn record_success(&mut self, device: &DeviceId) {
        let health = self.devices.entry(device.clone()).or_default();
        if health.consecutive_failures > 0 {
            info!(
                device = %device,
                failures = health.consecutive_failures,
                "device recovered"
            );
        }
        health.consecutive_failures = 0;
        health.last_success = Some(Utc::now());
        health.last_error = None;
    }

    /// Record a failed attempt on `device`.
    pub fn record_failure(&mut self, device: &DeviceId, error: &str) {
        let health = self.devices.entry(device.clone()).or_default();
        health.consecutive_failures += 1;
        health.last_error = Some(error.to_owned());

        if health.consecutive_failures == STRUGGLING_THRESHOLD {
            warn!(
                device = %device,
                failures = health.consecutive_failures,
                "device keeps failing"
            );
        }
    }

    pub fn get(&self, device: &DeviceId) -> Option<&DeviceHealth> {
        self.devices.get(device)
    }

    pub fn consecutive_failures(&self, device: &DeviceId) -> u32 {
        self.devices
            .get(device)
            .map_or(0, |h| h.consecutive_failures)
    }
}
