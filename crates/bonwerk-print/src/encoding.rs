// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Payload encoding.
//
// Ticket layout belongs to the producers; the orchestrator only picks which
// encoder entry point a role goes through and hands the bytes to the
// transport.

use bonwerk_core::error::{BonwerkError, Result};
use bonwerk_core::types::{PrintPayload, Role};

/// Turns payloads into bytes the printer understands.
pub trait TicketEncoder: Send + Sync {
    fn kitchen_ticket(&self, payload: &PrintPayload) -> Result<Vec<u8>>;
    fn bar_ticket(&self, payload: &PrintPayload) -> Result<Vec<u8>>;
    fn receipt(&self, payload: &PrintPayload) -> Result<Vec<u8>>;
}

/// Role-indexed dispatch to the encoder.
pub fn encode_for_role(
    encoder: &dyn TicketEncoder,
    role: Role,
    payload: &PrintPayload,
) -> Result<Vec<u8>> {
    match role {
        Role::KitchenOrder => encoder.kitchen_ticket(payload),
        Role::BarOrder => encoder.bar_ticket(payload),
        Role::Receipt => encoder.receipt(payload),
    }
}

/// Forwards raw bytes untouched and serialises documents as JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughEncoder;

impl PassthroughEncoder {
    fn passthrough(payload: &PrintPayload) -> Result<Vec<u8>> {
        match payload {
            PrintPayload::Raw(bytes) => Ok(bytes.clone()),
            PrintPayload::Document(doc) => serde_json::to_vec(doc)
                .map_err(|e| BonwerkError::Encoding(format!("document: {e}"))),
        }
    }
}

impl TicketEncoder for PassthroughEncoder {
    fn kitchen_ticket(&self, payload: &PrintPayload) -> Result<Vec<u8>> {
        Self::passthrough(payload)
    }

    fn bar_ticket(&self, payload: &PrintPayload) -> Result<Vec<u8>> {
        Self::passthrough(payload)
    }

    fn receipt(&self, payload: &PrintPayload) -> Result<Vec<u8>> {
        Self::passthrough(payload)
    }
}
