// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transport abstraction (spec section 9): "Model transports as a common
//! trait providing `Start`, `Stop`, `SendTo(repeaterID, encodedFrame)` and
//! exposing an inbound channel of decoded `(Packet, srcAddr)`."
//!
//! The inbound channel half of that contract is realized through the
//! shared pub/sub bus rather than a bespoke per-transport channel type:
//! every transport publishes decoded frames onto `packets:<id>:inbound`,
//! and the Hub subscribes like any other consumer. That keeps the Hub
//! transport-agnostic without a second abstraction duplicating what the
//! bus already does.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport io error: {0}")]
    Io(String),
    #[error("unknown target id {0}")]
    UnknownTarget(u32),
}

/// Identifies which protocol a `Transport` speaks, used by the Hub to
/// route a repeater/peer row to the right sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Hbrp,
    Ipsc,
    OpenBridge,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn start(&self) -> Result<(), TransportError>;
    async fn stop(&self) -> Result<(), TransportError>;

    /// Deliver an already-encoded frame to the repeater/peer identified by
    /// `target_id`, using that target's session (HBRP/IPSC) or configured
    /// address (OpenBridge).
    async fn send_to(&self, target_id: u32, frame: Vec<u8>) -> Result<(), TransportError>;
}
