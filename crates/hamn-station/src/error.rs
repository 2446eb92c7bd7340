// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use hamn_store::StoreError;
use hamn_wire::{Id, WireError};
use thiserror::Error;

/// Station-level error taxonomy.
///
/// Recoverable variants surface to the sender as receipt envelopes; the
/// fatal ones (storage, bind) abort startup or trigger a graceful shutdown.
#[derive(Debug, Error)]
pub enum StationError {
    #[error("framing: {0}")]
    Framing(String),

    #[error("unsupported protocol version {0}")]
    ProtocolVersion(u32),

    #[error("signature verification failed for {0}")]
    Signature(Id),

    #[error("encryption key unknown for {0}")]
    UnknownSenderKey(Id),

    #[error("meta verification failed for {0}")]
    MetaVerify(Id),

    #[error("policy denied: {0}")]
    PolicyDenied(String),

    #[error("not addressed to this station: {0}")]
    NotForMe(Id),

    #[error("no route to {0}")]
    RouteUnknown(Id),

    #[error("transport: {0}")]
    Transport(String),

    #[error("storage full")]
    StorageFull,

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl StationError {
    /// Errors that end the connection they occurred on.
    pub fn closes_connection(&self) -> bool {
        matches!(self, Self::Framing(_) | Self::ProtocolVersion(_))
    }
}
