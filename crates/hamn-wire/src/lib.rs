// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Wire data model for the hamn relay station.
//!
//! Everything a station reads off the network lives here: network-typed
//! identities, meta/visa records and their verification, the reliable
//! envelope JSON, the Mars frame codec, and the typed control commands
//! carried by station-addressed envelopes.
//!
//! The station never sees message plaintext — envelope `data` stays an
//! opaque base64 blob except for envelopes addressed to the station itself,
//! whose bodies are JSON control commands.

pub mod command;
pub mod envelope;
pub mod id;
pub mod mars;
pub mod meta;

pub use command::{
    BlockCommand, Command, HandshakeCommand, HandshakePhase, LoginCommand, MetaCommand,
    MuteCommand, ProfileCommand, ReceiptCommand, ReportCommand, UsersCommand,
};
pub use envelope::Envelope;
pub use id::{Address, Id, NetworkType};
pub use mars::{MarsCmd, MarsCodec, MarsPackage, BODY_NOOP, BODY_PING, BODY_PONG, MARS_VERSION};
pub use meta::{Meta, Visa};

use thiserror::Error;

/// Errors produced while decoding or verifying wire material.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("framing error: {0}")]
    Framing(String),

    #[error("unsupported protocol version {0}")]
    ProtocolVersion(u32),

    #[error("invalid identifier: {0}")]
    BadId(String),

    #[error("signature verification failed")]
    Signature,

    #[error("meta does not match identity")]
    MetaVerify,

    #[error("base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
