// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The relay station runtime.
//!
//! One station accepts long-lived client connections on a Mars-framed TCP
//! gate and a WebSocket gate, authenticates peers with a challenge–response
//! handshake, verifies end-to-end encrypted envelopes, delivers them to
//! local sessions, spools them for offline recipients, and bridges them
//! across the neighbor mesh. Plaintext never enters this crate: everything
//! the station touches is a signed envelope or a control command addressed
//! to the station itself.

pub mod config;
pub mod dispatcher;
pub mod docker;
pub mod error;
pub mod event;
pub mod gate;
pub mod octopus;
pub mod policy;
pub mod processor;
pub mod push;
pub mod receptionist;
pub mod session;
pub mod station;
pub mod ws;

pub use config::{NeighborConfig, PushBackendConfig, StationConfig};
pub use dispatcher::{RECEIPT_BROADCAST, RECEIPT_CACHED, RECEIPT_FORWARDED, RECEIPT_RESPOND};
pub use docker::{DockerHandle, Priority, Ship, ShipOutcome};
pub use error::StationError;
pub use event::StationEvent;
pub use session::{ConnCtx, Session, SessionTable};
pub use station::{run, start, Running, Station, StationChannels, STATION_SEQ_BASE};
