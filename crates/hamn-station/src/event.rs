// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Station-wide notifications, fanned out on a broadcast channel. The
//! receptionist listens for logins; operators may subscribe for
//! observability.

use hamn_wire::Id;

#[derive(Debug, Clone)]
pub enum StationEvent {
    /// A session completed the handshake and turned active.
    UserLogin { id: Id },
    /// An active session was evicted (connection closed or logout).
    UserLogout { id: Id },
    /// A neighbor worker (re)established its terminal connection.
    NeighborUp { id: Id },
}
