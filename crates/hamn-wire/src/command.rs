// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Typed control commands carried inside station-addressed envelopes.
//!
//! The JSON body is internally tagged on `type`; a tag the station does not
//! know falls through to the processor's forward fallback, so the enum here
//! only covers the commands the core handles itself.

use serde::{Deserialize, Serialize};

use crate::id::Id;
use crate::meta::{Meta, Visa};
use crate::WireError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    Handshake(HandshakeCommand),
    Login(LoginCommand),
    Meta(MetaCommand),
    Profile(ProfileCommand),
    Users(UsersCommand),
    Report(ReportCommand),
    Block(BlockCommand),
    Mute(MuteCommand),
    Receipt(ReceiptCommand),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Handshake(_) => "handshake",
            Self::Login(_) => "login",
            Self::Meta(_) => "meta",
            Self::Profile(_) => "profile",
            Self::Users(_) => "users",
            Self::Report(_) => "report",
            Self::Block(_) => "block",
            Self::Mute(_) => "mute",
            Self::Receipt(_) => "receipt",
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, WireError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, WireError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Challenge–response phases of the session handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakePhase {
    /// Client → station, with its current session key guess.
    Start,
    /// Station → client, carrying a fresh challenge key.
    Again,
    /// Station → client, session is active.
    Success,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeCommand {
    pub phase: HandshakePhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
}

impl HandshakeCommand {
    pub fn start(session: Option<String>) -> Self {
        Self {
            phase: HandshakePhase::Start,
            session,
        }
    }

    pub fn again(session: impl Into<String>) -> Self {
        Self {
            phase: HandshakePhase::Again,
            session: Some(session.into()),
        }
    }

    pub fn success() -> Self {
        Self {
            phase: HandshakePhase::Success,
            session: None,
        }
    }
}

/// Login report: which station a user last attached to, and when.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginCommand {
    pub id: Id,
    /// Milliseconds since the epoch.
    pub time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub station: Option<Id>,
}

/// Meta query (no record attached) or upload (record attached).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaCommand {
    pub id: Id,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
}

/// Profile/visa query or upload, analogous to [`MetaCommand`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileCommand {
    pub id: Id,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visa: Option<Visa>,
}

/// Recommended-users query; the reply carries the `users` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsersCommand {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<Id>,
}

/// Presence report (`online` / `offline`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportCommand {
    pub title: String,
}

impl ReportCommand {
    pub const ONLINE: &'static str = "online";
    pub const OFFLINE: &'static str = "offline";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockCommand {
    #[serde(default)]
    pub list: Vec<Id>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MuteCommand {
    #[serde(default)]
    pub list: Vec<Id>,
}

/// Delivery/status receipt sent back to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptCommand {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<Vec<Id>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed: Option<Vec<Id>>,
}

impl ReceiptCommand {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            success: None,
            failed: None,
        }
    }

    pub fn rejected(message: impl Into<String>, failed: Vec<Id>) -> Self {
        Self {
            message: message.into(),
            success: None,
            failed: Some(failed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_tags_as_snake_case() {
        let cmd = Command::Handshake(HandshakeCommand::start(Some("k1".into())));
        let json = String::from_utf8(cmd.to_json().unwrap()).unwrap();
        assert!(json.contains("\"type\":\"handshake\""));
        assert!(json.contains("\"phase\":\"start\""));
        assert_eq!(Command::from_json(json.as_bytes()).unwrap(), cmd);
    }

    #[test]
    fn unknown_type_fails_to_parse() {
        let body = br#"{"type":"teleport","anywhere":true}"#;
        assert!(Command::from_json(body).is_err());
    }

    #[test]
    fn receipt_omits_empty_lists() {
        let cmd = Command::Receipt(ReceiptCommand::ok("Message respond"));
        let json = String::from_utf8(cmd.to_json().unwrap()).unwrap();
        assert!(!json.contains("success"));
        assert!(!json.contains("failed"));
    }
}
