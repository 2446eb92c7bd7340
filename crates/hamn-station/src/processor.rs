// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Command processors for station-addressed envelopes.
//!
//! The body of such an envelope is a JSON object tagged on `type`; a
//! registry maps the tag to its handler. A tag nobody registered falls back
//! to an "unsupported" receipt, so new client commands degrade gracefully
//! instead of killing the connection.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info};

use hamn_wire::{
    Command, Envelope, HandshakeCommand, HandshakePhase, LoginCommand, MetaCommand, MuteCommand,
    ProfileCommand, ReceiptCommand, ReportCommand, UsersCommand,
};

use crate::error::StationError;
use crate::event::StationEvent;
use crate::session::ConnCtx;
use crate::station::Station;

pub const RECEIPT_UNSUPPORTED: &str = "Command not supported";

/// One registered command handler.
#[async_trait]
pub trait CommandProcessor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Handle the decoded command body. The returned command (if any) is
    /// sealed into a reply envelope for the sender.
    async fn process(
        &self,
        station: &Station,
        ctx: Option<&Arc<ConnCtx>>,
        body: &Value,
        envelope: &Envelope,
    ) -> Result<Option<Command>, StationError>;
}

/// `type` → handler registry, populated once at startup.
pub struct Processor {
    handlers: HashMap<&'static str, Arc<dyn CommandProcessor>>,
}

impl Processor {
    pub fn with_default_handlers() -> Self {
        let mut processor = Self {
            handlers: HashMap::new(),
        };
        processor.register(Arc::new(HandshakeProcessor));
        processor.register(Arc::new(LoginProcessor));
        processor.register(Arc::new(MetaProcessor));
        processor.register(Arc::new(ProfileProcessor));
        processor.register(Arc::new(UsersProcessor));
        processor.register(Arc::new(ReportProcessor));
        processor.register(Arc::new(BlockProcessor));
        processor.register(Arc::new(MuteProcessor));
        processor.register(Arc::new(ReceiptProcessor));
        processor
    }

    pub fn register(&mut self, handler: Arc<dyn CommandProcessor>) {
        self.handlers.insert(handler.name(), handler);
    }

    pub async fn process(
        &self,
        station: &Station,
        ctx: Option<&Arc<ConnCtx>>,
        envelope: &Envelope,
    ) -> Result<Option<Envelope>, StationError> {
        let body = envelope.payload()?;
        let value: Value = serde_json::from_slice(&body)
            .map_err(|e| StationError::Framing(format!("command body: {e}")))?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let reply = match self.handlers.get(kind.as_str()) {
            Some(handler) => handler.process(station, ctx, &value, envelope).await?,
            None => {
                debug!(command = %kind, sender = %envelope.sender, "unregistered command");
                Some(Command::Receipt(ReceiptCommand::rejected(
                    format!("{RECEIPT_UNSUPPORTED}: {kind}"),
                    vec![envelope.receiver.clone()],
                )))
            }
        };

        match reply {
            Some(command) => Ok(Some(station.seal_command(&command, &envelope.sender)?)),
            None => Ok(None),
        }
    }
}

fn parse<T: DeserializeOwned>(value: &Value) -> Result<T, StationError> {
    serde_json::from_value(value.clone())
        .map_err(|e| StationError::Framing(format!("command fields: {e}")))
}

// ── handshake ─────────────────────────────────────────────────────────────────

/// Drives `INIT → CHALLENGED → ACTIVE` for the envelope's connection.
///
/// Meta and signature verification already happened in the dispatcher, so
/// by the time a `start` lands here the sender's address is proven.
struct HandshakeProcessor;

#[async_trait]
impl CommandProcessor for HandshakeProcessor {
    fn name(&self) -> &'static str {
        "handshake"
    }

    async fn process(
        &self,
        station: &Station,
        ctx: Option<&Arc<ConnCtx>>,
        body: &Value,
        envelope: &Envelope,
    ) -> Result<Option<Command>, StationError> {
        let cmd: HandshakeCommand = parse(body)?;
        let Some(ctx) = ctx else {
            // A handshake relayed from another station binds no connection.
            return Ok(None);
        };
        if let Some(session) = ctx.session() {
            // Same for a broadcast start arriving over a live terminal
            // connection: challenging it would hijack the neighbor session.
            if session.is_active()
                && session.id.is_station()
                && !envelope.sender.same_identity(&session.id)
            {
                return Ok(None);
            }
        }
        if cmd.phase != HandshakePhase::Start {
            return Ok(Some(Command::Receipt(ReceiptCommand::rejected(
                "Handshake out of order",
                vec![],
            ))));
        }

        let bound = ctx.session();
        match (&bound, &cmd.session) {
            (Some(session), Some(token))
                if session.id.same_identity(&envelope.sender) && *token == session.key() =>
            {
                // Challenge answered; tolerated (and re-asserting) when the
                // session is already active.
                session.set_active(true);
                info!(id = %session.id, remote = %ctx.remote, "session active");
                station.emit(StationEvent::UserLogin {
                    id: session.id.clone(),
                });
                Ok(Some(Command::Handshake(HandshakeCommand::success())))
            }
            _ => {
                // Wrong or missing token: stay challenged. Reuse the bound
                // session with a renewed key when the identity matches,
                // otherwise start a fresh one for this connection.
                let session = match &bound {
                    Some(session) if session.id.same_identity(&envelope.sender) => {
                        session.renew_key();
                        session.clone()
                    }
                    _ => {
                        let session = station.sessions.create(
                            &envelope.sender,
                            ctx.conn_id,
                            ctx.remote,
                            &ctx.docker,
                        );
                        ctx.bind(session.clone());
                        session
                    }
                };
                Ok(Some(Command::Handshake(HandshakeCommand::again(
                    session.key(),
                ))))
            }
        }
    }
}

// ── login ─────────────────────────────────────────────────────────────────────

struct LoginProcessor;

#[async_trait]
impl CommandProcessor for LoginProcessor {
    fn name(&self) -> &'static str {
        "login"
    }

    async fn process(
        &self,
        station: &Station,
        _ctx: Option<&Arc<ConnCtx>>,
        body: &Value,
        envelope: &Envelope,
    ) -> Result<Option<Command>, StationError> {
        let cmd: LoginCommand = parse(body)?;
        if !cmd.id.same_identity(&envelope.sender) {
            return Ok(Some(Command::Receipt(ReceiptCommand::rejected(
                "Login identity mismatch",
                vec![cmd.id],
            ))));
        }
        let fresh = station.store.users.save_login(&cmd, envelope)?;
        let message = if fresh { "Login received" } else { "Login ignored" };
        Ok(Some(Command::Receipt(ReceiptCommand::ok(message))))
    }
}

// ── meta ──────────────────────────────────────────────────────────────────────

struct MetaProcessor;

#[async_trait]
impl CommandProcessor for MetaProcessor {
    fn name(&self) -> &'static str {
        "meta"
    }

    async fn process(
        &self,
        station: &Station,
        _ctx: Option<&Arc<ConnCtx>>,
        body: &Value,
        _envelope: &Envelope,
    ) -> Result<Option<Command>, StationError> {
        let cmd: MetaCommand = parse(body)?;
        match cmd.meta {
            Some(meta) => {
                if !meta.matches(&cmd.id) {
                    return Err(StationError::MetaVerify(cmd.id));
                }
                station.store.users.save_meta(&cmd.id, &meta)?;
                // Anything waiting on this key can go now.
                station.wake_suspended(&cmd.id);
                Ok(Some(Command::Receipt(ReceiptCommand::ok("Meta received"))))
            }
            None => match station.store.users.load_meta(&cmd.id)? {
                Some(meta) => Ok(Some(Command::Meta(MetaCommand {
                    id: cmd.id,
                    meta: Some(meta),
                }))),
                None => Ok(Some(Command::Receipt(ReceiptCommand::rejected(
                    "Meta not found",
                    vec![cmd.id],
                )))),
            },
        }
    }
}

// ── profile / visa ────────────────────────────────────────────────────────────

struct ProfileProcessor;

#[async_trait]
impl CommandProcessor for ProfileProcessor {
    fn name(&self) -> &'static str {
        "profile"
    }

    async fn process(
        &self,
        station: &Station,
        _ctx: Option<&Arc<ConnCtx>>,
        body: &Value,
        _envelope: &Envelope,
    ) -> Result<Option<Command>, StationError> {
        let cmd: ProfileCommand = parse(body)?;
        match cmd.visa {
            Some(visa) => {
                if let Some(meta) = &cmd.meta {
                    if !meta.matches(&cmd.id) {
                        return Err(StationError::MetaVerify(cmd.id));
                    }
                    station.store.users.save_meta(&cmd.id, meta)?;
                }
                let meta = station
                    .store
                    .users
                    .load_meta(&cmd.id)?
                    .ok_or_else(|| StationError::UnknownSenderKey(cmd.id.clone()))?;
                if !visa.id.same_identity(&cmd.id) || !visa.verify(&meta) {
                    return Err(StationError::MetaVerify(cmd.id));
                }
                station.store.users.save_visa(&visa)?;
                station.wake_suspended(&cmd.id);
                Ok(Some(Command::Receipt(ReceiptCommand::ok(
                    "Profile received",
                ))))
            }
            None => match station.store.users.load_visa(&cmd.id)? {
                Some(visa) => Ok(Some(Command::Profile(ProfileCommand {
                    meta: station.store.users.load_meta(&cmd.id)?,
                    id: cmd.id,
                    visa: Some(visa),
                }))),
                None => Ok(Some(Command::Receipt(ReceiptCommand::rejected(
                    "Profile not found",
                    vec![cmd.id],
                )))),
            },
        }
    }
}

// ── users ─────────────────────────────────────────────────────────────────────

struct UsersProcessor;

#[async_trait]
impl CommandProcessor for UsersProcessor {
    fn name(&self) -> &'static str {
        "users"
    }

    async fn process(
        &self,
        station: &Station,
        _ctx: Option<&Arc<ConnCtx>>,
        body: &Value,
        _envelope: &Envelope,
    ) -> Result<Option<Command>, StationError> {
        let cmd: UsersCommand = parse(body)?;
        let max = cmd.max.unwrap_or(20);
        let users = station
            .config
            .recommended_users
            .iter()
            .take(max)
            .cloned()
            .collect();
        Ok(Some(Command::Users(UsersCommand { max: None, users })))
    }
}

// ── report ────────────────────────────────────────────────────────────────────

/// Presence reports toggle the availability of the connection's session.
struct ReportProcessor;

#[async_trait]
impl CommandProcessor for ReportProcessor {
    fn name(&self) -> &'static str {
        "report"
    }

    async fn process(
        &self,
        station: &Station,
        ctx: Option<&Arc<ConnCtx>>,
        body: &Value,
        envelope: &Envelope,
    ) -> Result<Option<Command>, StationError> {
        let cmd: ReportCommand = parse(body)?;
        let session = ctx
            .and_then(|c| c.session())
            .filter(|s| s.id.same_identity(&envelope.sender));
        if let Some(session) = session {
            match cmd.title.as_str() {
                ReportCommand::ONLINE => {
                    if !session.is_active() {
                        session.set_active(true);
                        station.emit(StationEvent::UserLogin {
                            id: session.id.clone(),
                        });
                    }
                }
                ReportCommand::OFFLINE => session.set_active(false),
                _ => {}
            }
        }
        Ok(Some(Command::Receipt(ReceiptCommand::ok("Report received"))))
    }
}

// ── block / mute ──────────────────────────────────────────────────────────────

struct BlockProcessor;

#[async_trait]
impl CommandProcessor for BlockProcessor {
    fn name(&self) -> &'static str {
        "block"
    }

    async fn process(
        &self,
        station: &Station,
        _ctx: Option<&Arc<ConnCtx>>,
        body: &Value,
        envelope: &Envelope,
    ) -> Result<Option<Command>, StationError> {
        let cmd: hamn_wire::BlockCommand = parse(body)?;
        station.policy.set_block_list(&envelope.sender, &cmd.list);
        Ok(Some(Command::Receipt(ReceiptCommand::ok(
            "Block list received",
        ))))
    }
}

struct MuteProcessor;

#[async_trait]
impl CommandProcessor for MuteProcessor {
    fn name(&self) -> &'static str {
        "mute"
    }

    async fn process(
        &self,
        station: &Station,
        _ctx: Option<&Arc<ConnCtx>>,
        body: &Value,
        envelope: &Envelope,
    ) -> Result<Option<Command>, StationError> {
        let cmd: MuteCommand = parse(body)?;
        station.policy.set_mute_list(&envelope.sender, &cmd.list);
        Ok(Some(Command::Receipt(ReceiptCommand::ok(
            "Mute list received",
        ))))
    }
}

// ── receipt ───────────────────────────────────────────────────────────────────

/// Client receipts (acks for pushed envelopes) end here; nothing to reply.
struct ReceiptProcessor;

#[async_trait]
impl CommandProcessor for ReceiptProcessor {
    fn name(&self) -> &'static str {
        "receipt"
    }

    async fn process(
        &self,
        _station: &Station,
        _ctx: Option<&Arc<ConnCtx>>,
        _body: &Value,
        envelope: &Envelope,
    ) -> Result<Option<Command>, StationError> {
        debug!(sender = %envelope.sender, "receipt absorbed");
        Ok(None)
    }
}
