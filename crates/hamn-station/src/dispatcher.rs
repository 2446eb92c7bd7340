// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The dispatcher: one verified envelope in, zero or more deliveries out.
//!
//! Order of operations per envelope: trace check (broadcast loop freedom),
//! absorption of the self-authenticating attachments (meta/visa), sender
//! verification with suspend-on-unknown-key, group-key absorption (only
//! valid once the sender is proven), policy filter, then routing — local
//! sessions first, then spool + push, then the neighbor bridge.
//! Worklist-driven so woken and re-addressed envelopes never recurse.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use hamn_wire::id::Address;
use hamn_wire::{Envelope, ReceiptCommand};

use crate::docker::Priority;
use crate::error::StationError;
use crate::session::ConnCtx;
use crate::station::Station;

/// Receipt bodies a sender can expect back.
pub const RECEIPT_RESPOND: &str = "Message respond";
pub const RECEIPT_CACHED: &str = "Message cached";
pub const RECEIPT_FORWARDED: &str = "Message forwarded";
pub const RECEIPT_BROADCAST: &str = "Message broadcast";

impl Station {
    /// Gate-facing entry: decode the frame body, dispatch, and serialise
    /// the reply. Returns `(reply_bytes, close_connection)`.
    pub async fn handle_body(&self, body: &[u8], ctx: &Arc<ConnCtx>) -> (Vec<u8>, bool) {
        let envelope = match Envelope::from_json(body) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(remote = %ctx.remote, "undecodable envelope: {err}");
                return (Vec::new(), true);
            }
        };
        let sender = envelope.sender.clone();

        match self.dispatch(envelope, Some(ctx)).await {
            Ok(Some(reply)) => (reply.to_json().unwrap_or_default(), false),
            Ok(None) => (Vec::new(), false),
            Err(err) => {
                warn!(sender = %sender, remote = %ctx.remote, "dispatch failed: {err}");
                // A failed handshake attempt ends the connection; an active
                // session just gets the receipt.
                let close = err.closes_connection()
                    || (!ctx.is_active()
                        && matches!(
                            err,
                            StationError::Signature(_) | StationError::MetaVerify(_)
                        ));
                let reply = self
                    .receipt(&sender, ReceiptCommand::rejected(err.to_string(), vec![]))
                    .and_then(|env| env.to_json().map_err(StationError::from))
                    .unwrap_or_default();
                (reply, close)
            }
        }
    }

    /// Dispatch one envelope. `ctx` is the originating connection for
    /// direct client traffic, `None` for bridged or re-dispatched
    /// envelopes. The returned envelope is the reply for the originator.
    pub async fn dispatch(
        &self,
        envelope: Envelope,
        ctx: Option<&Arc<ConnCtx>>,
    ) -> Result<Option<Envelope>, StationError> {
        let mut reply = None;
        let mut queue: VecDeque<(Envelope, bool)> = VecDeque::new();
        queue.push_back((envelope, true));

        while let Some((envelope, original)) = queue.pop_front() {
            let ctx_for = if original { ctx } else { None };
            match self.dispatch_one(envelope, ctx_for, &mut queue).await {
                Ok(out) => {
                    if original {
                        reply = out;
                    }
                }
                Err(err) if original => return Err(err),
                Err(err) => warn!("follow-up dispatch failed: {err}"),
            }
        }
        Ok(reply)
    }

    async fn dispatch_one(
        &self,
        mut envelope: Envelope,
        ctx: Option<&Arc<ConnCtx>>,
        queue: &mut VecDeque<(Envelope, bool)>,
    ) -> Result<Option<Envelope>, StationError> {
        // A relayed envelope addressed to this station already made its
        // round trip; answering it again would ping-pong between stations.
        if let Some(session) = ctx.and_then(|c| c.session()) {
            if session.id.is_station()
                && envelope.receiver.same_identity(&self.id)
                && !envelope.sender.same_identity(&session.id)
            {
                trace!(sender = %envelope.sender, "relayed round-trip dropped");
                return Ok(None);
            }
        }

        // Loop suppression: a broadcast we have already handled stops here.
        if envelope.traced_by(&self.id) {
            if envelope.is_broadcast() {
                trace!(id = envelope.id(), "broadcast already traced, dropped");
                return Ok(None);
            }
        } else {
            envelope.add_trace(&self.id);
        }

        self.absorb_attachments(&mut envelope, queue)?;

        // Verify the sender signature; without the key, park the envelope
        // until the meta or visa shows up.
        let Some(meta) = self.store.users.load_meta(&envelope.sender)? else {
            debug!(sender = %envelope.sender, "sender key unknown, suspending");
            self.policy.suspend(envelope);
            return Ok(None);
        };
        let key = meta.verifying_key()?;
        envelope
            .verify(&key)
            .map_err(|_| StationError::Signature(envelope.sender.clone()))?;

        // Group keys carry no signature of their own, so they are cached
        // only now that the sender signature is proven.
        if let (Some(keys), Some(group)) = (&envelope.keys, &envelope.group) {
            self.store
                .group_keys
                .save_keys(group, &envelope.sender, keys)?;
        }

        // Policy filter. Station-addressed control traffic only passes the
        // per-sender rate limit (there are no block lists for the station).
        if let Err(err) = self.policy.check(&envelope) {
            debug!(sender = %envelope.sender, "{err}");
            return match ctx {
                Some(_) => Ok(Some(self.receipt(
                    &envelope.sender,
                    ReceiptCommand::rejected(err.to_string(), vec![envelope.receiver.clone()]),
                )?)),
                None => Ok(None),
            };
        }

        self.route(envelope, ctx, queue).await
    }

    /// Cache the self-authenticating attachments: meta (write-once, its
    /// fingerprint proves the address) and visa (signed, verified against
    /// the meta, last-writer-wins). Group keys are NOT handled here — they
    /// carry no signature, so they wait until the envelope itself verifies.
    /// Fresh meta wakes the envelopes suspended on that sender.
    fn absorb_attachments(
        &self,
        envelope: &mut Envelope,
        queue: &mut VecDeque<(Envelope, bool)>,
    ) -> Result<(), StationError> {
        let mut learned = false;

        if let Some(meta) = envelope.meta.clone() {
            if !meta.matches(&envelope.sender) {
                return Err(StationError::MetaVerify(envelope.sender.clone()));
            }
            learned = self.store.users.save_meta(&envelope.sender, &meta)?;
        }

        if let Some(visa) = envelope.visa.clone() {
            if visa.id.same_identity(&envelope.sender) {
                if let Some(meta) = self.store.users.load_meta(&envelope.sender)? {
                    if !visa.verify(&meta) {
                        return Err(StationError::MetaVerify(envelope.sender.clone()));
                    }
                    self.store.users.save_visa(&visa)?;
                    learned = true;
                }
            }
        }

        if learned {
            for woken in self.policy.wake(&envelope.sender) {
                queue.push_back((woken, false));
            }
        }
        Ok(())
    }

    async fn route(
        &self,
        mut envelope: Envelope,
        ctx: Option<&Arc<ConnCtx>>,
        queue: &mut VecDeque<(Envelope, bool)>,
    ) -> Result<Option<Envelope>, StationError> {
        // Addressed to this station: the command processor's reply is the
        // dispatcher's output.
        if envelope.receiver.same_identity(&self.id) {
            return self.processor.process(self, ctx, &envelope).await;
        }

        if envelope.is_broadcast() {
            return self.route_broadcast(envelope, ctx).await;
        }

        // An explicit neighbor hint, unless the recipient is attached right
        // here — a local user is never served via a remote hop.
        if let Some(target) = envelope.target.clone() {
            if !target.same_identity(&self.id) && !self.sessions.is_active(&envelope.receiver) {
                return self.bridge_to(&target, envelope, ctx).await;
            }
            envelope.target = None;
        }

        if envelope.receiver.is_group() {
            // Groups are client-driven; the station only relays to the
            // assistant bot, keeping the original group in the envelope.
            let Some(assistant) = self.ans_resolve("assistant") else {
                debug!(group = %envelope.receiver, "no assistant configured");
                return match ctx {
                    Some(_) => Ok(Some(self.receipt(
                        &envelope.sender,
                        ReceiptCommand::rejected(
                            "Group assistant not configured",
                            vec![envelope.receiver.clone()],
                        ),
                    )?)),
                    None => Ok(None),
                };
            };
            let sender = envelope.sender.clone();
            debug!(group = %envelope.receiver, assistant = %assistant, "re-routed to assistant");
            let mut copy = envelope;
            copy.group = Some(copy.receiver.clone());
            copy.receiver = assistant;
            queue.push_back((copy, false));
            return self.ack_to(ctx, &sender, RECEIPT_FORWARDED);
        }

        if envelope.receiver.is_station() {
            let target = envelope.receiver.clone();
            return self.bridge_to(&target, envelope, ctx).await;
        }

        self.route_user(envelope, ctx).await
    }

    /// Local delivery first; recipients without a live session get spooled
    /// and (best-effort) push-notified.
    async fn route_user(
        &self,
        envelope: Envelope,
        ctx: Option<&Arc<ConnCtx>>,
    ) -> Result<Option<Envelope>, StationError> {
        let receiver = envelope.receiver.clone();
        let origin_conn = ctx.map(|c| c.conn_id);

        let mut delivered = 0;
        for session in self.sessions.active_sessions(&receiver) {
            if Some(session.conn_id) == origin_conn {
                continue;
            }
            if session
                .deliver(&envelope, self.next_seq(), Priority::Normal)
                .await
            {
                delivered += 1;
            }
        }
        if delivered > 0 {
            debug!(receiver = %receiver, sessions = delivered, "delivered locally");
            return self.ack_to(ctx, &envelope.sender, RECEIPT_RESPOND);
        }

        self.store.spool.append(&receiver, &envelope)?;
        self.push.notify(&receiver, envelope.id());
        debug!(receiver = %receiver, "spooled for offline recipient");
        self.ack_to(ctx, &envelope.sender, RECEIPT_CACHED)
    }

    /// Broadcast fan-out. `anywhere` means "the nearest station" — handled
    /// here, never bridged. `everywhere` is the mesh-wide form: handled or
    /// fanned out locally once, then on to every neighbor not yet in the
    /// traces.
    async fn route_broadcast(
        &self,
        envelope: Envelope,
        ctx: Option<&Arc<ConnCtx>>,
    ) -> Result<Option<Envelope>, StationError> {
        if envelope.receiver.address == Address::Anywhere {
            return match self.processor.process(self, ctx, &envelope).await {
                Ok(Some(reply)) => Ok(Some(reply)),
                Ok(None) => self.ack_to(ctx, &envelope.sender, RECEIPT_RESPOND),
                Err(err) => Err(err),
            };
        }

        let mut reply = None;
        match envelope.receiver.name.as_deref() {
            Some("station") | Some("stations") => {
                // Addressed to every station: this one handles its copy.
                match self.processor.process(self, ctx, &envelope).await {
                    Ok(out) => reply = out,
                    Err(StationError::Framing(_)) => {
                        trace!("broadcast body is not a command, relaying only")
                    }
                    Err(err) => return Err(err),
                }
            }
            _ => {
                let origin_conn = ctx.map(|c| c.conn_id);
                for session in self.sessions.all_active() {
                    // Stations get their copy through the bridge, not as a
                    // session push.
                    if session.id.is_station() {
                        continue;
                    }
                    if Some(session.conn_id) == origin_conn {
                        continue;
                    }
                    if session.id.same_identity(&envelope.sender) {
                        continue;
                    }
                    session
                        .deliver(&envelope, self.next_seq(), Priority::Normal)
                        .await;
                }
            }
        }

        let bridged = self.octopus.broadcast(&envelope).await;
        if bridged > 0 {
            debug!(bridged, id = envelope.id(), "broadcast bridged");
        }
        if reply.is_some() {
            return Ok(reply);
        }
        self.ack_to(ctx, &envelope.sender, RECEIPT_BROADCAST)
    }

    async fn bridge_to(
        &self,
        target: &hamn_wire::Id,
        envelope: Envelope,
        ctx: Option<&Arc<ConnCtx>>,
    ) -> Result<Option<Envelope>, StationError> {
        let sender = envelope.sender.clone();
        match self.octopus.send_to(target, envelope).await {
            Ok(()) => self.ack_to(ctx, &sender, RECEIPT_FORWARDED),
            Err(StationError::RouteUnknown(id)) => {
                warn!(target = %id, "no worker for station");
                match ctx {
                    Some(_) => Ok(Some(self.receipt(
                        &sender,
                        ReceiptCommand::rejected("No route to station", vec![id]),
                    )?)),
                    None => Ok(None),
                }
            }
            Err(err) => Err(err),
        }
    }

    /// A delivery receipt for direct client traffic; bridged envelopes get
    /// no replies.
    fn ack_to(
        &self,
        ctx: Option<&Arc<ConnCtx>>,
        sender: &hamn_wire::Id,
        message: &str,
    ) -> Result<Option<Envelope>, StationError> {
        match ctx {
            Some(_) => Ok(Some(self.receipt(sender, ReceiptCommand::ok(message))?)),
            None => Ok(None),
        }
    }
}
