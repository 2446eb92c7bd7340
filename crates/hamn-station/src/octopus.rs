// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Octopus — the neighbor bridge.
//!
//! One worker task per configured neighbor owns a Terminal (a client-side
//! Mars connection with its own handshake, made with the station's own
//! identity) and a FIFO queue. Envelopes the worker cannot deliver are
//! parked in the roaming store and flushed on the next successful connect.
//!
//! Outbound ("inner messenger"): an explicit `target` hint routes to that
//! neighbor, everything else broadcasts to every neighbor not yet in the
//! envelope's traces or `sent_neighbors`. Inbound frames from a neighbor
//! are handed back to the station's dispatcher; loop suppression is purely
//! traces-driven.

use std::collections::HashMap;

use ed25519_dalek::SigningKey;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{timeout, Duration, Instant};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use hamn_store::RoamingStore;
use hamn_wire::{
    Command, Envelope, HandshakeCommand, HandshakePhase, Id, MarsCodec, MarsPackage, Meta,
    BODY_PING,
};

use crate::config::NeighborConfig;
use crate::error::StationError;
use crate::event::StationEvent;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_STEP_TIMEOUT: Duration = Duration::from_secs(10);
/// Minimum pause between connection attempts to a dead neighbor.
const RECONNECT_COOLDOWN: Duration = Duration::from_secs(5);
const WORKER_QUEUE: usize = 256;

/// The station's own signing identity, used by every Terminal handshake.
#[derive(Clone)]
pub struct StationIdentity {
    pub id: Id,
    pub meta: Meta,
    pub signing_key: SigningKey,
}

#[derive(Clone)]
struct Worker {
    id: Id,
    tx: mpsc::Sender<Envelope>,
}

pub struct Octopus {
    workers: std::sync::RwLock<HashMap<String, Worker>>,
}

impl Octopus {
    /// Spawn one worker per neighbor. `inbound_tx` receives envelopes a
    /// neighbor pushes to us over the terminal connection.
    pub fn spawn(
        identity: StationIdentity,
        neighbors: &[NeighborConfig],
        roaming: RoamingStore,
        events: broadcast::Sender<StationEvent>,
        inbound_tx: mpsc::Sender<(Id, Envelope)>,
    ) -> Self {
        let mut workers = HashMap::new();
        for cfg in neighbors {
            if cfg.id.same_identity(&identity.id) {
                continue;
            }
            let (tx, rx) = mpsc::channel(WORKER_QUEUE);
            let task = WorkerTask {
                cfg: cfg.clone(),
                identity: identity.clone(),
                roaming: roaming.clone(),
                events: events.clone(),
                inbound_tx: inbound_tx.clone(),
                rx,
                seq: 1,
                last_attempt: None,
            };
            tokio::spawn(task.run());
            workers.insert(
                cfg.id.address.to_string(),
                Worker {
                    id: cfg.id.clone(),
                    tx,
                },
            );
        }
        if !workers.is_empty() {
            info!(neighbors = workers.len(), "octopus bridge ready");
        }
        Self {
            workers: std::sync::RwLock::new(workers),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Worker>> {
        self.workers.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn neighbor_ids(&self) -> Vec<Id> {
        self.read().values().map(|w| w.id.clone()).collect()
    }

    /// Queue an envelope to one specific neighbor, stripping the hint.
    pub async fn send_to(&self, target: &Id, mut envelope: Envelope) -> Result<(), StationError> {
        envelope.target = None;
        let worker = self
            .read()
            .get(&target.address.to_string())
            .cloned()
            .ok_or_else(|| StationError::RouteUnknown(target.clone()))?;
        worker
            .tx
            .send(envelope)
            .await
            .map_err(|_| StationError::Transport(format!("worker for {} is gone", worker.id)))
    }

    /// Queue copies to every neighbor not already covered by the envelope's
    /// traces or `sent_neighbors`. Returns how many were queued.
    pub async fn broadcast(&self, envelope: &Envelope) -> usize {
        let targets: Vec<Worker> = self
            .read()
            .values()
            .filter(|w| !envelope.traced_by(&w.id))
            .filter(|w| {
                !envelope
                    .sent_neighbors
                    .iter()
                    .any(|n| n.same_identity(&w.id))
            })
            .cloned()
            .collect();
        if targets.is_empty() {
            return 0;
        }

        // Every copy carries the full set we are trying now, so the next hop
        // skips them.
        let mut tried = envelope.sent_neighbors.clone();
        tried.extend(targets.iter().map(|w| w.id.clone()));

        let mut queued = 0;
        for worker in targets {
            let mut copy = envelope.clone();
            copy.target = None;
            copy.sent_neighbors = tried.clone();
            if worker.tx.send(copy).await.is_ok() {
                queued += 1;
            }
        }
        queued
    }

    /// Drop the queues; workers flush what is left to the roaming store and
    /// exit.
    pub fn close(&self) {
        self.workers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

type Terminal = Framed<TcpStream, MarsCodec>;

struct WorkerTask {
    cfg: NeighborConfig,
    identity: StationIdentity,
    roaming: RoamingStore,
    events: broadcast::Sender<StationEvent>,
    inbound_tx: mpsc::Sender<(Id, Envelope)>,
    rx: mpsc::Receiver<Envelope>,
    seq: u32,
    last_attempt: Option<Instant>,
}

impl WorkerTask {
    async fn run(mut self) {
        'main: loop {
            // Disconnected: wait for work before dialing.
            let Some(envelope) = self.rx.recv().await else {
                break 'main;
            };
            let Some(mut terminal) = self.connect_and_flush(envelope).await else {
                continue 'main;
            };

            loop {
                tokio::select! {
                    maybe = self.rx.recv() => match maybe {
                        Some(envelope) => {
                            if let Err(err) =
                                send_envelope(&mut terminal, &mut self.seq, &envelope).await
                            {
                                warn!(neighbor = %self.cfg.id, "send failed: {err}");
                                self.park(envelope);
                                continue 'main;
                            }
                        }
                        None => break 'main,
                    },
                    frame = terminal.next() => match frame {
                        Some(Ok(pkg)) => {
                            if self.on_frame(&mut terminal, pkg).await.is_err() {
                                continue 'main;
                            }
                        }
                        Some(Err(err)) => {
                            warn!(neighbor = %self.cfg.id, "terminal stream error: {err}");
                            continue 'main;
                        }
                        None => {
                            debug!(neighbor = %self.cfg.id, "terminal closed by peer");
                            continue 'main;
                        }
                    }
                }
            }
        }

        // Shutdown: everything still queued goes to the roaming store.
        self.rx.close();
        while let Ok(envelope) = self.rx.try_recv() {
            self.park(envelope);
        }
        debug!(neighbor = %self.cfg.id, "worker stopped");
    }

    fn park(&self, envelope: Envelope) {
        if let Err(err) = self.roaming.push(&self.cfg.id, &envelope) {
            warn!(neighbor = %self.cfg.id, "roaming spool write failed: {err}");
        }
    }

    /// Dial the neighbor (respecting the cooldown), then send the roaming
    /// backlog followed by `envelope`. Anything that cannot be sent is
    /// parked.
    async fn connect_and_flush(&mut self, envelope: Envelope) -> Option<Terminal> {
        if self
            .last_attempt
            .is_some_and(|at| at.elapsed() < RECONNECT_COOLDOWN)
        {
            self.park(envelope);
            return None;
        }
        self.last_attempt = Some(Instant::now());

        let mut terminal = match self.connect().await {
            Ok(terminal) => terminal,
            Err(err) => {
                warn!(neighbor = %self.cfg.id, "connect failed: {err}");
                self.park(envelope);
                return None;
            }
        };
        let _ = self.events.send(StationEvent::NeighborUp {
            id: self.cfg.id.clone(),
        });

        // Backlog first, to keep per-sender order across reconnects.
        let mut backlog = match self.roaming.drain(&self.cfg.id) {
            Ok(backlog) => backlog,
            Err(err) => {
                warn!(neighbor = %self.cfg.id, "roaming drain failed: {err}");
                Vec::new()
            }
        };
        backlog.push(envelope);

        for (at, env) in backlog.iter().enumerate() {
            if let Err(err) = send_envelope(&mut terminal, &mut self.seq, env).await {
                warn!(neighbor = %self.cfg.id, "flush failed: {err}");
                for env in &backlog[at..] {
                    self.park(env.clone());
                }
                return None;
            }
        }
        Some(terminal)
    }

    /// Client-side challenge–response with the station's own identity.
    async fn connect(&mut self) -> Result<Terminal, StationError> {
        let stream = timeout(
            CONNECT_TIMEOUT,
            TcpStream::connect((self.cfg.host.as_str(), self.cfg.port)),
        )
        .await
        .map_err(|_| StationError::Timeout(format!("connecting to {}", self.cfg.id)))?
        .map_err(|e| StationError::Transport(e.to_string()))?;
        let mut terminal = Framed::new(stream, MarsCodec::new());

        let mut session: Option<String> = None;
        for _ in 0..3 {
            let cmd = Command::Handshake(HandshakeCommand::start(session.clone()));
            let mut env = Envelope::seal(
                self.identity.id.clone(),
                self.cfg.id.clone(),
                &cmd.to_json()?,
                &self.identity.signing_key,
            );
            env.meta = Some(self.identity.meta.clone());
            self.seq = self.seq.wrapping_add(1);
            terminal
                .send(MarsPackage::message(self.seq, env.to_json()?))
                .await?;

            let reply = loop {
                let pkg = timeout(HANDSHAKE_STEP_TIMEOUT, terminal.next())
                    .await
                    .map_err(|_| StationError::Timeout("neighbor handshake".into()))?
                    .ok_or_else(|| {
                        StationError::Transport("neighbor closed during handshake".into())
                    })??;
                if pkg.body == BODY_PING {
                    terminal.send(MarsPackage::pong(pkg.seq)).await?;
                    continue;
                }
                if pkg.is_liveness() {
                    continue;
                }
                break pkg;
            };

            let reply_env = Envelope::from_json(&reply.body)?;
            match Command::from_json(&reply_env.payload()?)? {
                Command::Handshake(h) => match h.phase {
                    HandshakePhase::Again => session = h.session,
                    HandshakePhase::Success => {
                        info!(neighbor = %self.cfg.id, "terminal handshake complete");
                        return Ok(terminal);
                    }
                    HandshakePhase::Start => {
                        return Err(StationError::Transport(
                            "unexpected handshake phase from neighbor".into(),
                        ))
                    }
                },
                Command::Receipt(receipt) => {
                    return Err(StationError::PolicyDenied(receipt.message))
                }
                _ => {
                    return Err(StationError::Transport(
                        "unexpected handshake reply from neighbor".into(),
                    ))
                }
            }
        }
        Err(StationError::Timeout(
            "neighbor handshake did not converge".into(),
        ))
    }

    /// Liveness bookkeeping plus the outer-messenger feed: envelopes the
    /// neighbor pushes to us go back into the local dispatcher.
    async fn on_frame(&mut self, terminal: &mut Terminal, pkg: MarsPackage) -> Result<(), ()> {
        if pkg.body == BODY_PING {
            return terminal
                .send(MarsPackage::pong(pkg.seq))
                .await
                .map_err(|_| ());
        }
        if pkg.is_liveness() {
            return Ok(());
        }
        match Envelope::from_json(&pkg.body) {
            Ok(envelope) => {
                let _ = self
                    .inbound_tx
                    .send((self.cfg.id.clone(), envelope))
                    .await;
            }
            Err(err) => debug!(neighbor = %self.cfg.id, "undecodable frame: {err}"),
        }
        Ok(())
    }
}

async fn send_envelope(
    terminal: &mut Terminal,
    seq: &mut u32,
    envelope: &Envelope,
) -> Result<(), StationError> {
    *seq = seq.wrapping_add(1);
    terminal
        .send(MarsPackage::message(*seq, envelope.to_json()?))
        .await?;
    Ok(())
}
