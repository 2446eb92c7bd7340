// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Docker — the outbound half of a connection's packet pump.
//!
//! Callers enqueue [`Ship`]s; the docker task writes them by priority,
//! tracks ships awaiting a response by `seq`, retries with exponential
//! backoff, and runs the liveness heartbeat. A transport error or three
//! missed pongs flips the `closed` watch, which the connection's read loop
//! observes.
//!
//! ```text
//!   gate / dispatcher ──► mpsc<DockerCmd> ──► docker task ──► socket sink
//!                                              │
//!   read loop ◄── watch<closed> ◄──────────────┘
//! ```

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace, warn};

use hamn_wire::MarsPackage;

use crate::error::StationError;

/// Retry budget for ships that expect a response.
pub const RETRY_LIMIT: u32 = 3;
/// Base retry delay; doubled on every attempt.
pub const RETRY_BASE: Duration = Duration::from_secs(30);
/// Consecutive unanswered pings before the connection is declared dead.
const MAX_MISSED_PONGS: u32 = 3;
const QUEUE_DEPTH: usize = 256;

/// Outbound priority classes. FIFO within a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Slower = -1,
    Normal = 0,
    Urgent = 1,
}

impl Priority {
    fn lane(self) -> usize {
        match self {
            Self::Urgent => 0,
            Self::Normal => 1,
            Self::Slower => 2,
        }
    }
}

/// Terminal state of a ship, reported through its completion handler.
#[derive(Debug)]
pub enum ShipOutcome {
    /// Written to the socket (ships that expect no response).
    Written,
    /// The peer answered with the same `seq`.
    Responded,
    /// Retry budget exhausted without a response.
    Timeout,
    /// Socket error or connection closed before the write.
    Transport(String),
}

impl ShipOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Written | Self::Responded)
    }
}

/// A queued outbound payload.
#[derive(Debug)]
pub struct Ship {
    pub package: MarsPackage,
    pub priority: Priority,
    /// Keep the ship after writing and retry until a frame with the same
    /// `seq` arrives.
    pub expects_response: bool,
    handler: Option<oneshot::Sender<ShipOutcome>>,
    attempts: u32,
    next_attempt: Instant,
}

impl Ship {
    pub fn new(package: MarsPackage, priority: Priority) -> Self {
        Self {
            package,
            priority,
            expects_response: false,
            handler: None,
            attempts: 0,
            next_attempt: Instant::now(),
        }
    }

    pub fn expecting_response(mut self) -> Self {
        self.expects_response = true;
        self
    }

    pub fn with_handler(mut self, handler: oneshot::Sender<ShipOutcome>) -> Self {
        self.handler = Some(handler);
        self
    }

    fn finish(self, outcome: ShipOutcome) {
        match self.handler {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => {
                if !outcome.is_delivered() {
                    debug!(seq = self.package.seq, ?outcome, "ship dropped");
                }
            }
        }
    }
}

/// Where the docker writes frames; TCP uses Mars framing, the WebSocket
/// gate maps packages onto text/ping frames.
#[async_trait]
pub trait FrameSink: Send + 'static {
    async fn send_frame(&mut self, package: MarsPackage) -> Result<(), StationError>;
}

enum DockerCmd {
    Sail(Ship),
    /// A frame with this `seq` arrived; completes an awaiting ship.
    Ack(u32),
    /// Any inbound frame was seen (`pong` when it was a PONG body).
    Inbound,
    Close,
}

/// Cheap-to-clone handle to a docker task.
#[derive(Clone)]
pub struct DockerHandle {
    tx: mpsc::Sender<DockerCmd>,
    closed: watch::Receiver<bool>,
}

impl std::fmt::Debug for DockerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DockerHandle")
    }
}

impl DockerHandle {
    pub async fn sail(&self, ship: Ship) -> Result<(), StationError> {
        self.tx
            .send(DockerCmd::Sail(ship))
            .await
            .map_err(|_| StationError::Transport("connection closed".into()))
    }

    /// Enqueue a package at NORMAL priority, fire-and-forget.
    pub async fn send_package(&self, package: MarsPackage) -> Result<(), StationError> {
        self.sail(Ship::new(package, Priority::Normal)).await
    }

    /// Enqueue and wait until the ship is written (or fails).
    pub async fn deliver(&self, package: MarsPackage, priority: Priority) -> ShipOutcome {
        let (tx, rx) = oneshot::channel();
        let ship = Ship::new(package, priority).with_handler(tx);
        if self.sail(ship).await.is_err() {
            return ShipOutcome::Transport("connection closed".into());
        }
        rx.await
            .unwrap_or_else(|_| ShipOutcome::Transport("connection closed".into()))
    }

    pub async fn ack(&self, seq: u32) {
        let _ = self.tx.send(DockerCmd::Ack(seq)).await;
    }

    pub async fn inbound_seen(&self) {
        let _ = self.tx.send(DockerCmd::Inbound).await;
    }

    /// Ask the task to flush fresh ships and exit.
    pub async fn close(&self) {
        let _ = self.tx.send(DockerCmd::Close).await;
    }

    /// Watch that flips to `true` when the docker gives up on the
    /// connection (transport error or lost liveness).
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed.clone()
    }
}

/// Spawn the docker task over `sink`.
pub fn spawn<S: FrameSink>(sink: S, heartbeat: Duration) -> DockerHandle {
    let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
    let (closed_tx, closed_rx) = watch::channel(false);
    tokio::spawn(run(sink, rx, closed_tx, heartbeat));
    DockerHandle {
        tx,
        closed: closed_rx,
    }
}

struct Pump<S> {
    sink: S,
    fresh: [VecDeque<Ship>; 3],
    waiting: Vec<Ship>,
    last_inbound: Instant,
    missed_pongs: u32,
    next_ping: Instant,
    ping_seq: u32,
    heartbeat: Duration,
}

async fn run<S: FrameSink>(
    sink: S,
    mut rx: mpsc::Receiver<DockerCmd>,
    closed_tx: watch::Sender<bool>,
    heartbeat: Duration,
) {
    let mut pump = Pump {
        sink,
        fresh: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
        waiting: Vec::new(),
        last_inbound: Instant::now(),
        missed_pongs: 0,
        next_ping: Instant::now() + heartbeat,
        ping_seq: 1,
        heartbeat,
    };

    let mut draining = false;
    'pump: loop {
        if !pump.heartbeat_ok() {
            debug!("liveness lost, closing connection");
            break 'pump;
        }
        if pump.flush().await.is_err() {
            break 'pump;
        }
        if draining {
            break 'pump;
        }

        let wake = pump.next_wake();
        tokio::select! {
            cmd = rx.recv() => {
                pump.apply(cmd, &mut draining);
                // Batch whatever else queued up so the priority lanes see
                // the whole burst before the next flush.
                while let Ok(cmd) = rx.try_recv() {
                    pump.apply(Some(cmd), &mut draining);
                }
            }
            _ = sleep_until(wake) => {}
        }
    }

    let _ = closed_tx.send(true);
    rx.close();
    while let Ok(cmd) = rx.try_recv() {
        if let DockerCmd::Sail(ship) = cmd {
            ship.finish(ShipOutcome::Transport("connection closed".into()));
        }
    }
    pump.cancel_all();
}

impl<S: FrameSink> Pump<S> {
    fn apply(&mut self, cmd: Option<DockerCmd>, draining: &mut bool) {
        match cmd {
            Some(DockerCmd::Sail(ship)) => self.fresh[ship.priority.lane()].push_back(ship),
            Some(DockerCmd::Ack(seq)) => self.ack(seq),
            Some(DockerCmd::Inbound) => {
                self.last_inbound = Instant::now();
                self.missed_pongs = 0;
            }
            Some(DockerCmd::Close) | None => *draining = true,
        }
    }

    /// Write every ready ship. `Err` means the sink is broken.
    async fn flush(&mut self) -> Result<(), ()> {
        loop {
            let now = Instant::now();
            let Some(mut ship) = self.pop_ready(now) else {
                return Ok(());
            };
            if ship.attempts > RETRY_LIMIT {
                trace!(seq = ship.package.seq, "retry budget exhausted");
                ship.finish(ShipOutcome::Timeout);
                continue;
            }
            match self.sink.send_frame(ship.package.clone()).await {
                Ok(()) => {
                    if ship.expects_response {
                        ship.attempts += 1;
                        ship.next_attempt = now + RETRY_BASE * 2u32.saturating_pow(ship.attempts - 1);
                        self.waiting.push(ship);
                    } else {
                        ship.finish(ShipOutcome::Written);
                    }
                }
                Err(err) => {
                    warn!("write failed: {err}");
                    ship.finish(ShipOutcome::Transport(err.to_string()));
                    return Err(());
                }
            }
        }
    }

    /// Highest-priority new ship first; otherwise the earliest ship whose
    /// next-attempt time has arrived.
    fn pop_ready(&mut self, now: Instant) -> Option<Ship> {
        for lane in &mut self.fresh {
            if let Some(ship) = lane.pop_front() {
                return Some(ship);
            }
        }
        let due = self
            .waiting
            .iter()
            .enumerate()
            .filter(|(_, ship)| ship.next_attempt <= now)
            .min_by_key(|(_, ship)| ship.next_attempt)
            .map(|(i, _)| i)?;
        Some(self.waiting.remove(due))
    }

    /// Returns `false` once three consecutive pings have gone unanswered.
    fn heartbeat_ok(&mut self) -> bool {
        let now = Instant::now();
        if now < self.next_ping {
            return true;
        }
        self.next_ping = now + self.heartbeat;
        if now.duration_since(self.last_inbound) < self.heartbeat {
            return true;
        }
        if self.missed_pongs >= MAX_MISSED_PONGS {
            return false;
        }
        self.missed_pongs += 1;
        self.ping_seq = self.ping_seq.wrapping_add(1);
        self.fresh[Priority::Slower.lane()]
            .push_back(Ship::new(MarsPackage::ping(self.ping_seq), Priority::Slower));
        true
    }

    fn ack(&mut self, seq: u32) {
        if let Some(at) = self
            .waiting
            .iter()
            .position(|ship| ship.package.seq == seq)
        {
            self.waiting.remove(at).finish(ShipOutcome::Responded);
        }
    }

    fn next_wake(&self) -> Instant {
        self.waiting
            .iter()
            .map(|ship| ship.next_attempt)
            .min()
            .map_or(self.next_ping, |retry| retry.min(self.next_ping))
    }

    fn cancel_all(&mut self) {
        for lane in &mut self.fresh {
            for ship in lane.drain(..) {
                ship.finish(ShipOutcome::Transport("connection closed".into()));
            }
        }
        for ship in self.waiting.drain(..) {
            ship.finish(ShipOutcome::Transport("connection closed".into()));
        }
    }
}
