// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The owning aggregate: one `Station` holds every long-lived collaborator
//! (store, session table, policy, push sink, octopus bridge, processor
//! registry) and is shared by handle into every task. Nothing mutates after
//! construction except through the typed operations of those collaborators.
//!
//! ```text
//!   TCP gate ──┐
//!              ├─► dispatcher ──► sessions / spool+push / octopus
//!   WS gate  ──┘        ▲
//!                       │ redispatch (woken envelopes)
//!   octopus inbound ────┤
//!   receptionist ◄── events(broadcast) ◄── handshake
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use ed25519_dalek::SigningKey;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Duration};
use tracing::{debug, info, warn};

use hamn_store::{StationKey, Store};
use hamn_wire::{Command, Envelope, Id, Meta, ReceiptCommand};

use crate::config::StationConfig;
use crate::docker::Priority;
use crate::error::StationError;
use crate::event::StationEvent;
use crate::octopus::{Octopus, StationIdentity};
use crate::policy::Policy;
use crate::processor::Processor;
use crate::push::{backend_from, PushSink};
use crate::session::SessionTable;
use crate::{gate, receptionist, ws};

/// Sequence numbers the station stamps on pushed frames live above this
/// base, so responses are distinguishable from fresh client requests.
pub const STATION_SEQ_BASE: u32 = 0x8000_0000;

/// How often the suspend queues are swept for expired envelopes.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

pub struct Station {
    pub config: StationConfig,
    pub id: Id,
    pub meta: Meta,
    pub(crate) signing_key: SigningKey,
    pub store: Store,
    pub sessions: SessionTable,
    pub policy: Policy,
    pub push: PushSink,
    pub octopus: Octopus,
    pub processor: Processor,
    events: broadcast::Sender<StationEvent>,
    redispatch_tx: mpsc::UnboundedSender<Envelope>,
    seq: AtomicU32,
}

/// Channels the runner pumps; produced by [`Station::open`].
pub struct StationChannels {
    pub redispatch_rx: mpsc::UnboundedReceiver<Envelope>,
    pub octopus_rx: mpsc::Receiver<(Id, Envelope)>,
}

impl Station {
    /// Construct the aggregate: open the store, load or mint the station
    /// identity, spawn the push worker and the neighbor workers.
    pub fn open(config: StationConfig) -> Result<(Arc<Self>, StationChannels), StationError> {
        let store = Store::open(&config.base_dir, config.offline_batch_size)?;
        let key = StationKey::load_or_create(store.root(), &store.users, &config.station_name)?;
        info!(id = %key.id, base = %store.root().display(), "station identity ready");

        let (events, _) = broadcast::channel(256);
        let (octopus_tx, octopus_rx) = mpsc::channel(256);
        let (redispatch_tx, redispatch_rx) = mpsc::unbounded_channel();

        let octopus = Octopus::spawn(
            StationIdentity {
                id: key.id.clone(),
                meta: key.meta.clone(),
                signing_key: key.signing_key.clone(),
            },
            &config.neighbors,
            store.roaming.clone(),
            events.clone(),
            octopus_tx,
        );

        let station = Arc::new(Self {
            sessions: SessionTable::new(events.clone()),
            policy: Policy::new(config.rate_limit_per_min, config.rate_limit_burst),
            push: PushSink::spawn(backend_from(&config.push_backend)),
            octopus,
            processor: Processor::with_default_handlers(),
            id: key.id,
            meta: key.meta,
            signing_key: key.signing_key,
            store,
            events,
            redispatch_tx,
            seq: AtomicU32::new(STATION_SEQ_BASE),
            config,
        });
        Ok((
            station,
            StationChannels {
                redispatch_rx,
                octopus_rx,
            },
        ))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StationEvent> {
        self.events.subscribe()
    }

    pub fn emit(&self, event: StationEvent) {
        let _ = self.events.send(event);
    }

    pub fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed) | STATION_SEQ_BASE
    }

    /// Look up a well-known name in the reserved ANS records.
    pub fn ans_resolve(&self, name: &str) -> Option<Id> {
        self.config.ans_reserved_records.get(name).cloned()
    }

    /// Sign a command and wrap it into an envelope from the station. The
    /// station's meta rides along so a first-contact peer (a neighbor
    /// relaying our receipt, say) can verify us without a query.
    pub fn seal_command(
        &self,
        command: &Command,
        receiver: &Id,
    ) -> Result<Envelope, StationError> {
        let mut envelope = Envelope::seal(
            self.id.clone(),
            receiver.clone(),
            &command.to_json()?,
            &self.signing_key,
        );
        envelope.meta = Some(self.meta.clone());
        Ok(envelope)
    }

    pub fn receipt(
        &self,
        receiver: &Id,
        receipt: ReceiptCommand,
    ) -> Result<Envelope, StationError> {
        self.seal_command(&Command::Receipt(receipt), receiver)
    }

    /// Release envelopes suspended on `id` back into the dispatcher.
    pub fn wake_suspended(&self, id: &Id) {
        for envelope in self.policy.wake(id) {
            let _ = self.redispatch_tx.send(envelope);
        }
    }
}

/// A started station: listeners bound, workers running.
pub struct Running {
    pub station: Arc<Station>,
    pub tcp_addr: SocketAddr,
    pub ws_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Running {
    /// Flip the shutdown watch, let the neighbor workers flush to the
    /// roaming store, and reap the tasks.
    pub async fn shutdown(self) {
        info!("station shutting down");
        let _ = self.shutdown.send(true);
        self.station.octopus.close();
        for mut task in self.tasks {
            if timeout(Duration::from_secs(2), &mut task).await.is_err() {
                task.abort();
            }
        }
    }
}

/// Bind both gates and spawn every worker task.
pub async fn start(config: StationConfig) -> Result<Running, StationError> {
    let (station, channels) = Station::open(config)?;

    let host = station.config.station_host.clone();
    let tcp = TcpListener::bind((host.as_str(), station.config.station_port))
        .await
        .map_err(|e| {
            StationError::Transport(format!(
                "binding {host}:{}: {e}",
                station.config.station_port
            ))
        })?;
    let ws = TcpListener::bind((host.as_str(), station.config.ws_port))
        .await
        .map_err(|e| {
            StationError::Transport(format!("binding {host}:{}: {e}", station.config.ws_port))
        })?;
    let tcp_addr = tcp.local_addr().map_err(|e| StationError::Transport(e.to_string()))?;
    let ws_addr = ws.local_addr().map_err(|e| StationError::Transport(e.to_string()))?;
    info!(%tcp_addr, %ws_addr, id = %station.id, "station listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(gate::serve_mars(
        station.clone(),
        tcp,
        shutdown_rx.clone(),
    )));
    tasks.push(tokio::spawn(ws::serve_ws(
        station.clone(),
        ws,
        shutdown_rx.clone(),
    )));
    tasks.push(tokio::spawn(receptionist::run(
        station.clone(),
        shutdown_rx.clone(),
    )));
    tasks.push(tokio::spawn(pump_redispatch(
        station.clone(),
        channels.redispatch_rx,
        shutdown_rx.clone(),
    )));
    tasks.push(tokio::spawn(pump_octopus_inbound(
        station.clone(),
        channels.octopus_rx,
        shutdown_rx.clone(),
    )));
    tasks.push(tokio::spawn(sweep_suspended(
        station.clone(),
        shutdown_rx,
    )));

    Ok(Running {
        station,
        tcp_addr,
        ws_addr,
        shutdown: shutdown_tx,
        tasks,
    })
}

/// Run until ctrl-c, then shut down cleanly.
pub async fn run(config: StationConfig) -> Result<(), StationError> {
    let running = start(config).await?;
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("ctrl-c handler failed: {err}");
    }
    running.shutdown().await;
    Ok(())
}

/// Envelopes released from the suspend queue re-enter the dispatcher here.
async fn pump_redispatch(
    station: Arc<Station>,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            maybe = rx.recv() => match maybe {
                Some(envelope) => {
                    if let Err(err) = station.dispatch(envelope, None).await {
                        warn!("re-dispatch failed: {err}");
                    }
                }
                None => break,
            }
        }
    }
}

/// The outer messenger: envelopes a neighbor pushed over a terminal
/// connection. An envelope addressed to this station went around a loop —
/// drop it instead of bouncing it back.
async fn pump_octopus_inbound(
    station: Arc<Station>,
    mut rx: mpsc::Receiver<(Id, Envelope)>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            maybe = rx.recv() => match maybe {
                Some((neighbor, envelope)) => {
                    if envelope.receiver.same_identity(&station.id) {
                        debug!(%neighbor, "bridged envelope addressed to us, dropped");
                        continue;
                    }
                    if let Err(err) = station.dispatch(envelope, None).await {
                        warn!(%neighbor, "bridged dispatch failed: {err}");
                    }
                }
                None => break,
            }
        }
    }
}

/// Expired suspended envelopes are dropped; senders that still have a live
/// session learn about it through a receipt.
async fn sweep_suspended(station: Arc<Station>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                for envelope in station.policy.sweep() {
                    debug!(sender = %envelope.sender, "suspended envelope expired");
                    let receipt = ReceiptCommand::rejected(
                        "Message expired waiting for your key",
                        vec![envelope.receiver.clone()],
                    );
                    let Ok(reply) = station.receipt(&envelope.sender, receipt) else {
                        continue;
                    };
                    for session in station.sessions.active_sessions(&envelope.sender) {
                        session
                            .deliver(&reply, station.next_seq(), Priority::Slower)
                            .await;
                    }
                }
            }
        }
    }
}
