// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Receptionist — drains the offline spool for recipients that just came
//! online. Guests arrive via `USER_LOGIN`; every tick each guest gets one
//! batch pushed to every valid session. A guest leaves the set when the
//! spool is empty, when no session is active anymore, or when an envelope
//! failed on every session (the remainder waits for the next login).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, warn};

use hamn_wire::Id;

use crate::docker::Priority;
use crate::event::StationEvent;
use crate::station::Station;

pub const TICK: Duration = Duration::from_millis(100);

enum Guest {
    /// Spool may hold more batches; keep serving.
    More,
    /// Done (or unreachable); forget the guest.
    Leave,
}

pub async fn run(station: Arc<Station>, mut shutdown: watch::Receiver<bool>) {
    let mut events = station.subscribe();
    // address → identity, so multiple logins of one identity collapse.
    let mut guests: HashMap<String, Id> = HashMap::new();
    let mut ticker = interval(TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            event = events.recv() => match event {
                Ok(StationEvent::UserLogin { id }) => {
                    guests.insert(id.address.to_string(), id);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "receptionist lagged on the event stream");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = ticker.tick() => {
                let snapshot: Vec<(String, Id)> = guests
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                for (key, guest) in snapshot {
                    if let Guest::Leave = serve_guest(&station, &guest).await {
                        guests.remove(&key);
                    }
                }
            }
        }
    }
    debug!("receptionist stopped");
}

async fn serve_guest(station: &Arc<Station>, guest: &Id) -> Guest {
    let sessions = station.sessions.active_sessions(guest);
    if sessions.is_empty() {
        station.push.clear_badge(guest);
        return Guest::Leave;
    }

    let batch = match station
        .store
        .spool
        .load_batch(guest, station.config.offline_batch_size)
    {
        Ok(Some(batch)) => batch,
        Ok(None) => {
            station.push.clear_badge(guest);
            return Guest::Leave;
        }
        Err(err) => {
            warn!(guest = %guest, "spool read failed: {err}");
            return Guest::More;
        }
    };

    // Successes form a prefix: stop at the first envelope no session takes.
    let mut successes = 0;
    for envelope in &batch.envelopes {
        let mut delivered = false;
        for session in &sessions {
            if session
                .deliver(envelope, station.next_seq(), Priority::Normal)
                .await
            {
                delivered = true;
            }
        }
        if !delivered {
            break;
        }
        successes += 1;
    }

    if let Err(err) = station.store.spool.remove_batch(&batch, successes) {
        warn!(guest = %guest, "spool trim failed: {err}");
        return Guest::Leave;
    }

    if successes < batch.envelopes.len() {
        debug!(guest = %guest, successes, of = batch.envelopes.len(), "delivery stalled");
        return Guest::Leave;
    }
    debug!(guest = %guest, pushed = successes, "spool batch drained");
    Guest::More
}
