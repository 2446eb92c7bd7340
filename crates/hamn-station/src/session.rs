// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The process-wide session table: authenticated identities mapped to their
//! live connections. Multiple devices per identity are permitted; a
//! connection carries exactly one session once its handshake starts.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use rand::RngCore;
use tokio::sync::broadcast;
use tracing::debug;

use hamn_wire::{Envelope, Id, MarsPackage};

use crate::docker::{DockerHandle, Priority};
use crate::event::StationEvent;

static CONN_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique id for one accepted connection.
pub fn next_conn_id() -> u64 {
    CONN_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Per-connection context handed through the envelope pipeline.
pub struct ConnCtx {
    pub conn_id: u64,
    pub remote: SocketAddr,
    pub docker: DockerHandle,
    session: Mutex<Option<Arc<Session>>>,
}

impl ConnCtx {
    pub fn new(remote: SocketAddr, docker: DockerHandle) -> Arc<Self> {
        Arc::new(Self {
            conn_id: next_conn_id(),
            remote,
            docker,
            session: Mutex::new(None),
        })
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn bind(&self, session: Arc<Session>) {
        *self.session.lock().unwrap_or_else(|e| e.into_inner()) = Some(session);
    }

    pub fn is_active(&self) -> bool {
        self.session().is_some_and(|s| s.is_active())
    }
}

/// One authenticated (or authenticating) connection of an identity.
#[derive(Debug)]
pub struct Session {
    pub id: Id,
    pub conn_id: u64,
    pub client_addr: SocketAddr,
    pub created_at: chrono::DateTime<chrono::Utc>,
    key: Mutex<String>,
    active: AtomicBool,
    docker: DockerHandle,
}

fn fresh_key() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

impl Session {
    fn new(id: Id, conn_id: u64, client_addr: SocketAddr, docker: DockerHandle) -> Arc<Self> {
        Arc::new(Self {
            id,
            conn_id,
            client_addr,
            created_at: chrono::Utc::now(),
            key: Mutex::new(fresh_key()),
            active: AtomicBool::new(false),
            docker,
        })
    }

    /// Current challenge key.
    pub fn key(&self) -> String {
        self.key.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replace the challenge with a fresh one and return it.
    pub fn renew_key(&self) -> String {
        let key = fresh_key();
        *self.key.lock().unwrap_or_else(|e| e.into_inner()) = key.clone();
        key
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    pub fn docker(&self) -> &DockerHandle {
        &self.docker
    }

    /// Push an envelope down this session's connection and wait for the
    /// write. Returns `false` when the connection is gone.
    pub async fn deliver(&self, envelope: &Envelope, seq: u32, priority: Priority) -> bool {
        let Ok(body) = envelope.to_json() else {
            return false;
        };
        self.docker
            .deliver(MarsPackage::push(seq, body), priority)
            .await
            .is_delivered()
    }
}

/// Identity ⇄ live-session registry shared by every handler task.
pub struct SessionTable {
    map: DashMap<String, Vec<Arc<Session>>>,
    events: broadcast::Sender<StationEvent>,
}

impl SessionTable {
    pub fn new(events: broadcast::Sender<StationEvent>) -> Self {
        Self {
            map: DashMap::new(),
            events,
        }
    }

    fn key(id: &Id) -> String {
        id.address.to_string()
    }

    /// Create (or replace, for the same connection) the session for
    /// `identity`, with a fresh challenge key and `active = false`.
    pub fn create(
        &self,
        identity: &Id,
        ctx_conn_id: u64,
        client_addr: SocketAddr,
        docker: &DockerHandle,
    ) -> Arc<Session> {
        let session = Session::new(identity.clone(), ctx_conn_id, client_addr, docker.clone());
        let mut entry = self.map.entry(Self::key(identity)).or_default();
        entry.retain(|s| s.conn_id != ctx_conn_id);
        entry.push(session.clone());
        debug!(id = %identity, conn = ctx_conn_id, "session created");
        session
    }

    /// Every live session of `identity`, any device.
    pub fn all(&self, identity: &Id) -> Vec<Arc<Session>> {
        self.map
            .get(&Self::key(identity))
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    pub fn active_sessions(&self, identity: &Id) -> Vec<Arc<Session>> {
        self.all(identity)
            .into_iter()
            .filter(|s| s.is_active())
            .collect()
    }

    pub fn is_active(&self, identity: &Id) -> bool {
        !self.active_sessions(identity).is_empty()
    }

    /// Every active session on the station, for broadcast fan-out.
    pub fn all_active(&self) -> Vec<Arc<Session>> {
        self.map
            .iter()
            .flat_map(|entry| entry.value().clone())
            .filter(|s| s.is_active())
            .collect()
    }

    /// Evict every session of a closing connection, firing `USER_LOGOUT`
    /// for the ones that were active.
    pub fn close_connection(&self, conn_id: u64) {
        let mut evicted = Vec::new();
        self.map.retain(|_, sessions| {
            sessions.retain(|s| {
                if s.conn_id == conn_id {
                    evicted.push(s.clone());
                    false
                } else {
                    true
                }
            });
            !sessions.is_empty()
        });
        for session in evicted {
            debug!(id = %session.id, conn = conn_id, "session evicted");
            if session.is_active() {
                session.set_active(false);
                let _ = self.events.send(StationEvent::UserLogout {
                    id: session.id.clone(),
                });
            }
        }
    }

    pub fn len(&self) -> usize {
        self.map.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
