// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The reliable envelope — the only message form the station stores or
//! forwards.
//!
//! `data` is ciphertext the station cannot read; `signature` doubles as the
//! envelope's primary key. `traces` records every station that has handled
//! the envelope and is the sole loop-suppression mechanism for broadcast
//! fan-out across the mesh.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::id::Id;
use crate::meta::{Meta, Visa};
use crate::WireError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: Id,
    pub receiver: Id,
    /// Milliseconds since the epoch, chosen by the sender.
    pub time: u64,
    /// base64 ciphertext.
    pub data: String,
    /// base64 sender signature over the ciphertext bytes.
    pub signature: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keys: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visa: Option<Visa>,

    /// Stations that have handled this envelope, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub traces: Vec<Id>,

    /// Original group receiver, kept while the envelope is re-addressed to
    /// the group assistant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<Id>,
    /// Explicit neighbor-station hint for bridged envelopes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<Id>,
    /// Neighbors a previous hop has already tried.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sent_neighbors: Vec<Id>,
}

impl Envelope {
    /// Sign `data` and wrap it into an envelope. Used by the station for its
    /// own control traffic (receipts, neighbor handshakes) and by tests.
    pub fn seal(sender: Id, receiver: Id, data: &[u8], signing_key: &SigningKey) -> Self {
        let signature = B64.encode(signing_key.sign(data).to_bytes());
        Self {
            sender,
            receiver,
            time: chrono::Utc::now().timestamp_millis() as u64,
            data: B64.encode(data),
            signature,
            key: None,
            keys: None,
            meta: None,
            visa: None,
            traces: Vec::new(),
            group: None,
            target: None,
            sent_neighbors: Vec::new(),
        }
    }

    /// Primary key: the base64 signature.
    pub fn id(&self) -> &str {
        &self.signature
    }

    pub fn is_broadcast(&self) -> bool {
        self.receiver.is_broadcast()
    }

    /// Verify the sender signature over the ciphertext.
    pub fn verify(&self, key: &VerifyingKey) -> Result<(), WireError> {
        let data = B64.decode(&self.data)?;
        let sig = B64.decode(&self.signature)?;
        let sig = Signature::from_slice(&sig).map_err(|_| WireError::Signature)?;
        key.verify(&data, &sig).map_err(|_| WireError::Signature)
    }

    /// The decoded ciphertext bytes. For station-addressed envelopes this is
    /// the JSON command body.
    pub fn payload(&self) -> Result<Vec<u8>, WireError> {
        Ok(B64.decode(&self.data)?)
    }

    pub fn traced_by(&self, station: &Id) -> bool {
        self.traces.iter().any(|t| t.same_identity(station))
    }

    /// Append `station` to the traces. Appending is idempotent: a station
    /// appears at most once no matter how often it handles the envelope.
    pub fn add_trace(&mut self, station: &Id) -> bool {
        if self.traced_by(station) {
            return false;
        }
        self.traces.push(station.clone());
        true
    }

    pub fn to_json(&self) -> Result<Vec<u8>, WireError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, WireError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
