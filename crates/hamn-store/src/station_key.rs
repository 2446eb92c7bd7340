// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The station's own signing identity, persisted so the station keeps a
//! stable ID across restarts. Neighbors verify the station's envelopes
//! against the meta published in the public store.

use std::path::Path;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tracing::info;

use hamn_wire::{Id, Meta, NetworkType};

use crate::fs::{read_json, write_json_atomic};
use crate::{StoreError, UserStore};

#[derive(Debug, Serialize, Deserialize)]
struct KeyFile {
    /// base64 ed25519 seed.
    seed: String,
    name: String,
}

/// Loaded or freshly generated station identity.
pub struct StationKey {
    pub id: Id,
    pub meta: Meta,
    pub signing_key: SigningKey,
}

impl StationKey {
    /// Load `private/station.js`, generating a new keypair on first boot and
    /// publishing the derived meta to the public store.
    pub fn load_or_create(
        root: &Path,
        users: &UserStore,
        name: &str,
    ) -> Result<Self, StoreError> {
        let path = root.join("private").join("station.js");

        let (signing_key, name) = match read_json::<KeyFile>(&path)? {
            Some(file) => {
                let seed = B64
                    .decode(&file.seed)
                    .map_err(hamn_wire::WireError::from)?;
                let seed: [u8; 32] = seed.try_into().map_err(|_| {
                    StoreError::Io(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "station key has a bad seed length",
                    ))
                })?;
                (SigningKey::from_bytes(&seed), file.name)
            }
            None => {
                let key = SigningKey::generate(&mut OsRng);
                write_json_atomic(
                    &path,
                    &KeyFile {
                        seed: B64.encode(key.to_bytes()),
                        name: name.to_string(),
                    },
                )?;
                info!(name, "generated a fresh station keypair");
                (key, name.to_string())
            }
        };

        let meta = Meta::generate(name, &signing_key);
        let id = meta.derive_id(NetworkType::Station)?;
        users.save_meta(&id, &meta)?;

        Ok(Self {
            id,
            meta,
            signing_key,
        })
    }
}
