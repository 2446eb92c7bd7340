// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! On-disk persistence for the relay station.
//!
//! Everything lives under one configurable base directory:
//!
//! ```text
//! private/station.js                          station's own keypair
//! private/{address}/secret.js                 user's encrypted key (opaque)
//! public/{address}/meta.js|profile.js|login.js
//! protected/{group}/group-keys-{sender}.js
//! messages/{recipient}/batch-{n}.msg          offline spool
//! roaming/{neighbor}/{n}.msg                  undeliverable cross-station envelopes
//! ```
//!
//! Every file is JSON written via write-temp-then-rename.

mod fs;
pub mod group_keys;
pub mod roaming;
pub mod spool;
pub mod station_key;
pub mod users;

use std::path::{Path, PathBuf};

use thiserror::Error;

pub use group_keys::GroupKeyStore;
pub use roaming::RoamingStore;
pub use spool::{Batch, Spool};
pub use station_key::StationKey;
pub use users::{LoginRecord, UserStore};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("storage full")]
    Full,

    #[error("wire: {0}")]
    Wire(#[from] hamn_wire::WireError),
}

/// Handle to the whole persistent layout. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
    pub spool: Spool,
    pub users: UserStore,
    pub group_keys: GroupKeyStore,
    pub roaming: RoamingStore,
}

impl Store {
    /// Open (creating if needed) the base directory and probe it for
    /// writability, so an unreachable volume fails at startup rather than on
    /// the first envelope.
    pub fn open(root: impl Into<PathBuf>, batch_size: usize) -> Result<Self, StoreError> {
        let root = root.into();
        for sub in ["private", "public", "protected", "messages", "roaming"] {
            std::fs::create_dir_all(root.join(sub))?;
        }
        fs::probe_writable(&root)?;
        Ok(Self {
            spool: Spool::new(root.join("messages"), batch_size),
            users: UserStore::new(root.join("public")),
            group_keys: GroupKeyStore::new(root.join("protected")),
            roaming: RoamingStore::new(root.join("roaming")),
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}
