// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Per-user durable records: meta (write-once), visa (last-writer-wins) and
//! the login record (monotonic on command time, stale after seven days).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

use hamn_wire::{Envelope, Id, LoginCommand, Meta, Visa};

use crate::fs::{read_json, write_json_atomic};
use crate::StoreError;

/// Logins older than this read as absent.
const LOGIN_TTL_MS: u64 = 7 * 24 * 3600 * 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRecord {
    pub command: LoginCommand,
    pub envelope: Envelope,
}

#[derive(Debug, Clone)]
pub struct UserStore {
    root: PathBuf,
}

impl UserStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn dir(&self, id: &Id) -> PathBuf {
        self.root.join(id.address.to_string())
    }

    /// Meta is written once per identity; a second save is a no-op.
    pub fn save_meta(&self, id: &Id, meta: &Meta) -> Result<bool, StoreError> {
        let path = self.dir(id).join("meta.js");
        if read_json::<Meta>(&path)?.is_some() {
            debug!(id = %id, "meta already on file");
            return Ok(false);
        }
        write_json_atomic(&path, meta)?;
        Ok(true)
    }

    pub fn load_meta(&self, id: &Id) -> Result<Option<Meta>, StoreError> {
        read_json(&self.dir(id).join("meta.js"))
    }

    /// Caller is responsible for signature verification; the store only does
    /// last-writer-wins.
    pub fn save_visa(&self, visa: &Visa) -> Result<(), StoreError> {
        write_json_atomic(&self.dir(&visa.id).join("profile.js"), visa)
    }

    pub fn load_visa(&self, id: &Id) -> Result<Option<Visa>, StoreError> {
        read_json(&self.dir(id).join("profile.js"))
    }

    /// Store the latest login. A command whose time is not strictly newer
    /// than the stored one is dropped (`Ok(false)`).
    pub fn save_login(
        &self,
        command: &LoginCommand,
        envelope: &Envelope,
    ) -> Result<bool, StoreError> {
        let path = self.dir(&command.id).join("login.js");
        if let Some(stored) = read_json::<LoginRecord>(&path)? {
            if command.time <= stored.command.time {
                debug!(id = %command.id, "stale login dropped");
                return Ok(false);
            }
        }
        write_json_atomic(
            &path,
            &LoginRecord {
                command: command.clone(),
                envelope: envelope.clone(),
            },
        )?;
        Ok(true)
    }

    /// The last login record, or `None` when absent or older than the TTL.
    pub fn load_login(&self, id: &Id) -> Result<Option<LoginRecord>, StoreError> {
        let Some(record) = read_json::<LoginRecord>(&self.dir(id).join("login.js"))? else {
            return Ok(None);
        };
        let now = chrono::Utc::now().timestamp_millis() as u64;
        if now.saturating_sub(record.command.time) > LOGIN_TTL_MS {
            return Ok(None);
        }
        Ok(Some(record))
    }
}
