// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Roaming spool — envelopes a neighbor worker could not deliver.
//!
//! One numbered file per envelope. Each neighbor's worker is the sole
//! reader and writer of its own directory.

use std::path::PathBuf;

use hamn_wire::{Envelope, Id};

use crate::fs::{read_json, write_json_atomic};
use crate::StoreError;

#[derive(Debug, Clone)]
pub struct RoamingStore {
    root: PathBuf,
}

impl RoamingStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn dir(&self, neighbor: &Id) -> PathBuf {
        self.root.join(neighbor.address.to_string())
    }

    fn numbers(&self, neighbor: &Id) -> Result<Vec<u64>, StoreError> {
        let mut numbers = Vec::new();
        let entries = match std::fs::read_dir(self.dir(neighbor)) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(numbers),
            Err(err) => return Err(err.into()),
        };
        for entry in entries {
            let name = entry?.file_name();
            if let Some(n) = name
                .to_str()
                .and_then(|name| name.strip_suffix(".msg"))
                .and_then(|n| n.parse().ok())
            {
                numbers.push(n);
            }
        }
        numbers.sort_unstable();
        Ok(numbers)
    }

    /// Park an undeliverable envelope for a later retry.
    pub fn push(&self, neighbor: &Id, envelope: &Envelope) -> Result<u64, StoreError> {
        let n = self.numbers(neighbor)?.last().map(|n| n + 1).unwrap_or(0);
        let path = self.dir(neighbor).join(format!("{n}.msg"));
        write_json_atomic(&path, envelope)?;
        Ok(n)
    }

    /// Take every parked envelope, oldest first, deleting the files.
    pub fn drain(&self, neighbor: &Id) -> Result<Vec<Envelope>, StoreError> {
        let mut envelopes = Vec::new();
        for n in self.numbers(neighbor)? {
            let path = self.dir(neighbor).join(format!("{n}.msg"));
            if let Some(envelope) = read_json::<Envelope>(&path)? {
                envelopes.push(envelope);
            }
            std::fs::remove_file(&path)?;
        }
        Ok(envelopes)
    }
}
