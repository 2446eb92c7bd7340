// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Offline spool — per-recipient FIFO of reliable envelopes.
//!
//! Each recipient owns a directory of numbered batch files; appends fill the
//! newest batch until it reaches the batch size, reads drain the oldest.
//! Access is serialised per recipient, matching the one-writer contract of
//! the dispatcher/receptionist pair.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::debug;

use hamn_wire::{Envelope, Id};

use crate::fs::{read_json, write_json_atomic};
use crate::StoreError;

pub const DEFAULT_BATCH_SIZE: usize = 20;

#[derive(Debug, Serialize, Deserialize)]
struct BatchFile {
    count: usize,
    messages: Vec<Envelope>,
}

/// One loaded batch, handed to the receptionist.
#[derive(Debug, Clone)]
pub struct Batch {
    pub recipient: Id,
    file_no: u64,
    pub envelopes: Vec<Envelope>,
}

#[derive(Debug, Clone)]
pub struct Spool {
    root: PathBuf,
    batch_size: usize,
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl Spool {
    pub fn new(root: PathBuf, batch_size: usize) -> Self {
        Self {
            root,
            batch_size: batch_size.max(1),
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock_for(&self, recipient: &Id) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(recipient.address.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn dir(&self, recipient: &Id) -> PathBuf {
        self.root.join(recipient.address.to_string())
    }

    fn batch_path(&self, recipient: &Id, n: u64) -> PathBuf {
        self.dir(recipient).join(format!("batch-{n}.msg"))
    }

    /// Batch numbers present for `recipient`, ascending.
    fn batch_numbers(&self, recipient: &Id) -> Result<Vec<u64>, StoreError> {
        let dir = self.dir(recipient);
        let mut numbers = Vec::new();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(numbers),
            Err(err) => return Err(err.into()),
        };
        for entry in entries {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(n) = name
                .strip_prefix("batch-")
                .and_then(|rest| rest.strip_suffix(".msg"))
                .and_then(|n| n.parse().ok())
            {
                numbers.push(n);
            }
        }
        numbers.sort_unstable();
        Ok(numbers)
    }

    /// Append one envelope. Appending a signature equal to the last appended
    /// one is a no-op (`Ok(false)`), which makes redelivery idempotent.
    pub fn append(&self, recipient: &Id, envelope: &Envelope) -> Result<bool, StoreError> {
        let lock = self.lock_for(recipient);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let numbers = self.batch_numbers(recipient)?;
        let tail = numbers.last().copied();

        let (n, mut batch) = match tail {
            Some(n) => {
                let batch: BatchFile = read_json(&self.batch_path(recipient, n))?
                    .unwrap_or(BatchFile {
                        count: 0,
                        messages: Vec::new(),
                    });
                (n, batch)
            }
            None => (
                0,
                BatchFile {
                    count: 0,
                    messages: Vec::new(),
                },
            ),
        };

        if batch
            .messages
            .last()
            .is_some_and(|last| last.signature == envelope.signature)
        {
            debug!(recipient = %recipient, "duplicate append skipped");
            return Ok(false);
        }

        if batch.messages.len() >= self.batch_size {
            batch = BatchFile {
                count: 0,
                messages: Vec::new(),
            };
            return self.write_batch(recipient, n + 1, batch, envelope);
        }
        self.write_batch(recipient, n, batch, envelope)
    }

    fn write_batch(
        &self,
        recipient: &Id,
        n: u64,
        mut batch: BatchFile,
        envelope: &Envelope,
    ) -> Result<bool, StoreError> {
        batch.messages.push(envelope.clone());
        batch.count = batch.messages.len();
        write_json_atomic(&self.batch_path(recipient, n), &batch)?;
        Ok(true)
    }

    /// Load the oldest batch, up to `max` envelopes. `None` when the spool is
    /// empty.
    pub fn load_batch(&self, recipient: &Id, max: usize) -> Result<Option<Batch>, StoreError> {
        let lock = self.lock_for(recipient);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        for n in self.batch_numbers(recipient)? {
            let Some(mut file) = read_json::<BatchFile>(&self.batch_path(recipient, n))? else {
                continue;
            };
            if file.messages.is_empty() {
                std::fs::remove_file(self.batch_path(recipient, n))?;
                continue;
            }
            file.messages.truncate(max.max(1));
            return Ok(Some(Batch {
                recipient: recipient.clone(),
                file_no: n,
                envelopes: file.messages,
            }));
        }
        Ok(None)
    }

    /// Remove the first `removed` entries of `batch` from disk, preserving
    /// the rest in order.
    pub fn remove_batch(&self, batch: &Batch, removed: usize) -> Result<(), StoreError> {
        if removed == 0 {
            return Ok(());
        }
        let lock = self.lock_for(&batch.recipient);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let path = self.batch_path(&batch.recipient, batch.file_no);
        let Some(mut file) = read_json::<BatchFile>(&path)? else {
            return Ok(());
        };
        let removed = removed.min(file.messages.len());
        file.messages.drain(..removed);
        file.count = file.messages.len();
        if file.messages.is_empty() {
            std::fs::remove_file(&path)?;
        } else {
            write_json_atomic(&path, &file)?;
        }
        Ok(())
    }

    /// Whether any batch exists for `recipient`.
    pub fn is_empty(&self, recipient: &Id) -> Result<bool, StoreError> {
        Ok(self.batch_numbers(recipient)?.is_empty())
    }
}
