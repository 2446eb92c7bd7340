// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Group member key cache, kept by assistant-role stations.
//!
//! `(group, sender) → {member-address → encrypted key}`, merged
//! last-writer-wins per member. Empty values never overwrite a stored key.

use std::collections::HashMap;
use std::path::PathBuf;

use hamn_wire::Id;

use crate::fs::{read_json, write_json_atomic};
use crate::StoreError;

#[derive(Debug, Clone)]
pub struct GroupKeyStore {
    root: PathBuf,
}

impl GroupKeyStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn path(&self, group: &Id, sender: &Id) -> PathBuf {
        self.root
            .join(group.address.to_string())
            .join(format!("group-keys-{}.js", sender.address))
    }

    pub fn save_keys(
        &self,
        group: &Id,
        sender: &Id,
        keys: &HashMap<String, String>,
    ) -> Result<(), StoreError> {
        let path = self.path(group, sender);
        let mut stored: HashMap<String, String> = read_json(&path)?.unwrap_or_default();
        for (member, key) in keys {
            if key.is_empty() {
                continue;
            }
            stored.insert(member.clone(), key.clone());
        }
        write_json_atomic(&path, &stored)
    }

    pub fn load_keys(
        &self,
        group: &Id,
        sender: &Id,
    ) -> Result<HashMap<String, String>, StoreError> {
        Ok(read_json(&self.path(group, sender))?.unwrap_or_default())
    }
}
