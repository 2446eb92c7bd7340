// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Meta and visa records.
//!
//! A [`Meta`] binds an ed25519 public key to an address: the address digest
//! is derived from `sha256(key ‖ seed)` and the fingerprint is the holder's
//! signature over the seed, so `Meta::matches` is a pure check requiring no
//! network round-trip. A [`Visa`] is a signed attribute document (display
//! name, avatar hint) verified against the holder's meta.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::id::{Address, Id, NetworkType};
use crate::WireError;

/// Number of digest bytes kept in a concrete address.
const ADDRESS_DIGEST_LEN: usize = 20;

/// Self-describing key-to-address binding. Written once per identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    pub version: u8,
    /// base64 ed25519 public key.
    pub key: String,
    pub seed: String,
    /// base64 signature over the seed bytes, made with the bound key.
    pub fingerprint: String,
}

impl Meta {
    /// Build a meta record for a fresh keypair.
    pub fn generate(seed: impl Into<String>, signing_key: &SigningKey) -> Self {
        let seed = seed.into();
        let fingerprint = signing_key.sign(seed.as_bytes());
        Self {
            version: 1,
            key: B64.encode(signing_key.verifying_key().as_bytes()),
            seed,
            fingerprint: B64.encode(fingerprint.to_bytes()),
        }
    }

    pub fn verifying_key(&self) -> Result<VerifyingKey, WireError> {
        let bytes = B64.decode(&self.key)?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| WireError::MetaVerify)?;
        VerifyingKey::from_bytes(&bytes).map_err(|_| WireError::MetaVerify)
    }

    /// The fingerprint must be a valid self-signature over the seed.
    pub fn is_valid(&self) -> bool {
        let Ok(key) = self.verifying_key() else {
            return false;
        };
        let Ok(sig) = B64.decode(&self.fingerprint) else {
            return false;
        };
        let Ok(sig) = Signature::from_slice(&sig) else {
            return false;
        };
        key.verify(self.seed.as_bytes(), &sig).is_ok()
    }

    /// Derive the concrete address this meta generates on `network`.
    pub fn derive_address(&self, network: NetworkType) -> Result<Address, WireError> {
        let key = B64.decode(&self.key)?;
        let mut hasher = Sha256::new();
        hasher.update(&key);
        hasher.update(self.seed.as_bytes());
        let digest = hasher.finalize();
        Ok(Address::Concrete {
            network,
            digest: hex::encode(&digest[..ADDRESS_DIGEST_LEN]),
        })
    }

    /// Derive the full identity (`seed` becomes the name).
    pub fn derive_id(&self, network: NetworkType) -> Result<Id, WireError> {
        Ok(Id::new(self.seed.clone(), self.derive_address(network)?))
    }

    /// Pure meta-to-identity check: valid fingerprint and matching address.
    pub fn matches(&self, id: &Id) -> bool {
        if !self.is_valid() {
            return false;
        }
        let Some(network) = id.network() else {
            return false;
        };
        match self.derive_address(network) {
            Ok(addr) => addr == id.address,
            Err(_) => false,
        }
    }
}

/// Signed attribute document of an identity (a.k.a. profile).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Visa {
    pub id: Id,
    /// JSON document string, e.g. `{"name":"Alice","avatar":"…"}`.
    pub data: String,
    /// base64 signature over the document bytes.
    pub signature: String,
}

impl Visa {
    pub fn sign(id: Id, data: impl Into<String>, signing_key: &SigningKey) -> Self {
        let data = data.into();
        let signature = B64.encode(signing_key.sign(data.as_bytes()).to_bytes());
        Self {
            id,
            data,
            signature,
        }
    }

    /// Verify the document signature against the holder's meta.
    pub fn verify(&self, meta: &Meta) -> bool {
        let Ok(key) = meta.verifying_key() else {
            return false;
        };
        let Ok(sig) = B64.decode(&self.signature) else {
            return false;
        };
        let Ok(sig) = Signature::from_slice(&sig) else {
            return false;
        };
        key.verify(self.data.as_bytes(), &sig).is_ok()
    }

    /// Display name from the document, if present.
    pub fn name(&self) -> Option<String> {
        let doc: serde_json::Value = serde_json::from_str(&self.data).ok()?;
        doc.get("name")?.as_str().map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn keypair() -> SigningKey {
        SigningKey::generate(&mut OsRng)
    }

    #[test]
    fn generated_meta_matches_its_derived_id() {
        let sk = keypair();
        let meta = Meta::generate("alice", &sk);
        assert!(meta.is_valid());
        let id = meta.derive_id(NetworkType::User).unwrap();
        assert!(meta.matches(&id));
    }

    #[test]
    fn meta_rejects_a_foreign_id() {
        let meta = Meta::generate("alice", &keypair());
        let other = Meta::generate("mallory", &keypair());
        let stolen = other.derive_id(NetworkType::User).unwrap();
        assert!(!meta.matches(&stolen));
    }

    #[test]
    fn tampered_fingerprint_invalidates_meta() {
        let sk = keypair();
        let mut meta = Meta::generate("alice", &sk);
        meta.seed = "eve".into();
        assert!(!meta.is_valid());
    }

    #[test]
    fn visa_verifies_only_with_the_matching_meta() {
        let sk = keypair();
        let meta = Meta::generate("alice", &sk);
        let id = meta.derive_id(NetworkType::User).unwrap();
        let visa = Visa::sign(id, r#"{"name":"Alice"}"#, &sk);
        assert!(visa.verify(&meta));
        assert_eq!(visa.name().as_deref(), Some("Alice"));

        let other = Meta::generate("mallory", &keypair());
        assert!(!visa.verify(&other));
    }
}
