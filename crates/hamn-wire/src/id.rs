// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Network identities.
//!
//! An [`Id`] is an opaque textual handle of the form `name@address` or
//! `name@address/terminal`. The address carries a single-byte network type
//! and a hex digest derived from the holder's meta, except for the two
//! distinguished broadcast forms `anywhere` and `everywhere`.
//!
//! Ids are immutable once parsed and serialize as plain strings.

use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::WireError;

/// Single-byte network type tag partitioning the identity space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NetworkType {
    User = 0x08,
    Polylogue = 0x10,
    Group = 0x20,
    Station = 0x88,
    Robot = 0xC8,
}

impl NetworkType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x08 => Some(Self::User),
            0x10 => Some(Self::Polylogue),
            0x20 => Some(Self::Group),
            0x88 => Some(Self::Station),
            0xC8 => Some(Self::Robot),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Group-like networks (explicit groups and founder-derived polylogues).
    pub fn is_group(self) -> bool {
        matches!(self, Self::Group | Self::Polylogue)
    }
}

/// Short address of an identity.
///
/// Concrete addresses are `<network-byte-hex><digest-hex>`; the broadcast
/// forms are the literal strings `anywhere` and `everywhere`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// "Any station" broadcast form.
    Anywhere,
    /// "Everyone" broadcast form.
    Everywhere,
    Concrete { network: NetworkType, digest: String },
}

impl Address {
    pub fn is_broadcast(&self) -> bool {
        matches!(self, Self::Anywhere | Self::Everywhere)
    }

    pub fn network(&self) -> Option<NetworkType> {
        match self {
            Self::Concrete { network, .. } => Some(*network),
            _ => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anywhere => write!(f, "anywhere"),
            Self::Everywhere => write!(f, "everywhere"),
            Self::Concrete { network, digest } => {
                write!(f, "{:02x}{}", network.as_byte(), digest)
            }
        }
    }
}

impl FromStr for Address {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "anywhere" => return Ok(Self::Anywhere),
            "everywhere" => return Ok(Self::Everywhere),
            _ => {}
        }
        if s.len() < 4 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(WireError::BadId(format!("bad address: {s:?}")));
        }
        let byte = u8::from_str_radix(&s[..2], 16)
            .map_err(|_| WireError::BadId(format!("bad address: {s:?}")))?;
        let network = NetworkType::from_byte(byte)
            .ok_or_else(|| WireError::BadId(format!("unknown network type 0x{byte:02x}")))?;
        Ok(Self::Concrete {
            network,
            digest: s[2..].to_ascii_lowercase(),
        })
    }
}

/// A parsed identity: `name@address[/terminal]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Id {
    pub name: Option<String>,
    pub address: Address,
    pub terminal: Option<String>,
}

impl Id {
    pub fn new(name: impl Into<String>, address: Address) -> Self {
        Self {
            name: Some(name.into()),
            address,
            terminal: None,
        }
    }

    /// The "any station" broadcast identity.
    pub fn any_station() -> Self {
        Self::new("station", Address::Anywhere)
    }

    /// The "everyone" broadcast identity.
    pub fn everyone() -> Self {
        Self::new("everyone", Address::Everywhere)
    }

    pub fn is_broadcast(&self) -> bool {
        self.address.is_broadcast()
    }

    pub fn network(&self) -> Option<NetworkType> {
        self.address.network()
    }

    pub fn is_station(&self) -> bool {
        self.network() == Some(NetworkType::Station)
    }

    pub fn is_group(&self) -> bool {
        self.network().map(NetworkType::is_group).unwrap_or(false)
    }

    pub fn is_user(&self) -> bool {
        matches!(
            self.network(),
            Some(NetworkType::User) | Some(NetworkType::Robot)
        )
    }

    /// Identity equality ignoring the terminal suffix.
    ///
    /// Two logins of the same account on different devices share an address
    /// but not a terminal.
    pub fn same_identity(&self, other: &Id) -> bool {
        self.address == other.address
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.name {
            write!(f, "{name}@")?;
        }
        write!(f, "{}", self.address)?;
        if let Some(terminal) = &self.terminal {
            write!(f, "/{terminal}")?;
        }
        Ok(())
    }
}

impl FromStr for Id {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (body, terminal) = match s.split_once('/') {
            Some((body, term)) if !term.is_empty() => (body, Some(term.to_string())),
            Some((body, _)) => (body, None),
            None => (s, None),
        };
        let (name, addr) = match body.split_once('@') {
            Some((name, addr)) if !addr.is_empty() => {
                let name = (!name.is_empty()).then(|| name.to_string());
                (name, addr)
            }
            Some(_) => return Err(WireError::BadId(format!("empty address in {s:?}"))),
            None => (None, body),
        };
        Ok(Self {
            name,
            address: addr.parse()?,
            terminal,
        })
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}
