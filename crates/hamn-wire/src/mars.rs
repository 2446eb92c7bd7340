// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Mars framing — the TCP wire format carrying every envelope.
//!
//! Package layout, big-endian:
//!
//! ```text
//! [head_len:4][version:4][cmd:4][seq:4][body_len:4][options:head_len-20][body:body_len]
//! ```
//!
//! `version` is fixed at 200. On a corrupt header the decoder resynchronises
//! by scanning forward for the next plausible version word, drops the bytes
//! scanned past, and synthesises one empty `NOOP` so the peer sees a
//! liveness signal instead of silence.
//!
//! The bodies `"PING"`, `"PONG"` and `"NOOP"` are reserved liveness markers
//! and never reach the dispatcher.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::WireError;

pub const MARS_VERSION: u32 = 200;

/// Fixed header size; `head_len` may exceed it by the options length.
pub const HEAD_MIN: usize = 20;
/// Sanity cap on `head_len` when validating a candidate header.
pub const MAX_HEAD_BYTES: usize = 1024;
/// Max body size: 8 MiB covers large attachment envelopes.
pub const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

pub const BODY_PING: &[u8] = b"PING";
pub const BODY_PONG: &[u8] = b"PONG";
pub const BODY_NOOP: &[u8] = b"NOOP";

/// Commands a station accepts; anything else is a framing error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MarsCmd {
    SendMsg = 3,
    Noop = 6,
    PushMessage = 10001,
}

impl MarsCmd {
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            3 => Some(Self::SendMsg),
            6 => Some(Self::Noop),
            10001 => Some(Self::PushMessage),
            _ => None,
        }
    }
}

/// One framed package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarsPackage {
    pub cmd: MarsCmd,
    /// Opaque request identifier; a response carries the same value.
    pub seq: u32,
    pub options: Vec<u8>,
    pub body: Vec<u8>,
}

impl MarsPackage {
    pub fn new(cmd: MarsCmd, seq: u32, body: Vec<u8>) -> Self {
        Self {
            cmd,
            seq,
            options: Vec::new(),
            body,
        }
    }

    /// Empty-body NOOP, also the frame synthesised on resync.
    pub fn noop() -> Self {
        Self::new(MarsCmd::Noop, 0, Vec::new())
    }

    pub fn ping(seq: u32) -> Self {
        Self::new(MarsCmd::Noop, seq, BODY_PING.to_vec())
    }

    pub fn pong(seq: u32) -> Self {
        Self::new(MarsCmd::Noop, seq, BODY_PONG.to_vec())
    }

    pub fn message(seq: u32, body: Vec<u8>) -> Self {
        Self::new(MarsCmd::SendMsg, seq, body)
    }

    pub fn push(seq: u32, body: Vec<u8>) -> Self {
        Self::new(MarsCmd::PushMessage, seq, body)
    }

    pub fn head_len(&self) -> usize {
        HEAD_MIN + self.options.len()
    }

    /// Serialised size: `head_len + body_len`.
    pub fn encoded_len(&self) -> usize {
        self.head_len() + self.body.len()
    }

    /// True for the reserved liveness bodies that must not reach the
    /// dispatcher.
    pub fn is_liveness(&self) -> bool {
        self.body.is_empty()
            || self.body == BODY_PING
            || self.body == BODY_PONG
            || self.body == BODY_NOOP
    }

    pub fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        write_package(self, &mut buf);
        buf.to_vec()
    }
}

fn write_package(pkg: &MarsPackage, dst: &mut BytesMut) {
    dst.reserve(pkg.encoded_len());
    dst.put_u32(pkg.head_len() as u32);
    dst.put_u32(MARS_VERSION);
    dst.put_u32(pkg.cmd as u32);
    dst.put_u32(pkg.seq);
    dst.put_u32(pkg.body.len() as u32);
    dst.put_slice(&pkg.options);
    dst.put_slice(&pkg.body);
}

/// Streaming codec with resynchronisation.
#[derive(Debug, Default)]
pub struct MarsCodec {
    /// Set while skipping a corruption burst; the synthetic NOOP is emitted
    /// once per burst, on the first bad header.
    resyncing: bool,
}

impl MarsCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance `src` to the next plausible header start, or drop everything
    /// but a header-sized tail when none is in sight.
    fn skip_to_candidate(src: &mut BytesMut) {
        let version = MARS_VERSION.to_be_bytes();
        let len = src.len();
        let mut found = None;
        if len >= 8 {
            for i in 1..=(len - 8) {
                if src[i + 4..i + 8] != version {
                    continue;
                }
                let head_len =
                    u32::from_be_bytes([src[i], src[i + 1], src[i + 2], src[i + 3]]) as usize;
                if (HEAD_MIN..=MAX_HEAD_BYTES).contains(&head_len) {
                    found = Some(i);
                    break;
                }
            }
        }
        match found {
            Some(i) => src.advance(i),
            None => {
                // Keep a partial-header tail so a version word split across
                // reads is not lost.
                let keep = len.min(HEAD_MIN - 1);
                src.advance(len - keep);
            }
        }
    }
}

impl Decoder for MarsCodec {
    type Item = MarsPackage;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<MarsPackage>, WireError> {
        loop {
            if src.len() < HEAD_MIN {
                return Ok(None);
            }
            let head_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
            let version = u32::from_be_bytes([src[4], src[5], src[6], src[7]]);
            let cmd_raw = u32::from_be_bytes([src[8], src[9], src[10], src[11]]);
            let seq = u32::from_be_bytes([src[12], src[13], src[14], src[15]]);
            let body_len = i32::from_be_bytes([src[16], src[17], src[18], src[19]]);

            let cmd = MarsCmd::from_u32(cmd_raw);
            let header_ok = (HEAD_MIN..=MAX_HEAD_BYTES).contains(&head_len)
                && version == MARS_VERSION
                && cmd.is_some()
                && body_len >= 0
                && (body_len as usize) <= MAX_BODY_BYTES;

            let Some(cmd) = cmd.filter(|_| header_ok) else {
                let already = std::mem::replace(&mut self.resyncing, true);
                Self::skip_to_candidate(src);
                if !already {
                    return Ok(Some(MarsPackage::noop()));
                }
                continue;
            };

            let total = head_len + body_len as usize;
            if src.len() < total {
                src.reserve(total - src.len());
                return Ok(None);
            }

            let frame = src.split_to(total);
            self.resyncing = false;
            return Ok(Some(MarsPackage {
                cmd,
                seq,
                options: frame[HEAD_MIN..head_len].to_vec(),
                body: frame[head_len..].to_vec(),
            }));
        }
    }
}

impl Encoder<MarsPackage> for MarsCodec {
    type Error = WireError;

    fn encode(&mut self, pkg: MarsPackage, dst: &mut BytesMut) -> Result<(), WireError> {
        if pkg.body.len() > MAX_BODY_BYTES {
            return Err(WireError::Framing(format!(
                "body of {} bytes exceeds the {} byte cap",
                pkg.body.len(),
                MAX_BODY_BYTES
            )));
        }
        write_package(&pkg, dst);
        Ok(())
    }
}
