// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Frame-level properties of the Mars codec: round-trips for every command,
//! serialised-length accounting, and resynchronisation after garbage.

use bytes::BytesMut;
use hamn_wire::mars::{MarsCmd, MarsCodec, MarsPackage, HEAD_MIN};
use tokio_util::codec::{Decoder, Encoder};

fn roundtrip(pkg: &MarsPackage) -> MarsPackage {
    let mut codec = MarsCodec::new();
    let mut buf = BytesMut::new();
    codec.encode(pkg.clone(), &mut buf).expect("encode");
    let decoded = codec.decode(&mut buf).expect("decode").expect("complete");
    assert!(buf.is_empty(), "no trailing bytes after a lone frame");
    decoded
}

#[test]
fn every_cmd_round_trips() {
    for cmd in [MarsCmd::SendMsg, MarsCmd::Noop, MarsCmd::PushMessage] {
        let pkg = MarsPackage::new(cmd, 0xDEAD_BEEF, b"body bytes".to_vec());
        assert_eq!(roundtrip(&pkg), pkg);
    }
}

#[test]
fn seq_and_options_are_preserved() {
    let pkg = MarsPackage {
        cmd: MarsCmd::SendMsg,
        seq: u32::MAX,
        options: (0u8..=63).collect(),
        body: vec![0xFF; 1024],
    };
    assert_eq!(roundtrip(&pkg), pkg);
}

#[test]
fn empty_body_round_trips() {
    let pkg = MarsPackage::noop();
    assert_eq!(roundtrip(&pkg), pkg);
}

#[test]
fn serialised_length_is_head_len_plus_body_len() {
    let pkg = MarsPackage {
        cmd: MarsCmd::PushMessage,
        seq: 7,
        options: vec![9; 12],
        body: vec![1; 345],
    };
    let bytes = pkg.encode_to_vec();
    assert_eq!(bytes.len(), pkg.head_len() + pkg.body.len());
    assert_eq!(pkg.head_len(), HEAD_MIN + 12);
}

#[test]
fn resync_recovers_the_frame_after_garbage() {
    // Deterministic pseudo-garbage, sized just under 64 KiB.
    let garbage: Vec<u8> = (0..65_000u32).map(|i| (i.wrapping_mul(31) >> 3) as u8).collect();
    let pkg = MarsPackage::message(11, b"survivor".to_vec());

    let mut bytes = garbage;
    bytes.extend_from_slice(&pkg.encode_to_vec());

    let mut codec = MarsCodec::new();
    let mut buf = BytesMut::from(&bytes[..]);
    let mut decoded = Vec::new();
    while let Some(p) = codec.decode(&mut buf).expect("decode") {
        decoded.push(p);
    }

    let noops = decoded
        .iter()
        .filter(|p| **p == MarsPackage::noop())
        .count();
    assert!(noops <= 1, "at most one synthetic NOOP, got {noops}");
    assert_eq!(decoded.last(), Some(&pkg), "the valid frame must surface");
}

#[test]
fn resync_across_split_reads() {
    let pkg = MarsPackage::message(3, b"chunked".to_vec());
    let mut bytes = vec![0x55u8; 4096];
    bytes.extend_from_slice(&pkg.encode_to_vec());

    let mut codec = MarsCodec::new();
    let mut buf = BytesMut::new();
    let mut decoded = Vec::new();
    for chunk in bytes.chunks(7) {
        buf.extend_from_slice(chunk);
        while let Some(p) = codec.decode(&mut buf).expect("decode") {
            decoded.push(p);
        }
    }

    let noops = decoded
        .iter()
        .filter(|p| **p == MarsPackage::noop())
        .count();
    assert!(noops <= 1, "at most one synthetic NOOP, got {noops}");
    assert_eq!(decoded.last(), Some(&pkg));
}

#[test]
fn back_to_back_frames_decode_in_order() {
    let first = MarsPackage::message(1, b"one".to_vec());
    let second = MarsPackage::push(2, b"two".to_vec());
    let third = MarsPackage::ping(3);

    let mut codec = MarsCodec::new();
    let mut buf = BytesMut::new();
    for pkg in [&first, &second, &third] {
        codec.encode((*pkg).clone(), &mut buf).expect("encode");
    }

    assert_eq!(codec.decode(&mut buf).unwrap(), Some(first));
    assert_eq!(codec.decode(&mut buf).unwrap(), Some(second));
    assert_eq!(codec.decode(&mut buf).unwrap(), Some(third));
    assert_eq!(codec.decode(&mut buf).unwrap(), None);
}
