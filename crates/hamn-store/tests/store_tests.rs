// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Disk-backed store behavior: spool ordering and prefix removal, login
//! monotonicity and staleness, group-key merging, roaming drain order.

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use tempfile::TempDir;

use hamn_store::{StationKey, Store};
use hamn_wire::{Envelope, Id, LoginCommand, Meta, NetworkType, Visa};

fn identity(seed: &str) -> (Id, SigningKey, Meta) {
    let sk = SigningKey::generate(&mut OsRng);
    let meta = Meta::generate(seed, &sk);
    let id = meta.derive_id(NetworkType::User).unwrap();
    (id, sk, meta)
}

fn envelope(from: &(Id, SigningKey, Meta), to: &Id, body: &[u8]) -> Envelope {
    Envelope::seal(from.0.clone(), to.clone(), body, &from.1)
}

fn store() -> (Store, TempDir) {
    let dir = TempDir::new().unwrap();
    let store = Store::open(dir.path(), 3).unwrap();
    (store, dir)
}

#[test]
fn appended_envelope_shows_up_in_the_next_batch() {
    let (store, _dir) = store();
    let alice = identity("alice");
    let (bob, _, _) = identity("bob");

    let env = envelope(&alice, &bob, b"one");
    assert!(store.spool.append(&bob, &env).unwrap());

    let batch = store.spool.load_batch(&bob, 20).unwrap().expect("batch");
    assert_eq!(batch.envelopes.len(), 1);
    assert_eq!(batch.envelopes[0].signature, env.signature);
}

#[test]
fn duplicate_append_is_a_noop() {
    let (store, _dir) = store();
    let alice = identity("alice");
    let (bob, _, _) = identity("bob");

    let env = envelope(&alice, &bob, b"dup");
    assert!(store.spool.append(&bob, &env).unwrap());
    assert!(!store.spool.append(&bob, &env).unwrap());

    let batch = store.spool.load_batch(&bob, 20).unwrap().expect("batch");
    assert_eq!(batch.envelopes.len(), 1);
}

#[test]
fn remove_batch_drops_exactly_the_prefix() {
    let (store, _dir) = store();
    let alice = identity("alice");
    let (bob, _, _) = identity("bob");

    for body in [b"a".as_slice(), b"b", b"c"] {
        store.spool.append(&bob, &envelope(&alice, &bob, body)).unwrap();
    }

    let batch = store.spool.load_batch(&bob, 20).unwrap().expect("batch");
    assert_eq!(batch.envelopes.len(), 3);
    store.spool.remove_batch(&batch, 2).unwrap();

    let rest = store.spool.load_batch(&bob, 20).unwrap().expect("rest");
    assert_eq!(rest.envelopes.len(), 1);
    assert_eq!(rest.envelopes[0].signature, batch.envelopes[2].signature);
}

#[test]
fn batches_roll_over_at_the_batch_size() {
    let (store, _dir) = store(); // batch size 3
    let alice = identity("alice");
    let (bob, _, _) = identity("bob");

    for i in 0..5u8 {
        store
            .spool
            .append(&bob, &envelope(&alice, &bob, &[i]))
            .unwrap();
    }

    // Oldest batch first, fully drained before the next one appears.
    let first = store.spool.load_batch(&bob, 20).unwrap().expect("first");
    assert_eq!(first.envelopes.len(), 3);
    store.spool.remove_batch(&first, 3).unwrap();

    let second = store.spool.load_batch(&bob, 20).unwrap().expect("second");
    assert_eq!(second.envelopes.len(), 2);
    store.spool.remove_batch(&second, 2).unwrap();

    assert!(store.spool.load_batch(&bob, 20).unwrap().is_none());
    assert!(store.spool.is_empty(&bob).unwrap());
}

#[test]
fn stale_login_does_not_overwrite_a_newer_one() {
    let (store, _dir) = store();
    let alice = identity("alice");
    let now = chrono::Utc::now().timestamp_millis() as u64;

    let newer = LoginCommand {
        id: alice.0.clone(),
        time: now,
        agent: Some("phone".into()),
        station: None,
    };
    let older = LoginCommand {
        id: alice.0.clone(),
        time: now - 1,
        agent: Some("tablet".into()),
        station: None,
    };
    let env = envelope(&alice, &alice.0, b"login");

    assert!(store.users.save_login(&newer, &env).unwrap());
    assert!(!store.users.save_login(&older, &env).unwrap());

    let record = store.users.load_login(&alice.0).unwrap().expect("login");
    assert_eq!(record.command.agent.as_deref(), Some("phone"));
}

#[test]
fn week_old_login_reads_as_absent() {
    let (store, _dir) = store();
    let alice = identity("alice");
    let now = chrono::Utc::now().timestamp_millis() as u64;

    let ancient = LoginCommand {
        id: alice.0.clone(),
        time: now - 8 * 24 * 3600 * 1000,
        agent: None,
        station: None,
    };
    let env = envelope(&alice, &alice.0, b"login");
    assert!(store.users.save_login(&ancient, &env).unwrap());
    assert!(store.users.load_login(&alice.0).unwrap().is_none());
}

#[test]
fn meta_is_write_once() {
    let (store, _dir) = store();
    let (id, _, meta) = identity("alice");
    let (_, _, other) = identity("alice2");

    assert!(store.users.save_meta(&id, &meta).unwrap());
    assert!(!store.users.save_meta(&id, &other).unwrap());
    assert_eq!(store.users.load_meta(&id).unwrap().unwrap(), meta);
}

#[test]
fn visa_is_last_writer_wins() {
    let (store, _dir) = store();
    let (id, sk, _) = identity("alice");

    store
        .users
        .save_visa(&Visa::sign(id.clone(), r#"{"name":"A"}"#, &sk))
        .unwrap();
    store
        .users
        .save_visa(&Visa::sign(id.clone(), r#"{"name":"Alice"}"#, &sk))
        .unwrap();

    let visa = store.users.load_visa(&id).unwrap().unwrap();
    assert_eq!(visa.name().as_deref(), Some("Alice"));
}

#[test]
fn group_keys_merge_and_ignore_empty_values() {
    let (store, _dir) = store();
    let (sender, _, _) = identity("alice");
    let group: Id = "team@20aabbccddeeff00112233445566778899aabbcc"
        .parse()
        .unwrap();

    let mut first = std::collections::HashMap::new();
    first.insert("m1".to_string(), "k1".to_string());
    first.insert("m2".to_string(), "k2".to_string());
    store.group_keys.save_keys(&group, &sender, &first).unwrap();

    let mut second = std::collections::HashMap::new();
    second.insert("m2".to_string(), "k2b".to_string());
    second.insert("m3".to_string(), String::new()); // ignored
    store.group_keys.save_keys(&group, &sender, &second).unwrap();

    let keys = store.group_keys.load_keys(&group, &sender).unwrap();
    assert_eq!(keys.get("m1").map(String::as_str), Some("k1"));
    assert_eq!(keys.get("m2").map(String::as_str), Some("k2b"));
    assert!(!keys.contains_key("m3"));
}

#[test]
fn roaming_drains_in_insertion_order() {
    let (store, _dir) = store();
    let alice = identity("alice");
    let neighbor: Id = "north@88aabbccddeeff00112233445566778899aabbcc"
        .parse()
        .unwrap();

    let first = envelope(&alice, &neighbor, b"first");
    let second = envelope(&alice, &neighbor, b"second");
    store.roaming.push(&neighbor, &first).unwrap();
    store.roaming.push(&neighbor, &second).unwrap();

    let drained = store.roaming.drain(&neighbor).unwrap();
    assert_eq!(drained.len(), 2);
    assert_eq!(drained[0].signature, first.signature);
    assert_eq!(drained[1].signature, second.signature);
    assert!(store.roaming.drain(&neighbor).unwrap().is_empty());
}

#[test]
fn station_key_is_stable_across_reopens() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(dir.path(), 20).unwrap();
    let first = StationKey::load_or_create(dir.path(), &store.users, "gate").unwrap();
    let second = StationKey::load_or_create(dir.path(), &store.users, "gate").unwrap();
    assert_eq!(first.id, second.id);
    assert!(first.meta.matches(&second.id));
}
