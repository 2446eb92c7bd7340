// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! End-to-end scenarios over loopback TCP: handshake, local delivery,
//! offline spool drain, suspend-until-key, the unsupported-command
//! fallback, and cross-station bridging with broadcast loop freedom.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use ed25519_dalek::SigningKey;
use futures::{SinkExt, StreamExt};
use rand::rngs::OsRng;
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::codec::Framed;

use hamn_station::{
    start, NeighborConfig, Running, StationConfig, RECEIPT_BROADCAST, RECEIPT_CACHED,
    RECEIPT_FORWARDED, RECEIPT_RESPOND,
};
use hamn_store::{StationKey, Store};
use hamn_wire::{
    Command, Envelope, HandshakeCommand, HandshakePhase, Id, MarsCmd, MarsCodec, MarsPackage,
    Meta, NetworkType, BODY_PING,
};

const STEP: Duration = Duration::from_secs(10);

struct Identity {
    id: Id,
    sk: SigningKey,
    meta: Meta,
}

fn identity(seed: &str) -> Identity {
    let sk = SigningKey::generate(&mut OsRng);
    let meta = Meta::generate(seed, &sk);
    let id = meta.derive_id(NetworkType::User).unwrap();
    Identity { id, sk, meta }
}

struct TestClient {
    framed: Framed<TcpStream, MarsCodec>,
    me: Identity,
    seq: u32,
    station: Option<Id>,
    pushes: VecDeque<Envelope>,
}

impl TestClient {
    async fn connect(addr: SocketAddr, me: Identity) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        Self {
            framed: Framed::new(stream, MarsCodec::new()),
            me,
            seq: 1,
            station: None,
            pushes: VecDeque::new(),
        }
    }

    /// Seal a payload, always shipping our meta for first contact.
    fn seal(&self, receiver: &Id, body: &[u8]) -> Envelope {
        let mut env = Envelope::seal(self.me.id.clone(), receiver.clone(), body, &self.me.sk);
        env.meta = Some(self.me.meta.clone());
        env
    }

    /// Send and wait for the station's reply frame (same seq). `None` when
    /// the station answered with an empty body.
    async fn send_envelope(&mut self, env: &Envelope) -> Option<Envelope> {
        self.seq += 1;
        let seq = self.seq;
        self.framed
            .send(MarsPackage::message(seq, env.to_json().unwrap()))
            .await
            .expect("send frame");
        loop {
            let pkg = self.recv_frame().await.expect("reply frame");
            if pkg.seq == seq {
                if pkg.body.is_empty() {
                    return None;
                }
                return Some(Envelope::from_json(&pkg.body).expect("reply envelope"));
            }
            // Unrelated data frame: a push; keep it for later.
            if !pkg.body.is_empty() {
                if let Ok(push) = Envelope::from_json(&pkg.body) {
                    self.pushes.push_back(push);
                }
            }
        }
    }

    /// Next data frame, answering pings on the way. NOOP frames are
    /// liveness; an empty body on a data command is a real (silent) reply.
    async fn recv_frame(&mut self) -> Option<MarsPackage> {
        loop {
            let frame = timeout(STEP, self.framed.next()).await.ok()??.ok()?;
            if frame.cmd == MarsCmd::Noop {
                if frame.body == BODY_PING {
                    let _ = self.framed.send(MarsPackage::pong(frame.seq)).await;
                }
                continue;
            }
            return Some(frame);
        }
    }

    async fn recv_push(&mut self) -> Option<Envelope> {
        if let Some(env) = self.pushes.pop_front() {
            return Some(env);
        }
        loop {
            let pkg = self.recv_frame().await?;
            if pkg.body.is_empty() {
                continue;
            }
            if let Ok(env) = Envelope::from_json(&pkg.body) {
                return Some(env);
            }
        }
    }

    async fn try_recv_push(&mut self, wait: Duration) -> Option<Envelope> {
        timeout(wait, self.recv_push()).await.ok().flatten()
    }

    /// Challenge–response: start → again(key) → start(key) → success.
    async fn handshake(&mut self) {
        let cmd = Command::Handshake(HandshakeCommand::start(None));
        let env = self.seal(&Id::any_station(), &cmd.to_json().unwrap());
        let reply = self.send_envelope(&env).await.expect("challenge reply");
        let station = reply.sender.clone();
        let challenge = match Command::from_json(&reply.payload().unwrap()).unwrap() {
            Command::Handshake(h) => h,
            other => panic!("expected a handshake challenge, got {other:?}"),
        };
        assert_eq!(challenge.phase, HandshakePhase::Again);
        let key = challenge.session.expect("session key");

        let cmd = Command::Handshake(HandshakeCommand::start(Some(key)));
        let env = self.seal(&station, &cmd.to_json().unwrap());
        let reply = self.send_envelope(&env).await.expect("success reply");
        let done = match Command::from_json(&reply.payload().unwrap()).unwrap() {
            Command::Handshake(h) => h,
            other => panic!("expected handshake success, got {other:?}"),
        };
        assert_eq!(done.phase, HandshakePhase::Success);
        self.station = Some(station);
    }

    fn receipt_message(reply: &Envelope) -> String {
        match Command::from_json(&reply.payload().unwrap()).unwrap() {
            Command::Receipt(receipt) => receipt.message,
            other => panic!("expected a receipt, got {other:?}"),
        }
    }
}

fn config_for(dir: &TempDir) -> StationConfig {
    StationConfig {
        base_dir: dir.path().to_path_buf(),
        station_host: "127.0.0.1".into(),
        station_port: 0,
        ws_port: 0,
        ..StationConfig::default()
    }
}

async fn start_station(dir: &TempDir) -> Running {
    start(config_for(dir)).await.expect("station start")
}

/// Fix a station's identity before it runs, so mesh configs can reference
/// each other.
fn station_identity(dir: &TempDir) -> Id {
    let store = Store::open(dir.path(), 20).unwrap();
    StationKey::load_or_create(dir.path(), &store.users, "gate")
        .unwrap()
        .id
}

async fn reserve_ports(n: usize) -> Vec<u16> {
    let mut listeners = Vec::new();
    for _ in 0..n {
        listeners.push(TcpListener::bind(("127.0.0.1", 0)).await.unwrap());
    }
    listeners
        .iter()
        .map(|l| l.local_addr().unwrap().port())
        .collect()
}

// ── scenarios ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn handshake_reaches_active_in_two_round_trips() {
    let dir = TempDir::new().unwrap();
    let running = start_station(&dir).await;

    let mut alice = TestClient::connect(running.tcp_addr, identity("alice")).await;
    alice.handshake().await;
    assert!(alice.station.is_some());

    running.shutdown().await;
}

#[tokio::test]
async fn local_delivery_returns_a_respond_receipt() {
    let dir = TempDir::new().unwrap();
    let running = start_station(&dir).await;

    let mut alice = TestClient::connect(running.tcp_addr, identity("alice")).await;
    let mut bob = TestClient::connect(running.tcp_addr, identity("bob")).await;
    alice.handshake().await;
    bob.handshake().await;

    let env = alice.seal(&bob.me.id.clone(), b"ciphertext one");
    let reply = alice.send_envelope(&env).await.expect("receipt");
    assert_eq!(TestClient::receipt_message(&reply), RECEIPT_RESPOND);

    let pushed = bob.recv_push().await.expect("pushed envelope");
    assert_eq!(pushed.data, env.data);
    assert!(pushed.sender.same_identity(&alice.me.id));
    assert!(pushed.traced_by(&running.station.id));

    running.shutdown().await;
}

#[tokio::test]
async fn deliveries_keep_the_sender_order() {
    let dir = TempDir::new().unwrap();
    let running = start_station(&dir).await;

    let mut alice = TestClient::connect(running.tcp_addr, identity("alice")).await;
    let mut bob = TestClient::connect(running.tcp_addr, identity("bob")).await;
    alice.handshake().await;
    bob.handshake().await;

    let bodies: Vec<&[u8]> = vec![b"first", b"second", b"third"];
    for body in &bodies {
        let env = alice.seal(&bob.me.id.clone(), body);
        let reply = alice.send_envelope(&env).await.expect("receipt");
        assert_eq!(TestClient::receipt_message(&reply), RECEIPT_RESPOND);
    }

    for body in &bodies {
        let pushed = bob.recv_push().await.expect("pushed envelope");
        assert_eq!(pushed.payload().unwrap(), *body);
    }

    running.shutdown().await;
}

#[tokio::test]
async fn offline_envelope_is_spooled_then_drained_on_login() {
    let dir = TempDir::new().unwrap();
    let running = start_station(&dir).await;
    let bob_identity = identity("bob");
    let bob_addr = bob_identity.id.address.to_string();

    let mut alice = TestClient::connect(running.tcp_addr, identity("alice")).await;
    alice.handshake().await;

    let env = alice.seal(&bob_identity.id.clone(), b"for later");
    let reply = alice.send_envelope(&env).await.expect("receipt");
    assert_eq!(TestClient::receipt_message(&reply), RECEIPT_CACHED);

    // The spool holds exactly one envelope for bob.
    let spool_dir = dir.path().join("messages").join(&bob_addr);
    assert_eq!(std::fs::read_dir(&spool_dir).unwrap().count(), 1);

    // Bob shows up; the receptionist drains the spool within a tick or two.
    let mut bob = TestClient::connect(running.tcp_addr, bob_identity).await;
    bob.handshake().await;
    let pushed = bob.recv_push().await.expect("drained envelope");
    assert_eq!(pushed.data, env.data);

    // And the batch file is gone.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let left = std::fs::read_dir(&spool_dir).map(|d| d.count()).unwrap_or(0);
        if left == 0 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "spool not emptied, {left} file(s) left"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    running.shutdown().await;
}

#[tokio::test]
async fn envelope_without_sender_key_is_suspended_until_the_meta_arrives() {
    let dir = TempDir::new().unwrap();
    let running = start_station(&dir).await;
    let bob_identity = identity("bob");

    let mut carol = TestClient::connect(running.tcp_addr, identity("carol")).await;

    // First envelope travels without meta: the station cannot verify it and
    // stays silent.
    let mut first = Envelope::seal(
        carol.me.id.clone(),
        bob_identity.id.clone(),
        b"held back",
        &carol.me.sk,
    );
    first.meta = None;
    assert!(carol.send_envelope(&first).await.is_none());

    // The second one carries the meta; both get released into the spool.
    let second = carol.seal(&bob_identity.id.clone(), b"key attached");
    let reply = carol.send_envelope(&second).await.expect("receipt");
    assert_eq!(TestClient::receipt_message(&reply), RECEIPT_CACHED);

    let mut bob = TestClient::connect(running.tcp_addr, bob_identity).await;
    bob.handshake().await;
    let mut bodies = vec![
        bob.recv_push().await.expect("first push").data,
        bob.recv_push().await.expect("second push").data,
    ];
    bodies.sort();
    let mut expected = vec![first.data.clone(), second.data.clone()];
    expected.sort();
    assert_eq!(bodies, expected);

    running.shutdown().await;
}

#[tokio::test]
async fn forged_group_keys_are_not_cached() {
    let dir = TempDir::new().unwrap();
    let running = start_station(&dir).await;
    let bob = identity("bob");
    let group: Id = "team@20aabbccddeeff00112233445566778899aabbcc"
        .parse()
        .unwrap();

    let mut alice = TestClient::connect(running.tcp_addr, identity("alice")).await;
    alice.handshake().await;
    let alice_id = alice.me.id.clone();

    let mut keys = std::collections::HashMap::new();
    keys.insert("member".to_string(), "forged-key".to_string());

    // An attacker names alice as the sender but can only sign with their
    // own key; the group keys ride along on the bad envelope.
    let mut eve = TestClient::connect(running.tcp_addr, identity("mallory")).await;
    let mut forged = Envelope::seal(alice_id.clone(), bob.id.clone(), b"smuggled", &eve.me.sk);
    forged.group = Some(group.clone());
    forged.keys = Some(keys.clone());
    let reply = eve.send_envelope(&forged).await.expect("rejection receipt");
    let message = TestClient::receipt_message(&reply);
    assert!(message.contains("signature"), "unexpected receipt: {message}");

    // Nothing was persisted under the forged sender's identity.
    let key_file = dir
        .path()
        .join("protected")
        .join(group.address.to_string())
        .join(format!("group-keys-{}.js", alice_id.address));
    assert!(!key_file.exists(), "forged group keys were cached");

    // The same attachment from the real sender lands.
    let mut genuine = alice.seal(&bob.id.clone(), b"real update");
    genuine.group = Some(group.clone());
    genuine.keys = Some(keys);
    let reply = alice.send_envelope(&genuine).await.expect("receipt");
    assert_eq!(TestClient::receipt_message(&reply), RECEIPT_CACHED);
    assert!(key_file.exists(), "genuine group keys missing");

    running.shutdown().await;
}

#[tokio::test]
async fn unknown_command_gets_an_unsupported_receipt() {
    let dir = TempDir::new().unwrap();
    let running = start_station(&dir).await;

    let mut dave = TestClient::connect(running.tcp_addr, identity("dave")).await;
    let env = dave.seal(
        &Id::any_station(),
        br#"{"type":"teleport","anywhere":true}"#,
    );
    let reply = dave.send_envelope(&env).await.expect("receipt");
    let message = TestClient::receipt_message(&reply);
    assert!(
        message.contains("Command not supported"),
        "unexpected receipt: {message}"
    );
    assert!(message.contains("teleport"));

    running.shutdown().await;
}

#[tokio::test]
async fn meta_query_returns_the_cached_record() {
    let dir = TempDir::new().unwrap();
    let running = start_station(&dir).await;

    let mut alice = TestClient::connect(running.tcp_addr, identity("alice")).await;
    alice.handshake().await;
    let station = alice.station.clone().unwrap();

    let query = Command::Meta(hamn_wire::MetaCommand {
        id: alice.me.id.clone(),
        meta: None,
    });
    let env = alice.seal(&station, &query.to_json().unwrap());
    let reply = alice.send_envelope(&env).await.expect("meta reply");
    match Command::from_json(&reply.payload().unwrap()).unwrap() {
        Command::Meta(cmd) => {
            assert_eq!(cmd.meta.expect("meta attached"), alice.me.meta);
        }
        other => panic!("expected a meta reply, got {other:?}"),
    }

    running.shutdown().await;
}

#[tokio::test]
async fn duplicate_envelope_is_delivered_once() {
    let dir = TempDir::new().unwrap();
    let running = start_station(&dir).await;
    let bob_identity = identity("bob");

    let mut alice = TestClient::connect(running.tcp_addr, identity("alice")).await;
    alice.handshake().await;

    // The same signed envelope twice: identity is the signature, so the
    // spool keeps one copy.
    let env = alice.seal(&bob_identity.id.clone(), b"exactly once");
    for _ in 0..2 {
        let reply = alice.send_envelope(&env).await.expect("receipt");
        assert_eq!(TestClient::receipt_message(&reply), RECEIPT_CACHED);
    }

    let mut bob = TestClient::connect(running.tcp_addr, bob_identity).await;
    bob.handshake().await;
    let pushed = bob.recv_push().await.expect("single copy");
    assert_eq!(pushed.data, env.data);
    assert_eq!(pushed.traces.len(), 1, "station traced once: {:?}", pushed.traces);
    assert!(bob.try_recv_push(Duration::from_millis(1500)).await.is_none());

    running.shutdown().await;
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>;

async fn ws_recv_envelope(ws: &mut WsStream) -> Envelope {
    use tokio_tungstenite::tungstenite::Message;
    loop {
        let msg = timeout(STEP, ws.next())
            .await
            .expect("ws reply in time")
            .expect("ws open")
            .expect("ws frame");
        if let Message::Text(text) = msg {
            return Envelope::from_json(text.as_bytes()).expect("ws envelope");
        }
    }
}

#[tokio::test]
async fn websocket_gate_shares_the_pipeline() {
    use tokio_tungstenite::tungstenite::Message;

    let dir = TempDir::new().unwrap();
    let running = start_station(&dir).await;

    let mut bob = TestClient::connect(running.tcp_addr, identity("bob")).await;
    bob.handshake().await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}", running.ws_addr))
        .await
        .expect("ws connect");
    let alice = identity("alice-ws");
    let seal = |receiver: &Id, body: &[u8]| {
        let mut env = Envelope::seal(alice.id.clone(), receiver.clone(), body, &alice.sk);
        env.meta = Some(alice.meta.clone());
        env
    };
    let send = |env: &Envelope| {
        Message::Text(String::from_utf8(env.to_json().unwrap()).unwrap())
    };

    // Handshake over text frames.
    let start = Command::Handshake(HandshakeCommand::start(None));
    ws.send(send(&seal(&Id::any_station(), &start.to_json().unwrap())))
        .await
        .unwrap();
    let reply = ws_recv_envelope(&mut ws).await;
    let station = reply.sender.clone();
    let key = match Command::from_json(&reply.payload().unwrap()).unwrap() {
        Command::Handshake(h) => h.session.expect("session key"),
        other => panic!("expected a challenge, got {other:?}"),
    };
    let again = Command::Handshake(HandshakeCommand::start(Some(key)));
    ws.send(send(&seal(&station, &again.to_json().unwrap())))
        .await
        .unwrap();
    let reply = ws_recv_envelope(&mut ws).await;
    match Command::from_json(&reply.payload().unwrap()).unwrap() {
        Command::Handshake(h) => assert_eq!(h.phase, HandshakePhase::Success),
        other => panic!("expected success, got {other:?}"),
    }

    // Same dispatcher behind both gates: a WS sender reaches a TCP session.
    let env = seal(&bob.me.id.clone(), b"via websocket");
    ws.send(send(&env)).await.unwrap();
    let receipt = ws_recv_envelope(&mut ws).await;
    assert_eq!(TestClient::receipt_message(&receipt), RECEIPT_RESPOND);

    let pushed = bob.recv_push().await.expect("pushed envelope");
    assert_eq!(pushed.data, env.data);

    running.shutdown().await;
}

#[tokio::test]
async fn envelope_with_a_target_hint_crosses_the_bridge() {
    let dir_b = TempDir::new().unwrap();
    let b = start_station(&dir_b).await;
    let b_id = b.station.id.clone();

    let dir_a = TempDir::new().unwrap();
    let mut config_a = config_for(&dir_a);
    config_a.neighbors = vec![NeighborConfig {
        id: b_id.clone(),
        host: "127.0.0.1".into(),
        port: b.tcp_addr.port(),
    }];
    let a = start(config_a).await.expect("station A");

    let mut alice = TestClient::connect(a.tcp_addr, identity("alice")).await;
    let mut bob = TestClient::connect(b.tcp_addr, identity("bob")).await;
    alice.handshake().await;
    bob.handshake().await;

    let mut env = alice.seal(&bob.me.id.clone(), b"across the bridge");
    env.target = Some(b_id.clone());
    let reply = alice.send_envelope(&env).await.expect("receipt");
    assert_eq!(TestClient::receipt_message(&reply), RECEIPT_FORWARDED);

    let pushed = bob.recv_push().await.expect("bridged envelope");
    assert_eq!(pushed.data, env.data);
    assert!(pushed.sender.same_identity(&alice.me.id));
    assert!(pushed.traced_by(&a.station.id), "missing trace of A");
    assert!(pushed.traced_by(&b_id), "missing trace of B");

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn broadcast_visits_every_station_exactly_once() {
    // Three fully-connected stations with pre-arranged identities/ports.
    let dirs: Vec<TempDir> = (0..3).map(|_| TempDir::new().unwrap()).collect();
    let ids: Vec<Id> = dirs.iter().map(station_identity).collect();
    let ports = reserve_ports(3).await;

    let mut runnings = Vec::new();
    for me in 0..3 {
        let mut config = config_for(&dirs[me]);
        config.station_port = ports[me];
        config.neighbors = (0..3)
            .filter(|other| *other != me)
            .map(|other| NeighborConfig {
                id: ids[other].clone(),
                host: "127.0.0.1".into(),
                port: ports[other],
            })
            .collect();
        runnings.push(start(config).await.expect("station start"));
    }

    let mut bob_a = TestClient::connect(runnings[0].tcp_addr, identity("bob-a")).await;
    let mut bob_b = TestClient::connect(runnings[1].tcp_addr, identity("bob-b")).await;
    let mut alice = TestClient::connect(runnings[2].tcp_addr, identity("alice")).await;
    bob_a.handshake().await;
    bob_b.handshake().await;
    alice.handshake().await;

    let env = alice.seal(&Id::everyone(), b"hear ye");
    let reply = alice.send_envelope(&env).await.expect("receipt");
    assert_eq!(TestClient::receipt_message(&reply), RECEIPT_BROADCAST);

    // Each remote station delivers exactly one copy to its local user.
    let copy_a = bob_a.recv_push().await.expect("copy on A");
    let copy_b = bob_b.recv_push().await.expect("copy on B");
    assert_eq!(copy_a.data, env.data);
    assert_eq!(copy_b.data, env.data);

    for copy in [&copy_a, &copy_b] {
        assert!(copy.traced_by(&ids[2]), "origin station missing in traces");
        assert_eq!(copy.traces.len(), 2, "traces: {:?}", copy.traces);
    }

    // No duplicates arrive afterwards.
    assert!(bob_a.try_recv_push(Duration::from_millis(1500)).await.is_none());
    assert!(bob_b.try_recv_push(Duration::from_millis(1500)).await.is_none());

    for running in runnings {
        running.shutdown().await;
    }
}
