// End-to-end integration tests for the lockstep netplay pipeline.
//
// Each test starts a real server on a loopback port and connects real
// clients — `TestGameClient` for full-stack lockstep behavior, `RawClient`
// where the exact wire output matters (relay stamps, Ack frames, priming,
// rejection orders). Server internals are probed through the handle's
// callback event, the same serialized path every other event takes.

use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use basalt_netplay::error::NetplayError;
use basalt_netplay::game_save::{GameSave, SavedOrder};
use basalt_netplay::handshake::{HandshakeRequest, HandshakeResponse};
use basalt_netplay::hooks::ServerHooks;
use basalt_netplay::replay::{Outcome, ReplayRecorder};
use basalt_netplay::server::{
    Collaborators, PlayerProfile, ProfileVerifier, Server, ServerConfig, ServerHandle,
    ServerState, ServerType,
};
use basalt_netplay::session::Session;
use basalt_netplay::Simulation;
use basalt_protocol::{
    ClientIndex, FrameNumber, ORDERS_PROTOCOL, Order, OrderKind, OrderPacket, SyncRecord,
};
use multiplayer_tests::{RawClient, TestGameClient};

fn config(order_latency: i32) -> ServerConfig {
    ServerConfig {
        listen_addrs: vec!["127.0.0.1:0".parse().expect("loopback addr")],
        order_latency,
        ..ServerConfig::default()
    }
}

fn start(config: ServerConfig) -> (ServerHandle, SocketAddr) {
    start_with(config, Collaborators::default())
}

fn start_with(config: ServerConfig, collaborators: Collaborators) -> (ServerHandle, SocketAddr) {
    let handle = Server::start(config, collaborators).expect("server start failed");
    let addr = handle.addr().expect("no bound address");
    (handle, addr)
}

/// Run a closure on the server's consumer thread and wait for its answer.
fn probe<T: Send + 'static>(
    handle: &ServerHandle,
    f: impl FnOnce(&mut Server) -> T + Send + 'static,
) -> T {
    let (tx, rx) = mpsc::channel();
    handle.call(move |server| {
        let _ = tx.send(f(server));
    });
    rx.recv_timeout(Duration::from_secs(5))
        .expect("server did not answer probe")
}

#[test]
fn handshake_join_and_lobby_sync() {
    let (handle, addr) = start(config(3));

    let mut a = TestGameClient::connect(addr, "Alice");
    a.complete_handshake(None);

    let session = a.sim.session.clone().expect("session after join");
    let alice = session.client_with_index(a.index()).expect("alice listed");
    assert!(alice.is_admin, "first client becomes admin");
    assert_eq!(alice.slot.as_deref(), Some("slot0"));
    assert_eq!(alice.name, "Alice");

    let mut b = TestGameClient::connect(addr, "Bob");
    b.complete_handshake(None);

    // Both views converge on the two-client roster.
    a.pump_until("roster to show both clients", |c| {
        c.sim
            .session
            .as_ref()
            .is_some_and(|s| s.clients.len() == 2)
    });
    let session = b.sim.session.clone().expect("session after join");
    let bob = session.client_with_index(b.index()).expect("bob listed");
    assert!(!bob.is_admin);
    assert_eq!(bob.slot.as_deref(), Some("slot1"));

    handle.shutdown();
}

#[test]
fn relay_projects_latency_and_acks_sender() {
    let (handle, addr) = start(config(3));

    let mut a = RawClient::connect(addr);
    a.complete_handshake("Alice");
    let mut b = RawClient::connect(addr);
    b.complete_handshake("Bob");

    handle.call(Server::start_game);
    a.wait_for_order("StartGame");
    b.wait_for_order("StartGame");

    // A regular order at frame 10 with latency 3 relays at 13, and the
    // sender gets an Ack for 13 instead of an echo.
    a.send_orders(FrameNumber(10), &[Order::regular("Attack", vec![1, 2])]);

    a.wait_for("ack for frame 13", |sender, frame, payload| {
        (sender == ClientIndex::SERVER
            && frame == FrameNumber(13)
            && payload.len() == 1
            && payload[0] == OrderKind::Ack as u8)
            .then_some(())
    });

    let from_a = a.index;
    b.wait_for("relayed order at frame 13", |sender, frame, payload| {
        (sender == from_a
            && frame == FrameNumber(13)
            && OrderPacket::deserialize(payload)
                .orders()
                .iter()
                .any(|o| o.opcode() == Some("Attack")))
        .then_some(())
    });

    handle.shutdown();
}

#[test]
fn game_start_primes_every_client_queue() {
    let (handle, addr) = start(config(3));

    let mut a = RawClient::connect(addr);
    a.complete_handshake("Alice");
    let mut b = RawClient::connect(addr);
    b.complete_handshake("Bob");

    handle.call(Server::start_game);
    b.wait_for_order("StartGame");

    // Frames 1..=3 arrive as empty packets from *both* clients, so no queue
    // ever misses a packet for a registered peer.
    let mut expected: Vec<(ClientIndex, i32)> = Vec::new();
    for frame in 1..=3 {
        expected.push((a.index, frame));
        expected.push((b.index, frame));
    }
    b.wait_for("all priming packets", |sender, frame, payload| {
        if payload.is_empty() {
            expected.retain(|&(s, f)| !(s == sender && FrameNumber(f) == frame));
        }
        expected.is_empty().then_some(())
    });

    handle.shutdown();
}

#[test]
fn sync_reports_relay_verbatim_at_true_frame() {
    let (handle, addr) = start(config(3));

    let mut a = RawClient::connect(addr);
    a.complete_handshake("Alice");
    let mut b = RawClient::connect(addr);
    b.complete_handshake("Bob");

    handle.call(Server::start_game);
    a.wait_for_order("StartGame");
    b.wait_for_order("StartGame");

    let record = SyncRecord {
        checksum: 0x1234,
        defeat: 0,
    };
    a.send_sync(FrameNumber(7), record);

    // No latency projection for sync hashes: B sees frame 7, not 10.
    let from_a = a.index;
    b.wait_for("sync report at frame 7", |sender, frame, payload| {
        (sender == from_a && frame == FrameNumber(7) && SyncRecord::decode(payload) == Some(record))
            .then_some(())
    });

    handle.shutdown();
}

#[test]
fn password_checked_before_joining() {
    let mut cfg = config(1);
    cfg.password = Some("secret".into());
    let (handle, addr) = start(cfg);

    // Wrong password.
    let mut wrong = RawClient::connect(addr);
    let body = wrong.wait_for_order("HandshakeRequest");
    let request = HandshakeRequest::from_json(&body).expect("parse request");
    wrong.respond(&HandshakeResponse {
        mod_id: request.mod_id.clone(),
        version: request.version.clone(),
        orders_protocol: ORDERS_PROTOCOL,
        name: "Eve".into(),
        password: Some("wrong".into()),
        fingerprint: None,
        auth_signature: None,
    });
    let reason = wrong.wait_for_order("AuthenticationError");
    assert_eq!(reason, "Incorrect password");
    assert!(wrong.wait_closed(), "rejected connection must be dropped");

    // Missing password gets the distinct message.
    let mut missing = RawClient::connect(addr);
    let body = missing.wait_for_order("HandshakeRequest");
    let request = HandshakeRequest::from_json(&body).expect("parse request");
    missing.respond(&HandshakeResponse {
        mod_id: request.mod_id.clone(),
        version: request.version.clone(),
        orders_protocol: ORDERS_PROTOCOL,
        name: "Mallory".into(),
        password: None,
        fingerprint: None,
        auth_signature: None,
    });
    let reason = missing.wait_for_order("AuthenticationError");
    assert_eq!(reason, "Server requires a password");

    // Correct password joins.
    let mut ok = RawClient::connect(addr);
    let body = ok.wait_for_order("HandshakeRequest");
    let request = HandshakeRequest::from_json(&body).expect("parse request");
    ok.respond(&HandshakeResponse {
        mod_id: request.mod_id,
        version: request.version,
        orders_protocol: ORDERS_PROTOCOL,
        name: "Carol".into(),
        password: Some("secret".into()),
        fingerprint: None,
        auth_signature: None,
    });
    ok.wait_for_order("SyncInfo");

    handle.shutdown();
}

#[test]
fn version_mismatch_rejected_with_reason() {
    let (handle, addr) = start(config(1));

    let mut client = RawClient::connect(addr);
    let body = client.wait_for_order("HandshakeRequest");
    let request = HandshakeRequest::from_json(&body).expect("parse request");
    client.respond(&HandshakeResponse {
        mod_id: request.mod_id,
        version: "something-else".into(),
        orders_protocol: ORDERS_PROTOCOL,
        name: "Old".into(),
        password: None,
        fingerprint: None,
        auth_signature: None,
    });

    let reason = client.wait_for_order("ServerError");
    assert_eq!(reason, "Server is running an incompatible version");
    assert!(client.wait_closed());

    handle.shutdown();
}

#[test]
fn frame_bound_orders_before_validation_drop_the_connection() {
    let (handle, addr) = start(config(1));

    let mut client = RawClient::connect(addr);
    client.wait_for_order("HandshakeRequest");
    client.send_orders(FrameNumber(5), &[Order::regular("Move", vec![1])]);

    assert!(client.wait_closed(), "unvalidated sender must be dropped");
    handle.shutdown();
}

#[test]
fn stalled_peer_halts_lockstep_advancement() {
    let (handle, addr) = start(config(3));

    let mut a = TestGameClient::connect(addr, "Alice");
    a.complete_handshake(None);
    let mut b = TestGameClient::connect(addr, "Bob");
    b.complete_handshake(None);
    a.pump_until("roster", |c| {
        c.sim
            .session
            .as_ref()
            .is_some_and(|s| s.clients.len() == 2)
    });

    handle.call(Server::start_game);
    a.wait_until_started();

    // B never ticks. A can consume the primed frames (1..=3), then must
    // stall no matter how many local ticks elapse.
    a.pump_until("primed frames to process", |c| {
        c.manager.net_frame() == FrameNumber(4)
    });
    for _ in 0..100 {
        a.pump().expect("pump");
    }
    assert_eq!(a.manager.net_frame(), FrameNumber(4));
    let frozen_local = a.manager.local_frame();
    for _ in 0..50 {
        a.pump().expect("pump");
    }
    assert_eq!(a.manager.local_frame(), frozen_local);

    // Once B participates again, A resumes.
    b.wait_until_started();
    for _ in 0..10 {
        b.pump().expect("pump");
        a.pump().expect("pump");
    }
    assert!(a.manager.net_frame() > FrameNumber(4));

    handle.shutdown();
}

#[test]
fn lockstep_applies_orders_on_the_same_frame_everywhere() {
    let (handle, addr) = start(config(2));

    let mut a = TestGameClient::connect(addr, "Alice");
    a.complete_handshake(None);
    let mut b = TestGameClient::connect(addr, "Bob");
    b.complete_handshake(None);
    a.pump_until("roster", |c| {
        c.sim
            .session
            .as_ref()
            .is_some_and(|s| s.clients.len() == 2)
    });

    handle.call(Server::start_game);
    a.wait_until_started();
    b.wait_until_started();

    a.issue(Order::regular("Attack", vec![9]));

    let from_a = a.index();
    let deadline = Instant::now() + Duration::from_secs(5);
    let applied = |c: &TestGameClient| {
        c.applied_log
            .iter()
            .find(|(_, client, opcode)| *client == from_a && opcode == "Attack")
            .map(|(frame, _, _)| *frame)
    };
    loop {
        assert!(Instant::now() < deadline, "order never applied on both");
        a.pump().expect("pump a");
        b.pump().expect("pump b");
        if let (Some(frame_a), Some(frame_b)) = (applied(&a), applied(&b)) {
            // The sender applies its own cached copy on exactly the frame
            // every other client applies the relayed copy.
            assert_eq!(frame_a, frame_b);
            break;
        }
        thread::sleep(Duration::from_millis(2));
    }

    // Identical inputs on identical frames: state checksums agree.
    assert_eq!(a.sim.checksum(), b.sim.checksum());

    handle.shutdown();
}

#[test]
fn desync_is_fatal_on_clients_but_not_the_server() {
    let collaborators = Collaborators {
        replay: Some(Box::new(ReplayRecorder::new(Vec::new()))),
        ..Collaborators::default()
    };
    let (handle, addr) = start_with(config(1), collaborators);

    let mut a = TestGameClient::connect(addr, "Alice");
    a.complete_handshake(None);
    let mut b = TestGameClient::connect(addr, "Bob");
    // Same inputs, different state: B's checksums always disagree.
    b.sim.bias = 0xDEAD_BEEF;
    b.complete_handshake(None);
    a.pump_until("roster", |c| {
        c.sim
            .session
            .as_ref()
            .is_some_and(|s| s.clients.len() == 2)
    });

    assert!(probe(&handle, |server| server.replay_active()));

    handle.call(Server::start_game);
    a.wait_until_started();
    b.wait_until_started();

    // Pump both until one of them hits the divergence.
    let deadline = Instant::now() + Duration::from_secs(5);
    let error = loop {
        assert!(Instant::now() < deadline, "no desync detected");
        match a.pump().and_then(|_| b.pump()) {
            Ok(_) => thread::sleep(Duration::from_millis(2)),
            Err(e) => break e,
        }
    };
    assert!(
        matches!(error, NetplayError::OutOfSync(_)),
        "expected OutOfSync, got {error}"
    );

    // The server flags the divergence, cancels the replay, and keeps
    // running for the surviving participants.
    let deadline = Instant::now() + Duration::from_secs(5);
    while !probe(&handle, |server| server.is_out_of_sync()) {
        assert!(Instant::now() < deadline, "server never flagged the desync");
        thread::sleep(Duration::from_millis(10));
    }
    assert!(!probe(&handle, |server| server.replay_active()));
    assert_eq!(handle.state(), ServerState::GameStarted);

    handle.shutdown();
}

#[test]
fn defeat_bits_drive_result_tracking() {
    let (handle, addr) = start(config(1));

    let mut a = RawClient::connect(addr);
    a.complete_handshake("Alice");
    let mut b = RawClient::connect(addr);
    b.complete_handshake("Bob");

    handle.call(Server::start_game);
    a.wait_for_order("StartGame");
    b.wait_for_order("StartGame");

    // Matching reports; frame 2 sets bit 0 — Alice (slot0) is eliminated.
    for client in [&mut a, &mut b] {
        client.send_sync(
            FrameNumber(1),
            SyncRecord {
                checksum: 100,
                defeat: 0,
            },
        );
        client.send_sync(
            FrameNumber(2),
            SyncRecord {
                checksum: 200,
                defeat: 0b01,
            },
        );
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let outcomes = probe(&handle, |server| {
            server
                .game_info()
                .map(|info| info.players.iter().map(|p| p.outcome).collect::<Vec<_>>())
        });
        if outcomes
            .as_deref()
            .is_some_and(|o| o == [Outcome::Lost, Outcome::Won])
        {
            break;
        }
        assert!(Instant::now() < deadline, "outcomes never settled");
        thread::sleep(Duration::from_millis(10));
    }

    // Matching reports never flag a desync.
    assert!(!probe(&handle, |server| server.is_out_of_sync()));

    handle.shutdown();
}

#[test]
fn game_save_resume_dispatches_after_saved_frames() {
    let (handle, addr) = start(config(3));

    let mut a = RawClient::connect(addr);
    a.complete_handshake("Alice");
    let mut b = RawClient::connect(addr);
    b.complete_handshake("Bob");

    // A save whose journal ends at frame 120.
    let save = GameSave::from_journal(vec![
        SavedOrder {
            client: a.index,
            frame: FrameNumber(120),
            payload: Order::regular("Saved", vec![1]).serialize(),
        },
        SavedOrder {
            client: b.index,
            frame: FrameNumber(120),
            payload: Order::regular("Idle", vec![]).serialize(),
        },
    ]);
    assert_eq!(save.last_orders_frame, FrameNumber(120));
    handle.call(move |server| server.load_game_save(save));
    handle.call(Server::start_game);

    let start_data = b.wait_for_order("StartGame");
    let value: serde_json::Value = serde_json::from_str(&start_data).expect("start data json");
    assert_eq!(value["save_last_orders_frame"].as_i64(), Some(120));

    // The journal replays with its original stamps, then frames 121..=123
    // are pre-filled with empty packets for every connected client before
    // live orders flow.
    let from_a = a.index;
    b.wait_for("journal replay at frame 120", |sender, frame, payload| {
        (sender == from_a
            && frame == FrameNumber(120)
            && OrderPacket::deserialize(payload)
                .orders()
                .iter()
                .any(|o| o.opcode() == Some("Saved")))
        .then_some(())
    });

    let mut expected: Vec<(ClientIndex, i32)> = Vec::new();
    for frame in 121..=123 {
        expected.push((a.index, frame));
        expected.push((b.index, frame));
    }
    b.wait_for("post-save priming", |sender, frame, payload| {
        if payload.is_empty() {
            assert!(
                frame >= FrameNumber(121),
                "priming must start after the saved frames, saw {frame}"
            );
            expected.retain(|&(s, f)| !(s == sender && FrameNumber(f) == frame));
        }
        expected.is_empty().then_some(())
    });

    // Live orders resume with the usual projection.
    a.send_orders(FrameNumber(121), &[Order::regular("Live", vec![])]);
    b.wait_for("live order at frame 124", |sender, frame, payload| {
        (sender == from_a
            && frame == FrameNumber(124)
            && OrderPacket::deserialize(payload)
                .orders()
                .iter()
                .any(|o| o.opcode() == Some("Live")))
        .then_some(())
    });

    handle.shutdown();
}

#[test]
fn admin_disconnect_shuts_down_non_dedicated_session() {
    let (handle, addr) = start(config(1));

    let mut a = RawClient::connect(addr);
    a.complete_handshake("Admin");
    let mut b = RawClient::connect(addr);
    b.complete_handshake("Guest");

    drop(a);

    let deadline = Instant::now() + Duration::from_secs(5);
    while handle.state() != ServerState::ShuttingDown {
        assert!(
            Instant::now() < deadline,
            "admin disconnect did not cascade into shutdown"
        );
        thread::sleep(Duration::from_millis(10));
    }
    handle.join();
    drop(b);
}

#[test]
fn non_admin_disconnect_keeps_session_running() {
    let (handle, addr) = start(config(1));

    let mut a = RawClient::connect(addr);
    a.complete_handshake("Admin");
    let mut b = RawClient::connect(addr);
    b.complete_handshake("Guest");

    drop(b);

    // The admin sees the disconnect notices; the session survives.
    a.wait_for_order("Disconnected");
    assert_eq!(handle.state(), ServerState::WaitingPlayers);

    handle.shutdown();
}

#[test]
fn dedicated_server_reelects_admin_in_lobby() {
    let mut cfg = config(1);
    cfg.server_type = ServerType::Dedicated;
    let (handle, addr) = start(cfg);

    let mut a = RawClient::connect(addr);
    a.complete_handshake("First");
    let mut b = RawClient::connect(addr);
    b.complete_handshake("Second");

    drop(a);

    b.wait_for("admin handover", |_, _, payload| {
        OrderPacket::deserialize(payload)
            .into_orders()
            .into_iter()
            .find(|o| o.opcode() == Some("SyncInfo"))
            .and_then(|o| o.text_payload())
            .and_then(|blob| Session::deserialize(&blob).ok())
            .and_then(|session| {
                let survivor = session.clients.first()?;
                (session.clients.len() == 1 && survivor.is_admin).then_some(())
            })
    });
    assert_eq!(handle.state(), ServerState::WaitingPlayers);

    handle.shutdown();
}

#[test]
fn start_game_broadcast_happens_once() {
    let (handle, addr) = start(config(1));

    let mut a = RawClient::connect(addr);
    a.complete_handshake("Alice");

    handle.call(Server::start_game);
    handle.call(Server::start_game);
    a.wait_for_order("StartGame");

    // Drain the line for a while: no second StartGame may appear.
    let deadline = Instant::now() + Duration::from_millis(600);
    while Instant::now() < deadline {
        if let Ok((_, _, payload)) = a.try_next_frame(Duration::from_millis(100)) {
            let again = OrderPacket::deserialize(&payload)
                .orders()
                .iter()
                .any(|o| o.opcode() == Some("StartGame"));
            assert!(!again, "StartGame broadcast twice");
        }
    }

    handle.shutdown();
}

/// Accepts only the fingerprint "good" with a signature over the issued
/// challenge token.
struct FakeVerifier;

impl ProfileVerifier for FakeVerifier {
    fn verify(
        &self,
        fingerprint: &str,
        challenge: &str,
        signature: &str,
    ) -> Result<PlayerProfile, String> {
        if fingerprint == "good" && signature == format!("signed:{challenge}") {
            Ok(PlayerProfile {
                profile_id: "42".into(),
                profile_name: "GoodPlayer".into(),
            })
        } else {
            Err("signature verification failed".into())
        }
    }
}

#[test]
fn deferred_identity_verification_gates_dedicated_join() {
    let mut cfg = config(1);
    cfg.server_type = ServerType::Dedicated;
    cfg.require_authentication = true;
    let collaborators = Collaborators {
        verifier: Some(Arc::new(FakeVerifier)),
        ..Collaborators::default()
    };
    let (handle, addr) = start_with(cfg, collaborators);

    // A signed identity assertion over the server's challenge token passes
    // the out-of-band verification and completes the join.
    let mut good = RawClient::connect(addr);
    let body = good.wait_for_order("HandshakeRequest");
    let request = HandshakeRequest::from_json(&body).expect("parse request");
    good.respond(&HandshakeResponse {
        mod_id: request.mod_id.clone(),
        version: request.version.clone(),
        orders_protocol: ORDERS_PROTOCOL,
        name: "Authed".into(),
        password: None,
        fingerprint: Some("good".into()),
        auth_signature: Some(format!("signed:{}", request.auth_token)),
    });
    good.wait_for_order("SyncInfo");

    // A bad signature fails verification, and the auth-required policy
    // rejects the unverified client.
    let mut bad = RawClient::connect(addr);
    let body = bad.wait_for_order("HandshakeRequest");
    let request = HandshakeRequest::from_json(&body).expect("parse request");
    bad.respond(&HandshakeResponse {
        mod_id: request.mod_id.clone(),
        version: request.version.clone(),
        orders_protocol: ORDERS_PROTOCOL,
        name: "Forger".into(),
        password: None,
        fingerprint: Some("bad".into()),
        auth_signature: Some("forged".into()),
    });
    let reason = bad.wait_for_order("ServerError");
    assert_eq!(
        reason,
        "Server requires players to have an authenticated profile"
    );
    assert!(bad.wait_closed());

    // No identity assertion at all is rejected outright.
    let mut anonymous = RawClient::connect(addr);
    let body = anonymous.wait_for_order("HandshakeRequest");
    let request = HandshakeRequest::from_json(&body).expect("parse request");
    anonymous.respond(&HandshakeResponse {
        mod_id: request.mod_id,
        version: request.version,
        orders_protocol: ORDERS_PROTOCOL,
        name: "Anon".into(),
        password: None,
        fingerprint: None,
        auth_signature: None,
    });
    let reason = anonymous.wait_for_order("ServerError");
    assert_eq!(
        reason,
        "Server requires players to have an authenticated profile"
    );

    handle.shutdown();
}

#[test]
fn command_hooks_run_in_registration_order_first_match_wins() {
    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let mut hooks = ServerHooks::new();
    let joined_log = log.clone();
    hooks.on_client_joined(move |_, index| {
        joined_log.lock().expect("log lock").push(format!("joined {index}"));
    });
    let first_log = log.clone();
    hooks.on_command(move |_, _, command| {
        if command == "pause" {
            first_log.lock().expect("log lock").push("first".into());
            return true;
        }
        false
    });
    let second_log = log.clone();
    hooks.on_command(move |_, _, command| {
        second_log
            .lock()
            .expect("log lock")
            .push(format!("second {command}"));
        command == "speed"
    });

    let collaborators = Collaborators {
        hooks,
        ..Collaborators::default()
    };
    let (handle, addr) = start_with(config(1), collaborators);

    let mut a = RawClient::connect(addr);
    a.complete_handshake("Alice");

    let command = |text: &str| Order::immediate("Command", text.as_bytes().to_vec());
    a.send_orders(FrameNumber::IMMEDIATE, &[command("pause")]);
    a.send_orders(FrameNumber::IMMEDIATE, &[command("speed")]);
    a.send_orders(FrameNumber::IMMEDIATE, &[command("bogus")]);

    // The unhandled command produces a notice; once it arrives, all three
    // dispatches have run.
    a.wait_for("unknown-command notice", |_, _, payload| {
        OrderPacket::deserialize(payload)
            .into_orders()
            .into_iter()
            .find(|o| o.opcode() == Some("Message"))
            .and_then(|o| o.text_payload())
            .filter(|text| text.contains("Unknown server command: bogus"))
            .map(|_| ())
    });

    // "pause" stops at the first handler; "speed" falls through to the
    // second; "bogus" falls through unhandled.
    let entries = log.lock().expect("log lock").clone();
    assert_eq!(
        entries,
        vec![
            format!("joined {}", a.index),
            "first".to_string(),
            "second speed".to_string(),
            "second bogus".to_string(),
        ]
    );

    handle.shutdown();
}

#[test]
fn chat_relays_to_others_but_not_the_sender() {
    let (handle, addr) = start(config(1));

    let mut a = RawClient::connect(addr);
    a.complete_handshake("Alice");
    let mut b = RawClient::connect(addr);
    b.complete_handshake("Bob");

    a.send_orders(
        FrameNumber::IMMEDIATE,
        &[Order::immediate("Chat", b"hello everyone".to_vec())],
    );

    let text = b.wait_for_order("Chat");
    assert_eq!(text, "hello everyone");

    // The sender gets no echo of its own chat.
    let deadline = Instant::now() + Duration::from_millis(600);
    while Instant::now() < deadline {
        if let Ok((_, _, payload)) = a.try_next_frame(Duration::from_millis(100)) {
            let echoed = OrderPacket::deserialize(&payload)
                .orders()
                .iter()
                .any(|o| o.opcode() == Some("Chat"));
            assert!(!echoed, "chat echoed back to its sender");
        }
    }

    handle.shutdown();
}
