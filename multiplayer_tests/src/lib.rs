// Test-only clients for multiplayer integration tests.
//
// Two levels of harness:
//
// - `TestGameClient` wraps the real client stack — `NetConnection` +
//   `OrderManager` — around a scripted deterministic `TestSim`, providing
//   synchronous polling wrappers for exercising the full pipeline:
//   connect → handshake → lobby sync → start → orders → lockstep → sync
//   cross-check. All networking uses the same code paths as a real game
//   client; only the blocking poll loops are test-specific.
//
// - `RawClient` speaks the wire format directly (connect header, frames,
//   orders) with no pacing on top, so tests can assert the server's exact
//   output: relay stamps, Ack frames, priming, rejection orders.
//
// See `tests/full_pipeline.rs` for the scenarios.

use std::io::{self, BufReader};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use basalt_netplay::client::NetConnection;
use basalt_netplay::error::NetplayError;
use basalt_netplay::handshake::{HandshakeRequest, HandshakeResponse};
use basalt_netplay::order_manager::{
    Applied, NetControl, OrderManager, Simulation, StartGameParams,
};
use basalt_netplay::session::Session;
use basalt_protocol::{
    ClientIndex, FrameNumber, ORDERS_PROTOCOL, Order, OrderPacket, SyncRecord,
    read_connect_header, read_frame, write_frame,
};

/// Default timeout for blocking poll operations.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Sleep between poll attempts.
const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Scripted deterministic simulation: applies orders into a running state
/// hash and surfaces meta orders (handshake, lobby sync, pings, game start)
/// for the harness to react to.
#[derive(Default)]
pub struct TestSim {
    /// Regular (frame-bound) orders applied, in application order.
    pub applied: Vec<(ClientIndex, String)>,
    /// Chat/message/notice traffic, for assertions.
    pub notices: Vec<(ClientIndex, String, String)>,
    /// The server's handshake request, once received.
    pub handshake_request: Option<HandshakeRequest>,
    /// Ping payloads awaiting a pong.
    pub pings: Vec<String>,
    /// Latest lobby descriptor.
    pub session: Option<Session>,
    /// XORed into the checksum; lets a test force two sims to diverge while
    /// applying identical inputs.
    pub bias: u32,
    /// Reported defeat bitmask.
    pub defeat: u64,
    state: u32,
}

fn fold_bytes(seed: u32, bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(seed, |acc, b| acc.wrapping_mul(31).wrapping_add(u32::from(*b)))
}

impl Simulation for TestSim {
    fn apply(&mut self, client: ClientIndex, order: &Order, ctl: &mut NetControl) -> Applied {
        match order {
            Order::Handshake { opcode, payload } => {
                if opcode == "HandshakeRequest"
                    && let Ok(request) = HandshakeRequest::from_json(payload)
                {
                    self.handshake_request = Some(request);
                }
            }
            Order::Fields {
                opcode,
                payload,
                is_immediate,
            } => match opcode.as_str() {
                "SyncInfo" => {
                    if let Ok(session) = Session::deserialize(&String::from_utf8_lossy(payload)) {
                        self.session = Some(session);
                    }
                }
                "Ping" => self
                    .pings
                    .push(String::from_utf8_lossy(payload).into_owned()),
                "StartGame" => {
                    let (last_orders, last_sync) = parse_save_frames(payload);
                    let clients = self
                        .session
                        .as_ref()
                        .map(|s| s.non_bot_clients().map(|c| c.index).collect())
                        .unwrap_or_default();
                    let humans = self
                        .session
                        .as_ref()
                        .map_or(0, |s| s.non_bot_clients().count());
                    ctl.request_start_game(StartGameParams {
                        clients,
                        enable_sync_report: humans > 1,
                        save_last_orders_frame: last_orders,
                        save_last_sync_frame: last_sync,
                    });
                }
                "Chat" | "Message" | "Disconnected" => self.notices.push((
                    client,
                    opcode.clone(),
                    String::from_utf8_lossy(payload).into_owned(),
                )),
                _ if !is_immediate => {
                    // A real simulation input: fold it into the state hash.
                    self.state = fold_bytes(self.state, opcode.as_bytes());
                    self.state = fold_bytes(self.state, payload);
                    self.state = self.state.wrapping_add(client.0 as u32);
                    self.applied.push((client, opcode.clone()));
                }
                _ => {}
            },
            _ => {}
        }
        Applied::Continue
    }

    fn checksum(&self) -> u32 {
        self.state ^ self.bias
    }

    fn defeat_bitmask(&self) -> u64 {
        self.defeat
    }
}

fn parse_save_frames(payload: &[u8]) -> (FrameNumber, FrameNumber) {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(payload) else {
        return (FrameNumber(-1), FrameNumber(-1));
    };
    let frame = |key: &str| {
        value
            .get(key)
            .and_then(serde_json::Value::as_i64)
            .map_or(FrameNumber(-1), |n| FrameNumber(n as i32))
    };
    (frame("save_last_orders_frame"), frame("save_sync_frame"))
}

/// A test game client over the real client stack.
pub struct TestGameClient {
    pub manager: OrderManager<NetConnection>,
    pub sim: TestSim,
    /// Regular orders applied, stamped with the net frame they applied on.
    pub applied_log: Vec<(FrameNumber, ClientIndex, String)>,
    name: String,
}

impl TestGameClient {
    pub fn connect(addr: SocketAddr, name: &str) -> TestGameClient {
        let connection = NetConnection::connect(addr).expect("TestGameClient::connect failed");
        // Tick scale 1: every pump is a net tick, keeping tests fast.
        let manager = OrderManager::new(connection).with_tick_scale(1);
        TestGameClient {
            manager,
            sim: TestSim::default(),
            applied_log: Vec::new(),
            name: name.into(),
        }
    }

    pub fn index(&self) -> ClientIndex {
        self.manager.local_index()
    }

    /// One tick of the real client loop: flush immediates, drain the
    /// transport, attempt a paced frame. Newly applied regular orders are
    /// stamped with the frame they applied on, and pings are answered.
    pub fn pump(&mut self) -> Result<bool, NetplayError> {
        let frame = self.manager.net_frame();
        let before = self.sim.applied.len();
        let advanced = self.manager.tick(&mut self.sim)?;

        for (client, opcode) in &self.sim.applied[before..] {
            self.applied_log.push((frame, *client, opcode.clone()));
        }

        let pings: Vec<String> = self.sim.pings.drain(..).collect();
        for payload in pings {
            self.manager
                .issue_order(Order::immediate("Pong", payload.into_bytes()));
        }
        Ok(advanced)
    }

    /// Pump until `pred` holds. Panics on a netplay error or timeout.
    pub fn pump_until(&mut self, what: &str, mut pred: impl FnMut(&TestGameClient) -> bool) {
        let start = Instant::now();
        while !pred(self) {
            assert!(
                start.elapsed() < POLL_TIMEOUT,
                "timed out waiting for {what}"
            );
            self.pump().expect("netplay error while pumping");
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Pump until the client stack reports a fatal error; panics if none
    /// arrives in time.
    pub fn pump_until_error(&mut self) -> NetplayError {
        let start = Instant::now();
        loop {
            assert!(
                start.elapsed() < POLL_TIMEOUT,
                "timed out waiting for a netplay error"
            );
            if let Err(e) = self.pump() {
                return e;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Answer the server's handshake request, echoing its mod/version so the
    /// happy path always matches, then wait until the lobby lists us.
    pub fn complete_handshake(&mut self, password: Option<&str>) {
        self.pump_until("handshake request", |c| c.sim.handshake_request.is_some());
        let request = self
            .sim
            .handshake_request
            .clone()
            .expect("handshake request missing");

        let response = HandshakeResponse {
            mod_id: request.mod_id,
            version: request.version,
            orders_protocol: ORDERS_PROTOCOL,
            name: self.name.clone(),
            password: password.map(String::from),
            fingerprint: None,
            auth_signature: None,
        };
        let body = response.to_json().expect("serialize handshake response");
        self.manager
            .issue_order(Order::handshake("HandshakeResponse", body));

        let index = self.index();
        self.pump_until("lobby to list us", |c| {
            c.sim
                .session
                .as_ref()
                .is_some_and(|s| s.client_with_index(index).is_some())
        });
    }

    pub fn wait_until_started(&mut self) {
        self.pump_until("game start", |c| c.manager.game_started());
    }

    pub fn issue(&mut self, order: Order) {
        self.manager.issue_order(order);
    }
}

/// Wire-level test client: hand-speaks framing so tests can observe the
/// server's exact byte output.
pub struct RawClient {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
    pub index: ClientIndex,
}

impl RawClient {
    pub fn connect(addr: SocketAddr) -> RawClient {
        let stream = TcpStream::connect(addr).expect("RawClient::connect failed");
        let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));
        let (_, index) = read_connect_header(&mut reader).expect("read connect header");
        RawClient {
            stream,
            reader,
            index,
        }
    }

    /// Next frame, or the error that ended the read (timeout or close).
    pub fn try_next_frame(
        &mut self,
        timeout: Duration,
    ) -> io::Result<(ClientIndex, FrameNumber, Vec<u8>)> {
        self.reader
            .get_ref()
            .set_read_timeout(Some(timeout))
            .expect("set read timeout");
        read_frame(&mut self.reader)
    }

    /// Scan received frames until `f` produces a value or the deadline
    /// passes.
    pub fn wait_for<T>(
        &mut self,
        what: &str,
        mut f: impl FnMut(ClientIndex, FrameNumber, &[u8]) -> Option<T>,
    ) -> T {
        let start = Instant::now();
        while start.elapsed() < POLL_TIMEOUT {
            match self.try_next_frame(Duration::from_millis(200)) {
                Ok((sender, frame, payload)) => {
                    if let Some(value) = f(sender, frame, &payload) {
                        return value;
                    }
                }
                Err(e) if is_timeout(&e) => {}
                Err(e) => panic!("connection closed while waiting for {what}: {e}"),
            }
        }
        panic!("timed out waiting for {what}");
    }

    /// Wait for a Fields/Handshake order with this opcode; returns its text
    /// payload.
    pub fn wait_for_order(&mut self, opcode: &str) -> String {
        self.wait_for(&format!("order {opcode}"), |_, _, payload| {
            OrderPacket::deserialize(payload)
                .into_orders()
                .into_iter()
                .find(|o| o.opcode() == Some(opcode))
                .and_then(|o| o.text_payload())
        })
    }

    /// True if the server closes the connection within the timeout.
    pub fn wait_closed(&mut self) -> bool {
        let start = Instant::now();
        while start.elapsed() < POLL_TIMEOUT {
            match self.try_next_frame(Duration::from_millis(200)) {
                Ok(_) => {}
                Err(e) if is_timeout(&e) => {}
                Err(_) => return true,
            }
        }
        false
    }

    pub fn send_orders(&mut self, frame: FrameNumber, orders: &[Order]) {
        let packet = OrderPacket::new(orders.to_vec()).serialize();
        write_frame(&mut self.stream, self.index, frame, &packet).expect("send frame");
    }

    pub fn send_sync(&mut self, frame: FrameNumber, record: SyncRecord) {
        write_frame(&mut self.stream, self.index, frame, &record.encode()).expect("send sync");
    }

    /// Happy-path handshake: echo the server's identifiers back.
    pub fn complete_handshake(&mut self, name: &str) {
        let body = self.wait_for_order("HandshakeRequest");
        let request = HandshakeRequest::from_json(&body).expect("parse handshake request");
        self.respond(&HandshakeResponse {
            mod_id: request.mod_id,
            version: request.version,
            orders_protocol: ORDERS_PROTOCOL,
            name: name.into(),
            password: None,
            fingerprint: None,
            auth_signature: None,
        });
        self.wait_for_order("SyncInfo");
    }

    pub fn respond(&mut self, response: &HandshakeResponse) {
        let body = response.to_json().expect("serialize handshake response");
        self.send_orders(
            FrameNumber::IMMEDIATE,
            &[Order::handshake("HandshakeResponse", body)],
        );
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}
