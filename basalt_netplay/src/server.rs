// Authoritative relay server and main event loop.
//
// Architecture: thread-per-reader with a central `mpsc` channel.
//
// - **Listener threads** (one per bound address): accept TCP connections
//   while the session is waiting for players and send `ServerEvent::Connect`
//   to the consumer thread. They poll with a short sleep so they can stop
//   accepting the moment the session leaves the waiting state.
// - **Reader threads** (one per connection, spawned in `connection.rs`):
//   reassemble frames and send `ServerEvent::Packet` / `Disconnected`.
// - **Worker threads** (ad hoc): outbound profile verification calls; their
//   result re-enters the loop as a `ServerEvent::Callback` carrying the
//   partially validated client, so validation resumes on the consumer
//   thread.
// - **Consumer thread**: owns the `Server` (session, connections, ledger,
//   recorder) outright and is the only thread that mutates it. Extension
//   hooks run re-entrantly on this thread with full `&mut Server` access.
//
// Relay semantics: a frame-bound order packet received at frame F is
// broadcast to every *other* validated client stamped `F + order_latency`,
// and the sender gets a 13-byte Ack for the adjusted frame so it applies its
// own cached copy — every participant applies the same orders on the same
// frame, and only non-senders pay the payload bandwidth. SyncHash packets
// skip projection and relay verbatim at their true frame; the server
// cross-checks them in its own ledger and derives defeat/win results from
// the agreed bitmask. A server-side desync only cancels replay recording —
// with no simulation state to protect, the server stays up for diagnostics
// and so remaining clients can finish or leave gracefully.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use log::{error, info, warn};
use rand::distributions::{Alphanumeric, DistString};
use serde_json::json;

use basalt_protocol::{
    ClientIndex, FrameNumber, ORDERS_PROTOCOL, Order, OrderKind, OrderPacket, SYNC_PAYLOAD_LEN,
    SyncCheck, SyncLedger, SyncRecord, ack_frame, frame_bytes, write_connect_header,
};

use crate::connection::Connection;
use crate::game_save::GameSave;
use crate::handshake::{HandshakeRequest, HandshakeResponse};
use crate::hooks::ServerHooks;
use crate::replay::{GameInfo, Outcome, PlayerRecord, ReplaySink};
use crate::session::{Client, ClientPing, ClientState, Session};

/// Length of the random auth-token challenge issued per connection.
const AUTH_TOKEN_LEN: usize = 64;

/// Bounded wait on an empty event queue, so periodic hook ticks still run.
const EVENT_TIMEOUT: Duration = Duration::from_secs(1);

/// Accept-poll sleep while waiting for players.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerState {
    WaitingPlayers = 0,
    GameStarted = 1,
    ShuttingDown = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerType {
    /// Single-machine session; identity is trusted without verification.
    Local,
    /// Player-hosted network session; the admin leaving ends the session.
    Multiplayer,
    /// Standalone server; survives the admin leaving and re-elects one.
    Dedicated,
}

/// Session state flag shared with listener threads and the handle.
#[derive(Clone)]
struct SharedState(Arc<AtomicU8>);

impl SharedState {
    fn new() -> SharedState {
        SharedState(Arc::new(AtomicU8::new(ServerState::WaitingPlayers as u8)))
    }

    fn get(&self) -> ServerState {
        match self.0.load(Ordering::SeqCst) {
            0 => ServerState::WaitingPlayers,
            1 => ServerState::GameStarted,
            _ => ServerState::ShuttingDown,
        }
    }

    fn set(&self, state: ServerState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }
}

/// Resolved configuration. The sources of these values (flag parsing, the
/// game-speed table that fixes `order_latency`, ban-list storage) belong to
/// collaborators; the core only consumes the results.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub server_type: ServerType,
    pub listen_addrs: Vec<SocketAddr>,
    pub name: String,
    pub password: Option<String>,
    pub mod_id: String,
    pub version: String,
    pub banned_ips: Vec<String>,
    pub require_authentication: bool,
    pub profile_id_whitelist: Vec<String>,
    pub profile_id_blacklist: Vec<String>,
    pub allow_spectators: bool,
    pub slots: Vec<String>,
    /// Frames a regular order is delayed so all clients apply it together.
    /// Fixed for the lifetime of the session once the game starts.
    pub order_latency: i32,
    pub random_seed: i32,
    pub enable_sync_reports: bool,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            server_type: ServerType::Multiplayer,
            listen_addrs: vec![],
            name: "basalt-server".into(),
            password: None,
            mod_id: "basalt".into(),
            version: "dev".into(),
            banned_ips: vec![],
            require_authentication: false,
            profile_id_whitelist: vec![],
            profile_id_blacklist: vec![],
            allow_spectators: true,
            slots: (0..4).map(|i| format!("slot{i}")).collect(),
            order_latency: 1,
            random_seed: 0,
            enable_sync_reports: true,
        }
    }
}

/// A verified player identity returned by the profile service.
#[derive(Clone, Debug)]
pub struct PlayerProfile {
    pub profile_id: String,
    pub profile_name: String,
}

/// Out-of-band identity verification. `verify` runs on a worker thread and
/// may block on I/O; its result re-enters the event loop as a callback.
pub trait ProfileVerifier: Send + Sync {
    fn verify(
        &self,
        fingerprint: &str,
        challenge: &str,
        signature: &str,
    ) -> Result<PlayerProfile, String>;
}

/// External collaborators wired in at start. Hooks must be registered here;
/// registrations made after start are not possible.
#[derive(Default)]
pub struct Collaborators {
    pub hooks: ServerHooks,
    pub verifier: Option<Arc<dyn ProfileVerifier>>,
    pub replay: Option<Box<dyn ReplaySink>>,
}

/// Events feeding the consumer thread. Edge threads enqueue these; they
/// never touch server state directly.
pub enum ServerEvent {
    Connect(TcpStream),
    Packet {
        index: ClientIndex,
        frame: FrameNumber,
        data: Vec<u8>,
    },
    Disconnected {
        index: ClientIndex,
    },
    /// Deferred work re-injected into the serialized event stream (profile
    /// verification completions, external control via the handle).
    Callback(Box<dyn FnOnce(&mut Server) + Send>),
}

/// Control handle returned by `Server::start`.
pub struct ServerHandle {
    state: SharedState,
    event_tx: Sender<ServerEvent>,
    thread: Option<thread::JoinHandle<()>>,
    local_addrs: Vec<SocketAddr>,
}

impl ServerHandle {
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// First bound address, convenient for loopback sessions.
    pub fn addr(&self) -> Option<SocketAddr> {
        self.local_addrs.first().copied()
    }

    pub fn state(&self) -> ServerState {
        self.state.get()
    }

    /// Run `f` on the consumer thread with full access to the server. This
    /// is the external control surface — start the game, load a save, probe
    /// state through a reply channel.
    pub fn call(&self, f: impl FnOnce(&mut Server) + Send + 'static) {
        let _ = self.event_tx.send(ServerEvent::Callback(Box::new(f)));
    }

    /// Signal shutdown and wait for the event loop to finish.
    pub fn shutdown(mut self) {
        self.state.set(ServerState::ShuttingDown);
        // Wake the consumer if it is idle in its bounded wait.
        let _ = self
            .event_tx
            .send(ServerEvent::Callback(Box::new(|_server: &mut Server| {})));
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    /// Wait for the event loop to finish without requesting shutdown (for
    /// sessions that end themselves, like an admin-drop cascade).
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

pub struct Server {
    config: ServerConfig,
    state: SharedState,
    pub session: Session,
    conns: Vec<Connection>,
    temp_bans: Vec<String>,
    order_latency: i32,
    next_client_index: i32,
    event_tx: Sender<ServerEvent>,
    hooks: ServerHooks,
    verifier: Option<Arc<dyn ProfileVerifier>>,
    recorder: Option<Box<dyn ReplaySink>>,
    game_info: Option<GameInfo>,
    sync_ledger: SyncLedger,
    last_defeat_state: u64,
    last_defeat_frame: FrameNumber,
    game_save: Option<GameSave>,
    run_start: Instant,
}

impl Server {
    /// Bind the configured addresses, spawn listener threads and the
    /// consumer thread, and return the control handle. Fails only if no
    /// address could be bound.
    pub fn start(config: ServerConfig, collaborators: Collaborators) -> io::Result<ServerHandle> {
        if config.listen_addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "no listen addresses configured",
            ));
        }

        let state = SharedState::new();
        let (event_tx, event_rx) = mpsc::channel();

        let mut local_addrs = Vec::new();
        let mut last_error = None;
        for addr in &config.listen_addrs {
            let listener = match TcpListener::bind(addr) {
                Ok(l) => l,
                Err(e) => {
                    warn!("failed to listen on {addr}: {e}");
                    last_error = Some(e);
                    continue;
                }
            };
            let local = listener.local_addr()?;
            local_addrs.push(local);
            listener.set_nonblocking(true)?;

            let state = state.clone();
            let tx = event_tx.clone();
            thread::Builder::new()
                .name(format!("listener-{local}"))
                .spawn(move || listener_loop(listener, state, tx))?;
        }

        if local_addrs.is_empty() {
            return Err(last_error
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "bind failed")));
        }

        let mut session = Session {
            slots: config.slots.clone(),
            ..Session::default()
        };
        session.global.server_name = config.name.clone();
        session.global.random_seed = config.random_seed;
        session.global.game_uid = Alphanumeric.sample_string(&mut rand::thread_rng(), 32);
        session.global.allow_spectators = config.allow_spectators;
        session.global.dedicated = config.server_type == ServerType::Dedicated;
        session.global.enable_singleplayer = config.server_type != ServerType::Dedicated;
        session.global.enable_sync_reports = config.enable_sync_reports;

        let server = Server {
            order_latency: config.order_latency,
            config,
            state: state.clone(),
            session,
            conns: Vec::new(),
            temp_bans: Vec::new(),
            next_client_index: 1,
            event_tx: event_tx.clone(),
            hooks: collaborators.hooks,
            verifier: collaborators.verifier,
            recorder: collaborators.replay,
            game_info: None,
            sync_ledger: SyncLedger::new(),
            last_defeat_state: 0,
            last_defeat_frame: FrameNumber(0),
            game_save: None,
            run_start: Instant::now(),
        };

        let thread = thread::Builder::new()
            .name("server-events".into())
            .spawn(move || server.run(event_rx))?;

        Ok(ServerHandle {
            state,
            event_tx,
            thread: Some(thread),
            local_addrs,
        })
    }

    /// Main event loop. The consumer blocks with a bounded timeout so hook
    /// ticks keep running while the queue is idle.
    fn run(mut self, event_rx: Receiver<ServerEvent>) {
        self.with_hooks(|hooks, server| hooks.notify_server_start(server));
        info!("server started, waiting for players");

        loop {
            if self.state.get() != ServerState::ShuttingDown {
                match event_rx.recv_timeout(EVENT_TIMEOUT) {
                    Ok(event) => {
                        self.handle_event(event);
                        // Drain whatever arrived while handling.
                        while let Ok(event) = event_rx.try_recv() {
                            self.handle_event(event);
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => self.state.set(ServerState::ShuttingDown),
                }

                self.with_hooks(|hooks, server| hooks.notify_tick(server));
            }

            if self.state.get() == ServerState::ShuttingDown {
                self.end_game();
                break;
            }
        }

        self.with_hooks(|hooks, server| hooks.notify_shutdown(server));
        self.conns.clear();
        info!("server shut down");
    }

    fn handle_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Connect(stream) => self.accept_connection(stream),
            ServerEvent::Packet { index, frame, data } => self.receive_orders(index, frame, &data),
            ServerEvent::Disconnected { index } => self.drop_client(index),
            ServerEvent::Callback(f) => f(self),
        }
    }

    /// Hooks need `&mut Server` while living inside it; take them out for
    /// the duration of the dispatch.
    fn with_hooks(&mut self, f: impl FnOnce(&mut ServerHooks, &mut Server)) {
        let mut hooks = std::mem::take(&mut self.hooks);
        f(&mut hooks, self);
        self.hooks = hooks;
    }

    pub fn state(&self) -> ServerState {
        self.state.get()
    }

    pub fn server_type(&self) -> ServerType {
        self.config.server_type
    }

    pub fn order_latency(&self) -> i32 {
        self.order_latency
    }

    /// True once any frame's sync reports have diverged.
    pub fn is_out_of_sync(&self) -> bool {
        self.sync_ledger.out_of_sync()
    }

    /// True while a replay recording is active (a desync releases it).
    pub fn replay_active(&self) -> bool {
        self.recorder.is_some()
    }

    pub fn game_info(&self) -> Option<&GameInfo> {
        self.game_info.as_ref()
    }

    /// Ban an address for the rest of this server's lifetime (command hooks
    /// drive this; permanent bans come resolved in the config).
    pub fn temp_ban(&mut self, ip: impl Into<String>) {
        self.temp_bans.push(ip.into());
    }

    /// Stage a save to resume from when the game starts. Ignored once the
    /// session has left the lobby.
    pub fn load_game_save(&mut self, save: GameSave) {
        if self.state.get() != ServerState::WaitingPlayers {
            return;
        }
        self.game_save = Some(save);
    }

    pub fn shutdown(&mut self) {
        self.state.set(ServerState::ShuttingDown);
    }

    fn conn(&self, index: ClientIndex) -> Option<&Connection> {
        self.conns.iter().find(|c| c.index == index)
    }

    fn conn_mut(&mut self, index: ClientIndex) -> Option<&mut Connection> {
        self.conns.iter_mut().find(|c| c.index == index)
    }

    fn run_time_millis(&self) -> i64 {
        i64::try_from(self.run_start.elapsed().as_millis()).unwrap_or(i64::MAX)
    }

    // ---- connection lifecycle ----

    fn accept_connection(&mut self, stream: TcpStream) {
        if self.state.get() != ServerState::WaitingPlayers {
            return; // Dropping the stream closes it.
        }

        // The client proves an identity claim by signing this random blob.
        let token = Alphanumeric.sample_string(&mut rand::thread_rng(), AUTH_TOKEN_LEN);
        let index = ClientIndex(self.next_client_index);
        self.next_client_index += 1;

        let mut conn = match Connection::new(stream, index, token.clone()) {
            Ok(conn) => conn,
            Err(e) => {
                warn!("accepting connection failed: {e}");
                return;
            }
        };

        let greeting = (|| -> io::Result<()> {
            let mut header = Vec::with_capacity(8);
            write_connect_header(&mut header, index)?;
            conn.send_data(&header)?;

            let request = HandshakeRequest {
                mod_id: self.config.mod_id.clone(),
                version: self.config.version.clone(),
                auth_token: token,
            };
            let body = request
                .to_json()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            let order = Order::handshake("HandshakeRequest", body).serialize();
            conn.send_data(&frame_bytes(
                ClientIndex::SERVER,
                FrameNumber::IMMEDIATE,
                &order,
            ))?;

            conn.spawn_reader(self.event_tx.clone())
        })();

        match greeting {
            Ok(()) => self.conns.push(conn),
            Err(e) => warn!("handshake for client {index} failed: {e}"),
        }
    }

    /// Final and irreversible: close the socket, remove the client, notify
    /// everyone else, and cascade if it was the admin of a non-dedicated
    /// session.
    pub fn drop_client(&mut self, index: ClientIndex) {
        let Some(pos) = self.conns.iter().position(|c| c.index == index) else {
            return; // Stale disconnect event for an already-dropped index.
        };
        let conn = self.conns.remove(pos);

        let Some(dropped) = self.session.client_with_index(index).cloned() else {
            return; // Never validated; closing the socket is all there is.
        };

        let state = self.state.get();
        let suffix = if state == ServerState::GameStarted {
            if dropped.is_spectator() {
                " (Spectator)".to_string()
            } else if dropped.team != 0 {
                format!(" (Team {})", dropped.team)
            } else {
                String::new()
            }
        } else {
            String::new()
        };
        self.send_message(&format!("{}{suffix} has disconnected.", dropped.name));

        // Human-readable notice attributed to the leaving client, then the
        // binary disconnect packet the order managers consume.
        self.dispatch_orders_to_clients(
            index,
            FrameNumber::IMMEDIATE,
            &Order::immediate_text("Disconnected", "").serialize(),
        );

        if let Some(info) = &mut self.game_info
            && !dropped.is_spectator()
            && let Some(player) = info.players.iter_mut().find(|p| p.client == index)
        {
            player.disconnect_frame = Some(conn.most_recent_frame);
        }

        self.session.clients.retain(|c| c.index != index);
        self.session.client_pings.retain(|p| p.index != index);

        // A dedicated server in the lobby re-elects an admin; the dropped
        // admin's bots leave with them.
        if self.config.server_type == ServerType::Dedicated
            && dropped.is_admin
            && state == ServerState::WaitingPlayers
        {
            self.session
                .clients
                .retain(|c| !(c.is_bot && c.bot_controller == Some(index)));
            if let Some(next) = self
                .session
                .clients
                .iter_mut()
                .filter(|c| !c.is_bot)
                .min_by_key(|c| c.index)
            {
                next.is_admin = true;
                let name = next.name.clone();
                self.send_message(&format!("{name} is now the admin."));
            }
        }

        self.dispatch_server_orders_to_clients(
            &Order::Disconnect { client: index }.serialize(),
        );

        if !self.conns.iter().any(|c| c.validated) {
            self.with_hooks(|hooks, server| hooks.notify_server_empty(server));
        }

        if self.conns.iter().any(|c| c.validated)
            || self.config.server_type == ServerType::Dedicated
        {
            self.sync_lobby_info();
        }

        if self.config.server_type != ServerType::Dedicated && dropped.is_admin {
            self.shutdown();
        }
    }

    // ---- order relay ----

    /// Entry point for every packet a reader thread produced.
    fn receive_orders(&mut self, index: ClientIndex, frame: FrameNumber, data: &[u8]) {
        let Some(validated) = self.conn(index).map(|c| c.validated) else {
            return; // Packet raced a drop.
        };

        if frame == FrameNumber::IMMEDIATE {
            self.interpret_server_orders(index, data);
            return;
        }

        if !validated {
            warn!("dropping client {index}: frame-bound orders before validation");
            self.drop_client(index);
            return;
        }
        if let Some(conn) = self.conn_mut(index) {
            conn.most_recent_frame = frame;
        }

        let adjusted = if data.first() == Some(&(OrderKind::SyncHash as u8)) {
            // Sync reports bypass latency projection: desync detection needs
            // the true simulation frame. No Ack either — there is nothing
            // cached to apply.
            if SyncRecord::decode(data).is_none() {
                warn!(
                    "dropped sync order with length {} from client {index}; expected {SYNC_PAYLOAD_LEN}",
                    data.len()
                );
                return;
            }
            frame
        } else {
            // Project into the future so every client applies the orders on
            // the same frame. The sender already holds the bytes, so it gets
            // a lightweight Ack instead of an echo.
            let adjusted = frame.project(self.order_latency);
            self.send_raw_to(index, &ack_frame(adjusted));
            adjusted
        };

        self.dispatch_orders_to_clients(index, adjusted, data);

        if let Some(save) = &mut self.game_save {
            save.dispatch_orders(index, adjusted, data);
        }
    }

    /// Broadcast a frame to every validated connection except the sender,
    /// then record it.
    fn dispatch_orders_to_clients(&mut self, from: ClientIndex, frame: FrameNumber, data: &[u8]) {
        let frame_data = frame_bytes(from, frame, data);
        let targets: Vec<ClientIndex> = self
            .conns
            .iter()
            .filter(|c| c.index != from && c.validated)
            .map(|c| c.index)
            .collect();
        for target in targets {
            self.send_raw_to(target, &frame_data);
        }
        self.record_order(from, frame, data);
    }

    /// Broadcast a server-originated immediate order to every validated
    /// connection.
    fn dispatch_server_orders_to_clients(&mut self, data: &[u8]) {
        self.dispatch_orders_to_clients(ClientIndex::SERVER, FrameNumber::IMMEDIATE, data);
    }

    fn send_raw_to(&mut self, index: ClientIndex, frame_data: &[u8]) {
        let Some(conn) = self.conn_mut(index) else {
            return;
        };
        if let Err(e) = conn.send_data(frame_data) {
            warn!("dropping client {index}: dispatching orders failed: {e}");
            self.drop_client(index);
        }
    }

    fn send_order_to(&mut self, index: ClientIndex, opcode: &str, text: &str) {
        let order = Order::immediate_text(opcode, text).serialize();
        self.send_raw_to(
            index,
            &frame_bytes(ClientIndex::SERVER, FrameNumber::IMMEDIATE, &order),
        );
    }

    /// Chat-style broadcast from the server itself.
    pub fn send_message(&mut self, text: &str) {
        self.dispatch_server_orders_to_clients(&Order::immediate_text("Message", text).serialize());
        if self.config.server_type == ServerType::Dedicated {
            info!("{text}");
        }
    }

    fn record_order(&mut self, from: ClientIndex, frame: FrameNumber, data: &[u8]) {
        if let Some(recorder) = &mut self.recorder {
            recorder.receive_frame(from, frame, data);
        }

        if data.first() == Some(&(OrderKind::SyncHash as u8))
            && let Some(record) = SyncRecord::decode(data)
        {
            self.handle_sync_order(frame, record);
        }
    }

    // ---- desync and defeat tracking ----

    fn handle_sync_order(&mut self, frame: FrameNumber, record: SyncRecord) {
        match self.sync_ledger.check(frame, record) {
            SyncCheck::Mismatch => self.out_of_sync(frame),
            SyncCheck::New => {
                // Defeat bookkeeping happens once, against the first report
                // for a frame; the ledger guarantees a flagged desync if any
                // other participant disagrees.
                if frame > self.last_defeat_frame && record.defeat != self.last_defeat_state {
                    let new_defeats = record.defeat & !self.last_defeat_state;
                    for bit in 0..64 {
                        if new_defeats & (1 << bit) != 0 {
                            self.set_player_defeat(bit);
                        }
                    }
                    self.last_defeat_state = record.defeat;
                    self.last_defeat_frame = frame;
                }
            }
            SyncCheck::Match | SyncCheck::AlreadyFlagged => {}
        }
    }

    fn out_of_sync(&mut self, frame: FrameNumber) {
        error!("out of sync detected at frame {frame}, cancelling replay recording");
        if let Some(mut recorder) = self.recorder.take() {
            recorder.invalidate();
        }
    }

    fn set_player_defeat(&mut self, player: usize) {
        let Some(info) = &mut self.game_info else {
            return;
        };
        let Some(defeated) = info.players.get_mut(player) else {
            return;
        };
        if defeated.outcome != Outcome::Undefined {
            return;
        }
        defeated.outcome = Outcome::Lost;
        info!("{} has been defeated", defeated.name);

        // When every remaining player is on one shared team (or only one
        // player remains), they have all won.
        if !contest_remains(&info.players) {
            for winner in info
                .players
                .iter_mut()
                .filter(|p| p.outcome == Outcome::Undefined)
            {
                winner.outcome = Outcome::Won;
            }
        }
    }

    // ---- immediate server orders ----

    fn interpret_server_orders(&mut self, index: ClientIndex, data: &[u8]) {
        for order in OrderPacket::deserialize(data).into_orders() {
            self.interpret_server_order(index, order);
            if self.conn(index).is_none() {
                break; // The order got this client dropped; stop parsing.
            }
        }
    }

    fn interpret_server_order(&mut self, index: ClientIndex, order: Order) {
        let Some(validated) = self.conn(index).map(|c| c.validated) else {
            return;
        };

        // Only handshake responses are accepted from unvalidated clients;
        // anything else may be an attempt to exploit the server.
        if !validated {
            match order {
                Order::Handshake { opcode, payload } if opcode == "HandshakeResponse" => {
                    self.validate_client(index, &payload);
                }
                other => {
                    warn!(
                        "dropping client {index}: first order {:?} is not a handshake response",
                        other.kind()
                    );
                    self.drop_client(index);
                }
            }
            return;
        }

        let Order::Fields {
            opcode, payload, ..
        } = order
        else {
            return; // No server-side meaning once validated.
        };

        match opcode.as_str() {
            "Command" => {
                let command = String::from_utf8_lossy(&payload).into_owned();
                let mut hooks = std::mem::take(&mut self.hooks);
                let handled = hooks.dispatch_command(self, index, &command);
                self.hooks = hooks;
                if !handled {
                    warn!("unknown server command from client {index}: {command}");
                    self.send_order_to(index, "Message", &format!("Unknown server command: {command}"));
                }
            }
            "Chat" => {
                // Relayed to everyone else; the sender already displays its
                // own line locally.
                let data = Order::immediate("Chat", payload).serialize();
                self.dispatch_orders_to_clients(index, FrameNumber::IMMEDIATE, &data);
            }
            "Pong" => self.handle_pong(index, &payload),
            _ => {} // Collaborator traffic the core does not interpret.
        }
    }

    fn handle_pong(&mut self, index: ClientIndex, payload: &[u8]) {
        let text = String::from_utf8_lossy(payload);
        let Ok(sent) = text.trim().parse::<i64>() else {
            warn!("invalid pong payload from client {index}: {text}");
            return;
        };

        let now = self.run_time_millis();
        let Some(ping) = self.session.ping_for_client_mut(index) else {
            return;
        };
        ping.record(now.saturating_sub(sent));
        self.sync_client_pings();
    }

    // ---- handshake validation ----

    /// Validation checks run in order; the first failure sends a descriptive
    /// order and drops the connection. Identity verification crosses a
    /// thread boundary, so the tail of the sequence runs as a continuation
    /// carrying the partially validated client record.
    fn validate_client(&mut self, index: ClientIndex, payload: &str) {
        let handshake = match HandshakeResponse::from_json(payload) {
            Ok(handshake) => handshake,
            Err(e) => {
                warn!("dropping client {index}: malformed handshake response: {e}");
                self.drop_client(index);
                return;
            }
        };

        if self.state.get() == ServerState::GameStarted {
            self.reject(index, "ServerError", "The game has already started");
            return;
        }

        if let Some(password) = &self.config.password
            && handshake.password.as_deref() != Some(password.as_str())
        {
            let message = if handshake.password.as_deref().unwrap_or("").is_empty() {
                "Server requires a password"
            } else {
                "Incorrect password"
            };
            self.reject(index, "AuthenticationError", message);
            return;
        }

        if handshake.mod_id != self.config.mod_id {
            self.reject(index, "ServerError", "Server is running an incompatible mod");
            return;
        }
        if handshake.version != self.config.version {
            self.reject(
                index,
                "ServerError",
                "Server is running an incompatible version",
            );
            return;
        }
        if handshake.orders_protocol != ORDERS_PROTOCOL {
            self.reject(
                index,
                "ServerError",
                "Server is running an incompatible protocol",
            );
            return;
        }

        let Some(conn) = self.conn(index) else { return };
        let ip = conn.ip().to_string();
        let token = conn.auth_token.clone();

        if self.config.banned_ips.contains(&ip) || self.temp_bans.contains(&ip) {
            let message = if self.config.banned_ips.contains(&ip) {
                "You have been banned from the server"
            } else {
                "You have been temporarily banned from the server"
            };
            self.reject(index, "ServerError", message);
            return;
        }

        let mut client = Client {
            index,
            name: sanitize_name(&handshake.name),
            ip_address: ip,
            slot: None,
            team: 0,
            state: ClientState::Invalid,
            is_admin: false,
            is_bot: false,
            bot_controller: None,
            fingerprint: None,
        };

        match (
            self.config.server_type,
            handshake.fingerprint.clone(),
            handshake.auth_signature.clone(),
        ) {
            (ServerType::Local, fingerprint, _) => {
                // Local sessions are joined from the same machine; trust the
                // identity claim without verification.
                client.fingerprint = fingerprint;
                self.complete_connection(index, client);
            }
            (_, Some(fingerprint), Some(signature)) => {
                // Steps so far ran synchronously; verification completes on
                // a worker and re-enters as a callback event.
                let verifier = self.verifier.clone();
                let tx = self.event_tx.clone();
                thread::spawn(move || {
                    let profile = match &verifier {
                        Some(v) => match v.verify(&fingerprint, &token, &signature) {
                            Ok(profile) => Some(profile),
                            Err(reason) => {
                                info!("client {index} failed to authenticate as {fingerprint}: {reason}");
                                None
                            }
                        },
                        None => None,
                    };
                    if profile.is_some() {
                        client.fingerprint = Some(fingerprint);
                    }
                    let _ = tx.send(ServerEvent::Callback(Box::new(move |server| {
                        server.finish_deferred_validation(index, client, profile);
                    })));
                });
            }
            _ => {
                if self.requires_identity() {
                    self.reject(
                        index,
                        "ServerError",
                        "Server requires players to have an authenticated profile",
                    );
                } else {
                    self.complete_connection(index, client);
                }
            }
        }
    }

    fn requires_identity(&self) -> bool {
        self.config.server_type == ServerType::Dedicated
            && (self.config.require_authentication || !self.config.profile_id_whitelist.is_empty())
    }

    /// Resumption of `validate_client` after the out-of-band verification
    /// call, back on the consumer thread.
    fn finish_deferred_validation(
        &mut self,
        index: ClientIndex,
        client: Client,
        profile: Option<PlayerProfile>,
    ) {
        if self.conn(index).is_none() {
            return; // Disconnected while verification ran.
        }

        let dedicated = self.config.server_type == ServerType::Dedicated;
        let not_authenticated = profile.is_none() && self.requires_identity();
        let blacklisted = dedicated
            && profile
                .as_ref()
                .is_some_and(|p| self.config.profile_id_blacklist.contains(&p.profile_id));
        let not_whitelisted = dedicated
            && !self.config.profile_id_whitelist.is_empty()
            && !profile
                .as_ref()
                .is_some_and(|p| self.config.profile_id_whitelist.contains(&p.profile_id));

        if not_authenticated {
            self.reject(
                index,
                "ServerError",
                "Server requires players to have an authenticated profile",
            );
        } else if blacklisted || not_whitelisted {
            self.reject(
                index,
                "ServerError",
                "You do not have permission to join this server",
            );
        } else {
            if let Some(profile) = &profile {
                info!("client {index} authenticated as {}", profile.profile_name);
            }
            self.complete_connection(index, client);
        }
    }

    fn reject(&mut self, index: ClientIndex, opcode: &str, reason: &str) {
        info!("rejected connection from client {index}: {reason}");
        self.send_order_to(index, opcode, reason);
        self.drop_client(index);
    }

    /// Tail of validation: slot assignment, admin election, promotion to a
    /// validated client, and the join broadcast.
    fn complete_connection(&mut self, index: ClientIndex, mut client: Client) {
        client.slot = self.session.first_empty_slot();
        client.is_admin = !self.session.clients.iter().any(|c| c.is_admin);

        if client.is_spectator() && !self.session.global.allow_spectators {
            self.reject(index, "ServerError", "The game is full");
            return;
        }

        client.state = ClientState::NotReady;
        let name = client.name.clone();
        self.session.clients.push(client);
        match self.conn_mut(index) {
            Some(conn) => conn.validated = true,
            None => return,
        }
        self.session.client_pings.push(ClientPing::new(index));
        info!("client {index}: accepted connection");

        self.with_hooks(|hooks, server| hooks.notify_client_joined(server, index));
        self.sync_lobby_info();

        if self.config.server_type != ServerType::Local {
            self.send_message(&format!("{name} has joined the game."));
        }

        let now = self.run_time_millis();
        self.send_order_to(index, "Ping", &now.to_string());
    }

    // ---- lobby state broadcast ----

    /// Broadcast the whole descriptor as one atomic blob. Only while waiting
    /// for players — mid-game lobby updates would fight the simulation.
    pub fn sync_lobby_info(&mut self) {
        if self.state.get() != ServerState::WaitingPlayers {
            return;
        }
        match self.session.serialize() {
            Ok(blob) => self.dispatch_server_orders_to_clients(
                &Order::immediate_text("SyncInfo", blob).serialize(),
            ),
            Err(e) => error!("lobby descriptor serialization failed: {e}"),
        }
    }

    fn sync_client_pings(&mut self) {
        match serde_json::to_string(&self.session.client_pings) {
            Ok(blob) => self.dispatch_server_orders_to_clients(
                &Order::immediate_text("SyncClientPings", blob).serialize(),
            ),
            Err(e) => error!("ping serialization failed: {e}"),
        }
    }

    // ---- game start ----

    /// Leave the lobby: kick stragglers, build result tracking, broadcast
    /// the start order, replay any staged save, and prime the first
    /// `order_latency` frames with empty packets for every client so no
    /// queue ever misses a packet for a registered peer.
    pub fn start_game(&mut self) {
        if self.state.get() != ServerState::WaitingPlayers {
            return;
        }
        info!("game started");

        let to_kick: Vec<ClientIndex> = self
            .conns
            .iter()
            .filter(|c| {
                !c.validated
                    || !matches!(
                        self.session.client_with_index(c.index),
                        Some(client) if client.state != ClientState::Invalid
                    )
            })
            .map(|c| c.index)
            .collect();
        for index in to_kick {
            self.send_order_to(index, "ServerError", "You have been kicked from the server!");
            self.drop_client(index);
        }

        self.session.global.game_saves_enabled = self.config.server_type != ServerType::Dedicated
            && self.session.non_bot_clients().count() == 1;

        // Result-tracking list in slot order: bit i of the defeat bitmask
        // maps to players[i], an indexing every participant can derive from
        // the shared lobby state.
        let slots = self.session.slots.clone();
        let mut players = Vec::new();
        for slot in &slots {
            if let Some(client) = self
                .session
                .clients
                .iter()
                .find(|c| c.slot.as_deref() == Some(slot.as_str()))
            {
                players.push(PlayerRecord {
                    client: client.index,
                    name: client.name.clone(),
                    team: client.team,
                    outcome: Outcome::Undefined,
                    disconnect_frame: None,
                });
            }
        }
        self.game_info = Some(GameInfo {
            mod_id: self.config.mod_id.clone(),
            version: self.config.version.clone(),
            server_name: self.config.name.clone(),
            players,
        });

        self.sync_lobby_info();
        self.state.set(ServerState::GameStarted);

        if self.game_save.is_none() && self.session.global.game_saves_enabled {
            self.game_save = Some(GameSave::new());
        }

        let start_data = match &self.game_save {
            Some(save) if save.last_orders_frame.0 >= 0 => json!({
                "save_last_orders_frame": save.last_orders_frame.0,
                "save_sync_frame": save.last_sync_frame.0,
            })
            .to_string(),
            _ => String::new(),
        };
        self.dispatch_server_orders_to_clients(
            &Order::immediate_text("StartGame", start_data).serialize(),
        );

        self.with_hooks(|hooks, server| hooks.notify_game_started(server));

        // Resuming a save: replay the journal so clients fast-forward, then
        // continue live play after the last saved frame.
        let mut first_frame = FrameNumber(1);
        if let Some(save) = self.game_save.take() {
            if save.last_orders_frame.0 >= 0 {
                let targets: Vec<ClientIndex> = self
                    .conns
                    .iter()
                    .filter(|c| c.validated)
                    .map(|c| c.index)
                    .collect();
                save.parse_orders(|client, frame, payload| {
                    let frame_data = frame_bytes(client, frame, payload);
                    for &target in &targets {
                        self.send_raw_to(target, &frame_data);
                    }
                });
                first_frame = FrameNumber(save.last_orders_frame.0 + 1);
            }
            self.game_save = Some(save);
        }

        // Clients demand exactly one packet per peer per frame before a
        // frame can process; nobody has sent anything for the first
        // `order_latency` frames, so synthesize empty packets for them.
        let validated: Vec<ClientIndex> = self
            .conns
            .iter()
            .filter(|c| c.validated)
            .map(|c| c.index)
            .collect();
        for &from in &validated {
            for offset in 0..self.order_latency {
                let frame = FrameNumber(first_frame.0 + offset);
                let frame_data = frame_bytes(from, frame, &[]);
                for &target in &validated {
                    self.send_raw_to(target, &frame_data);
                }
                self.record_order(from, frame, &[]);
                if let Some(save) = &mut self.game_save {
                    save.dispatch_orders(from, frame, &[]);
                }
            }
        }
    }

    fn end_game(&mut self) {
        if let Some(mut recorder) = self.recorder.take() {
            recorder.finalize(self.game_info.as_ref());
        }
    }
}

fn listener_loop(listener: TcpListener, state: SharedState, tx: Sender<ServerEvent>) {
    while state.get() == ServerState::WaitingPlayers {
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false).ok();
                if tx.send(ServerEvent::Connect(stream)).is_err() {
                    break;
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(_) => break,
        }
    }
}

/// True while at least two undefeated sides remain (different teams, or any
/// teamless player alongside another survivor).
fn contest_remains(players: &[PlayerRecord]) -> bool {
    let mut last_team = None;
    for player in players.iter().filter(|p| p.outcome == Outcome::Undefined) {
        if let Some(team) = last_team
            && (player.team != team || player.team == 0)
        {
            return true;
        }
        last_team = Some(player.team);
    }
    false
}

fn sanitize_name(name: &str) -> String {
    let trimmed: String = name.trim().chars().take(32).collect();
    if trimmed.is_empty() {
        "Player".into()
    } else {
        trimmed
    }
}
