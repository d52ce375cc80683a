// basalt_netplay — deterministic-lockstep network synchronization for Basalt
// multiplayer.
//
// Two tightly coupled halves of one protocol live here:
//
// Server half (the authoritative relay):
// - `server.rs`:     Event loop, handshake/validation state machine, order
//                    relay with latency projection, desync/defeat tracking,
//                    game start and save-resume priming.
// - `connection.rs`: One accepted socket — thin synchronous writes plus a
//                    background frame reader feeding the event queue.
// - `session.rs`:    Lobby descriptor broadcast to clients as an atomic blob.
// - `hooks.rs`:      Capability-keyed extension callbacks (lifecycle, tick,
//                    first-match-wins commands).
// - `replay.rs`:     Frame recording and cross-checked game-result metadata.
// - `game_save.rs`:  Order journal for resuming a session from a save.
//
// Client half (the order pump):
// - `order_manager.rs`: Frame-paced order dispatch, per-peer packet queues,
//                       readiness/backpressure, sync-hash cross-checking.
// - `client.rs`:        Transports — real TCP with Ack-resolved local order
//                       cache, and a loopback for local sessions.
// - `sync_report.rs`:   Post-mortem diagnostics dumped on desync.
//
// Shared plumbing: `handshake.rs` (negotiation bodies), `error.rs` (the
// client-fatal error taxonomy). The wire format itself lives in
// `basalt_protocol`.
//
// Threading: both halves funnel all state mutation onto one thread (the
// server's event-loop consumer, the client's logic tick) and restrict other
// threads to feeding channels. See `server.rs` for the full picture.

pub mod client;
pub mod connection;
pub mod error;
pub mod game_save;
pub mod handshake;
pub mod hooks;
pub mod order_manager;
pub mod replay;
pub mod server;
pub mod session;
pub mod sync_report;

pub use client::{LoopbackConnection, NetConnection, OrderConnection};
pub use error::NetplayError;
pub use game_save::{GameSave, SavedOrder};
pub use handshake::{HandshakeRequest, HandshakeResponse};
pub use hooks::ServerHooks;
pub use order_manager::{
    Applied, MAX_BUFFERED_FRAMES, NET_TICK_SCALE, NetControl, OrderManager, Simulation,
    StartGameParams,
};
pub use replay::{GameInfo, Outcome, PlayerRecord, ReplayRecorder, ReplaySink};
pub use server::{
    Collaborators, PlayerProfile, ProfileVerifier, Server, ServerConfig, ServerEvent,
    ServerHandle, ServerState, ServerType,
};
pub use session::{Client, ClientPing, ClientState, GlobalSettings, Session};
