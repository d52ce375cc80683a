// basalt_protocol — wire protocol for Basalt lockstep multiplayer.
//
// This crate defines the frame format, order encoding, and sync-hash ledger
// shared by the relay server and game clients. It is transport-level only:
// no sockets, no threads, no session state.
//
// Module overview:
// - `types.rs`:   Core ID types — `ClientIndex`, `FrameNumber`.
// - `order.rs`:   `Order`/`OrderPacket` binary codec — the discrete
//                 simulation inputs packed into frame payloads.
// - `framing.rs`: `[length][sender][frame][payload]` little-endian framing
//                 over any `Read`/`Write` stream, the special Ack frame, and
//                 the raw connect header.
// - `sync.rs`:    13-byte sync-hash payload codec and the per-frame
//                 divergence ledger used by both sides.
//
// Design decisions:
// - **Binary encoding.** Orders are relayed at frame cadence; the codec is
//   hand-rolled little-endian with length-prefixed strings rather than a
//   self-describing format. Opaque blobs that ride *inside* order payloads
//   (lobby state, handshake bodies) are free to use whatever encoding their
//   owners choose.
// - **Lenient packet decoding.** End-of-input terminates a packet normally;
//   an unknown discriminant abandons the remainder of that packet with a
//   warning. One peer running an incompatible build must not take the
//   session down.
// - **No async runtime.** Framing works on blocking `std::io` streams and
//   buffered wrappers.

pub mod framing;
pub mod order;
pub mod sync;
pub mod types;

pub use framing::{
    HANDSHAKE_PROTOCOL, MAX_FRAME_SIZE, ORDERS_PROTOCOL, ack_frame, frame_bytes,
    read_connect_header, read_frame, write_connect_header, write_frame,
};
pub use order::{DecodeError, Order, OrderKind, OrderPacket};
pub use sync::{SYNC_PAYLOAD_LEN, SyncCheck, SyncLedger, SyncRecord};
pub use types::{ClientIndex, FrameNumber};
