// Order encoding: the discrete simulation inputs carried inside frame
// payloads.
//
// An order is one input to the lockstep simulation — a unit command, a chat
// line, a handshake exchange, a disconnect notice, or a sync-hash report.
// Several orders may be packed back to back into one frame payload
// (`OrderPacket`); the first byte of each order is its discriminant
// (`OrderKind`), which selects the layout of the rest.
//
// Wire layouts (all integers little-endian, strings and byte arrays carry a
// u32 length prefix):
// - Ack:        `[0x10]` — the whole payload; tells a client to apply its
//               own cached orders at the frame stamped on the enclosing frame
//               header instead of receiving the bytes again.
// - SyncHash:   `[0x65][checksum:u32][defeat:u64]` — fixed 13 bytes, see
//               `sync.rs`.
// - Disconnect: `[0xBF][client:i32]` — server-synthesized notice that a
//               client left.
// - Handshake:  `[0xFE][opcode:str][payload:str]` — connection negotiation,
//               always immediate.
// - Fields:     `[0xFF][opcode:str][flags:u8][payload:bytes]` — the general
//               opcode-string order; flags bit 0 is the immediate flag.
//
// Packet decoding is deliberately lenient: running out of bytes at an order
// boundary is the normal end-of-packet terminator, and an unknown
// discriminant (a newer or buggy peer) abandons the remainder of that packet
// with a logged warning instead of tearing the session down.

use log::warn;
use thiserror::Error;

use crate::sync::SyncRecord;
use crate::types::ClientIndex;

/// Order discriminant byte, the first byte of every serialized order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum OrderKind {
    Ack = 0x10,
    SyncHash = 0x65,
    Disconnect = 0xBF,
    Handshake = 0xFE,
    Fields = 0xFF,
}

/// One discrete simulation input.
#[derive(Clone, Debug, PartialEq)]
pub enum Order {
    /// Apply locally cached orders at the enclosing frame.
    Ack,
    /// Per-frame state fingerprint for desync detection.
    SyncHash(SyncRecord),
    /// A client left the session.
    Disconnect { client: ClientIndex },
    /// Connection negotiation; `payload` is an opaque serialized blob.
    Handshake { opcode: String, payload: String },
    /// General opcode-string order. Immediate orders bypass frame pacing;
    /// regular orders are applied exactly once at their stamped frame.
    Fields {
        opcode: String,
        payload: Vec<u8>,
        is_immediate: bool,
    },
}

/// Why decoding one order failed. Neither case is fatal to the session; the
/// packet decoder stops at the failure and keeps whatever parsed cleanly.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("order data truncated mid-order")]
    Truncated,
    #[error("unknown order discriminant 0x{0:02x}")]
    UnknownDiscriminant(u8),
    #[error("order string field is not valid UTF-8")]
    InvalidString,
}

impl Order {
    /// A frame-bound order carrying an opcode and opaque payload bytes.
    pub fn regular(opcode: impl Into<String>, payload: Vec<u8>) -> Order {
        Order::Fields {
            opcode: opcode.into(),
            payload,
            is_immediate: false,
        }
    }

    /// An immediate order carrying an opcode and opaque payload bytes.
    pub fn immediate(opcode: impl Into<String>, payload: Vec<u8>) -> Order {
        Order::Fields {
            opcode: opcode.into(),
            payload,
            is_immediate: true,
        }
    }

    /// An immediate order whose payload is a UTF-8 string — the common shape
    /// for server notices, chat, and lobby state blobs.
    pub fn immediate_text(opcode: impl Into<String>, text: impl Into<String>) -> Order {
        Order::immediate(opcode, text.into().into_bytes())
    }

    pub fn handshake(opcode: impl Into<String>, payload: impl Into<String>) -> Order {
        Order::Handshake {
            opcode: opcode.into(),
            payload: payload.into(),
        }
    }

    pub fn kind(&self) -> OrderKind {
        match self {
            Order::Ack => OrderKind::Ack,
            Order::SyncHash(_) => OrderKind::SyncHash,
            Order::Disconnect { .. } => OrderKind::Disconnect,
            Order::Handshake { .. } => OrderKind::Handshake,
            Order::Fields { .. } => OrderKind::Fields,
        }
    }

    /// Whether this order bypasses frame pacing. Handshake, disconnect, and
    /// ack orders are inherently out-of-band.
    pub fn is_immediate(&self) -> bool {
        match self {
            Order::Ack | Order::Disconnect { .. } | Order::Handshake { .. } => true,
            Order::SyncHash(_) => false,
            Order::Fields { is_immediate, .. } => *is_immediate,
        }
    }

    /// The opcode string, for the order kinds that carry one.
    pub fn opcode(&self) -> Option<&str> {
        match self {
            Order::Handshake { opcode, .. } => Some(opcode),
            Order::Fields { opcode, .. } => Some(opcode),
            _ => None,
        }
    }

    /// The payload interpreted as UTF-8 text (lossy), for the order kinds
    /// that carry one.
    pub fn text_payload(&self) -> Option<String> {
        match self {
            Order::Handshake { payload, .. } => Some(payload.clone()),
            Order::Fields { payload, .. } => {
                Some(String::from_utf8_lossy(payload).into_owned())
            }
            _ => None,
        }
    }

    pub fn serialize_into(&self, buf: &mut Vec<u8>) {
        match self {
            Order::Ack => buf.push(OrderKind::Ack as u8),
            Order::SyncHash(record) => buf.extend_from_slice(&record.encode()),
            Order::Disconnect { client } => {
                buf.push(OrderKind::Disconnect as u8);
                buf.extend_from_slice(&client.0.to_le_bytes());
            }
            Order::Handshake { opcode, payload } => {
                buf.push(OrderKind::Handshake as u8);
                put_str(buf, opcode);
                put_str(buf, payload);
            }
            Order::Fields {
                opcode,
                payload,
                is_immediate,
            } => {
                buf.push(OrderKind::Fields as u8);
                put_str(buf, opcode);
                buf.push(u8::from(*is_immediate));
                put_bytes(buf, payload);
            }
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.serialize_into(&mut buf);
        buf
    }

    /// Decode one order from the front of `input`, advancing it past the
    /// consumed bytes. `Ok(None)` is the clean end-of-packet terminator.
    pub fn read(input: &mut &[u8]) -> Result<Option<Order>, DecodeError> {
        let Some(discriminant) = take_u8(input) else {
            return Ok(None);
        };

        let order = match discriminant {
            d if d == OrderKind::Ack as u8 => Order::Ack,
            d if d == OrderKind::SyncHash as u8 => {
                let body = take(input, 12).ok_or(DecodeError::Truncated)?;
                let mut payload = Vec::with_capacity(13);
                payload.push(OrderKind::SyncHash as u8);
                payload.extend_from_slice(body);
                // Length and discriminant are known good at this point.
                let record = SyncRecord::decode(&payload).ok_or(DecodeError::Truncated)?;
                Order::SyncHash(record)
            }
            d if d == OrderKind::Disconnect as u8 => {
                let client = take_i32(input).ok_or(DecodeError::Truncated)?;
                Order::Disconnect {
                    client: ClientIndex(client),
                }
            }
            d if d == OrderKind::Handshake as u8 => {
                let opcode = take_str(input)?;
                let payload = take_str(input)?;
                Order::Handshake { opcode, payload }
            }
            d if d == OrderKind::Fields as u8 => {
                let opcode = take_str(input)?;
                let flags = take_u8(input).ok_or(DecodeError::Truncated)?;
                let payload = take_len_bytes(input)?;
                Order::Fields {
                    opcode,
                    payload,
                    is_immediate: flags & 1 != 0,
                }
            }
            other => return Err(DecodeError::UnknownDiscriminant(other)),
        };

        Ok(Some(order))
    }
}

/// An ordered sequence of orders bound to one `(client, frame)` pair — the
/// unit of relay and of client-side queuing.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OrderPacket {
    orders: Vec<Order>,
}

impl OrderPacket {
    pub fn new(orders: Vec<Order>) -> OrderPacket {
        OrderPacket { orders }
    }

    pub fn empty() -> OrderPacket {
        OrderPacket::default()
    }

    pub fn orders(&self) -> &[Order] {
        &self.orders
    }

    pub fn into_orders(self) -> Vec<Order> {
        self.orders
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        for order in &self.orders {
            order.serialize_into(&mut buf);
        }
        buf
    }

    /// Decode a packet payload. Stops cleanly at end of input; a decode
    /// failure abandons the rest of the packet with a warning and keeps the
    /// orders that parsed before it.
    pub fn deserialize(mut data: &[u8]) -> OrderPacket {
        let mut orders = Vec::new();
        loop {
            match Order::read(&mut data) {
                Ok(Some(order)) => orders.push(order),
                Ok(None) => break,
                Err(e) => {
                    warn!("dropping remainder of order packet: {e}");
                    break;
                }
            }
        }
        OrderPacket { orders }
    }
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
    put_bytes(buf, s.as_bytes());
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(bytes);
}

fn take<'a>(input: &mut &'a [u8], n: usize) -> Option<&'a [u8]> {
    if input.len() < n {
        return None;
    }
    let (head, rest) = input.split_at(n);
    *input = rest;
    Some(head)
}

fn take_u8(input: &mut &[u8]) -> Option<u8> {
    take(input, 1).map(|b| b[0])
}

fn take_i32(input: &mut &[u8]) -> Option<i32> {
    take(input, 4).map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn take_u32(input: &mut &[u8]) -> Option<u32> {
    take(input, 4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn take_len_bytes(input: &mut &[u8]) -> Result<Vec<u8>, DecodeError> {
    let len = take_u32(input).ok_or(DecodeError::Truncated)? as usize;
    let bytes = take(input, len).ok_or(DecodeError::Truncated)?;
    Ok(bytes.to_vec())
}

fn take_str(input: &mut &[u8]) -> Result<String, DecodeError> {
    let bytes = take_len_bytes(input)?;
    String::from_utf8(bytes).map_err(|_| DecodeError::InvalidString)
}
