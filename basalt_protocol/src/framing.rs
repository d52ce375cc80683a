// Length-delimited frame format over TCP.
//
// Every message after the initial connect header travels as one frame:
//
//   [length:u32][sender:i32][frame:i32][payload bytes]
//
// all little-endian, where `length` counts everything after itself (payload
// length + 8). `sender` is 0 for server-originated orders and `frame` is 0
// for immediate orders. The payload is `OrderPacket` bytes (see `order.rs`),
// except for the special Ack frame: `length = 5`, `sender = 0`, and a
// one-byte payload holding the Ack discriminant, instructing the receiving
// client to apply orders it already holds locally at the stamped frame.
//
// The connect header is the one exception to framing: immediately after
// accepting a socket the server writes 8 raw bytes
// `[handshake protocol:u32][assigned client index:u32]` before any frame.
//
// A `MAX_FRAME_SIZE` guard protects against unbounded allocation from
// malformed or malicious length prefixes.

use std::io::{self, Read, Write};

use crate::order::OrderKind;
use crate::types::{ClientIndex, FrameNumber};

/// Version of the connect header + handshake exchange.
pub const HANDSHAKE_PROTOCOL: u32 = 7;

/// Version of the order encoding; checked during handshake validation.
pub const ORDERS_PROTOCOL: u32 = 11;

/// Maximum allowed frame length (16 MB). Lobby state blobs are the largest
/// expected payloads; this is generous headroom.
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Bytes of sender + frame fields counted inside `length`.
const FRAME_OVERHEAD: u32 = 8;

/// Write one complete frame.
pub fn write_frame<W: Write>(
    writer: &mut W,
    sender: ClientIndex,
    frame: FrameNumber,
    payload: &[u8],
) -> io::Result<()> {
    let len = payload.len();
    if len > (MAX_FRAME_SIZE - FRAME_OVERHEAD) as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame payload too large: {len} bytes (max {MAX_FRAME_SIZE})"),
        ));
    }

    #[expect(clippy::cast_possible_truncation)]
    let length = len as u32 + FRAME_OVERHEAD;
    writer.write_all(&length.to_le_bytes())?;
    writer.write_all(&sender.0.to_le_bytes())?;
    writer.write_all(&frame.0.to_le_bytes())?;
    writer.write_all(payload)?;
    writer.flush()
}

/// Read one complete frame: `(sender, frame, payload)`.
///
/// Returns `UnexpectedEof` if the stream closes before or during a frame,
/// `InvalidData` if the length prefix is shorter than the frame header or
/// exceeds `MAX_FRAME_SIZE`.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<(ClientIndex, FrameNumber, Vec<u8>)> {
    let mut header = [0u8; 4];
    reader.read_exact(&mut header)?;
    let length = u32::from_le_bytes(header);

    if length < FRAME_OVERHEAD {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {length} shorter than frame header"),
        ));
    }
    if length > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {length} bytes (max {MAX_FRAME_SIZE})"),
        ));
    }

    let mut fields = [0u8; 8];
    reader.read_exact(&mut fields)?;
    let sender = i32::from_le_bytes([fields[0], fields[1], fields[2], fields[3]]);
    let frame = i32::from_le_bytes([fields[4], fields[5], fields[6], fields[7]]);

    let mut payload = vec![0u8; (length - FRAME_OVERHEAD) as usize];
    reader.read_exact(&mut payload)?;
    Ok((ClientIndex(sender), FrameNumber(frame), payload))
}

/// Build one complete frame in memory, for callers that hand pre-built
/// frames to many sockets.
pub fn frame_bytes(sender: ClientIndex, frame: FrameNumber, payload: &[u8]) -> Vec<u8> {
    #[expect(clippy::cast_possible_truncation)]
    let length = payload.len() as u32 + FRAME_OVERHEAD;
    let mut buf = Vec::with_capacity(payload.len() + 12);
    buf.extend_from_slice(&length.to_le_bytes());
    buf.extend_from_slice(&sender.0.to_le_bytes());
    buf.extend_from_slice(&frame.0.to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Build the 13-byte Ack frame for `frame`.
pub fn ack_frame(frame: FrameNumber) -> [u8; 13] {
    let mut buf = [0u8; 13];
    buf[0..4].copy_from_slice(&5u32.to_le_bytes());
    buf[4..8].copy_from_slice(&ClientIndex::SERVER.0.to_le_bytes());
    buf[8..12].copy_from_slice(&frame.0.to_le_bytes());
    buf[12] = OrderKind::Ack as u8;
    buf
}

/// Write the raw connect header sent once per accepted socket.
pub fn write_connect_header<W: Write>(writer: &mut W, index: ClientIndex) -> io::Result<()> {
    writer.write_all(&HANDSHAKE_PROTOCOL.to_le_bytes())?;
    writer.write_all(&(index.0 as u32).to_le_bytes())?;
    writer.flush()
}

/// Read the raw connect header: `(handshake protocol, assigned index)`.
pub fn read_connect_header<R: Read>(reader: &mut R) -> io::Result<(u32, ClientIndex)> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    let protocol = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let raw_index = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    #[expect(clippy::cast_possible_wrap)]
    let index = ClientIndex(raw_index as i32);
    Ok((protocol, index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frame_roundtrip() {
        let mut wire = Vec::new();
        write_frame(&mut wire, ClientIndex(3), FrameNumber(42), b"orders").unwrap();

        let mut cursor = Cursor::new(&wire);
        let (sender, frame, payload) = read_frame(&mut cursor).unwrap();
        assert_eq!(sender, ClientIndex(3));
        assert_eq!(frame, FrameNumber(42));
        assert_eq!(payload, b"orders");
    }

    #[test]
    fn frame_roundtrip_empty_payload() {
        let mut wire = Vec::new();
        write_frame(&mut wire, ClientIndex(1), FrameNumber(7), &[]).unwrap();
        assert_eq!(wire.len(), 12);

        let mut cursor = Cursor::new(&wire);
        let (sender, frame, payload) = read_frame(&mut cursor).unwrap();
        assert_eq!(sender, ClientIndex(1));
        assert_eq!(frame, FrameNumber(7));
        assert!(payload.is_empty());
    }

    #[test]
    fn length_counts_everything_after_itself() {
        let mut wire = Vec::new();
        write_frame(&mut wire, ClientIndex(2), FrameNumber(9), &[0xAB; 10]).unwrap();
        let length = u32::from_le_bytes([wire[0], wire[1], wire[2], wire[3]]);
        assert_eq!(length as usize, wire.len() - 4);
        assert_eq!(length, 18);
    }

    #[test]
    fn frame_bytes_matches_write_frame() {
        let mut wire = Vec::new();
        write_frame(&mut wire, ClientIndex(4), FrameNumber(100), b"xyz").unwrap();
        assert_eq!(frame_bytes(ClientIndex(4), FrameNumber(100), b"xyz"), wire);
    }

    #[test]
    fn ack_frame_layout() {
        let buf = ack_frame(FrameNumber(13));
        let mut cursor = Cursor::new(buf.to_vec());
        let (sender, frame, payload) = read_frame(&mut cursor).unwrap();
        assert_eq!(sender, ClientIndex::SERVER);
        assert_eq!(frame, FrameNumber(13));
        assert_eq!(payload, vec![OrderKind::Ack as u8]);
        assert_eq!(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]), 5);
    }

    #[test]
    fn rejects_oversized_length_prefix() {
        let mut wire = (MAX_FRAME_SIZE + 1).to_le_bytes().to_vec();
        wire.extend_from_slice(&[0; 8]);
        let mut cursor = Cursor::new(wire);
        let err = read_frame(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn rejects_undersized_length_prefix() {
        let wire = 4u32.to_le_bytes().to_vec();
        let mut cursor = Cursor::new(wire);
        let err = read_frame(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn read_unexpected_eof() {
        let mut cursor = Cursor::new(vec![12u8, 0]);
        let err = read_frame(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn multiple_frames_in_sequence() {
        let mut wire = Vec::new();
        write_frame(&mut wire, ClientIndex(1), FrameNumber(1), b"a").unwrap();
        write_frame(&mut wire, ClientIndex(2), FrameNumber(2), b"bb").unwrap();

        let mut cursor = Cursor::new(&wire);
        let (_, f1, p1) = read_frame(&mut cursor).unwrap();
        let (_, f2, p2) = read_frame(&mut cursor).unwrap();
        assert_eq!((f1, p1.as_slice()), (FrameNumber(1), b"a".as_slice()));
        assert_eq!((f2, p2.as_slice()), (FrameNumber(2), b"bb".as_slice()));
    }

    #[test]
    fn connect_header_roundtrip() {
        let mut wire = Vec::new();
        write_connect_header(&mut wire, ClientIndex(5)).unwrap();
        assert_eq!(wire.len(), 8);

        let mut cursor = Cursor::new(&wire);
        let (protocol, index) = read_connect_header(&mut cursor).unwrap();
        assert_eq!(protocol, HANDSHAKE_PROTOCOL);
        assert_eq!(index, ClientIndex(5));
    }
}
