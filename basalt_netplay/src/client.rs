// Client-side transports for the order manager.
//
// `OrderConnection` is the seam between the order manager and the wire:
// the manager sends frame-bound orders, immediate orders, and sync reports,
// and drains received packets without ever blocking.
//
// `NetConnection` is the real TCP transport:
// - `connect()` reads the raw connect header (protocol version + assigned
//   client index) on the calling thread, then spawns a background reader.
// - The reader thread reassembles frames into an `mpsc` inbox; `receive()`
//   drains it non-blocking on the logic thread.
// - Sent regular packets are cached in send order. The server answers each
//   with a 13-byte Ack instead of echoing the bytes; `receive()` resolves an
//   Ack by re-materializing the oldest unacked packet as our own orders at
//   the server-adjusted frame. Resolution happens here, on the logic thread,
//   so the cache needs no locking.
//
// `LoopbackConnection` reflects everything straight back for local sessions
// and tests — no server, no latency projection.

use std::collections::VecDeque;
use std::io::{self, BufReader, BufWriter};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::mpsc::{self, Receiver};
use std::thread::{self, JoinHandle};

use log::warn;

use basalt_protocol::{
    ClientIndex, FrameNumber, HANDSHAKE_PROTOCOL, Order, OrderKind, SyncRecord,
    read_connect_header, read_frame, write_frame,
};

/// One received frame: `(sender, frame, payload)`.
pub type ReceivedPacket = (ClientIndex, FrameNumber, Vec<u8>);

/// Transport seam used by the order manager.
pub trait OrderConnection {
    fn local_index(&self) -> ClientIndex;

    /// Send the frame-bound orders for one net frame. Called exactly once
    /// per frame; an empty order list still produces a packet, because every
    /// frame must have one per client.
    fn send(&mut self, frame: FrameNumber, orders: &[Order]) -> io::Result<()>;

    /// Send immediate orders, outside frame pacing.
    fn send_immediate(&mut self, orders: &[Order]) -> io::Result<()>;

    /// Report the local state fingerprint for a processed frame.
    fn send_sync(&mut self, frame: FrameNumber, record: SyncRecord) -> io::Result<()>;

    /// Drain everything received since the last call. Never blocks.
    fn receive(&mut self) -> Vec<ReceivedPacket>;
}

fn serialize_orders(orders: &[Order]) -> Vec<u8> {
    let mut buf = Vec::new();
    for order in orders {
        order.serialize_into(&mut buf);
    }
    buf
}

/// TCP transport talking to a relay server.
pub struct NetConnection {
    writer: BufWriter<TcpStream>,
    inbox: Receiver<ReceivedPacket>,
    local_index: ClientIndex,
    sent_cache: VecDeque<Vec<u8>>,
    _reader_thread: JoinHandle<()>,
}

impl NetConnection {
    /// Connect and read the server's connect header. The handshake exchange
    /// itself happens as ordinary immediate orders once the manager ticks.
    pub fn connect(addr: impl ToSocketAddrs) -> io::Result<NetConnection> {
        let stream = TcpStream::connect(addr)?;
        let reader_stream = stream.try_clone()?;
        let mut reader = BufReader::new(reader_stream);

        let (protocol, local_index) = read_connect_header(&mut reader)?;
        if protocol != HANDSHAKE_PROTOCOL {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("server speaks handshake protocol {protocol}, expected {HANDSHAKE_PROTOCOL}"),
            ));
        }

        let (tx, rx) = mpsc::channel();
        let reader_thread = thread::Builder::new()
            .name("net-reader".into())
            .spawn(move || {
                while let Ok(packet) = read_frame(&mut reader) {
                    if tx.send(packet).is_err() {
                        break;
                    }
                }
            })?;

        Ok(NetConnection {
            writer: BufWriter::new(stream),
            inbox: rx,
            local_index,
            sent_cache: VecDeque::new(),
            _reader_thread: reader_thread,
        })
    }
}

impl OrderConnection for NetConnection {
    fn local_index(&self) -> ClientIndex {
        self.local_index
    }

    fn send(&mut self, frame: FrameNumber, orders: &[Order]) -> io::Result<()> {
        let payload = serialize_orders(orders);
        write_frame(&mut self.writer, self.local_index, frame, &payload)?;
        self.sent_cache.push_back(payload);
        Ok(())
    }

    fn send_immediate(&mut self, orders: &[Order]) -> io::Result<()> {
        let payload = serialize_orders(orders);
        write_frame(
            &mut self.writer,
            self.local_index,
            FrameNumber::IMMEDIATE,
            &payload,
        )
    }

    fn send_sync(&mut self, frame: FrameNumber, record: SyncRecord) -> io::Result<()> {
        write_frame(&mut self.writer, self.local_index, frame, &record.encode())
    }

    fn receive(&mut self) -> Vec<ReceivedPacket> {
        let mut packets = Vec::new();
        while let Ok((sender, frame, payload)) = self.inbox.try_recv() {
            if payload.len() == 1 && payload[0] == OrderKind::Ack as u8 {
                // Apply our own oldest unacked orders at the adjusted frame.
                match self.sent_cache.pop_front() {
                    Some(cached) => packets.push((self.local_index, frame, cached)),
                    None => warn!("received ack for frame {frame} with nothing awaiting ack"),
                }
            } else {
                packets.push((sender, frame, payload));
            }
        }
        packets
    }
}

/// Loopback transport for local sessions: sent orders come straight back as
/// our own packets at their original frame.
pub struct LoopbackConnection {
    local_index: ClientIndex,
    pending: VecDeque<ReceivedPacket>,
}

impl LoopbackConnection {
    pub fn new(local_index: ClientIndex) -> LoopbackConnection {
        LoopbackConnection {
            local_index,
            pending: VecDeque::new(),
        }
    }
}

impl OrderConnection for LoopbackConnection {
    fn local_index(&self) -> ClientIndex {
        self.local_index
    }

    fn send(&mut self, frame: FrameNumber, orders: &[Order]) -> io::Result<()> {
        self.pending
            .push_back((self.local_index, frame, serialize_orders(orders)));
        Ok(())
    }

    fn send_immediate(&mut self, orders: &[Order]) -> io::Result<()> {
        self.pending.push_back((
            self.local_index,
            FrameNumber::IMMEDIATE,
            serialize_orders(orders),
        ));
        Ok(())
    }

    fn send_sync(&mut self, frame: FrameNumber, record: SyncRecord) -> io::Result<()> {
        self.pending
            .push_back((self.local_index, frame, record.encode().to_vec()));
        Ok(())
    }

    fn receive(&mut self) -> Vec<ReceivedPacket> {
        self.pending.drain(..).collect()
    }
}
