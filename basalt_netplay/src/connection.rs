// One accepted client socket on the server side.
//
// The write half is a thin synchronous send owned by the event-loop thread;
// a complete pre-built frame either goes out whole or errors, and an error
// means the owner drops the connection. The read half is a background thread
// that reassembles frames and forwards them into the server's event channel —
// it never touches server state directly, which keeps all session mutation on
// the event-loop thread.
//
// Dropping a `Connection` closes the socket; the reader thread notices the
// closed stream, emits a final `Disconnected` event (ignored for already-
// removed indexes), and exits. Dropping is final: an index is never reused
// within a session.

use std::io::{self, BufReader, Write};
use std::net::TcpStream;
use std::sync::mpsc::Sender;
use std::thread;

use basalt_protocol::{ClientIndex, FrameNumber, read_frame};

use crate::server::ServerEvent;

pub struct Connection {
    stream: TcpStream,
    pub index: ClientIndex,
    pub validated: bool,
    /// Random challenge issued at accept, signed by authenticating clients.
    pub auth_token: String,
    /// Frame of the last order packet relayed from this client; stamps the
    /// disconnect time in replay metadata.
    pub most_recent_frame: FrameNumber,
    peer_ip: String,
}

impl Connection {
    pub fn new(stream: TcpStream, index: ClientIndex, auth_token: String) -> io::Result<Connection> {
        let peer_ip = stream.peer_addr()?.ip().to_string();
        Ok(Connection {
            stream,
            index,
            validated: false,
            auth_token,
            most_recent_frame: FrameNumber(0),
            peer_ip,
        })
    }

    pub fn ip(&self) -> &str {
        &self.peer_ip
    }

    /// Write one complete pre-built frame (or the raw connect header).
    pub fn send_data(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(data)?;
        self.stream.flush()
    }

    /// Start the background reader that feeds frames into the server's event
    /// queue. Called once, right after the connection is accepted.
    pub fn spawn_reader(&self, tx: Sender<ServerEvent>) -> io::Result<()> {
        let stream = self.stream.try_clone()?;
        let index = self.index;
        thread::Builder::new()
            .name(format!("reader-{index}"))
            .spawn(move || reader_loop(stream, index, tx))?;
        Ok(())
    }
}

fn reader_loop(stream: TcpStream, index: ClientIndex, tx: Sender<ServerEvent>) {
    let mut reader = BufReader::new(stream);
    loop {
        match read_frame(&mut reader) {
            // The sender field is ignored: the connection itself is the
            // authority on who is talking.
            Ok((_, frame, data)) => {
                if tx.send(ServerEvent::Packet { index, frame, data }).is_err() {
                    break;
                }
            }
            Err(_) => {
                // Read failure or peer close.
                let _ = tx.send(ServerEvent::Disconnected { index });
                break;
            }
        }
    }
}
