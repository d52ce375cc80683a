// Replay recording and game-result metadata.
//
// The server records every relayed frame so a finished game can be replayed
// byte for byte. `ReplaySink` is the seam the server talks through; the
// bundled `ReplayRecorder` writes frames in wire format to any `Write` sink
// and appends a JSON metadata trailer when finalized.
//
// Result tracking lives here too: `GameInfo` holds one `PlayerRecord` per
// playing client, built at game start in slot order. Bit *i* of the relayed
// defeat bitmask maps to `players[i]`, so outcomes are derived from the
// cross-checked bitmask rather than trusting any single client's simulation.
//
// On desync the server calls `invalidate()` — the recording keeps whatever
// frames were written but never gets a metadata trailer, leaving the
// artifact unusable as a replay while preserving the bytes for diagnostics.

use std::io::Write;

use log::warn;
use serde::{Deserialize, Serialize};

use basalt_protocol::{ClientIndex, FrameNumber, frame_bytes};

/// Magic suffix marking a finalized replay with a metadata trailer.
pub const METADATA_MAGIC: u32 = 0x5250_4C42; // "BLPR"

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Undefined,
    Lost,
    Won,
}

/// Result-tracking record for one playing client.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlayerRecord {
    pub client: ClientIndex,
    pub name: String,
    pub team: u8,
    pub outcome: Outcome,
    /// Frame of the last order relayed from this client before it left.
    pub disconnect_frame: Option<FrameNumber>,
}

/// Replay/result metadata, independent of any single client's simulation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GameInfo {
    pub mod_id: String,
    pub version: String,
    pub server_name: String,
    pub players: Vec<PlayerRecord>,
}

/// Where relayed frames go for recording. The on-disk layout beyond "frames
/// then trailer" belongs to the sink.
pub trait ReplaySink: Send {
    fn receive_frame(&mut self, sender: ClientIndex, frame: FrameNumber, payload: &[u8]);

    /// Make the artifact unusable as a replay (called on desync). Frames
    /// already written are kept for diagnostics.
    fn invalidate(&mut self);

    /// Called once at end of game with the final result metadata, if the
    /// recording is still valid.
    fn finalize(&mut self, metadata: Option<&GameInfo>);
}

/// Writes frames in wire format; a finalized, valid recording ends with
/// `[metadata JSON][metadata length:u32][METADATA_MAGIC:u32]` so readers can
/// locate the trailer from the end of the file.
pub struct ReplayRecorder<W: Write + Send> {
    sink: W,
    invalidated: bool,
}

impl<W: Write + Send> ReplayRecorder<W> {
    pub fn new(sink: W) -> ReplayRecorder<W> {
        ReplayRecorder {
            sink,
            invalidated: false,
        }
    }
}

impl<W: Write + Send> ReplaySink for ReplayRecorder<W> {
    fn receive_frame(&mut self, sender: ClientIndex, frame: FrameNumber, payload: &[u8]) {
        if self.invalidated {
            return;
        }
        if let Err(e) = self.sink.write_all(&frame_bytes(sender, frame, payload)) {
            warn!("replay write failed, invalidating recording: {e}");
            self.invalidated = true;
        }
    }

    fn invalidate(&mut self) {
        self.invalidated = true;
    }

    fn finalize(&mut self, metadata: Option<&GameInfo>) {
        if self.invalidated {
            return;
        }
        let Some(info) = metadata else { return };
        let trailer = match serde_json::to_vec(info) {
            Ok(json) => json,
            Err(e) => {
                warn!("replay metadata serialization failed: {e}");
                return;
            }
        };

        #[expect(clippy::cast_possible_truncation)]
        let result: std::io::Result<()> = (|| {
            self.sink.write_all(&trailer)?;
            self.sink.write_all(&(trailer.len() as u32).to_le_bytes())?;
            self.sink.write_all(&METADATA_MAGIC.to_le_bytes())?;
            self.sink.flush()
        })();
        if let Err(e) = result {
            warn!("replay finalize failed: {e}");
        }
    }
}
