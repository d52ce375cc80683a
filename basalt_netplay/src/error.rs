// Client-half error taxonomy.
//
// The order manager distinguishes faults that are fatal to the local session
// (the simulation can no longer be trusted) from transport failures. Server-
// side faults are deliberately *not* represented here: the server isolates
// them to the offending connection (drop) or, for desyncs, to the replay
// recording, and keeps running.

use thiserror::Error;

use basalt_protocol::{ClientIndex, FrameNumber};

#[derive(Debug, Error)]
pub enum NetplayError {
    /// A regular order packet arrived from a client we have no queue for.
    /// This means our session bookkeeping has diverged from the server's.
    #[error("received packet from unregistered client {0}")]
    UnknownClient(ClientIndex),

    /// The head of a client's queue is not the frame we are processing — the
    /// peer sent packets out of frame order or skipped a frame.
    #[error("orders from client {client} are for frame {got}, expected frame {expected}")]
    FrameMismatch {
        client: ClientIndex,
        got: FrameNumber,
        expected: FrameNumber,
    },

    /// Two participants disagree on the state fingerprint for a frame. The
    /// simulations have diverged; no recovery is meaningful.
    #[error("out of sync in frame {0}; compare sync reports with the other players")]
    OutOfSync(FrameNumber),

    /// A peer ran further ahead than the maximum buffered lookahead allows.
    #[error("client {0} exceeded the maximum buffered-frame lookahead")]
    LookaheadExceeded(ClientIndex),

    #[error("transport failure: {0}")]
    Transport(#[from] std::io::Error),
}
