// Core ID types for the lockstep protocol.
//
// These are lightweight newtypes used by the wire codec (`order.rs`,
// `framing.rs`) and the netplay crate's session management. Client indexes
// are server-assigned compact integers, unique per connection and never
// reused within a session. Index 0 is reserved for server-originated orders,
// and frame 0 marks an immediate (out-of-band) order, so both types carry
// their reserved value as an associated constant.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Server-assigned client index. `ClientIndex::SERVER` (0) marks orders that
/// originate from the server itself.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientIndex(pub i32);

impl ClientIndex {
    pub const SERVER: ClientIndex = ClientIndex(0);
}

impl fmt::Display for ClientIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Simulation frame number. `FrameNumber::IMMEDIATE` (0) marks orders that
/// are applied outside frame pacing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FrameNumber(pub i32);

impl FrameNumber {
    pub const IMMEDIATE: FrameNumber = FrameNumber(0);

    /// The frame `latency` frames after this one.
    #[must_use]
    pub fn project(self, latency: i32) -> FrameNumber {
        FrameNumber(self.0 + latency)
    }

    /// The immediately following frame.
    #[must_use]
    pub fn next(self) -> FrameNumber {
        FrameNumber(self.0 + 1)
    }
}

impl fmt::Display for FrameNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
