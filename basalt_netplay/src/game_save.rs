// Order journal for resuming a session from a game save.
//
// A save captures every relayed order packet with its final (latency-
// adjusted) stamp. On resume the server replays the journal to all clients —
// who fast-forward their simulations through it — and live play continues at
// `last_orders_frame + 1`. The on-disk save format and the slot-remapping
// rules live with the save system; this journal is the only surface the
// relay core needs.

use basalt_protocol::{ClientIndex, FrameNumber, sync::SyncRecord};

#[derive(Clone, Debug)]
pub struct SavedOrder {
    pub client: ClientIndex,
    pub frame: FrameNumber,
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct GameSave {
    /// Last frame with a recorded order packet, or -1 for a fresh save.
    pub last_orders_frame: FrameNumber,
    /// Last frame with a recorded sync report, or -1.
    pub last_sync_frame: FrameNumber,
    orders: Vec<SavedOrder>,
}

impl Default for GameSave {
    fn default() -> Self {
        GameSave::new()
    }
}

impl GameSave {
    pub fn new() -> GameSave {
        GameSave {
            last_orders_frame: FrameNumber(-1),
            last_sync_frame: FrameNumber(-1),
            orders: Vec::new(),
        }
    }

    /// Rebuild a save from a previously captured journal.
    pub fn from_journal(orders: Vec<SavedOrder>) -> GameSave {
        let mut save = GameSave::new();
        for order in orders {
            save.record(order);
        }
        save
    }

    /// Capture one relayed packet. Immediate (frame 0) traffic is not part
    /// of the simulation input stream and is not journaled.
    pub fn dispatch_orders(&mut self, client: ClientIndex, frame: FrameNumber, payload: &[u8]) {
        if frame.0 <= 0 {
            return;
        }
        self.record(SavedOrder {
            client,
            frame,
            payload: payload.to_vec(),
        });
    }

    fn record(&mut self, order: SavedOrder) {
        if SyncRecord::decode(&order.payload).is_some() {
            self.last_sync_frame = self.last_sync_frame.max(order.frame);
        } else {
            self.last_orders_frame = self.last_orders_frame.max(order.frame);
        }
        self.orders.push(order);
    }

    /// Replay the journal in capture order.
    pub fn parse_orders(&self, mut f: impl FnMut(ClientIndex, FrameNumber, &[u8])) {
        for order in &self.orders {
            f(order.client, order.frame, &order.payload);
        }
    }

    pub fn journal(&self) -> &[SavedOrder] {
        &self.orders
    }
}
