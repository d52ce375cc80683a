// Client-side order pump: paces the local simulation to the arrival of peer
// order packets.
//
// The manager owns one FIFO of `(frame, packet)` per registered non-bot
// client. The pacing rule is the heart of lockstep: a net frame is processed
// only when every queue has a packet at its head for exactly that frame, and
// the local frame counter halts entirely while any peer's queue is empty.
// The simulation therefore cannot outrun the slowest peer by more than the
// buffered lookahead.
//
// Tick cadence: the local frame counter advances every logic tick, but only
// every `tick_scale`-th tick is a net tick that attempts to advance the net
// frame. Immediate orders (chat, pings, handshake traffic) are flushed every
// tick and applied the moment they arrive — they carry no cross-client
// ordering guarantee.
//
// Processing a frame dequeues exactly one packet per client, applies the
// contained orders in ascending client-index order, submits a checksum +
// defeat-bitmask fingerprint for the frame, and advances the net frame by
// exactly one. Fingerprints from peers are cross-checked in a `SyncLedger`;
// any mismatch is fatal here — the state spaces have already diverged and no
// recovery is meaningful — unlike on the server, which has no simulation
// state to protect.

use std::collections::{BTreeMap, VecDeque};

use log::warn;

use basalt_protocol::{
    ClientIndex, FrameNumber, Order, OrderKind, OrderPacket, SyncCheck, SyncLedger, SyncRecord,
};

use crate::client::OrderConnection;
use crate::error::NetplayError;
use crate::sync_report::{SYNC_REPORT_FRAMES, SyncReport};

/// Net tick cadence: one net tick every this many local ticks.
pub const NET_TICK_SCALE: i32 = 3;

/// Maximum packets buffered per peer before the session is considered
/// faulted. Bounds memory when a peer runs far ahead of a stalled local
/// simulation.
pub const MAX_BUFFERED_FRAMES: usize = 120;

/// Outcome of applying one order to the simulation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Applied {
    Continue,
    /// The simulation has been torn down mid-iteration; stop applying.
    Halted,
}

/// Parameters delivered by the game-start order.
#[derive(Clone, Debug)]
pub struct StartGameParams {
    /// Every non-bot participant, the local client included.
    pub clients: Vec<ClientIndex>,
    /// Keep per-frame diagnostics for post-mortem comparison. Costs time
    /// every frame; pointless without another human to compare against.
    pub enable_sync_report: bool,
    /// When resuming a save: last frame it covers, else -1.
    pub save_last_orders_frame: FrameNumber,
    /// When resuming a save: last frame with a recorded sync report, else -1.
    pub save_last_sync_frame: FrameNumber,
}

impl StartGameParams {
    pub fn fresh(clients: Vec<ClientIndex>, enable_sync_report: bool) -> StartGameParams {
        StartGameParams {
            clients,
            enable_sync_report,
            save_last_orders_frame: FrameNumber(-1),
            save_last_sync_frame: FrameNumber(-1),
        }
    }
}

/// Requests an order applier can make back to the manager while an order is
/// being applied. Executed after the apply call returns, so the applier never
/// re-enters the manager.
#[derive(Default)]
pub struct NetControl {
    start_game: Option<StartGameParams>,
}

impl NetControl {
    /// Start frame pacing (the reaction to a game-start order). Idempotent:
    /// ignored if the game is already running.
    pub fn request_start_game(&mut self, params: StartGameParams) {
        self.start_game = Some(params);
    }
}

/// The simulation-facing collaborators: order application and the per-frame
/// state fingerprint.
pub trait Simulation {
    fn apply(&mut self, client: ClientIndex, order: &Order, ctl: &mut NetControl) -> Applied;

    /// Checksum over the authoritative simulation state, after the frame's
    /// orders have been applied.
    fn checksum(&self) -> u32;

    /// Bit *i* set = player *i* has a lost outcome. Monotonically
    /// non-decreasing.
    fn defeat_bitmask(&self) -> u64;
}

pub struct OrderManager<C: OrderConnection> {
    connection: C,
    pending_orders: BTreeMap<ClientIndex, VecDeque<(FrameNumber, OrderPacket)>>,
    sync_ledger: SyncLedger,
    sync_report: SyncReport,
    generate_sync_report: bool,
    local_orders: Vec<Order>,
    local_immediate_orders: Vec<Order>,
    net_frame: FrameNumber,
    local_frame: i32,
    sent_orders_frame: FrameNumber,
    tick_scale: i32,
    game_save_last_frame: FrameNumber,
    game_save_last_sync_frame: FrameNumber,
}

impl<C: OrderConnection> OrderManager<C> {
    pub fn new(connection: C) -> OrderManager<C> {
        OrderManager {
            connection,
            pending_orders: BTreeMap::new(),
            sync_ledger: SyncLedger::new(),
            sync_report: SyncReport::new(SYNC_REPORT_FRAMES),
            generate_sync_report: false,
            local_orders: Vec::new(),
            local_immediate_orders: Vec::new(),
            net_frame: FrameNumber(0),
            local_frame: 0,
            sent_orders_frame: FrameNumber(0),
            tick_scale: NET_TICK_SCALE,
            game_save_last_frame: FrameNumber(-1),
            game_save_last_sync_frame: FrameNumber(-1),
        }
    }

    pub fn with_tick_scale(mut self, tick_scale: i32) -> OrderManager<C> {
        self.tick_scale = tick_scale.max(1);
        self
    }

    pub fn local_index(&self) -> ClientIndex {
        self.connection.local_index()
    }

    /// Net frame 0 means the game has not started.
    pub fn game_started(&self) -> bool {
        self.net_frame != FrameNumber(0)
    }

    pub fn net_frame(&self) -> FrameNumber {
        self.net_frame
    }

    pub fn local_frame(&self) -> i32 {
        self.local_frame
    }

    /// Enter the running state: register one queue per non-bot client and
    /// set the net frame to 1. A second call is a no-op.
    pub fn start_game(&mut self, params: StartGameParams) {
        if self.game_started() {
            return;
        }

        for client in params.clients {
            self.pending_orders.insert(client, VecDeque::new());
        }
        self.generate_sync_report = params.enable_sync_report;
        self.game_save_last_frame = params.save_last_orders_frame;
        self.game_save_last_sync_frame = params.save_last_sync_frame;
        self.net_frame = FrameNumber(1);
        self.local_frame = 0;
    }

    /// Queue an order for dispatch: immediate orders go out on the next
    /// tick, regular orders with the current frame's packet.
    pub fn issue_order(&mut self, order: Order) {
        if order.is_immediate() {
            self.local_immediate_orders.push(order);
        } else {
            self.local_orders.push(order);
        }
    }

    pub fn issue_orders(&mut self, orders: impl IntoIterator<Item = Order>) {
        for order in orders {
            self.issue_order(order);
        }
    }

    /// A client left: its queue no longer gates frame processing.
    pub fn receive_disconnect(&mut self, client: ClientIndex) {
        self.pending_orders.remove(&client);
    }

    /// Every-tick work, independent of net-tick cadence: flush queued
    /// immediate orders and drain the transport.
    pub fn tick_immediate(&mut self, sim: &mut dyn Simulation) -> Result<(), NetplayError> {
        self.send_immediate_orders()?;
        for (sender, frame, payload) in self.connection.receive() {
            self.process_packet(sim, sender, frame, &payload)?;
        }
        Ok(())
    }

    fn send_immediate_orders(&mut self) -> Result<(), NetplayError> {
        // Suppressed while fast-forwarding through a game save; the queued
        // orders are stale by definition and are discarded either way.
        if !self.local_immediate_orders.is_empty() && self.game_save_last_frame < self.net_frame {
            let orders = std::mem::take(&mut self.local_immediate_orders);
            self.connection.send_immediate(&orders)?;
        } else {
            self.local_immediate_orders.clear();
        }
        Ok(())
    }

    fn process_packet(
        &mut self,
        sim: &mut dyn Simulation,
        sender: ClientIndex,
        frame: FrameNumber,
        payload: &[u8],
    ) -> Result<(), NetplayError> {
        if frame == FrameNumber::IMMEDIATE {
            return self.receive_immediate_orders(sim, sender, payload);
        }

        if payload.first() == Some(&(OrderKind::SyncHash as u8)) {
            return match SyncRecord::decode(payload) {
                Some(record) => self.receive_sync(frame, record),
                None => {
                    warn!(
                        "dropping sync order with length {} from client {sender}",
                        payload.len()
                    );
                    Ok(())
                }
            };
        }

        let queue = self
            .pending_orders
            .get_mut(&sender)
            .ok_or(NetplayError::UnknownClient(sender))?;
        if queue.len() >= MAX_BUFFERED_FRAMES {
            return Err(NetplayError::LookaheadExceeded(sender));
        }
        queue.push_back((frame, OrderPacket::deserialize(payload)));
        Ok(())
    }

    /// Apply an immediate packet the moment it arrives. Disconnect notices
    /// are consumed here; everything else goes to the simulation applier.
    fn receive_immediate_orders(
        &mut self,
        sim: &mut dyn Simulation,
        sender: ClientIndex,
        payload: &[u8],
    ) -> Result<(), NetplayError> {
        for order in OrderPacket::deserialize(payload).into_orders() {
            if let Order::Disconnect { client } = &order {
                self.receive_disconnect(*client);
                continue;
            }

            let mut ctl = NetControl::default();
            let applied = sim.apply(sender, &order, &mut ctl);
            self.run_control(ctl);
            if applied == Applied::Halted {
                return Ok(());
            }
        }
        Ok(())
    }

    fn run_control(&mut self, ctl: NetControl) {
        if let Some(params) = ctl.start_game {
            self.start_game(params);
        }
    }

    /// Cross-check a state fingerprint for a frame. First report wins; any
    /// later disagreement is fatal, with a diagnostic dump first.
    pub fn receive_sync(
        &mut self,
        frame: FrameNumber,
        record: SyncRecord,
    ) -> Result<(), NetplayError> {
        match self.sync_ledger.check(frame, record) {
            SyncCheck::Mismatch => {
                self.sync_report.dump(frame);
                Err(NetplayError::OutOfSync(frame))
            }
            _ => Ok(()),
        }
    }

    /// One logic tick. Returns whether the local frame advanced; a stalled
    /// net tick (peer queue empty) halts local frame advancement entirely.
    pub fn try_tick(&mut self, sim: &mut dyn Simulation) -> Result<bool, NetplayError> {
        let is_net_tick = self.local_frame % self.tick_scale == 0;
        let mut should_tick = true;

        if is_net_tick {
            // Will we be ready next frame? Our own queue is exempt — local
            // orders are generated on demand.
            let local = self.local_index();
            should_tick = self
                .pending_orders
                .iter()
                .all(|(client, queue)| *client == local || !queue.is_empty());

            // Send only when ready, so a stalled manager does not push
            // orders ahead of the frame it is stuck on.
            if should_tick {
                self.send_orders()?;
            }
        }

        let mut will_tick = should_tick;
        if will_tick && is_net_tick {
            will_tick = self.ready_for_next_frame();
            if will_tick {
                self.process_orders(sim)?;
            }
        }

        if will_tick {
            self.local_frame += 1;
        }
        Ok(will_tick)
    }

    /// Convenience wrapper: immediate work, then one paced tick.
    pub fn tick(&mut self, sim: &mut dyn Simulation) -> Result<bool, NetplayError> {
        self.tick_immediate(sim)?;
        self.try_tick(sim)
    }

    fn ready_for_next_frame(&self) -> bool {
        self.game_started() && self.pending_orders.values().all(|queue| !queue.is_empty())
    }

    /// Flush the locally queued regular orders for the current net frame,
    /// exactly once per frame.
    fn send_orders(&mut self) -> Result<(), NetplayError> {
        if self.game_started()
            && self.game_save_last_frame < self.net_frame
            && self.sent_orders_frame < self.net_frame
        {
            let orders = std::mem::take(&mut self.local_orders);
            self.connection.send(self.net_frame, &orders)?;
            self.sent_orders_frame = self.net_frame;
        }
        Ok(())
    }

    /// Dequeue one packet per client, apply in client-index order, submit
    /// the state fingerprint, advance the net frame.
    fn process_orders(&mut self, sim: &mut dyn Simulation) -> Result<(), NetplayError> {
        let mut applied_log = Vec::new();

        // BTreeMap iteration is ascending client index — the agreed
        // cross-client application order.
        let clients: Vec<ClientIndex> = self.pending_orders.keys().copied().collect();
        for client in clients {
            let Some(packet) = self
                .pending_orders
                .get_mut(&client)
                .and_then(VecDeque::pop_front)
            else {
                continue;
            };
            let (frame, packet) = packet;

            // Every frame must carry a packet per client; a head packet for
            // any other frame means the peer skipped or reordered frames.
            // Crash early instead of desyncing.
            if frame != self.net_frame {
                return Err(NetplayError::FrameMismatch {
                    client,
                    got: frame,
                    expected: self.net_frame,
                });
            }

            for order in packet.orders() {
                let mut ctl = NetControl::default();
                let applied = sim.apply(client, order, &mut ctl);
                self.run_control(ctl);
                if self.generate_sync_report {
                    applied_log.push(format!(
                        "client {client}: {}",
                        order.opcode().unwrap_or("<raw>")
                    ));
                }
                if applied == Applied::Halted {
                    return Ok(());
                }
            }
        }

        // While fast-forwarding through a game save the fingerprint is a
        // placeholder; real reporting resumes at the save's last sync frame.
        let record = if self.net_frame >= self.game_save_last_sync_frame {
            SyncRecord {
                checksum: sim.checksum(),
                defeat: sim.defeat_bitmask(),
            }
        } else {
            SyncRecord::default()
        };

        if self.generate_sync_report {
            self.sync_report.record(self.net_frame, record, applied_log);
        }

        // Register our own report first, then publish; peers running ahead
        // may already have seeded the ledger for this frame.
        self.receive_sync(self.net_frame, record)?;
        self.connection.send_sync(self.net_frame, record)?;
        self.net_frame = self.net_frame.next();
        Ok(())
    }
}
