// Lobby/session descriptor.
//
// `Session` is the server's authoritative description of who is in the game:
// client roster, latency bookkeeping, slot list, and session-wide settings.
// It is owned by the server's event-loop thread and mutated only there; every
// change is broadcast to all validated clients as one serialized `SyncInfo`
// order so clients treat the descriptor as an atomic unit. The serialized
// form is a JSON blob — opaque to the wire protocol, which only sees a string
// payload.
//
// Client identity lives here (index, slot, admin/bot flags); the socket
// itself lives in `connection.rs`. A client record is created only when a
// connection passes handshake validation and is destroyed on disconnect.

use serde::{Deserialize, Serialize};

use basalt_protocol::ClientIndex;

/// Number of latency samples retained per client (oldest evicted first).
pub const LATENCY_HISTORY_LEN: usize = 5;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientState {
    /// Joined but not yet marked ready in the lobby.
    #[default]
    NotReady,
    Ready,
    /// Placeholder state between handshake and slot assignment; clients
    /// still in it when the game starts are kicked.
    Invalid,
}

/// One participant in the session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Client {
    pub index: ClientIndex,
    pub name: String,
    pub ip_address: String,
    /// Lobby slot id, or `None` for a spectator.
    pub slot: Option<String>,
    /// Team number; 0 means no team.
    pub team: u8,
    pub state: ClientState,
    pub is_admin: bool,
    pub is_bot: bool,
    /// For bots, the client whose machine issues their orders.
    pub bot_controller: Option<ClientIndex>,
    /// Verified identity fingerprint, if the client authenticated.
    pub fingerprint: Option<String>,
}

impl Client {
    pub fn is_spectator(&self) -> bool {
        self.slot.is_none()
    }
}

/// Round-trip latency bookkeeping for one client, fed by Ping/Pong orders.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ClientPing {
    pub index: ClientIndex,
    pub latency_history: Vec<i64>,
    pub latency: i64,
    pub jitter: i64,
}

impl ClientPing {
    pub fn new(index: ClientIndex) -> ClientPing {
        ClientPing {
            index,
            ..ClientPing::default()
        }
    }

    /// Record one round-trip sample in milliseconds and recompute the
    /// aggregate latency and jitter.
    pub fn record(&mut self, sample: i64) {
        self.latency_history.push(sample);
        if self.latency_history.len() > LATENCY_HISTORY_LEN {
            let excess = self.latency_history.len() - LATENCY_HISTORY_LEN;
            self.latency_history.drain(..excess);
        }

        let len = self.latency_history.len() as i64;
        self.latency = self.latency_history.iter().sum::<i64>() / len;
        let max = self.latency_history.iter().max().copied().unwrap_or(0);
        let min = self.latency_history.iter().min().copied().unwrap_or(0);
        self.jitter = (max - min) / 2;
    }
}

/// Session-wide settings, fixed by the server at creation.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GlobalSettings {
    pub server_name: String,
    pub random_seed: i32,
    pub game_uid: String,
    pub allow_spectators: bool,
    pub enable_singleplayer: bool,
    pub dedicated: bool,
    pub enable_sync_reports: bool,
    pub game_saves_enabled: bool,
}

/// The full lobby descriptor broadcast to clients as one atomic blob.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Session {
    pub clients: Vec<Client>,
    pub client_pings: Vec<ClientPing>,
    /// Lobby slot ids in display order; `first_empty_slot` assigns them in
    /// this order.
    pub slots: Vec<String>,
    pub global: GlobalSettings,
}

impl Session {
    pub fn client_with_index(&self, index: ClientIndex) -> Option<&Client> {
        self.clients.iter().find(|c| c.index == index)
    }

    pub fn client_with_index_mut(&mut self, index: ClientIndex) -> Option<&mut Client> {
        self.clients.iter_mut().find(|c| c.index == index)
    }

    pub fn ping_for_client_mut(&mut self, index: ClientIndex) -> Option<&mut ClientPing> {
        self.client_pings.iter_mut().find(|p| p.index == index)
    }

    /// The first slot no client occupies, in declaration order.
    pub fn first_empty_slot(&self) -> Option<String> {
        self.slots
            .iter()
            .find(|slot| {
                !self
                    .clients
                    .iter()
                    .any(|c| c.slot.as_deref() == Some(slot.as_str()))
            })
            .cloned()
    }

    pub fn non_bot_clients(&self) -> impl Iterator<Item = &Client> {
        self.clients.iter().filter(|c| !c.is_bot)
    }

    /// Serialize the descriptor to the opaque blob broadcast in `SyncInfo`
    /// orders.
    pub fn serialize(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn deserialize(blob: &str) -> serde_json::Result<Session> {
        serde_json::from_str(blob)
    }
}
