// Handshake bodies exchanged inside `Order::Handshake` payloads.
//
// The server opens with a `HandshakeRequest` naming its content identifiers
// and a freshly generated auth token; the client must answer with a
// `HandshakeResponse` as its very first order. The bodies travel as JSON
// strings — they are negotiation metadata, not per-frame traffic, so a
// self-describing encoding is worth the bytes.

use serde::{Deserialize, Serialize};

/// Sent by the server immediately after the connect header.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub mod_id: String,
    pub version: String,
    /// Random challenge the client signs to prove an identity claim.
    pub auth_token: String,
}

/// The client's first order on an unvalidated connection.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub mod_id: String,
    pub version: String,
    pub orders_protocol: u32,
    pub name: String,
    pub password: Option<String>,
    /// Identity assertion: public-key fingerprint plus a signature over the
    /// server's auth token. Both absent for anonymous players.
    pub fingerprint: Option<String>,
    pub auth_signature: Option<String>,
}

impl HandshakeRequest {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> serde_json::Result<HandshakeRequest> {
        serde_json::from_str(s)
    }
}

impl HandshakeResponse {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> serde_json::Result<HandshakeResponse> {
        serde_json::from_str(s)
    }
}
