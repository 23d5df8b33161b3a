//! Wire frames of the hub WebSocket protocol
//!
//! Every frame is a JSON object tagged by its `type` field. The hub opens
//! with `auth_required`, the client answers with `auth`, and after `auth_ok`
//! the command phase begins: `subscribe_events`, `ping` and the hub's
//! `event`, `result` and `pong` responses.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frames sent by the hub
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Hub greeting that starts the auth handshake
    AuthRequired { ha_version: Option<String> },
    /// Access token accepted
    AuthOk { ha_version: Option<String> },
    /// Access token rejected; the hub closes the socket after this
    AuthInvalid { message: Option<String> },
    /// One hub event, delivered for an active subscription
    Event { id: Option<u64>, event: Value },
    /// Response to a client command
    #[serde(rename = "result")]
    CommandResult {
        id: u64,
        success: bool,
        error: Option<Value>,
    },
    /// Answer to a client ping
    Pong { id: u64 },
    /// Any frame type this client does not know
    #[serde(other)]
    Unknown,
}

/// Frames sent by this client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Answer to `auth_required`
    Auth { access_token: String },
    /// Subscribe to hub events; no event type means all events
    SubscribeEvents {
        id: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        event_type: Option<String>,
    },
    /// Application-level liveness probe
    Ping { id: u64 },
}
