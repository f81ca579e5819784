//! Message Types für das Broker-Protokoll
//!
//! JSON über WebSocket. Jede Client-Nachricht trägt ein `type`-Tag und
//! einen Millisekunden-Timestamp.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::call_session::RoomCode;

// ============================================================================
// HELPER TYPES
// ============================================================================

/// Kennung eines einzelnen Anrufversuchs beim Broker
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for CallId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// CLIENT → BROKER MESSAGES
// ============================================================================

/// Nachricht mit Timestamp
#[derive(Debug, Clone, Serialize)]
pub struct Envelope<T: Serialize> {
    #[serde(flatten)]
    pub payload: T,
    pub timestamp: i64,
}

impl<T: Serialize> Envelope<T> {
    pub fn now(payload: T) -> Self {
        Self {
            payload,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Host meldet sich unter dem Raum-Code an
    #[serde(rename_all = "camelCase")]
    Register { room_code: RoomCode },

    /// Client ruft einen Raum an (SDP Offer)
    #[serde(rename_all = "camelCase")]
    Dial {
        room_code: RoomCode,
        call_id: CallId,
        sdp: String,
    },

    /// Host nimmt an (SDP Answer)
    #[serde(rename_all = "camelCase")]
    Answer { call_id: CallId, sdp: String },

    #[serde(rename_all = "camelCase")]
    IceCandidate { call_id: CallId, candidate: String },

    #[serde(rename_all = "camelCase")]
    Reject {
        call_id: CallId,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    Hangup { call_id: CallId },

    Heartbeat,
}

impl ClientMessage {
    /// Serialisiert mit aktuellem Timestamp
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&Envelope::now(self))
    }
}

// ============================================================================
// BROKER → CLIENT MESSAGES
// ============================================================================

/// Fehlercodes des Brokers
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub enum BrokerErrorCode {
    /// Raum-Code ist bereits vergeben
    #[serde(rename = "unavailable-id")]
    UnavailableId,
    /// Kein Host unter diesem Code registriert
    #[serde(rename = "peer-unavailable")]
    PeerUnavailable,
    #[serde(rename = "invalid-id")]
    InvalidId,
    #[serde(rename = "network")]
    Network,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Registered { room_code: String },

    #[serde(rename_all = "camelCase")]
    IncomingCall { call_id: CallId, sdp: String },

    #[serde(rename_all = "camelCase")]
    Answer { call_id: CallId, sdp: String },

    #[serde(rename_all = "camelCase")]
    IceCandidate { call_id: CallId, candidate: String },

    #[serde(rename_all = "camelCase")]
    CallRejected {
        call_id: CallId,
        #[serde(default)]
        reason: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    CallEnded { call_id: CallId },

    Error {
        code: BrokerErrorCode,
        #[serde(default)]
        message: String,
    },

    Pong,
}
