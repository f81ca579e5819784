//! Zustände und Übergänge einer Anrufsitzung

use serde::Serialize;
use uuid::Uuid;

use super::error::CallError;
use super::room_code::RoomCode;

// ============================================================================
// ROLE / STATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    None,
    Host,
    Client,
}

/// Aktueller Status einer Sitzung
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallState {
    /// Keine Sitzung
    Disconnected,
    /// Host meldet den Raum beim Broker an
    Registering,
    /// Host wartet auf einen Anrufer
    AwaitingPeer,
    /// Aushandlung läuft
    Connecting,
    /// Anruf aktiv
    Connected,
    /// Fehler, wird sofort aufgeräumt und endet in `Disconnected`
    Failed(CallError),
}

impl CallState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Registering => "registering",
            Self::AwaitingPeer => "awaiting_peer",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed(_) => "failed",
        }
    }

    /// Endzustände: keine weiteren Fehler-Übergänge möglich
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed(_))
    }

    /// Übergangstabelle
    pub fn can_transition(from: &CallState, to: &CallState) -> bool {
        use CallState::*;

        match (from, to) {
            (Disconnected, Registering) => true,
            (Disconnected, Connecting) => true,
            (Registering, AwaitingPeer) => true,
            (AwaitingPeer, Connecting) => true,
            (Connecting, Connected) => true,
            (from, Failed(_)) => !from.is_terminal(),
            (Failed(_), Disconnected) => true,
            // geordneter Abbau ohne Fehler
            (from, Disconnected) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl Serialize for CallState {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

// ============================================================================
// OBSERVABLES
// ============================================================================

/// Wird bei jeder Zustandsänderung an den einzigen Abonnenten gesendet
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateUpdate {
    pub state: CallState,
    pub status: Option<String>,
    pub room_code: Option<RoomCode>,
}

/// Momentaufnahme der Sitzung
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub role: Role,
    pub room_code: Option<RoomCode>,
    pub state: CallState,
    pub muted: bool,
    pub speaker_enabled: bool,
    pub local_audio: Option<Uuid>,
    pub remote_audio: Option<Uuid>,
    pub signaling_open: bool,
}

impl SessionSnapshot {
    pub fn disconnected() -> Self {
        Self {
            role: Role::None,
            room_code: None,
            state: CallState::Disconnected,
            muted: false,
            speaker_enabled: true,
            local_audio: None,
            remote_audio: None,
            signaling_open: false,
        }
    }
}
