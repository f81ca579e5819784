use thiserror::Error;

use crate::media::MediaError;
use crate::signaling::SignalingError;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Fehler einer Anrufsitzung
///
/// Die Display-Texte werden dem Benutzer als Status angezeigt und müssen
/// voneinander unterscheidbar bleiben.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Invalid room code")]
    InvalidCode,

    #[error("Cannot access the microphone")]
    DevicePermissionDenied,

    #[error("Room code already in use")]
    RegistrationConflict,

    #[error("Room not found")]
    PeerUnreachable,

    #[error("Connection error: {0}")]
    NetworkError(String),

    #[error("Call dropped")]
    CallDropped,

    // Abgewiesene Kommandos, führen nie in den Failed-Zustand
    #[error("A call session is already active")]
    SessionActive,

    #[error("No active call session")]
    NoSession,

    #[error("Call controller has shut down")]
    ControllerGone,
}

impl CallError {
    pub fn status_text(&self) -> String {
        self.to_string()
    }

    /// Übersetzt Broker-Fehler; `connected` unterscheidet Abbruch von Verbindungsfehler
    pub fn from_signaling(err: SignalingError, connected: bool) -> Self {
        match err {
            SignalingError::IdentityTaken => Self::RegistrationConflict,
            SignalingError::Unreachable => Self::PeerUnreachable,
            SignalingError::InvalidCode => Self::InvalidCode,
            SignalingError::ConnectionLost if connected => Self::CallDropped,
            other => Self::NetworkError(other.to_string()),
        }
    }
}

impl From<MediaError> for CallError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::PermissionDenied
            | MediaError::NoDevice
            | MediaError::UnsupportedConfig(_)
            | MediaError::Stream(_) => Self::DevicePermissionDenied,
            MediaError::Negotiation(msg) => Self::NetworkError(msg),
            MediaError::RemoteAlreadyAttached | MediaError::Released => Self::CallDropped,
        }
    }
}
