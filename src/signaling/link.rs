//! Schnittstelle zum Broker
//!
//! `Broker` baut pro Sitzung genau eine Verbindung (`SignalingLink`) auf.
//! Ereignisse der Verbindung kommen über den mitgelieferten Receiver.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use super::messages::CallId;
use crate::call_session::RoomCode;
use crate::media::{AudioTrack, RemoteAudio};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("Room code is already registered")]
    IdentityTaken,

    #[error("No host registered under this room code")]
    Unreachable,

    #[error("Room code rejected by broker")]
    InvalidCode,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Broker did not answer in time")]
    Timeout,

    #[error("Connection to broker lost")]
    ConnectionLost,

    #[error("Not connected to broker")]
    NotConnected,

    #[error("Unknown call: {0}")]
    UnknownCall(String),

    #[error("Media negotiation failed: {0}")]
    Negotiation(String),
}

// ============================================================================
// SIGNALING EVENTS
// ============================================================================

/// Events einer Broker-Verbindung
#[derive(Debug)]
pub enum SignalingEvent {
    /// Ein Client ruft den registrierten Raum an
    IncomingCall { call: CallId },

    /// Aushandlung abgeschlossen, Remote-Stream verfügbar
    Answered { call: CallId, remote: RemoteAudio },

    /// Gegenseite hat aufgelegt oder abgelehnt
    Closed { call: CallId },

    /// Fehler vom Broker oder Verbindungsabbruch
    Error(SignalingError),
}

/// Frisch aufgebaute Broker-Verbindung samt Event-Stream
pub struct BrokerConnection {
    pub link: Arc<dyn SignalingLink>,
    pub events: mpsc::Receiver<SignalingEvent>,
}

impl std::fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConnection")
            .field("closed", &self.link.is_closed())
            .finish()
    }
}

// ============================================================================
// TRAITS
// ============================================================================

/// Fabrik für Broker-Verbindungen
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self) -> Result<BrokerConnection, SignalingError>;
}

/// Eine offene Broker-Verbindung
///
/// Fehler werden nie automatisch wiederholt.
#[async_trait]
pub trait SignalingLink: Send + Sync {
    /// Host: unter dem Code anmelden, wartet auf Bestätigung
    async fn register(&self, code: &RoomCode) -> Result<(), SignalingError>;

    /// Client: Raum anrufen, liefert die Kennung des laufenden Anrufs
    async fn dial(&self, code: &RoomCode, local: AudioTrack) -> Result<CallId, SignalingError>;

    /// Host: eingehenden Anruf mit dem lokalen Stream annehmen
    async fn answer(&self, call: &CallId, local: AudioTrack) -> Result<(), SignalingError>;

    /// Host: weiteren Anrufer abweisen
    async fn reject(&self, call: &CallId) -> Result<(), SignalingError>;

    /// Schließt die Verbindung (idempotent, blockiert nicht)
    fn close(&self);

    fn is_closed(&self) -> bool;
}
