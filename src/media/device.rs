//! Geräte-Schnittstelle für den Mikrofonzugriff
//!
//! Die Plattform (cpal, Browser-Bridge, Test-Fake) implementiert
//! `AudioDevice`. Der Aufruf wartet u.U. auf eine Berechtigungsabfrage.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::track::LocalAudio;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Microphone permission denied")]
    PermissionDenied,

    #[error("No audio input device found")]
    NoDevice,

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to start audio stream: {0}")]
    Stream(String),

    #[error("Remote stream already attached")]
    RemoteAlreadyAttached,

    #[error("Media session already released")]
    Released,

    #[error("Media negotiation failed: {0}")]
    Negotiation(String),
}

// ============================================================================
// CONSTRAINTS
// ============================================================================

/// Anforderungen an den Mikrofon-Stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    /// Immer `false`: es werden nur Sprachanrufe unterstützt
    pub video: bool,
}

impl AudioConstraints {
    /// Standard für Sprache: alle Filter an, kein Video
    pub fn voice() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            video: false,
        }
    }
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self::voice()
    }
}

// ============================================================================
// DEVICE TRAIT
// ============================================================================

/// Zugriff auf das Aufnahmegerät
#[async_trait]
pub trait AudioDevice: Send + Sync {
    /// Fordert das Mikrofon an
    ///
    /// Liefert einen laufenden, aktivierten Track oder
    /// `PermissionDenied` / `NoDevice`.
    async fn request_microphone(
        &self,
        constraints: AudioConstraints,
    ) -> Result<LocalAudio, MediaError>;
}
