//! Audio-Track Handles
//!
//! Ein `AudioTrack` ist der geteilte Zustand eines Audio-Streams:
//! - `enabled`: Track liefert Audio (Mikrofon) bzw. wird abgespielt (Remote)
//! - `live`: Track läuft noch; nach `stop()` endgültig beendet
//!
//! `LocalAudio` und `RemoteAudio` besitzen ihren Track exklusiv und stoppen
//! ihn beim Drop. Geräte und Transport halten nur Klone als Sonde.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use super::device::AudioConstraints;

// ============================================================================
// AUDIO TRACK
// ============================================================================

/// Herkunft eines Tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    /// Eigenes Mikrofon (ausgehend)
    Local,
    /// Audio des Gesprächspartners (eingehend)
    Remote,
}

struct TrackInner {
    id: Uuid,
    kind: TrackKind,
    enabled: AtomicBool,
    live: Mutex<bool>,
    ended: Condvar,
}

/// Geteilter Handle auf einen Audio-Track
#[derive(Clone)]
pub struct AudioTrack {
    inner: Arc<TrackInner>,
}

impl AudioTrack {
    /// Erstellt einen neuen, aktiven Track
    pub fn new(kind: TrackKind) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                id: Uuid::new_v4(),
                kind,
                enabled: AtomicBool::new(true),
                live: Mutex::new(true),
                ended: Condvar::new(),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    /// Aktiviert/deaktiviert den Track ohne ihn zu beenden
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_live(&self) -> bool {
        *self.inner.live.lock()
    }

    /// Beendet den Track (idempotent)
    pub fn stop(&self) {
        let mut live = self.inner.live.lock();
        if *live {
            *live = false;
            self.inner.ended.notify_all();
            tracing::debug!("{:?} audio track {} stopped", self.inner.kind, self.inner.id);
        }
    }

    /// Blockiert bis der Track beendet wurde
    ///
    /// Nur für Geräte-Threads gedacht, niemals im async Kontext aufrufen.
    pub fn wait_ended(&self) {
        let mut live = self.inner.live.lock();
        while *live {
            self.inner.ended.wait(&mut live);
        }
    }

    /// Prüft ob zwei Handles denselben Track meinen
    pub fn same_track(&self, other: &AudioTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for AudioTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

// ============================================================================
// LOCAL / REMOTE HANDLES
// ============================================================================

/// Exklusiver Besitz des lokalen Mikrofon-Streams
#[derive(Debug)]
pub struct LocalAudio {
    track: AudioTrack,
    constraints: AudioConstraints,
}

impl LocalAudio {
    pub fn new(track: AudioTrack, constraints: AudioConstraints) -> Self {
        Self { track, constraints }
    }

    pub fn id(&self) -> Uuid {
        self.track.id()
    }

    /// Klon des Tracks, z.B. für den Peer-Connection-Sender
    pub fn track(&self) -> AudioTrack {
        self.track.clone()
    }

    pub fn constraints(&self) -> AudioConstraints {
        self.constraints
    }

    pub fn stop(&self) {
        self.track.stop();
    }
}

impl Drop for LocalAudio {
    fn drop(&mut self) {
        self.track.stop();
    }
}

/// Eingehender Stream des Gesprächspartners
///
/// `enabled` des Tracks steuert nur die lokale Wiedergabe.
#[derive(Debug)]
pub struct RemoteAudio {
    track: AudioTrack,
}

impl RemoteAudio {
    pub fn new(track: AudioTrack) -> Self {
        Self { track }
    }

    pub fn id(&self) -> Uuid {
        self.track.id()
    }

    pub fn track(&self) -> AudioTrack {
        self.track.clone()
    }

    pub fn playback_enabled(&self) -> bool {
        self.track.is_enabled()
    }

    pub fn set_playback_enabled(&self, enabled: bool) {
        self.track.set_enabled(enabled);
    }

    pub fn stop(&self) {
        self.track.stop();
    }
}

impl Drop for RemoteAudio {
    fn drop(&mut self) {
        self.track.stop();
    }
}
