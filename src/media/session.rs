//! MediaSession - Besitzer von lokalem und entferntem Audio
//!
//! Hält den Mikrofon-Track und den ausgehandelten Remote-Stream einer
//! Sitzung und wendet Mute/Lautsprecher an. `release()` ist von jedem
//! Zustand aus erreichbar und darf beliebig oft aufgerufen werden.

use uuid::Uuid;

use super::device::{AudioConstraints, AudioDevice, MediaError};
use super::track::{AudioTrack, LocalAudio, RemoteAudio};

/// Fordert das Mikrofon mit den gegebenen Constraints an
pub async fn acquire_local(
    device: &dyn AudioDevice,
    constraints: AudioConstraints,
) -> Result<LocalAudio, MediaError> {
    if constraints.video {
        return Err(MediaError::UnsupportedConfig(
            "video capture is not supported".to_string(),
        ));
    }

    tracing::debug!("Requesting microphone: {:?}", constraints);
    let local = device.request_microphone(constraints).await?;
    tracing::info!("Microphone acquired (track {})", local.id());
    Ok(local)
}

// ============================================================================
// MEDIA SESSION
// ============================================================================

#[derive(Debug)]
pub struct MediaSession {
    local: Option<LocalAudio>,
    remote: Option<RemoteAudio>,
    remote_attached: bool,
    muted: bool,
    speaker_enabled: bool,
}

impl MediaSession {
    /// Übernimmt einen bereits angeforderten Mikrofon-Stream
    pub fn new(local: LocalAudio) -> Self {
        Self {
            local: Some(local),
            remote: None,
            remote_attached: false,
            muted: false,
            speaker_enabled: true,
        }
    }

    pub fn local_track(&self) -> Option<AudioTrack> {
        self.local.as_ref().map(LocalAudio::track)
    }

    pub fn local_id(&self) -> Option<Uuid> {
        self.local.as_ref().map(LocalAudio::id)
    }

    pub fn remote_id(&self) -> Option<Uuid> {
        self.remote.as_ref().map(RemoteAudio::id)
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn speaker_enabled(&self) -> bool {
        self.speaker_enabled
    }

    pub fn is_released(&self) -> bool {
        self.local.is_none()
    }

    /// Bindet den eingehenden Stream zur Wiedergabe (einmal pro Anruf)
    pub fn attach_remote(&mut self, remote: RemoteAudio) -> Result<(), MediaError> {
        if self.is_released() {
            return Err(MediaError::Released);
        }
        if self.remote_attached {
            return Err(MediaError::RemoteAlreadyAttached);
        }

        remote.set_playback_enabled(self.speaker_enabled);
        tracing::info!("Remote stream {} attached", remote.id());
        self.remote = Some(remote);
        self.remote_attached = true;
        Ok(())
    }

    /// Schaltet den ausgehenden Track um, ohne das Gerät neu anzufordern
    pub fn set_muted(&mut self, muted: bool) -> Result<(), MediaError> {
        let local = self.local.as_ref().ok_or(MediaError::Released)?;
        local.track().set_enabled(!muted);
        self.muted = muted;
        tracing::debug!("Audio muted: {}", muted);
        Ok(())
    }

    /// Schaltet nur die lokale Wiedergabe des Remote-Streams um
    pub fn set_speaker_enabled(&mut self, enabled: bool) -> Result<(), MediaError> {
        if self.is_released() {
            return Err(MediaError::Released);
        }
        if let Some(remote) = self.remote.as_ref() {
            remote.set_playback_enabled(enabled);
        }
        self.speaker_enabled = enabled;
        tracing::debug!("Speaker enabled: {}", enabled);
        Ok(())
    }

    /// Stoppt alle lokalen Tracks und löst den Remote-Stream
    pub fn release(&mut self) {
        let local = self.local.take();
        let remote = self.remote.take();
        if local.is_none() && remote.is_none() {
            return;
        }

        if let Some(remote) = remote {
            remote.stop();
        }
        if let Some(local) = local {
            local.stop();
        }
        self.muted = false;
        self.speaker_enabled = true;
        tracing::info!("Media session released");
    }
}

impl Drop for MediaSession {
    fn drop(&mut self) {
        self.release();
    }
}
