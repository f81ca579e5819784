//! Media Module - Audio-Streams und Aushandlung
//!
//! Dieses Modul verwaltet:
//! - Mikrofon-Zugriff über `AudioDevice` (optional cpal)
//! - Lokale/entfernte Track-Handles mit Mute/Lautsprecher
//! - Die `MediaSession` einer Sitzung
//! - WebRTC Peer Connections

#[cfg(feature = "cpal-device")]
mod audio;
mod device;
mod rtc;
mod session;
mod track;

/// Sample Rate (48kHz ist der Standard für beste Qualität)
pub const SAMPLE_RATE: u32 = 48000;

/// Channels (Mono für Voice)
pub const CHANNELS: u16 = 1;

/// Frame Size in Samples (20ms @ 48kHz = 960 samples)
pub const FRAME_SIZE: usize = 960;

#[cfg(feature = "cpal-device")]
pub use audio::CpalMicrophone;
pub use device::{AudioConstraints, AudioDevice, MediaError};
pub use rtc::{ice_servers, RtcEvent, RtcPeer};
pub use session::{acquire_local, MediaSession};
pub use track::{AudioTrack, LocalAudio, RemoteAudio, TrackKind};
