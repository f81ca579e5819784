//! WebRTC Peer
//!
//! Kapselt genau eine `RTCPeerConnection` pro Anruf:
//! - Offer (Client) bzw. Answer (Host) erzeugen
//! - ICE Candidates in beide Richtungen
//! - Eingehenden Audio-Track als `RemoteAudio` melden
//!
//! Codec-Auswahl überlässt der Peer der Media Engine (Standard-Codecs).

use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

use super::device::MediaError;
use super::track::{AudioTrack, RemoteAudio, TrackKind};
use super::{CHANNELS, SAMPLE_RATE};

// ============================================================================
// EVENTS
// ============================================================================

/// Events einer Peer Connection
#[derive(Debug)]
pub enum RtcEvent {
    /// Lokaler ICE Candidate (JSON) für die Gegenseite
    LocalCandidate(String),
    /// Erster eingehender Audio-Track
    RemoteAudio(RemoteAudio),
    /// ICE/DTLS endgültig fehlgeschlagen
    ConnectionLost,
}

fn webrtc_err(e: webrtc::Error) -> MediaError {
    MediaError::Negotiation(e.to_string())
}

/// `Disconnected` kann sich noch erholen, erst `Failed` ist endgültig
fn is_connection_lost(state: RTCPeerConnectionState) -> bool {
    state == RTCPeerConnectionState::Failed
}

/// Baut die ICE-Server-Konfiguration aus URL-Strings
pub fn ice_servers(urls: &[String]) -> Vec<RTCIceServer> {
    if urls.is_empty() {
        return Vec::new();
    }
    vec![RTCIceServer {
        urls: urls.to_vec(),
        ..Default::default()
    }]
}

// ============================================================================
// RTC PEER
// ============================================================================

pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    local: AudioTrack,
}

impl RtcPeer {
    /// Erstellt eine Peer Connection mit ausgehendem Audio-Track
    pub async fn new(
        ice_server_urls: &[String],
        local: AudioTrack,
        events: mpsc::UnboundedSender<RtcEvent>,
    ) -> Result<Self, MediaError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(webrtc_err)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(webrtc_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers(ice_server_urls),
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await.map_err(webrtc_err)?);

        let outbound = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: SAMPLE_RATE,
                channels: CHANNELS,
                ..Default::default()
            },
            "audio".to_string(),
            local.id().to_string(),
        ));
        pc.add_track(Arc::clone(&outbound) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(webrtc_err)?;

        let peer = Self { pc, local };
        peer.install_handlers(events);
        Ok(peer)
    }

    /// Client: SDP Offer erzeugen und lokal setzen
    pub async fn create_offer(&self) -> Result<String, MediaError> {
        let offer = self.pc.create_offer(None).await.map_err(webrtc_err)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(webrtc_err)?;
        Ok(offer.sdp)
    }

    /// Host: Offer übernehmen und Answer erzeugen
    pub async fn accept_offer(&self, offer_sdp: String) -> Result<String, MediaError> {
        let offer = RTCSessionDescription::offer(offer_sdp).map_err(webrtc_err)?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(webrtc_err)?;

        let answer = self.pc.create_answer(None).await.map_err(webrtc_err)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(webrtc_err)?;
        Ok(answer.sdp)
    }

    /// Client: Answer der Gegenseite setzen
    pub async fn apply_answer(&self, answer_sdp: String) -> Result<(), MediaError> {
        let answer = RTCSessionDescription::answer(answer_sdp).map_err(webrtc_err)?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(webrtc_err)
    }

    pub async fn add_ice_candidate(&self, candidate_json: &str) -> Result<(), MediaError> {
        let candidate: RTCIceCandidateInit = serde_json::from_str(candidate_json)
            .map_err(|e| MediaError::Negotiation(e.to_string()))?;
        self.pc
            .add_ice_candidate(candidate)
            .await
            .map_err(webrtc_err)
    }

    pub fn local_track(&self) -> &AudioTrack {
        &self.local
    }

    pub async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            tracing::warn!("Failed to close peer connection: {}", e);
        }
    }

    fn install_handlers(&self, events: mpsc::UnboundedSender<RtcEvent>) {
        let state_events = events.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                tracing::info!("Peer connection state: {:?}", s);
                if is_connection_lost(s) {
                    let _ = state_events.send(RtcEvent::ConnectionLost);
                }
                Box::pin(async {})
            }));

        let ice_events = events.clone();
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            if let Some(c) = candidate {
                if let Ok(json) = c.to_json() {
                    if let Ok(candidate_str) = serde_json::to_string(&json) {
                        let _ = ice_events.send(RtcEvent::LocalCandidate(candidate_str));
                    }
                }
            }
            Box::pin(async {})
        }));

        let track_events = events;
        self.pc.on_track(Box::new(move |track, _, _| {
            let track_events = track_events.clone();
            Box::pin(async move {
                tracing::info!("Received track: {:?}", track.codec());

                let remote = AudioTrack::new(TrackKind::Remote);
                let handle = remote.clone();
                // Pakete abholen solange der Stream gebunden ist
                tokio::spawn(async move {
                    while handle.is_live() {
                        if track.read_rtp().await.is_err() {
                            break;
                        }
                    }
                });

                let _ = track_events.send(RtcEvent::RemoteAudio(RemoteAudio::new(remote)));
            })
        }));
    }
}

impl std::fmt::Debug for RtcPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtcPeer")
            .field("state", &self.pc.connection_state())
            .field("local", &self.local.id())
            .finish()
    }
}
