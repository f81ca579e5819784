//! WebSocket Client für den Broker
//!
//! Eine Verbindung pro Sitzung:
//! - Registrierung unter dem Raum-Code (Host) bzw. Anruf (Client)
//! - Offer/Answer/ICE-Relay für die WebRTC Peer Connection
//! - Heartbeat, damit der Broker die Verbindung nicht verwirft
//! - Event-basierte Kommunikation nach oben
//!
//! Kein automatisches Reconnect: Abbrüche werden als Fehler gemeldet.

use super::link::{Broker, BrokerConnection, SignalingError, SignalingEvent, SignalingLink};
use super::messages::*;
use crate::call_session::RoomCode;
use crate::media::{AudioTrack, RtcEvent, RtcPeer};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone)]
pub struct SignalingConfig {
    pub url: Url,
    pub ice_servers: Vec<String>,
    /// Maximale Wartezeit auf die Registrierungs-Antwort
    pub request_timeout: Duration,
    pub heartbeat_interval: Duration,
}

// ============================================================================
// CLIENT STATE
// ============================================================================

enum Outbound {
    Text(String),
    Close,
}

#[derive(Default)]
struct ClientState {
    closed: bool,
    room_code: Option<RoomCode>,
    pending_register: Option<oneshot::Sender<Result<(), SignalingError>>>,
    /// Offers eingehender Anrufe, bis sie angenommen/abgelehnt werden
    offers: HashMap<CallId, String>,
    active_call: Option<CallId>,
    peer: Option<Arc<RtcPeer>>,
}

struct ClientInner {
    config: SignalingConfig,
    outbound: mpsc::Sender<Outbound>,
    events: mpsc::Sender<SignalingEvent>,
    state: RwLock<ClientState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ClientInner {
    fn is_closed(&self) -> bool {
        self.state.read().closed
    }

    async fn send(&self, msg: ClientMessage) -> Result<(), SignalingError> {
        if self.is_closed() {
            return Err(SignalingError::NotConnected);
        }
        let text = msg
            .encode()
            .map_err(|e| SignalingError::Network(e.to_string()))?;
        self.outbound
            .send(Outbound::Text(text))
            .await
            .map_err(|_| SignalingError::NotConnected)
    }

    async fn emit(&self, event: SignalingEvent) {
        if self.events.send(event).await.is_err() {
            tracing::debug!("No listener for signaling events");
        }
    }

    fn peer_for(&self, call_id: &CallId) -> Option<Arc<RtcPeer>> {
        let state = self.state.read();
        if state.active_call.as_ref() == Some(call_id) {
            state.peer.clone()
        } else {
            None
        }
    }

    /// Verarbeitet eingehende Broker-Nachrichten
    async fn handle_server_message(&self, msg: ServerMessage) {
        match msg {
            ServerMessage::Registered { room_code } => {
                tracing::info!("Registered room {}", room_code);
                let pending = self.state.write().pending_register.take();
                if let Some(tx) = pending {
                    let _ = tx.send(Ok(()));
                }
            }

            ServerMessage::IncomingCall { call_id, sdp } => {
                tracing::info!("Incoming call {}", call_id);
                self.state.write().offers.insert(call_id.clone(), sdp);
                self.emit(SignalingEvent::IncomingCall { call: call_id }).await;
            }

            ServerMessage::Answer { call_id, sdp } => match self.peer_for(&call_id) {
                Some(peer) => {
                    if let Err(e) = peer.apply_answer(sdp).await {
                        tracing::error!("Failed to apply answer: {}", e);
                        self.emit(SignalingEvent::Error(SignalingError::Negotiation(
                            e.to_string(),
                        )))
                        .await;
                    }
                }
                None => tracing::debug!("Answer for unknown call {}", call_id),
            },

            ServerMessage::IceCandidate {
                call_id,
                candidate,
            } => {
                if let Some(peer) = self.peer_for(&call_id) {
                    if let Err(e) = peer.add_ice_candidate(&candidate).await {
                        tracing::warn!("Failed to add ICE candidate: {}", e);
                    }
                }
            }

            ServerMessage::CallRejected { call_id, reason } => {
                tracing::info!("Call {} rejected (reason: {:?})", call_id, reason);
                self.emit(SignalingEvent::Closed { call: call_id }).await;
            }

            ServerMessage::CallEnded { call_id } => {
                tracing::info!("Call {} ended by peer", call_id);
                self.state.write().offers.remove(&call_id);
                self.emit(SignalingEvent::Closed { call: call_id }).await;
            }

            ServerMessage::Error { code, message } => {
                tracing::error!("Broker error {:?}: {}", code, message);
                let err = match code {
                    BrokerErrorCode::UnavailableId => SignalingError::IdentityTaken,
                    BrokerErrorCode::PeerUnavailable => SignalingError::Unreachable,
                    BrokerErrorCode::InvalidId => SignalingError::InvalidCode,
                    BrokerErrorCode::Network | BrokerErrorCode::Other => {
                        SignalingError::Network(message)
                    }
                };
                // Fehler während der Registrierung gehen nur an den Wartenden
                let pending = self.state.write().pending_register.take();
                match pending {
                    Some(tx) => {
                        let _ = tx.send(Err(err));
                    }
                    None => self.emit(SignalingEvent::Error(err)).await,
                }
            }

            ServerMessage::Pong => {}
        }
    }

    /// Leitet Events der Peer Connection weiter
    async fn forward_rtc_events(
        inner: Arc<ClientInner>,
        call_id: CallId,
        mut rx: mpsc::UnboundedReceiver<RtcEvent>,
    ) {
        while let Some(event) = rx.recv().await {
            match event {
                RtcEvent::LocalCandidate(candidate) => {
                    let msg = ClientMessage::IceCandidate {
                        call_id: call_id.clone(),
                        candidate,
                    };
                    if let Err(e) = inner.send(msg).await {
                        tracing::debug!("Dropping ICE candidate: {}", e);
                    }
                }
                RtcEvent::RemoteAudio(remote) => {
                    inner
                        .emit(SignalingEvent::Answered {
                            call: call_id.clone(),
                            remote,
                        })
                        .await;
                }
                RtcEvent::ConnectionLost => {
                    tracing::warn!("Media connection of call {} failed", call_id);
                    inner
                        .emit(SignalingEvent::Error(SignalingError::ConnectionLost))
                        .await;
                    break;
                }
            }
        }
    }

    async fn connection_ended(&self) {
        let was_closed = {
            let mut state = self.state.write();
            state.pending_register = None;
            state.closed
        };
        if !was_closed {
            tracing::warn!("Broker connection lost");
            self.emit(SignalingEvent::Error(SignalingError::ConnectionLost))
                .await;
        }
    }
}

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

/// WebSocket Client für genau eine Sitzung
pub struct SignalingClient {
    inner: Arc<ClientInner>,
}

impl SignalingClient {
    /// Verbindet mit dem Broker und startet Lese-, Schreib- und Heartbeat-Task
    pub async fn connect(
        config: SignalingConfig,
    ) -> Result<(Self, mpsc::Receiver<SignalingEvent>), SignalingError> {
        tracing::info!("Connecting to broker: {}", config.url);

        let (ws_stream, _) = connect_async(config.url.as_str())
            .await
            .map_err(|e| SignalingError::Network(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(100);
        let (event_tx, event_rx) = mpsc::channel(100);

        let inner = Arc::new(ClientInner {
            config,
            outbound: out_tx,
            events: event_tx,
            state: RwLock::new(ClientState::default()),
            tasks: Mutex::new(Vec::new()),
        });

        // Write-Task endet nach dem Close-Frame von selbst
        tokio::spawn(async move {
            while let Some(out) = out_rx.recv().await {
                match out {
                    Outbound::Text(text) => {
                        if let Err(e) = write.send(Message::Text(text)).await {
                            tracing::error!("Failed to send WebSocket message: {}", e);
                            break;
                        }
                    }
                    Outbound::Close => {
                        let _ = write.send(Message::Close(None)).await;
                        let _ = write.close().await;
                        break;
                    }
                }
            }
        });

        let reader_inner = Arc::clone(&inner);
        let reader = tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(msg) => reader_inner.handle_server_message(msg).await,
                        Err(e) => tracing::warn!("Ignoring malformed broker message: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by broker");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            reader_inner.connection_ended().await;
        });

        let heartbeat_inner = Arc::clone(&inner);
        let heartbeat = tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat_inner.config.heartbeat_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = heartbeat_inner.send(ClientMessage::Heartbeat).await {
                    tracing::warn!("Failed to send heartbeat: {}", e);
                    break;
                }
            }
        });

        inner.tasks.lock().extend([reader, heartbeat]);
        Ok((Self { inner }, event_rx))
    }

    pub fn room_code(&self) -> Option<RoomCode> {
        self.inner.state.read().room_code.clone()
    }

    /// Erstellt die Peer Connection für den (einzigen) Anruf dieser Sitzung
    async fn open_peer(
        &self,
        call_id: CallId,
        local: AudioTrack,
    ) -> Result<Arc<RtcPeer>, SignalingError> {
        if self.inner.state.read().peer.is_some() {
            return Err(SignalingError::Negotiation(
                "a call is already in progress".to_string(),
            ));
        }

        let (rtc_tx, rtc_rx) = mpsc::unbounded_channel();
        let peer = RtcPeer::new(&self.inner.config.ice_servers, local, rtc_tx)
            .await
            .map_err(|e| SignalingError::Negotiation(e.to_string()))?;
        let peer = Arc::new(peer);

        let accepted = {
            let mut state = self.inner.state.write();
            if state.closed {
                false
            } else {
                state.peer = Some(Arc::clone(&peer));
                state.active_call = Some(call_id.clone());
                true
            }
        };
        if !accepted {
            peer.close().await;
            return Err(SignalingError::NotConnected);
        }

        let forwarder = tokio::spawn(ClientInner::forward_rtc_events(
            Arc::clone(&self.inner),
            call_id,
            rtc_rx,
        ));
        let mut tasks = self.inner.tasks.lock();
        if self.inner.is_closed() {
            forwarder.abort();
        } else {
            tasks.push(forwarder);
        }

        Ok(peer)
    }
}

#[async_trait]
impl SignalingLink for SignalingClient {
    async fn register(&self, code: &RoomCode) -> Result<(), SignalingError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.state.write();
            if state.closed {
                return Err(SignalingError::NotConnected);
            }
            state.room_code = Some(code.clone());
            state.pending_register = Some(tx);
        }

        self.inner
            .send(ClientMessage::Register {
                room_code: code.clone(),
            })
            .await?;

        match tokio::time::timeout(self.inner.config.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SignalingError::NotConnected),
            Err(_) => {
                self.inner.state.write().pending_register = None;
                Err(SignalingError::Timeout)
            }
        }
    }

    async fn dial(&self, code: &RoomCode, local: AudioTrack) -> Result<CallId, SignalingError> {
        let call_id = CallId::new();
        let peer = self.open_peer(call_id.clone(), local).await?;
        let sdp = peer
            .create_offer()
            .await
            .map_err(|e| SignalingError::Negotiation(e.to_string()))?;

        self.inner
            .send(ClientMessage::Dial {
                room_code: code.clone(),
                call_id: call_id.clone(),
                sdp,
            })
            .await?;

        tracing::info!("Dialing room {} (call {})", code, call_id);
        Ok(call_id)
    }

    async fn answer(&self, call: &CallId, local: AudioTrack) -> Result<(), SignalingError> {
        let offer = self
            .inner
            .state
            .write()
            .offers
            .remove(call)
            .ok_or_else(|| SignalingError::UnknownCall(call.to_string()))?;

        let peer = self.open_peer(call.clone(), local).await?;
        let sdp = peer
            .accept_offer(offer)
            .await
            .map_err(|e| SignalingError::Negotiation(e.to_string()))?;

        tracing::info!("Answering call {}", call);
        self.inner
            .send(ClientMessage::Answer {
                call_id: call.clone(),
                sdp,
            })
            .await
    }

    async fn reject(&self, call: &CallId) -> Result<(), SignalingError> {
        self.inner.state.write().offers.remove(call);
        tracing::info!("Rejecting call {}", call);
        self.inner
            .send(ClientMessage::Reject {
                call_id: call.clone(),
                reason: Some("busy".to_string()),
            })
            .await
    }

    fn close(&self) {
        let (peer, call) = {
            let mut state = self.inner.state.write();
            if state.closed {
                return;
            }
            state.closed = true;
            state.pending_register = None;
            state.offers.clear();
            (state.peer.take(), state.active_call.take())
        };

        if let Some(call_id) = call {
            if let Ok(text) = (ClientMessage::Hangup { call_id }).encode() {
                let _ = self.inner.outbound.try_send(Outbound::Text(text));
            }
        }
        let _ = self.inner.outbound.try_send(Outbound::Close);

        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }

        if let Some(peer) = peer {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move { peer.close().await });
                }
                Err(_) => tracing::warn!("No runtime to close peer connection"),
            }
        }

        tracing::info!("Broker connection closed");
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("SignalingClient")
            .field("url", &self.inner.config.url.as_str())
            .field("closed", &state.closed)
            .field("room_code", &state.room_code)
            .field("active_call", &state.active_call)
            .finish()
    }
}

// ============================================================================
// BROKER CONNECTOR
// ============================================================================

/// Baut pro Sitzung einen neuen `SignalingClient`
#[derive(Debug, Clone)]
pub struct BrokerConnector {
    config: SignalingConfig,
}

impl BrokerConnector {
    pub fn new(config: SignalingConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Broker for BrokerConnector {
    async fn connect(&self) -> Result<BrokerConnection, SignalingError> {
        let (client, events) = SignalingClient::connect(self.config.clone()).await?;
        Ok(BrokerConnection {
            link: Arc::new(client),
            events,
        })
    }
}
