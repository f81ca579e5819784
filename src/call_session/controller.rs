//! CallSessionController - Zustandsautomat einer Anrufsitzung
//!
//! Ein einzelner Task besitzt die Sitzung und verarbeitet nacheinander:
//! - Kommandos der UI (über `CallHandle`)
//! - Ergebnisse asynchroner Operationen (Mikrofon, Broker)
//! - Events der Broker-Verbindung
//!
//! Alle asynchronen Ergebnisse tragen die Generation ihrer Sitzung. Passt die
//! Generation nicht mehr, wird das Ergebnis verworfen und enthaltene
//! Ressourcen werden freigegeben.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::error::CallError;
use super::room_code::RoomCode;
use super::state::{CallState, Role, SessionSnapshot, StateUpdate};
use crate::media::{
    acquire_local, AudioConstraints, AudioDevice, LocalAudio, MediaError, MediaSession,
};
use crate::signaling::{
    Broker, BrokerConnection, CallId, SignalingError, SignalingEvent, SignalingLink,
};

const COMMAND_QUEUE_SIZE: usize = 32;

const STATUS_REGISTERING: &str = "Registering room…";
const STATUS_AWAITING_PEER: &str = "Waiting for the other party…";
const STATUS_DIALING: &str = "Calling room…";
const STATUS_INCOMING: &str = "Incoming call…";
const STATUS_CONNECTED: &str = "Connected – line open";
const STATUS_CALL_ENDED: &str = "Call ended";

// ============================================================================
// COMMANDS
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum Control {
    ToggleMute,
    ToggleSpeaker,
    SetMuted(bool),
    SetSpeaker(bool),
}

#[derive(Debug)]
enum Command {
    StartHost(oneshot::Sender<Result<(), CallError>>),
    JoinRoom(RoomCode, oneshot::Sender<Result<(), CallError>>),
    Control(Control, oneshot::Sender<Result<bool, CallError>>),
    Disconnect(oneshot::Sender<()>),
    Snapshot(oneshot::Sender<SessionSnapshot>),
}

// ============================================================================
// SESSION EVENTS
// ============================================================================

enum SessionEvent {
    LocalAcquired(Result<LocalAudio, MediaError>),
    BrokerReady(Result<BrokerConnection, SignalingError>),
    Registered(Result<(), SignalingError>),
    Dialed(Result<CallId, SignalingError>),
    Signaling(SignalingEvent),
    OperationFailed(SignalingError),
}

impl SessionEvent {
    /// Gibt Ressourcen eines verworfenen Events frei
    fn discard(self) {
        match self {
            SessionEvent::LocalAcquired(Ok(local)) => local.stop(),
            SessionEvent::BrokerReady(Ok(conn)) => conn.link.close(),
            SessionEvent::Signaling(SignalingEvent::Answered { remote, .. }) => remote.stop(),
            _ => {}
        }
    }
}

struct Tagged {
    generation: u64,
    event: SessionEvent,
}

// ============================================================================
// SESSION
// ============================================================================

/// Sitzung, deren Mikrofon-Anfrage noch läuft
struct PendingStart {
    generation: u64,
    role: Role,
    room_code: RoomCode,
}

struct Session {
    generation: u64,
    role: Role,
    room_code: RoomCode,
    state: CallState,
    media: MediaSession,
    link: Option<Arc<dyn SignalingLink>>,
    call: Option<CallId>,
    /// Anrufer, der vor der Registrierungs-Bestätigung eintraf
    early_call: Option<CallId>,
    pump: Option<JoinHandle<()>>,
}

impl Session {
    fn owns_call(&self, call: &CallId) -> bool {
        match &self.call {
            Some(active) => active == call,
            // Antwort kann vor dem Dial-Ergebnis eintreffen
            None => self.role == Role::Client,
        }
    }

    /// Gibt alle Ressourcen frei: Media zuerst, dann Broker
    fn teardown(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.media.release();
        if let Some(link) = self.link.take() {
            link.close();
        }
        self.call = None;
        self.early_call = None;
    }
}

enum Slot {
    Idle,
    Starting(PendingStart),
    Active(Session),
}

// ============================================================================
// CALL HANDLE
// ============================================================================

/// Handle für UI-Kommandos, beliebig klonbar
///
/// Werden alle Handles gedroppt, räumt der Controller auf und beendet sich.
#[derive(Debug, Clone)]
pub struct CallHandle {
    tx: mpsc::Sender<Command>,
}

impl CallHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, CallError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .await
            .map_err(|_| CallError::ControllerGone)?;
        rx.await.map_err(|_| CallError::ControllerGone)
    }

    /// Erzeugt einen Raum und wartet auf einen Anrufer
    pub async fn start_host(&self) -> Result<(), CallError> {
        self.request(Command::StartHost).await?
    }

    /// Ruft einen Raum an
    ///
    /// Ungültige Codes werden abgewiesen, bevor Gerät oder Broker
    /// angesprochen werden.
    pub async fn join_room(&self, code: &str) -> Result<(), CallError> {
        let Some(code) = RoomCode::parse(code) else {
            tracing::warn!("Rejected room code {:?}", code);
            return Err(CallError::InvalidCode);
        };
        self.request(|reply| Command::JoinRoom(code, reply)).await?
    }

    /// Gibt den neuen Mute-Status zurück
    pub async fn toggle_mute(&self) -> Result<bool, CallError> {
        self.control(Control::ToggleMute).await
    }

    /// Gibt den neuen Lautsprecher-Status zurück
    pub async fn toggle_speaker(&self) -> Result<bool, CallError> {
        self.control(Control::ToggleSpeaker).await
    }

    pub async fn set_muted(&self, muted: bool) -> Result<bool, CallError> {
        self.control(Control::SetMuted(muted)).await
    }

    pub async fn set_speaker_enabled(&self, enabled: bool) -> Result<bool, CallError> {
        self.control(Control::SetSpeaker(enabled)).await
    }

    /// Beendet die Sitzung; kehrt erst nach vollständiger Freigabe zurück
    pub async fn disconnect(&self) -> Result<(), CallError> {
        self.request(Command::Disconnect).await
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, CallError> {
        self.request(Command::Snapshot).await
    }

    async fn control(&self, action: Control) -> Result<bool, CallError> {
        self.request(|reply| Command::Control(action, reply)).await?
    }
}

// ============================================================================
// CONTROLLER
// ============================================================================

pub struct CallSessionController {
    device: Arc<dyn AudioDevice>,
    broker: Arc<dyn Broker>,
    constraints: AudioConstraints,
    slot: Slot,
    generation: u64,
    updates: mpsc::UnboundedSender<StateUpdate>,
    events_tx: mpsc::UnboundedSender<Tagged>,
}

impl CallSessionController {
    /// Startet den Controller-Task
    ///
    /// Der Receiver ist der einzige Abonnent der Zustandsänderungen.
    pub fn spawn(
        device: Arc<dyn AudioDevice>,
        broker: Arc<dyn Broker>,
        constraints: AudioConstraints,
    ) -> (CallHandle, mpsc::UnboundedReceiver<StateUpdate>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let controller = Self {
            device,
            broker,
            constraints,
            slot: Slot::Idle,
            generation: 0,
            updates: update_tx,
            events_tx,
        };
        tokio::spawn(controller.run(cmd_rx, events_rx));

        (CallHandle { tx: cmd_tx }, update_rx)
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: mpsc::UnboundedReceiver<Tagged>,
    ) {
        tracing::debug!("Call session controller started");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(tagged) = events.recv() => self.handle_event(tagged),
            }
        }

        self.close_session(None);
        tracing::debug!("Call session controller stopped");
    }

    // ========================================================================
    // COMMAND HANDLING
    // ========================================================================

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartHost(reply) => {
                let _ = reply.send(self.begin(Role::Host, RoomCode::generate()));
            }
            Command::JoinRoom(code, reply) => {
                let _ = reply.send(self.begin(Role::Client, code));
            }
            Command::Control(action, reply) => {
                let _ = reply.send(self.control(action));
            }
            Command::Disconnect(done) => {
                tracing::info!("Disconnect requested");
                self.close_session(None);
                let _ = done.send(());
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    /// Legt eine neue Sitzung an und fordert das Mikrofon an
    fn begin(&mut self, role: Role, room_code: RoomCode) -> Result<(), CallError> {
        if !matches!(self.slot, Slot::Idle) {
            return Err(CallError::SessionActive);
        }

        self.generation += 1;
        let generation = self.generation;
        tracing::info!(
            "Starting session {} as {:?} for room {}",
            generation,
            role,
            room_code
        );
        self.slot = Slot::Starting(PendingStart {
            generation,
            role,
            room_code,
        });

        let device = Arc::clone(&self.device);
        let constraints = self.constraints;
        self.spawn_op(generation, async move {
            SessionEvent::LocalAcquired(acquire_local(device.as_ref(), constraints).await)
        });
        Ok(())
    }

    fn control(&mut self, action: Control) -> Result<bool, CallError> {
        let Slot::Active(session) = &mut self.slot else {
            return Err(CallError::NoSession);
        };
        let media = &mut session.media;

        let result = match action {
            Control::ToggleMute => {
                let muted = !media.is_muted();
                media.set_muted(muted).map(|_| muted)
            }
            Control::SetMuted(muted) => media.set_muted(muted).map(|_| muted),
            Control::ToggleSpeaker => {
                let enabled = !media.speaker_enabled();
                media.set_speaker_enabled(enabled).map(|_| enabled)
            }
            Control::SetSpeaker(enabled) => media.set_speaker_enabled(enabled).map(|_| enabled),
        };
        result.map_err(|_| CallError::NoSession)
    }

    fn snapshot(&self) -> SessionSnapshot {
        match &self.slot {
            Slot::Active(session) => SessionSnapshot {
                role: session.role,
                room_code: Some(session.room_code.clone()),
                state: session.state.clone(),
                muted: session.media.is_muted(),
                speaker_enabled: session.media.speaker_enabled(),
                local_audio: session.media.local_id(),
                remote_audio: session.media.remote_id(),
                signaling_open: session.link.as_ref().is_some_and(|l| !l.is_closed()),
            },
            Slot::Idle | Slot::Starting(_) => SessionSnapshot::disconnected(),
        }
    }

    // ========================================================================
    // EVENT HANDLING
    // ========================================================================

    fn live_generation(&self) -> Option<u64> {
        match &self.slot {
            Slot::Idle => None,
            Slot::Starting(pending) => Some(pending.generation),
            Slot::Active(session) => Some(session.generation),
        }
    }

    fn handle_event(&mut self, tagged: Tagged) {
        if self.live_generation() != Some(tagged.generation) {
            tracing::trace!("Ignoring stale event of session {}", tagged.generation);
            tagged.event.discard();
            return;
        }

        match tagged.event {
            SessionEvent::LocalAcquired(result) => self.on_local_acquired(result),
            SessionEvent::BrokerReady(result) => self.on_broker_ready(result),
            SessionEvent::Registered(result) => self.on_registered(result),
            SessionEvent::Dialed(result) => self.on_dialed(result),
            SessionEvent::Signaling(event) => self.on_signaling(event),
            SessionEvent::OperationFailed(err) => self.fail_with_signaling(err),
        }
    }

    fn on_local_acquired(&mut self, result: Result<LocalAudio, MediaError>) {
        let pending = match std::mem::replace(&mut self.slot, Slot::Idle) {
            Slot::Starting(pending) => pending,
            other => {
                self.slot = other;
                if let Ok(local) = result {
                    local.stop();
                }
                return;
            }
        };

        let local = match result {
            Ok(local) => local,
            Err(e) => {
                tracing::warn!("Microphone unavailable: {}", e);
                self.fail_starting(CallError::from(e));
                return;
            }
        };

        let (next, status) = match pending.role {
            Role::Host => (CallState::Registering, STATUS_REGISTERING),
            _ => (CallState::Connecting, STATUS_DIALING),
        };
        self.slot = Slot::Active(Session {
            generation: pending.generation,
            role: pending.role,
            room_code: pending.room_code,
            state: CallState::Disconnected,
            media: MediaSession::new(local),
            link: None,
            call: None,
            early_call: None,
            pump: None,
        });
        self.transition(next, Some(status));

        let broker = Arc::clone(&self.broker);
        self.spawn_op(pending.generation, async move {
            SessionEvent::BrokerReady(broker.connect().await)
        });
    }

    fn on_broker_ready(&mut self, result: Result<BrokerConnection, SignalingError>) {
        let conn = match result {
            Ok(conn) => conn,
            Err(e) => {
                self.fail_with_signaling(e);
                return;
            }
        };

        let Slot::Active(session) = &mut self.slot else {
            conn.link.close();
            return;
        };
        let generation = session.generation;
        let role = session.role;
        let room_code = session.room_code.clone();
        let local = session.media.local_track();
        let link = Arc::clone(&conn.link);
        session.link = Some(Arc::clone(&conn.link));
        session.pump = Some(Self::spawn_pump(
            self.events_tx.clone(),
            generation,
            conn.events,
        ));

        match (role, local) {
            (Role::Host, _) => self.spawn_op(generation, async move {
                SessionEvent::Registered(link.register(&room_code).await)
            }),
            (_, Some(local)) => self.spawn_op(generation, async move {
                SessionEvent::Dialed(link.dial(&room_code, local).await)
            }),
            (_, None) => self.fail(CallError::CallDropped),
        }
    }

    fn on_registered(&mut self, result: Result<(), SignalingError>) {
        match result {
            Ok(()) => {
                if !self.transition(CallState::AwaitingPeer, Some(STATUS_AWAITING_PEER)) {
                    return;
                }
                let early = match &mut self.slot {
                    Slot::Active(session) => session.early_call.take(),
                    _ => None,
                };
                if let Some(call) = early {
                    self.accept_incoming(call);
                }
            }
            Err(e) => self.fail_with_signaling(e),
        }
    }

    /// Host: Anruf annehmen und mit dem lokalen Stream antworten
    fn accept_incoming(&mut self, call: CallId) {
        let Slot::Active(session) = &mut self.slot else {
            return;
        };
        let (Some(link), Some(local)) = (session.link.clone(), session.media.local_track()) else {
            return;
        };
        let generation = session.generation;
        session.call = Some(call.clone());
        self.transition(CallState::Connecting, Some(STATUS_INCOMING));
        self.spawn_call_op(generation, async move { link.answer(&call, local).await });
    }

    /// Weist einen Anrufer beim Broker ab, ohne die Sitzung zu berühren
    fn reject_caller(link: Option<Arc<dyn SignalingLink>>, call: CallId) {
        let Some(link) = link else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = link.reject(&call).await {
                tracing::warn!("Failed to reject call {}: {}", call, e);
            }
        });
    }

    fn on_dialed(&mut self, result: Result<CallId, SignalingError>) {
        match result {
            Ok(call) => {
                if let Slot::Active(session) = &mut self.slot {
                    tracing::debug!("Dial accepted by broker (call {})", call);
                    session.call.get_or_insert(call);
                }
            }
            Err(e) => self.fail_with_signaling(e),
        }
    }

    fn on_signaling(&mut self, event: SignalingEvent) {
        let Slot::Active(session) = &mut self.slot else {
            SessionEvent::Signaling(event).discard();
            return;
        };

        let state = session.state.clone();
        match event {
            SignalingEvent::IncomingCall { call } => {
                let host = session.role == Role::Host;
                match state {
                    CallState::AwaitingPeer if host => self.accept_incoming(call),
                    // Broker kann den Anrufer vor der Bestätigung zustellen
                    CallState::Registering if host && session.early_call.is_none() => {
                        tracing::debug!("Holding call {} until registration completes", call);
                        session.early_call = Some(call);
                    }
                    _ => {
                        // nur ein Gesprächspartner pro Sitzung
                        tracing::warn!("Rejecting caller {} in state {}", call, state.name());
                        Self::reject_caller(session.link.clone(), call);
                    }
                }
            }

            SignalingEvent::Answered { call, remote } => {
                if state != CallState::Connecting || !session.owns_call(&call) {
                    tracing::debug!("Ignoring remote stream for call {}", call);
                    remote.stop();
                    return;
                }
                session.call.get_or_insert(call);
                match session.media.attach_remote(remote) {
                    Ok(()) => {
                        self.transition(CallState::Connected, Some(STATUS_CONNECTED));
                    }
                    Err(e) => self.fail(CallError::from(e)),
                }
            }

            SignalingEvent::Closed { call } => {
                if !session.owns_call(&call) {
                    tracing::debug!("Ignoring close of unrelated call {}", call);
                    return;
                }
                match state {
                    CallState::Connected => {
                        tracing::info!("Call {} ended by peer", call);
                        self.close_session(Some(STATUS_CALL_ENDED.to_string()));
                    }
                    CallState::Connecting => self.fail(CallError::CallDropped),
                    _ => {}
                }
            }

            SignalingEvent::Error(err) => self.fail_with_signaling(err),
        }
    }

    // ========================================================================
    // TRANSITIONS
    // ========================================================================

    /// Einziger Weg, den Zustand einer aktiven Sitzung zu ändern
    fn transition(&mut self, to: CallState, status: Option<&str>) -> bool {
        let Slot::Active(session) = &mut self.slot else {
            return false;
        };
        if !CallState::can_transition(&session.state, &to) {
            tracing::warn!(
                "Invalid state transition: {:?} -> {:?}",
                session.state,
                to
            );
            return false;
        }

        tracing::info!(
            "Session {}: {} -> {}",
            session.generation,
            session.state.name(),
            to.name()
        );
        session.state = to.clone();
        let update = StateUpdate {
            state: to,
            status: status.map(str::to_string),
            room_code: Some(session.room_code.clone()),
        };
        self.publish(update);
        true
    }

    fn fail_with_signaling(&mut self, err: SignalingError) {
        let connected = matches!(
            &self.slot,
            Slot::Active(session) if session.state == CallState::Connected
        );
        self.fail(CallError::from_signaling(err, connected));
    }

    /// Failed melden, vollständig freigeben, in Disconnected enden
    fn fail(&mut self, err: CallError) {
        match self.slot {
            Slot::Idle => {}
            Slot::Starting(_) => self.fail_starting(err),
            Slot::Active(_) => {
                let status = err.status_text();
                tracing::warn!("Call failed: {}", status);
                self.transition(CallState::Failed(err), Some(&status));
                self.close_session(Some(status));
            }
        }
    }

    /// Fehler bevor das Mikrofon zur Verfügung stand
    fn fail_starting(&mut self, err: CallError) {
        let status = err.status_text();
        tracing::warn!("Call setup failed: {}", status);
        self.slot = Slot::Idle;
        self.publish(StateUpdate {
            state: CallState::Failed(err),
            status: Some(status.clone()),
            room_code: None,
        });
        self.publish(StateUpdate {
            state: CallState::Disconnected,
            status: Some(status),
            room_code: None,
        });
    }

    /// Gibt die Sitzung frei und meldet Disconnected
    ///
    /// Einziger Ausgang aus einer Sitzung; danach ist der Controller wieder frei.
    fn close_session(&mut self, status: Option<String>) {
        match std::mem::replace(&mut self.slot, Slot::Idle) {
            Slot::Idle => return,
            Slot::Starting(pending) => {
                // öffentlicher Zustand war noch Disconnected
                tracing::info!("Session {} cancelled during setup", pending.generation);
                return;
            }
            Slot::Active(mut session) => {
                session.teardown();
                tracing::info!("Session {} released", session.generation);
            }
        }

        self.publish(StateUpdate {
            state: CallState::Disconnected,
            status,
            room_code: None,
        });
    }

    fn publish(&self, update: StateUpdate) {
        tracing::debug!(
            "State update: {} ({})",
            update.state.name(),
            update.status.as_deref().unwrap_or("-")
        );
        if self.updates.send(update).is_err() {
            tracing::trace!("State subscriber gone");
        }
    }

    // ========================================================================
    // TASKS
    // ========================================================================

    /// Führt eine asynchrone Operation aus und stellt das Ergebnis zu
    fn spawn_op<F>(&self, generation: u64, op: F)
    where
        F: Future<Output = SessionEvent> + Send + 'static,
    {
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let event = op.await;
            if let Err(mpsc::error::SendError(tagged)) = tx.send(Tagged { generation, event }) {
                tagged.event.discard();
            }
        });
    }

    /// Wie `spawn_op`, meldet aber nur Fehler
    fn spawn_call_op<F>(&self, generation: u64, op: F)
    where
        F: Future<Output = Result<(), SignalingError>> + Send + 'static,
    {
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            if let Err(err) = op.await {
                let _ = tx.send(Tagged {
                    generation,
                    event: SessionEvent::OperationFailed(err),
                });
            }
        });
    }

    /// Leitet Events der Broker-Verbindung an den Controller weiter
    fn spawn_pump(
        tx: mpsc::UnboundedSender<Tagged>,
        generation: u64,
        mut events: mpsc::Receiver<SignalingEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let tagged = Tagged {
                    generation,
                    event: SessionEvent::Signaling(event),
                };
                if let Err(mpsc::error::SendError(tagged)) = tx.send(tagged) {
                    tagged.event.discard();
                    break;
                }
            }
        })
    }
}
