//! In-Process Fakes für Gerät, Broker und Standort
#![allow(dead_code)]

use async_trait::async_trait;
use intercom::assistant::{Location, LocationProvider};
use intercom::call_session::{RoomCode, StateUpdate};
use intercom::media::{AudioConstraints, AudioDevice, AudioTrack, LocalAudio, MediaError, RemoteAudio, TrackKind};
use intercom::signaling::{
    Broker, BrokerConnection, CallId, SignalingError, SignalingEvent, SignalingLink,
};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};

pub const STEP_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// HELPERS
// ============================================================================

pub async fn next_update(updates: &mut mpsc::UnboundedReceiver<StateUpdate>) -> StateUpdate {
    tokio::time::timeout(STEP_TIMEOUT, updates.recv())
        .await
        .expect("state update in time")
        .expect("update channel open")
}

/// Wartet, bis die Bedingung erfüllt ist
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + STEP_TIMEOUT;
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(STEP_TIMEOUT, fut)
        .await
        .expect("operation in time")
}

/// Keine weiteren Updates nach kurzer Wartezeit
pub async fn assert_quiet(updates: &mut mpsc::UnboundedReceiver<StateUpdate>) {
    tokio::time::sleep(Duration::from_millis(50)).await;
    if let Ok(update) = updates.try_recv() {
        panic!("unexpected state update: {:?}", update);
    }
}

// ============================================================================
// AUDIO DEVICE
// ============================================================================

pub struct FakeDevice {
    deny: Option<MediaError>,
    gate: Mutex<Option<oneshot::Receiver<()>>>,
    requests: AtomicUsize,
    issued: Mutex<Vec<AudioTrack>>,
}

impl FakeDevice {
    fn with(deny: Option<MediaError>, gate: Option<oneshot::Receiver<()>>) -> Arc<Self> {
        Arc::new(Self {
            deny,
            gate: Mutex::new(gate),
            requests: AtomicUsize::new(0),
            issued: Mutex::new(Vec::new()),
        })
    }

    pub fn granting() -> Arc<Self> {
        Self::with(None, None)
    }

    pub fn denying() -> Arc<Self> {
        Self::with(Some(MediaError::PermissionDenied), None)
    }

    /// Gewährt den Zugriff erst, wenn der Sender auslöst
    pub fn gated() -> (Arc<Self>, oneshot::Sender<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::with(None, Some(rx)), tx)
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn issued(&self) -> Vec<AudioTrack> {
        self.issued.lock().clone()
    }

    pub fn all_released(&self) -> bool {
        self.issued.lock().iter().all(|t| !t.is_live())
    }
}

#[async_trait]
impl AudioDevice for FakeDevice {
    async fn request_microphone(
        &self,
        constraints: AudioConstraints,
    ) -> Result<LocalAudio, MediaError> {
        self.requests.fetch_add(1, Ordering::SeqCst);

        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        if let Some(err) = &self.deny {
            return Err(err.clone());
        }

        let track = AudioTrack::new(TrackKind::Local);
        self.issued.lock().push(track.clone());
        Ok(LocalAudio::new(track, constraints))
    }
}

// ============================================================================
// BROKER
// ============================================================================

#[derive(Debug, Clone)]
pub enum RegisterMode {
    Succeed,
    Fail(SignalingError),
    /// Antwortet erst beim Schließen der Verbindung
    Hold,
    /// Stellt den Anrufer noch vor der Bestätigung zu
    CallerFirst(&'static str),
}

pub struct FakeBroker {
    gate: Mutex<Option<oneshot::Receiver<()>>>,
    register: RegisterMode,
    dial_error: Option<SignalingError>,
    connects: AtomicUsize,
    links: Mutex<Vec<Arc<FakeLink>>>,
}

impl FakeBroker {
    fn with(register: RegisterMode, dial_error: Option<SignalingError>) -> Arc<Self> {
        Arc::new(Self {
            gate: Mutex::new(None),
            register,
            dial_error,
            connects: AtomicUsize::new(0),
            links: Mutex::new(Vec::new()),
        })
    }

    pub fn new() -> Arc<Self> {
        Self::with(RegisterMode::Succeed, None)
    }

    pub fn registering(mode: RegisterMode) -> Arc<Self> {
        Self::with(mode, None)
    }

    pub fn dial_failing(err: SignalingError) -> Arc<Self> {
        Self::with(RegisterMode::Succeed, Some(err))
    }

    /// Verbindet erst, wenn der Sender auslöst
    pub fn gated() -> (Arc<Self>, oneshot::Sender<()>) {
        let (tx, rx) = oneshot::channel();
        let broker = Self::new();
        *broker.gate.lock() = Some(rx);
        (broker, tx)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn last_link(&self) -> Option<Arc<FakeLink>> {
        self.links.lock().last().cloned()
    }

    pub async fn wait_for_link(&self) -> Arc<FakeLink> {
        eventually("broker connection", || self.last_link().is_some()).await;
        self.last_link().expect("link present")
    }
}

#[async_trait]
impl Broker for FakeBroker {
    async fn connect(&self) -> Result<BrokerConnection, SignalingError> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }

        let (tx, rx) = mpsc::channel(16);
        let link = Arc::new(FakeLink {
            events: tx,
            register: self.register.clone(),
            dial_error: self.dial_error.clone(),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
            dialed: Mutex::new(None),
            answered: Mutex::new(Vec::new()),
            rejected: Mutex::new(Vec::new()),
            remotes: Mutex::new(Vec::new()),
        });
        self.links.lock().push(Arc::clone(&link));

        Ok(BrokerConnection { link, events: rx })
    }
}

// ============================================================================
// LINK
// ============================================================================

pub struct FakeLink {
    events: mpsc::Sender<SignalingEvent>,
    register: RegisterMode,
    dial_error: Option<SignalingError>,
    closed: AtomicBool,
    close_notify: Notify,
    dialed: Mutex<Option<CallId>>,
    answered: Mutex<Vec<CallId>>,
    rejected: Mutex<Vec<CallId>>,
    remotes: Mutex<Vec<AudioTrack>>,
}

impl FakeLink {
    pub async fn emit(&self, event: SignalingEvent) {
        let _ = self.events.send(event).await;
    }

    /// Broker meldet einen Anrufer (Host-Seite)
    pub async fn incoming_call(&self, id: &str) -> CallId {
        let call = CallId::from(id);
        self.emit(SignalingEvent::IncomingCall { call: call.clone() })
            .await;
        call
    }

    /// Gegenseite nimmt den Anruf an (Client-Seite)
    pub async fn remote_answers(&self) -> AudioTrack {
        eventually("dial", || self.dialed().is_some()).await;
        let call = self.dialed().expect("dialed call");
        self.deliver_remote(call).await
    }

    async fn deliver_remote(&self, call: CallId) -> AudioTrack {
        let track = AudioTrack::new(TrackKind::Remote);
        self.remotes.lock().push(track.clone());
        self.emit(SignalingEvent::Answered {
            call,
            remote: RemoteAudio::new(track.clone()),
        })
        .await;
        track
    }

    pub fn dialed(&self) -> Option<CallId> {
        self.dialed.lock().clone()
    }

    pub fn answered(&self) -> Vec<CallId> {
        self.answered.lock().clone()
    }

    pub fn rejected(&self) -> Vec<CallId> {
        self.rejected.lock().clone()
    }

    pub fn remotes(&self) -> Vec<AudioTrack> {
        self.remotes.lock().clone()
    }
}

#[async_trait]
impl SignalingLink for FakeLink {
    async fn register(&self, _code: &RoomCode) -> Result<(), SignalingError> {
        match &self.register {
            RegisterMode::Succeed => Ok(()),
            RegisterMode::Fail(err) => Err(err.clone()),
            RegisterMode::CallerFirst(id) => {
                self.incoming_call(id).await;
                Ok(())
            }
            RegisterMode::Hold => loop {
                let notified = self.close_notify.notified();
                if self.is_closed() {
                    return Err(SignalingError::ConnectionLost);
                }
                notified.await;
            },
        }
    }

    async fn dial(&self, _code: &RoomCode, _local: AudioTrack) -> Result<CallId, SignalingError> {
        if let Some(err) = &self.dial_error {
            return Err(err.clone());
        }
        let call = CallId::new();
        *self.dialed.lock() = Some(call.clone());
        Ok(call)
    }

    async fn answer(&self, call: &CallId, _local: AudioTrack) -> Result<(), SignalingError> {
        self.answered.lock().push(call.clone());
        self.deliver_remote(call.clone()).await;
        Ok(())
    }

    async fn reject(&self, call: &CallId) -> Result<(), SignalingError> {
        self.rejected.lock().push(call.clone());
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.close_notify.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

// ============================================================================
// LOCATION
// ============================================================================

pub struct FixedLocation(pub Option<Location>);

#[async_trait]
impl LocationProvider for FixedLocation {
    async fn current_location(&self) -> Option<Location> {
        self.0
    }
}
