//! Intercom - Sprachanrufe zwischen zwei Teilnehmern per Raum-Code
//!
//! Ein Host erzeugt einen sechsstelligen Raum-Code, ein Client ruft ihn an:
//! - Broker über WebSocket zum Auffinden des Gegenübers
//! - WebRTC für den Audio-Stream
//! - Ein Zustandsautomat pro Sitzung mit sauberem Abbau
//! - Sprachassistent mit Standortbezug während des Anrufs

pub mod assistant;
pub mod call_session;
pub mod config;
pub mod media;
pub mod signaling;

use assistant::{respond, AssistantReply, Location, LocationProvider};
use call_session::{CallHandle, CallSessionController, CallState, StateUpdate};
use config::IntercomConfig;
use media::{AudioConstraints, AudioDevice};
use parking_lot::Mutex;
use signaling::{Broker, BrokerConnector};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const DEFAULT_LOG_DIRECTIVES: &str = "intercom=debug,webrtc=warn";

/// Installiert den Logger (`RUST_LOG` hat Vorrang)
///
/// Mehrfache Aufrufe sind harmlos.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_DIRECTIVES));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

// ============================================================================
// APPLICATION
// ============================================================================

#[derive(Default)]
struct AssistantContext {
    /// Zählt erfolgreiche Verbindungen, verwirft verspätete Standorte
    epoch: u64,
    connected: bool,
    location: Option<Location>,
}

/// Anruf-Steuerung plus Assistent
pub struct Intercom {
    calls: CallHandle,
    context: Arc<Mutex<AssistantContext>>,
    forwarder: JoinHandle<()>,
}

impl Intercom {
    /// Startet Controller und Update-Weiterleitung
    ///
    /// Der zurückgegebene Receiver erhält jede Zustandsänderung.
    pub fn start(
        device: Arc<dyn AudioDevice>,
        broker: Arc<dyn Broker>,
        locator: Arc<dyn LocationProvider>,
        audio: AudioConstraints,
    ) -> (Self, mpsc::UnboundedReceiver<StateUpdate>) {
        let (calls, inbound) = CallSessionController::spawn(device, broker, audio);
        let (outbound, updates) = mpsc::unbounded_channel();
        let context = Arc::new(Mutex::new(AssistantContext::default()));

        let forwarder = tokio::spawn(forward_updates(
            inbound,
            outbound,
            locator,
            Arc::clone(&context),
        ));

        tracing::info!("Intercom started");
        (
            Self {
                calls,
                context,
                forwarder,
            },
            updates,
        )
    }

    /// Wie `start`, mit dem WebSocket-Broker aus der Konfiguration
    pub fn with_config(
        config: &IntercomConfig,
        device: Arc<dyn AudioDevice>,
        locator: Arc<dyn LocationProvider>,
    ) -> (Self, mpsc::UnboundedReceiver<StateUpdate>) {
        let broker = Arc::new(BrokerConnector::new(config.signaling()));
        Self::start(device, broker, locator, config.audio)
    }

    pub fn calls(&self) -> &CallHandle {
        &self.calls
    }

    /// Standort der laufenden Verbindung, falls bekannt
    pub fn location(&self) -> Option<Location> {
        self.context.lock().location
    }

    /// Fragt den Assistenten; nur während eines aktiven Anrufs
    pub fn ask(&self, text: &str) -> Option<AssistantReply> {
        let location = {
            let ctx = self.context.lock();
            if !ctx.connected {
                return None;
            }
            ctx.location
        };
        Some(respond(text, location))
    }
}

impl Drop for Intercom {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

async fn forward_updates(
    mut inbound: mpsc::UnboundedReceiver<StateUpdate>,
    outbound: mpsc::UnboundedSender<StateUpdate>,
    locator: Arc<dyn LocationProvider>,
    context: Arc<Mutex<AssistantContext>>,
) {
    while let Some(update) = inbound.recv().await {
        if update.state == CallState::Connected {
            let epoch = {
                let mut ctx = context.lock();
                ctx.epoch += 1;
                ctx.connected = true;
                ctx.epoch
            };

            let locator = Arc::clone(&locator);
            let context = Arc::clone(&context);
            tokio::spawn(async move {
                let Some(location) = locator.current_location().await else {
                    tracing::debug!("Location unavailable");
                    return;
                };
                let mut ctx = context.lock();
                if ctx.connected && ctx.epoch == epoch {
                    ctx.location = Some(location);
                }
            });
        } else {
            let mut ctx = context.lock();
            ctx.connected = false;
            ctx.location = None;
        }

        let _ = outbound.send(update);
    }
}
