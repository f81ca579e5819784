//! Signaling Module - Verbindung zum Broker
//!
//! Dieses Modul verwaltet die Kommunikation mit dem Broker:
//! - Raum-Code registrieren (Host) oder anrufen (Client)
//! - Offer/Answer und ICE Candidates weiterleiten
//! - Eingehende Nachrichten parsen und als Events weitergeben
//!

mod client;
mod link;
mod messages;

pub use client::{BrokerConnector, SignalingClient, SignalingConfig};
pub use link::{Broker, BrokerConnection, SignalingError, SignalingEvent, SignalingLink};
pub use messages::*;
