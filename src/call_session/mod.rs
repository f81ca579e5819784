//! Call Session Module - Lebenszyklus eines Zweier-Anrufs
//!
//! Dieses Modul verwaltet:
//! - Raum-Codes (Erzeugung und Prüfung)
//! - Den Zustandsautomaten einer Sitzung
//! - Die Zuordnung von Geräte- und Broker-Fehlern zu Benutzer-Status
//!

mod controller;
mod error;
mod room_code;
mod state;

pub use controller::{CallHandle, CallSessionController};
pub use error::CallError;
pub use room_code::{RoomCode, ROOM_CODE_LEN};
pub use state::{CallState, Role, SessionSnapshot, StateUpdate};
