//! Sprachassistent während eines Anrufs
//!
//! Erkennt einfache Anfragen (Restaurants, Tankstellen, Wetter, ...) per
//! Schlüsselwort und liefert eine gesprochene Antwort plus optional eine
//! externe Aktion (Kartensuche bzw. Websuche).

use async_trait::async_trait;
use serde::Serialize;
use url::Url;

const MAPS_SEARCH_URL: &str = "https://www.google.com/maps/search/";
const WEB_SEARCH_URL: &str = "https://www.google.com/search";
const MAP_ZOOM: u8 = 15;

// ============================================================================
// LOCATION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Location {
    pub lat: f64,
    pub lng: f64,
}

/// Liefert den ungefähren Standort, `None` wenn nicht verfügbar
#[async_trait]
pub trait LocationProvider: Send + Sync {
    async fn current_location(&self) -> Option<Location>;
}

// ============================================================================
// INTENTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Restaurant,
    Fuel,
    Hotel,
    Cafe,
    Pharmacy,
    Hospital,
    LocationQuery,
    Weather,
    Fallback,
}

/// Reihenfolge ist relevant: der erste Treffer gewinnt
const KEYWORDS: &[(Intent, &[&str])] = &[
    (Intent::Restaurant, &["restaurante", "comer", "restaurant", "food"]),
    (Intent::Fuel, &["gasolinera", "gasolina", "gas station", "petrol", "fuel"]),
    (Intent::Hotel, &["hotel", "dormir", "sleep"]),
    (Intent::Cafe, &["café", "cafetería", "cafe", "coffee"]),
    (Intent::Pharmacy, &["farmacia", "pharmacy"]),
    (Intent::Hospital, &["hospital", "médico", "doctor"]),
    (Intent::LocationQuery, &["dónde estoy", "ubicación", "where am i", "my location"]),
    (Intent::Weather, &["tiempo", "clima", "weather"]),
];

/// Ordnet eine Anfrage einer Kategorie zu (Groß-/Kleinschreibung egal)
pub fn classify(text: &str) -> Intent {
    let text = text.to_lowercase();
    KEYWORDS
        .iter()
        .find(|(_, words)| words.iter().any(|w| text.contains(w)))
        .map(|(intent, _)| *intent)
        .unwrap_or(Intent::Fallback)
}

// ============================================================================
// REPLIES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExternalAction {
    MapSearch {
        query: String,
        near: Option<Location>,
    },
    WebSearch {
        query: String,
    },
}

impl ExternalAction {
    /// Ziel-URL der Aktion
    pub fn url(&self) -> Result<Url, url::ParseError> {
        match self {
            ExternalAction::MapSearch { query, near } => {
                let mut url = Url::parse(MAPS_SEARCH_URL)?;
                if let Ok(mut segments) = url.path_segments_mut() {
                    segments.pop_if_empty().push(query);
                    if let Some(loc) = near {
                        segments.push(&format!("@{},{},{}z", loc.lat, loc.lng, MAP_ZOOM));
                    }
                }
                Ok(url)
            }
            ExternalAction::WebSearch { query } => {
                Url::parse_with_params(WEB_SEARCH_URL, &[("q", query.as_str())])
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssistantReply {
    pub intent: Intent,
    /// Text für die Sprachausgabe
    pub speech: String,
    pub action: Option<ExternalAction>,
}

/// Beantwortet eine Anfrage
pub fn respond(text: &str, location: Option<Location>) -> AssistantReply {
    let intent = classify(text);
    let map = |query: &str| {
        Some(ExternalAction::MapSearch {
            query: query.to_string(),
            near: location,
        })
    };

    let (speech, action) = match intent {
        Intent::Restaurant => ("Searching for nearby restaurants…".to_string(), map("restaurants")),
        Intent::Fuel => ("Searching for nearby gas stations…".to_string(), map("gas stations")),
        Intent::Hotel => ("Searching for nearby hotels…".to_string(), map("hotels")),
        Intent::Cafe => ("Searching for nearby cafés…".to_string(), map("cafés")),
        Intent::Pharmacy => ("Searching for nearby pharmacies…".to_string(), map("pharmacies")),
        Intent::Hospital => ("Searching for medical services…".to_string(), map("hospitals")),
        Intent::LocationQuery => {
            let speech = match location {
                Some(loc) => format!(
                    "Your approximate location is lat {:.4}, lon {:.4}.",
                    loc.lat, loc.lng
                ),
                None => "Getting your location…".to_string(),
            };
            (speech, None)
        }
        Intent::Weather => (
            "Opening the weather…".to_string(),
            Some(ExternalAction::WebSearch {
                query: "weather".to_string(),
            }),
        ),
        Intent::Fallback => (
            format!(
                "You said: \"{}\". I can look for restaurants, gas stations, hotels, pharmacies or the weather.",
                text.trim()
            ),
            None,
        ),
    };

    tracing::debug!("Assistant: {:?} -> {}", intent, speech);
    AssistantReply {
        intent,
        speech,
        action,
    }
}
