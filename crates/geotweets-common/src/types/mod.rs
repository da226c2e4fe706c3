//! Normalized row types and the producer schema descriptor

use serde::{Deserialize, Serialize};

/// Hex-encoded well-known-binary geometry
///
/// Carries no reference system; the store tags it with SRID 4326 on write.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncodedGeometry(String);

impl EncodedGeometry {
    pub fn new(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl std::fmt::Display for EncodedGeometry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Originating account of an event (maps to the `users` table)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorRow {
    pub id: i64,
    pub name: Option<String>,
    pub screen_name: Option<String>,
    pub description: Option<String>,
    pub verified: Option<bool>,
    pub geo_enabled: Option<bool>,
    pub statuses_count: Option<i64>,
    pub followers_count: Option<i64>,
    pub friends_count: Option<i64>,
    pub time_zone: Option<String>,
    pub lang: Option<String>,
    pub location: Option<String>,
}

/// Place context of an event (maps to the `places` table)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceRow {
    pub id: String,
    pub country: Option<String>,
    pub full_name: Option<String>,
    pub place_type: Option<String>,
    /// Only populated when the schema carries place geometry
    pub bounding_box: Option<EncodedGeometry>,
}

/// The event itself (maps to the `tweets` table)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRow {
    pub id: i64,
    pub actor_id: i64,
    pub place_id: Option<String>,
    pub text: Option<String>,
    /// Left as text; the store parses it into a timestamp
    pub created_at: Option<String>,
    pub hashtags: Option<Vec<String>>,
    pub urls: Option<Vec<String>>,
    pub media: Option<Vec<String>>,
    pub lang: Option<String>,
    pub mentioned_actor_ids: Option<Vec<i64>>,
    pub quoted_event_id: Option<i64>,
    pub in_reply_to_event_id: Option<i64>,
    pub in_reply_to_actor_id: Option<i64>,
    pub coordinates: EncodedGeometry,
}

/// The three rows derived from one raw record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub actor: ActorRow,
    pub place: Option<PlaceRow>,
    pub event: EventRow,
}

impl NormalizedRecord {
    /// Describe the first cross-row reference that does not line up, if any
    pub fn consistency_violation(&self) -> Option<String> {
        if self.event.actor_id != self.actor.id {
            return Some(format!(
                "event {} references actor {} but record carries actor {}",
                self.event.id, self.event.actor_id, self.actor.id
            ));
        }

        match (&self.event.place_id, &self.place) {
            (None, None) => None,
            (Some(place_id), Some(place)) if *place_id == place.id => None,
            (Some(place_id), Some(place)) => Some(format!(
                "event {} references place {} but record carries place {}",
                self.event.id, place_id, place.id
            )),
            (Some(place_id), None) => Some(format!(
                "event {} references place {} but record carries no place",
                self.event.id, place_id
            )),
            (None, Some(place)) => Some(format!(
                "record carries place {} but event {} has no place reference",
                place.id, self.event.id
            )),
        }
    }
}

/// Producer schema generations seen in the input corpus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SchemaVersion {
    /// First importer: no place geometry, no media, no quoted ids
    Legacy,
    /// Every optional column present
    #[default]
    Current,
}

impl std::str::FromStr for SchemaVersion {
    type Err = crate::CommonError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "legacy" | "v1" => Ok(SchemaVersion::Legacy),
            "current" | "v2" => Ok(SchemaVersion::Current),
            _ => Err(crate::CommonError::UnknownSchema(s.to_string())),
        }
    }
}

impl std::fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchemaVersion::Legacy => write!(f, "legacy"),
            SchemaVersion::Current => write!(f, "current"),
        }
    }
}

/// Which optional columns the target tables carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaCapabilities {
    /// `places.bounding_box`
    pub place_bounding_box: bool,
    /// `tweets.media`
    pub media: bool,
    /// `tweets.quoted_status_id`
    pub quoted_event: bool,
}

impl SchemaCapabilities {
    pub fn for_version(version: SchemaVersion) -> Self {
        match version {
            SchemaVersion::Legacy => Self {
                place_bounding_box: false,
                media: false,
                quoted_event: false,
            },
            SchemaVersion::Current => Self {
                place_bounding_box: true,
                media: true,
                quoted_event: true,
            },
        }
    }
}

impl Default for SchemaCapabilities {
    fn default() -> Self {
        Self::for_version(SchemaVersion::default())
    }
}

impl From<SchemaVersion> for SchemaCapabilities {
    fn from(version: SchemaVersion) -> Self {
        Self::for_version(version)
    }
}
