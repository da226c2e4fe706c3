//! Record normalization
//!
//! One raw event record becomes an actor row, an optional place row and an
//! event row. Any failure rejects the whole record; nothing is returned for
//! a partially valid record.

use serde_json::Value;
use tracing::trace;

use geotweets_common::types::{
    ActorRow, EventRow, NormalizedRecord, PlaceRow, SchemaCapabilities,
};

use crate::error::{IngestError, IngestResult};
use crate::extract::{
    bool_field, collect_list, get_optional, i64_field, require_id, require_object,
    string_field, unwrap_legacy_integer, Object,
};
use crate::geometry::encode_geometry;

/// Entity collections attached to an event
#[derive(Debug, Default, PartialEq)]
struct Entities {
    hashtags: Option<Vec<String>>,
    urls: Option<Vec<String>>,
    media: Option<Vec<String>>,
    mentioned_actor_ids: Option<Vec<i64>>,
}

/// Normalizes raw records for one schema generation
#[derive(Debug, Clone, Copy, Default)]
pub struct Normalizer {
    capabilities: SchemaCapabilities,
}

impl Normalizer {
    pub fn new(capabilities: SchemaCapabilities) -> Self {
        Self { capabilities }
    }

    pub fn capabilities(&self) -> SchemaCapabilities {
        self.capabilities
    }

    /// Parse one input line and normalize it
    pub fn normalize_line(&self, line: &str) -> IngestResult<NormalizedRecord> {
        let value: Value = serde_json::from_str(line)?;
        self.normalize(&value)
    }

    pub fn normalize(&self, raw: &Value) -> IngestResult<NormalizedRecord> {
        let record = raw
            .as_object()
            .ok_or_else(|| IngestError::malformed("record is not a JSON object"))?;

        let actor = self.actor(require_object(record, "user")?)?;

        let place = get_optional(record, "place")
            .map(|value| {
                value
                    .as_object()
                    .ok_or_else(|| IngestError::malformed("field `place` is not an object"))
                    .and_then(|obj| self.place(obj))
            })
            .transpose()?;

        let entities = self.entities(require_object(record, "entities")?)?;
        let event = self.event(record, &actor, place.as_ref(), entities)?;

        let normalized = NormalizedRecord {
            actor,
            place,
            event,
        };

        if let Some(violation) = normalized.consistency_violation() {
            return Err(IngestError::Inconsistent(violation));
        }

        trace!(event_id = normalized.event.id, actor_id = normalized.actor.id, "Normalized record");
        Ok(normalized)
    }

    fn actor(&self, user: &Object) -> IngestResult<ActorRow> {
        Ok(ActorRow {
            id: require_id(user, "id")?,
            name: string_field(user, "name")?,
            screen_name: string_field(user, "screen_name")?,
            description: string_field(user, "description")?,
            verified: bool_field(user, "verified")?,
            geo_enabled: bool_field(user, "geo_enabled")?,
            statuses_count: i64_field(user, "statuses_count")?,
            followers_count: i64_field(user, "followers_count")?,
            friends_count: i64_field(user, "friends_count")?,
            time_zone: string_field(user, "time_zone")?,
            lang: string_field(user, "lang")?,
            location: string_field(user, "location")?,
        })
    }

    fn place(&self, place: &Object) -> IngestResult<PlaceRow> {
        let id = string_field(place, "id")?
            .ok_or_else(|| IngestError::malformed("field `place.id` is null"))?;

        let bounding_box = if self.capabilities.place_bounding_box {
            Some(encode_geometry(get_optional(place, "bounding_box"))?)
        } else {
            None
        };

        Ok(PlaceRow {
            id,
            country: string_field(place, "country")?,
            full_name: string_field(place, "full_name")?,
            place_type: string_field(place, "place_type")?,
            bounding_box,
        })
    }

    fn entities(&self, entities: &Object) -> IngestResult<Entities> {
        let text_of = |key: &'static str| {
            move |item: &Object| {
                string_field(item, key)?.ok_or_else(|| {
                    IngestError::malformed(format!("entity field `{}` is null", key))
                })
            }
        };

        let media = if self.capabilities.media {
            collect_list(entities, "media", text_of("media_url"))?
        } else {
            None
        };

        Ok(Entities {
            hashtags: collect_list(entities, "hashtags", text_of("text"))?,
            urls: collect_list(entities, "urls", text_of("expanded_url"))?,
            media,
            mentioned_actor_ids: collect_list(entities, "user_mentions", |m| {
                require_id(m, "id")
            })?,
        })
    }

    fn event(
        &self,
        record: &Object,
        actor: &ActorRow,
        place: Option<&PlaceRow>,
        entities: Entities,
    ) -> IngestResult<EventRow> {
        let quoted_event_id = if self.capabilities.quoted_event {
            unwrap_legacy_integer(get_optional(record, "quoted_status_id"))?
        } else {
            None
        };

        Ok(EventRow {
            id: require_id(record, "id")?,
            actor_id: actor.id,
            place_id: place.map(|p| p.id.clone()),
            text: string_field(record, "text")?,
            created_at: string_field(record, "created_at")?,
            hashtags: entities.hashtags,
            urls: entities.urls,
            media: entities.media,
            lang: string_field(record, "lang")?,
            mentioned_actor_ids: entities.mentioned_actor_ids,
            quoted_event_id,
            in_reply_to_event_id: unwrap_legacy_integer(get_optional(
                record,
                "in_reply_to_status_id",
            ))?,
            in_reply_to_actor_id: unwrap_legacy_integer(get_optional(
                record,
                "in_reply_to_user_id",
            ))?,
            coordinates: encode_geometry(get_optional(record, "coordinates"))?,
        })
    }
}
