//! Shared fixtures for geotweets-ingest integration tests

#![allow(dead_code)]

use serde_json::{json, Value};
use std::path::{Path, PathBuf};

/// Install a test-friendly subscriber once per binary
pub fn init_test_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,geotweets_ingest=debug,sqlx=warn,testcontainers=info")
        }))
        .with_test_writer()
        .try_init();
}

pub fn user(id: i64) -> Value {
    json!({
        "id": id,
        "name": format!("user {}", id),
        "screen_name": format!("user_{}", id),
        "description": null,
        "verified": false,
        "geo_enabled": true,
        "statuses_count": 42,
        "followers_count": 7,
        "friends_count": 3,
        "time_zone": null,
        "lang": "en",
        "location": "Somerville, MA"
    })
}

pub fn place(id: &str) -> Value {
    json!({
        "id": id,
        "country": "United States",
        "full_name": "Cambridge, MA",
        "place_type": "city",
        "bounding_box": {
            "type": "Polygon",
            "coordinates": [[[-71.16, 42.35], [-71.06, 42.35], [-71.06, 42.40], [-71.16, 42.40]]]
        }
    })
}

/// A valid event posted by `user_id`, without a place
pub fn tweet(id: i64, user_id: i64) -> Value {
    json!({
        "id": {"$numberLong": id.to_string()},
        "user": user(user_id),
        "place": null,
        "entities": {
            "hashtags": [{"text": "rust"}],
            "user_mentions": [{"id": 99}]
        },
        "text": format!("tweet {}", id),
        "created_at": "Wed Aug 27 13:08:45 +0000 2008",
        "lang": "en",
        "in_reply_to_status_id": null,
        "coordinates": {"type": "Point", "coordinates": [-71.1, 42.37]}
    })
}

pub fn tweet_at(id: i64, user_id: i64, place_id: &str) -> Value {
    let mut value = tweet(id, user_id);
    value["place"] = place(place_id);
    value
}

/// Same record with `coordinates: null`
pub fn tweet_without_coordinates(id: i64, user_id: i64) -> Value {
    let mut value = tweet(id, user_id);
    value["coordinates"] = Value::Null;
    value
}

pub fn write_lines(dir: &Path, name: &str, lines: &[String]) -> PathBuf {
    let path = dir.join(name);
    let mut body = lines.join("\n");
    body.push('\n');
    std::fs::write(&path, body).expect("write input file");
    path
}

pub fn read_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .expect("read file")
        .lines()
        .map(str::to_string)
        .collect()
}
