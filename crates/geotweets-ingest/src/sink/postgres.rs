//! PostgreSQL/PostGIS sink
//!
//! Target relations: `users`, `places`, `tweets`. Geometry columns receive
//! hex WKB wrapped in `ST_SetSRID(..::geometry, 4326)`. Which optional
//! columns exist depends on the schema capabilities; statements are built
//! once per sink.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::time::Duration;
use tracing::{debug, info};

use geotweets_common::types::{ActorRow, EventRow, PlaceRow, SchemaCapabilities};

use super::RecordSink;
use crate::config::StoreConfig;
use crate::error::{IngestError, IngestResult};

const SAVEPOINT: &str = "SAVEPOINT record_savepoint";
const RELEASE_SAVEPOINT: &str = "RELEASE SAVEPOINT record_savepoint";
const ROLLBACK_TO_SAVEPOINT: &str = "ROLLBACK TO SAVEPOINT record_savepoint";

const INSERT_USER: &str = r#"
    INSERT INTO users
        (id, name, screen_name, description, verified, geo_enabled,
        statuses_count, followers_count, friends_count, time_zone,
        lang, location)
    VALUES
        ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
    ON CONFLICT DO NOTHING
"#;

/// SQL text for the three inserts, shaped by the schema capabilities
#[derive(Debug, Clone)]
struct Statements {
    capabilities: SchemaCapabilities,
    place: String,
    event: String,
}

impl Statements {
    fn new(capabilities: SchemaCapabilities) -> Self {
        let place = if capabilities.place_bounding_box {
            "INSERT INTO places (id, country, full_name, place_type, bounding_box) \
             VALUES ($1, $2, $3, $4, ST_SetSRID($5::geometry, 4326)) \
             ON CONFLICT DO NOTHING"
                .to_string()
        } else {
            "INSERT INTO places (id, country, full_name, place_type) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT DO NOTHING"
                .to_string()
        };

        let mut columns = vec![
            "id",
            "user_id",
            "place_id",
            "text",
            "created_at",
            "hashtags",
            "urls",
        ];
        if capabilities.media {
            columns.push("media");
        }
        columns.extend(["lang", "mentioned_user_ids"]);
        if capabilities.quoted_event {
            columns.push("quoted_status_id");
        }
        columns.extend(["in_reply_to_status_id", "in_reply_to_user_id", "coordinates"]);

        let values: Vec<String> = columns
            .iter()
            .enumerate()
            .map(|(i, column)| match *column {
                "created_at" => format!("${}::timestamptz", i + 1),
                "coordinates" => format!("ST_SetSRID(${}::geometry, 4326)", i + 1),
                _ => format!("${}", i + 1),
            })
            .collect();

        let event = format!(
            "INSERT INTO tweets ({}) VALUES ({}) ON CONFLICT DO NOTHING",
            columns.join(", "),
            values.join(", ")
        );

        Self {
            capabilities,
            place,
            event,
        }
    }
}

/// Sink over one dedicated Postgres connection
pub struct PgSink {
    pool: PgPool,
    tx: Option<Transaction<'static, Postgres>>,
    statements: Statements,
}

impl PgSink {
    /// Open a dedicated connection; failure here is fatal for the caller's shard
    pub async fn connect(store: &StoreConfig, capabilities: SchemaCapabilities) -> IngestResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(store.connect_timeout_secs))
            .connect(&store.url)
            .await
            .map_err(|e| IngestError::StoreUnavailable(format!("connect failed: {}", e)))?;

        info!(schema = ?capabilities, "Opened store connection");
        Ok(Self::from_pool(pool, capabilities))
    }

    /// Wrap an existing pool; only one connection from it is ever held
    pub fn from_pool(pool: PgPool, capabilities: SchemaCapabilities) -> Self {
        Self {
            pool,
            tx: None,
            statements: Statements::new(capabilities),
        }
    }

    async fn ensure_tx(&mut self) -> IngestResult<()> {
        if self.tx.is_none() {
            self.tx = Some(self.pool.begin().await?);
            debug!("Began transaction");
        }
        Ok(())
    }

    async fn run(&mut self, sql: &'static str) -> IngestResult<()> {
        self.ensure_tx().await?;
        if let Some(tx) = self.tx.as_mut() {
            sqlx::query(sql).execute(&mut **tx).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl RecordSink for PgSink {
    async fn begin_record(&mut self) -> IngestResult<()> {
        self.run(SAVEPOINT).await
    }

    async fn end_record(&mut self) -> IngestResult<()> {
        self.run(RELEASE_SAVEPOINT).await
    }

    async fn abort_record(&mut self) -> IngestResult<()> {
        // A failed rollback leaves the transaction unusable
        self.run(ROLLBACK_TO_SAVEPOINT)
            .await
            .map_err(|e| IngestError::StoreUnavailable(format!("rollback to savepoint: {}", e)))
    }

    async fn write_actor(&mut self, actor: &ActorRow) -> IngestResult<()> {
        self.ensure_tx().await?;
        let Some(tx) = self.tx.as_mut() else {
            return Ok(());
        };

        sqlx::query(INSERT_USER)
            .bind(actor.id)
            .bind(&actor.name)
            .bind(&actor.screen_name)
            .bind(&actor.description)
            .bind(actor.verified)
            .bind(actor.geo_enabled)
            .bind(actor.statuses_count)
            .bind(actor.followers_count)
            .bind(actor.friends_count)
            .bind(&actor.time_zone)
            .bind(&actor.lang)
            .bind(&actor.location)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn write_place(&mut self, place: &PlaceRow) -> IngestResult<()> {
        self.ensure_tx().await?;
        let Some(tx) = self.tx.as_mut() else {
            return Ok(());
        };

        let mut query = sqlx::query(&self.statements.place)
            .bind(&place.id)
            .bind(&place.country)
            .bind(&place.full_name)
            .bind(&place.place_type);
        if self.statements.capabilities.place_bounding_box {
            query = query.bind(place.bounding_box.as_ref().map(|g| g.as_str()));
        }
        query.execute(&mut **tx).await?;
        Ok(())
    }

    async fn write_event(&mut self, event: &EventRow) -> IngestResult<()> {
        self.ensure_tx().await?;
        let Some(tx) = self.tx.as_mut() else {
            return Ok(());
        };
        let capabilities = self.statements.capabilities;

        let mut query = sqlx::query(&self.statements.event)
            .bind(event.id)
            .bind(event.actor_id)
            .bind(&event.place_id)
            .bind(&event.text)
            .bind(&event.created_at)
            .bind(&event.hashtags)
            .bind(&event.urls);
        if capabilities.media {
            query = query.bind(&event.media);
        }
        query = query.bind(&event.lang).bind(&event.mentioned_actor_ids);
        if capabilities.quoted_event {
            query = query.bind(event.quoted_event_id);
        }
        query
            .bind(event.in_reply_to_event_id)
            .bind(event.in_reply_to_actor_id)
            .bind(event.coordinates.as_str())
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn commit(&mut self) -> IngestResult<()> {
        if let Some(tx) = self.tx.take() {
            tx.commit().await?;
            debug!("Committed transaction");
        }
        Ok(())
    }

    async fn close(&mut self) -> IngestResult<()> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
        }
        self.pool.close().await;
        Ok(())
    }
}
