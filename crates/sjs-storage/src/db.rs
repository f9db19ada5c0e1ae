//! SQLite persistence for listings and cross-run static values.

use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use futures::stream::{BoxStream, StreamExt};
use serde_json::Value as JsonValue;
use sjs_core::{
    ConditionalTokens, DateRange, FeedListing, Listing, TrackedFields, FEED_ETAG_KEY,
    FEED_MODIFIED_KEY,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::types::Json;
use tracing::debug;

macro_rules! listing_select {
    ($tail:literal) => {
        concat!(
            "SELECT id, external_id, link, title, description, publication_date, first_seen, \
             last_seen, is_enriched, enrichment_data, document, created_at, updated_at \
             FROM listings",
            $tail
        )
    };
}

#[derive(Debug, sqlx::FromRow)]
struct ListingRow {
    id: i64,
    external_id: String,
    link: String,
    title: String,
    description: String,
    publication_date: NaiveDate,
    first_seen: NaiveDate,
    last_seen: NaiveDate,
    is_enriched: bool,
    enrichment_data: Option<Json<JsonValue>>,
    document: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
}

impl From<ListingRow> for Listing {
    fn from(row: ListingRow) -> Self {
        Listing {
            id: row.id,
            external_id: row.external_id,
            link: row.link,
            title: row.title,
            description: row.description,
            publication_date: row.publication_date,
            first_seen: row.first_seen,
            last_seen: row.last_seen,
            is_enriched: row.is_enriched,
            enrichment_data: row.enrichment_data.map(|json| json.0),
            document: row.document,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Clone)]
pub enum InsertOutcome {
    Inserted(Listing),
    /// A row with the same external id or link already exists.
    Duplicate,
}

#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Connect to a SQLite URL, creating the file if needed. In-memory URLs get a
    /// single long-lived connection so every query sees the same database.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("parsing database url {database_url}"))?
            .create_if_missing(true);

        let pool_options = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(4)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .with_context(|| format!("connecting to {database_url}"))?;
        Ok(Self { pool })
    }

    /// Fresh migrated in-memory database.
    pub async fn connect_in_memory() -> Result<Self> {
        let db = Self::connect("sqlite::memory:").await?;
        db.migrate().await?;
        Ok(db)
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("running database migrations")
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn find_by_external_id(&self, external_id: &str) -> Result<Option<Listing>> {
        let row = sqlx::query_as::<_, ListingRow>(listing_select!(" WHERE external_id = ?1"))
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("loading listing {external_id}"))?;
        Ok(row.map(Listing::from))
    }

    /// Insert a newly seen feed entry. Unique violations come back as `Duplicate`.
    pub async fn insert_listing(
        &self,
        entry: &FeedListing,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<InsertOutcome> {
        let result = sqlx::query_as::<_, ListingRow>(
            r#"
            INSERT INTO listings
                (external_id, link, title, description, publication_date, first_seen, last_seen,
                 is_enriched, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, 0, ?7)
            RETURNING id, external_id, link, title, description, publication_date, first_seen,
                      last_seen, is_enriched, enrichment_data, document, created_at, updated_at
            "#,
        )
        .bind(&entry.external_id)
        .bind(&entry.link)
        .bind(&entry.title)
        .bind(&entry.description)
        .bind(entry.publication_date)
        .bind(today)
        .bind(now)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => Ok(InsertOutcome::Inserted(row.into())),
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
                debug!(external_id = %entry.external_id, "insert hit unique constraint");
                Ok(InsertOutcome::Duplicate)
            }
            Err(err) => {
                Err(err).with_context(|| format!("inserting listing {}", entry.external_id))
            }
        }
    }

    /// Persist every mutable column of an existing listing.
    pub async fn save_listing(&self, listing: &Listing) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE listings
            SET link = ?1,
                title = ?2,
                description = ?3,
                publication_date = ?4,
                last_seen = ?5,
                is_enriched = ?6,
                enrichment_data = ?7,
                document = ?8,
                updated_at = ?9
            WHERE id = ?10
            "#,
        )
        .bind(&listing.link)
        .bind(&listing.title)
        .bind(&listing.description)
        .bind(listing.publication_date)
        .bind(listing.last_seen)
        .bind(listing.is_enriched)
        .bind(listing.enrichment_data.clone().map(Json))
        .bind(&listing.document)
        .bind(listing.updated_at)
        .bind(listing.id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("saving listing {}", listing.external_id))?;
        Ok(())
    }

    /// Save a listing mutated since `before` was taken. Unchanged listings are not
    /// written; changed ones get `updated_at` per `Listing::stamp_if_modified`.
    pub async fn save_tracked(
        &self,
        listing: &mut Listing,
        before: &TrackedFields,
        now: DateTime<Utc>,
        threshold: Duration,
    ) -> Result<bool> {
        if listing.tracked_fields() == *before {
            return Ok(false);
        }
        listing.stamp_if_modified(before, now, threshold);
        self.save_listing(listing).await?;
        Ok(true)
    }

    /// Unenriched listings, most recently seen first.
    pub async fn unenriched_listings(&self, limit: usize) -> Result<Vec<Listing>> {
        let rows = sqlx::query_as::<_, ListingRow>(listing_select!(
            " WHERE is_enriched = 0 ORDER BY last_seen DESC, id DESC LIMIT ?1"
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .context("loading unenriched listings")?;
        Ok(rows.into_iter().map(Listing::from).collect())
    }

    /// Stream listings, optionally restricted to a `last_seen` range, in id order.
    pub fn stream_listings(&self, range: Option<DateRange>) -> BoxStream<'_, Result<Listing>> {
        let rows = match range {
            None => sqlx::query_as::<_, ListingRow>(listing_select!(" ORDER BY id"))
                .fetch(&self.pool),
            Some(DateRange { start, end: None }) => {
                sqlx::query_as::<_, ListingRow>(listing_select!(
                    " WHERE last_seen >= ?1 ORDER BY id"
                ))
                .bind(start)
                .fetch(&self.pool)
            }
            Some(DateRange {
                start,
                end: Some(end),
            }) => sqlx::query_as::<_, ListingRow>(listing_select!(
                " WHERE last_seen >= ?1 AND last_seen < ?2 ORDER BY id"
            ))
            .bind(start)
            .bind(end)
            .fetch(&self.pool),
        };
        rows.map(|row| row.map(Listing::from).context("reading listing row"))
            .boxed()
    }

    pub async fn count_listings(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM listings")
            .fetch_one(&self.pool)
            .await
            .context("counting listings")
    }

    pub async fn count_unenriched(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM listings WHERE is_enriched = 0")
            .fetch_one(&self.pool)
            .await
            .context("counting unenriched listings")
    }

    pub async fn static_value(&self, key: &str) -> Result<Option<String>> {
        sqlx::query_scalar("SELECT value FROM static_values WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("reading static value {key}"))
    }

    pub async fn set_static_value(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO static_values (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .with_context(|| format!("writing static value {key}"))?;
        Ok(())
    }

    pub async fn conditional_tokens(&self) -> Result<ConditionalTokens> {
        let non_empty = |v: Option<String>| v.filter(|s| !s.is_empty());
        Ok(ConditionalTokens {
            etag: non_empty(self.static_value(FEED_ETAG_KEY).await?),
            modified: non_empty(self.static_value(FEED_MODIFIED_KEY).await?),
        })
    }

    /// Remember whichever tokens the latest fetch returned.
    pub async fn store_conditional_tokens(&self, tokens: &ConditionalTokens) -> Result<()> {
        if let Some(etag) = &tokens.etag {
            self.set_static_value(FEED_ETAG_KEY, etag).await?;
        }
        if let Some(modified) = &tokens.modified {
            self.set_static_value(FEED_MODIFIED_KEY, modified).await?;
        }
        Ok(())
    }
}
