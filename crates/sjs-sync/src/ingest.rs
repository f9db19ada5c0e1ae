//! Feed ingestion: conditional fetch, entry validation, upsert by external id.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sjs_sources::{feed_listing, FeedFetch, FeedSource};
use sjs_storage::{Database, InsertOutcome};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::report::{ErrorReporter, Incident};

#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// Entries examined (valid or not) before stopping.
    pub max_count: Option<usize>,
    /// Only insert new listings; never touch existing rows.
    pub skip_update: bool,
    pub modified_threshold: Duration,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            max_count: None,
            skip_update: false,
            modified_threshold: Duration::seconds(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    NotModified,
    Completed,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
    pub run_id: Uuid,
    pub status: IngestStatus,
    pub entries_seen: usize,
    pub created: usize,
    pub updated: usize,
    /// Existing rows left as they were: skip-update mode, lost insert races, or no change.
    pub skipped_existing: usize,
    pub invalid_entries: usize,
}

impl IngestSummary {
    fn new(run_id: Uuid, status: IngestStatus) -> Self {
        Self {
            run_id,
            status,
            entries_seen: 0,
            created: 0,
            updated: 0,
            skipped_existing: 0,
            invalid_entries: 0,
        }
    }
}

pub async fn run_ingest(
    db: &Database,
    source: &dyn FeedSource,
    reporter: &dyn ErrorReporter,
    options: &IngestOptions,
    now: DateTime<Utc>,
) -> Result<IngestSummary> {
    let run_id = Uuid::new_v4();
    let span = info_span!("ingest_feed", %run_id);
    ingest(db, source, reporter, options, now, run_id)
        .instrument(span)
        .await
}

async fn ingest(
    db: &Database,
    source: &dyn FeedSource,
    reporter: &dyn ErrorReporter,
    options: &IngestOptions,
    now: DateTime<Utc>,
    run_id: Uuid,
) -> Result<IngestSummary> {
    let today = now.date_naive();
    let tokens = db.conditional_tokens().await?;

    let document = match source.fetch_feed(run_id, &tokens).await {
        Ok(FeedFetch::NotModified) => {
            info!("no new entries");
            return Ok(IngestSummary::new(run_id, IngestStatus::NotModified));
        }
        Ok(FeedFetch::Fetched(document)) => document,
        Err(err) => {
            reporter.report(Incident::error(None, format!("feed fetch failed: {err}")));
            return Err(err).context("fetching job feed");
        }
    };

    let mut summary = IngestSummary::new(run_id, IngestStatus::Completed);
    let limit = options.max_count.unwrap_or(usize::MAX);

    for entry in document.entries.iter().take(limit) {
        summary.entries_seen += 1;

        let feed = match feed_listing(entry) {
            Ok(feed) => feed,
            Err(err) => {
                warn!(error = %err, link = ?entry.link, "skipping feed entry");
                reporter.report(Incident::warning(None, err.to_string()));
                summary.invalid_entries += 1;
                continue;
            }
        };

        let existing = if options.skip_update {
            None
        } else {
            db.find_by_external_id(&feed.external_id).await?
        };

        match existing {
            Some(mut listing) => {
                let before = listing.tracked_fields();
                listing.apply_feed(&feed, today);
                if db
                    .save_tracked(&mut listing, &before, now, options.modified_threshold)
                    .await?
                {
                    summary.updated += 1;
                } else {
                    summary.skipped_existing += 1;
                }
            }
            None => match db.insert_listing(&feed, today, now).await? {
                InsertOutcome::Inserted(listing) => {
                    info!(external_id = %listing.external_id, "new listing");
                    summary.created += 1;
                }
                InsertOutcome::Duplicate => summary.skipped_existing += 1,
            },
        }
    }

    db.store_conditional_tokens(&document.tokens).await?;
    info!(
        entries = summary.entries_seen,
        created = summary.created,
        updated = summary.updated,
        invalid = summary.invalid_entries,
        "feed ingested"
    );
    Ok(summary)
}
