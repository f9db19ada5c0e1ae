//! Listing enrichment: case search lookup, payload validation, job order PDF download.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use sjs_core::CASE_NUMBER_FIELD;
use sjs_sources::{CaseSearch, DocumentSource, SourceError};
use sjs_storage::{Database, DocumentStore};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::report::{ErrorReporter, Incident, SampledReporter};

#[derive(Debug, Clone)]
pub struct EnrichOptions {
    pub max_count: usize,
    pub modified_threshold: Duration,
    /// Document failures forwarded to telemetry: the first, then one in this many.
    pub telemetry_sample_every: u64,
}

impl Default for EnrichOptions {
    fn default() -> Self {
        Self {
            max_count: 1,
            modified_threshold: Duration::seconds(10),
            telemetry_sample_every: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EnrichSummary {
    pub run_id: Uuid,
    pub requested: usize,
    pub enriched: usize,
    pub api_failures: usize,
    pub invalid_payloads: usize,
    pub mismatches: usize,
    pub documents_saved: usize,
    pub document_failures: usize,
}

/// Upstream endpoints used by one enrichment run.
pub struct EnrichSources<'a> {
    pub search: &'a dyn CaseSearch,
    pub documents: &'a dyn DocumentSource,
}

pub async fn run_enrich(
    db: &Database,
    sources: EnrichSources<'_>,
    store: &DocumentStore,
    reporter: &dyn ErrorReporter,
    options: &EnrichOptions,
    now: DateTime<Utc>,
) -> Result<EnrichSummary> {
    let run_id = Uuid::new_v4();
    let span = info_span!("enrich_listings", %run_id);
    enrich(db, sources, store, reporter, options, now, run_id)
        .instrument(span)
        .await
}

async fn enrich(
    db: &Database,
    sources: EnrichSources<'_>,
    store: &DocumentStore,
    reporter: &dyn ErrorReporter,
    options: &EnrichOptions,
    now: DateTime<Utc>,
    run_id: Uuid,
) -> Result<EnrichSummary> {
    let mut summary = EnrichSummary {
        run_id,
        ..Default::default()
    };

    let listings = db.unenriched_listings(options.max_count).await?;
    summary.requested = listings.len();
    if listings.is_empty() {
        info!("No listings left to enrich!");
        return Ok(summary);
    }

    let document_reporter = SampledReporter::new(reporter, options.telemetry_sample_every);

    for mut listing in listings {
        let external_id = listing.external_id.clone();

        let payload = match sources.search.search_case(&external_id).await {
            Ok(payload) => payload,
            Err(SourceError::InvalidPayload(detail)) => {
                let msg = format!("Invalid JSON for {external_id}");
                error!(%external_id, %detail, "{msg}");
                reporter.report(Incident::error(Some(&external_id), msg));
                summary.invalid_payloads += 1;
                continue;
            }
            Err(err) => {
                let msg = format!("API call failed for listing {external_id}: {err}");
                error!(%external_id, "{msg}");
                reporter.report(Incident::error(Some(&external_id), msg));
                summary.api_failures += 1;
                continue;
            }
        };

        let case_number = payload.get(CASE_NUMBER_FIELD).and_then(JsonValue::as_str);
        if case_number == Some(external_id.as_str()) {
            let before = listing.tracked_fields();
            listing.mark_enriched(payload);
            db.save_tracked(&mut listing, &before, now, options.modified_threshold)
                .await?;
            summary.enriched += 1;
            info!(%external_id, "saved enrichment data");
        } else {
            let msg = format!(
                "case number mismatch for {external_id}: search returned {}",
                case_number.unwrap_or("nothing")
            );
            error!(%external_id, "{msg}");
            reporter.report(Incident::error(Some(&external_id), msg));
            summary.mismatches += 1;
        }

        if listing.document.is_some() {
            continue;
        }

        match sources.documents.fetch_document(&external_id).await {
            Ok(bytes) => {
                let stored = store
                    .store_document(&listing.document_file_name(), &bytes)
                    .await?;
                let before = listing.tracked_fields();
                listing.document = Some(stored.relative_path.to_string_lossy().into_owned());
                db.save_tracked(&mut listing, &before, now, options.modified_threshold)
                    .await?;
                summary.documents_saved += 1;
                info!(%external_id, bytes = stored.byte_size, "saved job order document");
            }
            Err(err) => {
                let msg = format!("failed job order document request for {external_id}: {err}");
                warn!(%external_id, "{msg}");
                document_reporter.report(Incident::warning(Some(&external_id), msg));
                summary.document_failures += 1;
            }
        }
    }

    info!(
        requested = summary.requested,
        enriched = summary.enriched,
        documents = summary.documents_saved,
        "enrichment run finished"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{RecordingReporter, Severity};
    use crate::testing::{FakeDocuments, FakeSearch, SearchReply};
    use chrono::{NaiveDate, TimeZone};
    use serde_json::json;
    use sjs_core::FeedListing;
    use tempfile::tempdir;

    const IDS: [&str; 5] = [
        "H-300-24001-000001",
        "H-300-24001-000002",
        "H-300-24001-000003",
        "H-300-24001-000004",
        "H-300-24001-000005",
    ];

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 20, 8, 0, 0).unwrap()
    }

    async fn seed(db: &Database, external_id: &str, last_seen_day: u32) {
        let day = NaiveDate::from_ymd_opt(2024, 3, last_seen_day).unwrap();
        let entry = FeedListing {
            external_id: external_id.to_string(),
            link: format!("https://seasonaljobs.dol.gov/jobs/{external_id}"),
            title: "Farmworker".to_string(),
            description: "Harvest".to_string(),
            publication_date: day,
        };
        db.insert_listing(&entry, day, now() - Duration::days(1)).await.unwrap();
    }

    fn hit(external_id: &str) -> SearchReply {
        SearchReply::Hit(json!({
            "case_number": external_id,
            "job_title": "Farmworker",
            "apply_url": "https://http:apply.example/job",
        }))
    }

    fn options(max_count: usize) -> EnrichOptions {
        EnrichOptions {
            max_count,
            modified_threshold: Duration::zero(),
            telemetry_sample_every: 10,
        }
    }

    #[tokio::test]
    async fn empty_backlog_is_a_quiet_success() {
        let db = Database::connect_in_memory().await.unwrap();
        let dir = tempdir().unwrap();
        let search = FakeSearch::default();
        let documents = FakeDocuments::default();
        let reporter = RecordingReporter::default();

        let summary = run_enrich(
            &db,
            EnrichSources { search: &search, documents: &documents },
            &DocumentStore::new(dir.path()),
            &reporter,
            &options(5),
            now(),
        )
        .await
        .unwrap();
        assert_eq!(summary.requested, 0);
        assert!(search.calls().is_empty());
        assert!(reporter.incidents().is_empty());
    }

    #[tokio::test]
    async fn one_api_failure_among_five_does_not_stop_the_rest() {
        let db = Database::connect_in_memory().await.unwrap();
        let dir = tempdir().unwrap();
        let mut search = FakeSearch::default();
        let mut documents = FakeDocuments::default();
        for (i, id) in IDS.iter().enumerate() {
            seed(&db, id, 10 + i as u32).await;
            search = search.reply(id, if i == 2 { SearchReply::Status(500) } else { hit(id) });
            documents = documents.body(id, b"%PDF-1.4");
        }
        let reporter = RecordingReporter::default();

        let summary = run_enrich(
            &db,
            EnrichSources { search: &search, documents: &documents },
            &DocumentStore::new(dir.path()),
            &reporter,
            &options(5),
            now(),
        )
        .await
        .unwrap();

        assert_eq!(summary.requested, 5);
        assert_eq!(summary.api_failures, 1);
        assert_eq!(summary.enriched, 4);
        assert_eq!(summary.documents_saved, 4);
        assert_eq!(search.calls().len(), 5);
        assert!(!documents.calls().contains(&IDS[2].to_string()));

        let messages = reporter.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains(IDS[2]) && messages[0].contains("500"), "{messages:?}");

        let failed = db.find_by_external_id(IDS[2]).await.unwrap().unwrap();
        assert!(!failed.is_enriched);
        assert!(failed.enrichment_data.is_none());

        let ok = db.find_by_external_id(IDS[0]).await.unwrap().unwrap();
        assert!(ok.is_enriched);
        assert_eq!(ok.enrichment_data.unwrap()["apply_url"], "https://apply.example/job");
        assert_eq!(ok.document.as_deref(), Some("job_pdfs/H-300-24001-000001.pdf"));
        assert_eq!(ok.updated_at, Some(now()));
        assert_eq!(
            std::fs::read(dir.path().join("job_pdfs/H-300-24001-000001.pdf")).unwrap(),
            b"%PDF-1.4"
        );
    }

    #[tokio::test]
    async fn picks_most_recently_seen_first() {
        let db = Database::connect_in_memory().await.unwrap();
        let dir = tempdir().unwrap();
        seed(&db, IDS[0], 12).await;
        seed(&db, IDS[1], 18).await;
        seed(&db, IDS[2], 15).await;
        let search = FakeSearch::default().reply(IDS[1], hit(IDS[1]));
        let documents = FakeDocuments::default();
        let reporter = RecordingReporter::default();

        let summary = run_enrich(
            &db,
            EnrichSources { search: &search, documents: &documents },
            &DocumentStore::new(dir.path()),
            &reporter,
            &EnrichOptions {
                modified_threshold: Duration::zero(),
                ..Default::default()
            },
            now(),
        )
        .await
        .unwrap();
        assert_eq!(summary.requested, 1);
        assert_eq!(search.calls(), vec![IDS[1].to_string()]);
        assert_eq!(db.count_unenriched().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn mismatch_keeps_listing_unenriched_but_still_fetches_document() {
        let db = Database::connect_in_memory().await.unwrap();
        let dir = tempdir().unwrap();
        seed(&db, IDS[0], 15).await;
        let search = FakeSearch::default().reply(IDS[0], hit(IDS[1]));
        let documents = FakeDocuments::default().body(IDS[0], b"%PDF");
        let reporter = RecordingReporter::default();

        let summary = run_enrich(
            &db,
            EnrichSources { search: &search, documents: &documents },
            &DocumentStore::new(dir.path()),
            &reporter,
            &options(1),
            now(),
        )
        .await
        .unwrap();

        assert_eq!(summary.mismatches, 1);
        assert_eq!(summary.enriched, 0);
        assert_eq!(summary.documents_saved, 1);
        assert_eq!(documents.calls(), vec![IDS[0].to_string()]);

        let listing = db.find_by_external_id(IDS[0]).await.unwrap().unwrap();
        assert!(!listing.is_enriched);
        assert!(listing.enrichment_data.is_none());
        assert!(listing.document.is_some());
        assert!(reporter.messages()[0].contains("mismatch"));
    }

    #[tokio::test]
    async fn invalid_payload_skips_the_record_entirely() {
        let db = Database::connect_in_memory().await.unwrap();
        let dir = tempdir().unwrap();
        seed(&db, IDS[0], 15).await;
        let search = FakeSearch::default().reply(IDS[0], SearchReply::Invalid);
        let documents = FakeDocuments::default().body(IDS[0], b"%PDF");
        let reporter = RecordingReporter::default();

        let summary = run_enrich(
            &db,
            EnrichSources { search: &search, documents: &documents },
            &DocumentStore::new(dir.path()),
            &reporter,
            &options(1),
            now(),
        )
        .await
        .unwrap();

        assert_eq!(summary.invalid_payloads, 1);
        assert!(documents.calls().is_empty());
        assert_eq!(reporter.messages(), vec![format!("Invalid JSON for {}", IDS[0])]);
    }

    #[tokio::test]
    async fn document_failures_are_all_counted_but_sampled_for_telemetry() {
        let db = Database::connect_in_memory().await.unwrap();
        let dir = tempdir().unwrap();
        let mut search = FakeSearch::default();
        for n in 1..=12u32 {
            let id = format!("H-300-24001-{n:06}");
            seed(&db, &id, 1 + n).await;
            search = search.reply(&id, hit(&id));
        }
        let documents = FakeDocuments::default();
        let reporter = RecordingReporter::default();

        let summary = run_enrich(
            &db,
            EnrichSources { search: &search, documents: &documents },
            &DocumentStore::new(dir.path()),
            &reporter,
            &options(20),
            now(),
        )
        .await
        .unwrap();

        assert_eq!(summary.enriched, 12);
        assert_eq!(summary.document_failures, 12);
        let warnings: Vec<_> = reporter
            .incidents()
            .into_iter()
            .filter(|i| i.severity == Severity::Warning)
            .collect();
        assert_eq!(warnings.len(), 2);
    }

    #[tokio::test]
    async fn listing_with_document_is_not_refetched() {
        let db = Database::connect_in_memory().await.unwrap();
        let dir = tempdir().unwrap();
        seed(&db, IDS[0], 15).await;
        let mut listing = db.find_by_external_id(IDS[0]).await.unwrap().unwrap();
        listing.document = Some("job_pdfs/H-300-24001-000001.pdf".to_string());
        db.save_listing(&listing).await.unwrap();

        let search = FakeSearch::default().reply(IDS[0], hit(IDS[0]));
        let documents = FakeDocuments::default().body(IDS[0], b"%PDF");
        let reporter = RecordingReporter::default();

        let summary = run_enrich(
            &db,
            EnrichSources { search: &search, documents: &documents },
            &DocumentStore::new(dir.path()),
            &reporter,
            &options(1),
            now(),
        )
        .await
        .unwrap();
        assert_eq!(summary.enriched, 1);
        assert!(documents.calls().is_empty());
    }
}
