//! Batch pipelines (feed ingestion, enrichment, export) and their configuration.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use sjs_sources::{HttpFeedSource, JobOrderDocuments, SearchApiClient};
use sjs_storage::{Database, DocumentStore, ExportMirror, HttpClientConfig, HttpFetcher};
use thiserror::Error;
use tracing::info;

pub mod enrich;
pub mod export;
pub mod ingest;
pub mod report;

#[cfg(test)]
mod testing;

pub use enrich::{run_enrich, EnrichOptions, EnrichSources, EnrichSummary};
pub use export::{run_export, ExportFormat, ExportOptions, ExportSummary};
pub use ingest::{run_ingest, IngestOptions, IngestStatus, IngestSummary};
pub use report::{ErrorReporter, Incident, SampledReporter, Severity, TracingReporter};

pub const CRATE_NAME: &str = "sjs-sync";

pub const DEFAULT_FEED_URL: &str = "https://seasonaljobs.dol.gov/job_rss.xml";
pub const DEFAULT_API_URL: &str =
    "https://foreign-labor.search.windows.net/indexes/foreign-labor/docs/search?api-version=2017-11-11";
pub const DEFAULT_JOB_ORDER_BASE_URL: &str = "https://seasonaljobs.dol.gov/job-order/";
pub const DEFAULT_NOT_FOUND_URL: &str = "https://seasonaljobs.dol.gov/system/404";
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/80.0.3987.149 Safari/537.36";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} has invalid value {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub media_root: PathBuf,
    pub media_url: String,
    pub feed_url: String,
    pub api_url: String,
    pub api_key: Option<String>,
    pub document_base_url: String,
    pub not_found_url: String,
    pub user_agent: String,
    pub http_timeout: Duration,
    pub modified_threshold: chrono::Duration,
    pub telemetry_sample_every: u64,
    pub mirror_bucket: Option<String>,
    pub mirror_dir: Option<PathBuf>,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let or = |name: &str, default: &str| var(name).unwrap_or_else(|| default.to_string());

        Ok(Self {
            database_url: or("DATABASE_URL", "sqlite://jobscraper.db"),
            media_root: PathBuf::from(or("MEDIA_ROOT", "./files")),
            media_url: or("MEDIA_URL", "/files/"),
            feed_url: or("JOBS_RSS_FEED_URL", DEFAULT_FEED_URL),
            api_url: or("JOBS_API_URL", DEFAULT_API_URL),
            api_key: var("JOBS_API_KEY"),
            document_base_url: or("JOB_ORDER_BASE_URL", DEFAULT_JOB_ORDER_BASE_URL),
            not_found_url: or("JOB_ORDER_NOT_FOUND_URL", DEFAULT_NOT_FOUND_URL),
            user_agent: or("SJS_USER_AGENT", DEFAULT_USER_AGENT),
            http_timeout: Duration::from_secs(parse_var(&var, "SJS_HTTP_TIMEOUT_SECS", 30)?),
            modified_threshold: chrono::Duration::seconds(parse_var(
                &var,
                "SJS_MODIFIED_THRESHOLD_SECS",
                10,
            )?),
            telemetry_sample_every: parse_var(&var, "SJS_TELEMETRY_SAMPLE_EVERY", 10)?,
            mirror_bucket: var("EXPORT_MIRROR_BUCKET"),
            mirror_dir: var("EXPORT_MIRROR_DIR").map(PathBuf::from),
        })
    }

    /// The search API key; enrichment cannot run without it.
    pub fn require_api_key(&self) -> Result<&str, ConfigError> {
        self.api_key.as_deref().ok_or(ConfigError::Missing("JOBS_API_KEY"))
    }

    pub fn http_fetcher(&self) -> Result<HttpFetcher> {
        HttpFetcher::new(HttpClientConfig {
            timeout: self.http_timeout,
            user_agent: Some(self.user_agent.clone()),
        })
    }

    pub fn document_store(&self) -> DocumentStore {
        DocumentStore::new(self.media_root.clone())
    }

    /// Bucket mirror wins over a directory mirror; neither configured means no mirror.
    pub fn export_mirror(&self) -> Result<Option<ExportMirror>> {
        if let Some(bucket) = &self.mirror_bucket {
            return ExportMirror::s3(bucket).map(Some);
        }
        if let Some(dir) = &self.mirror_dir {
            return ExportMirror::local(dir).map(Some);
        }
        Ok(None)
    }

    pub fn ingest_options(&self, max_count: Option<usize>, skip_update: bool) -> IngestOptions {
        IngestOptions {
            max_count,
            skip_update,
            modified_threshold: self.modified_threshold,
        }
    }

    pub fn enrich_options(&self, max_count: usize) -> EnrichOptions {
        EnrichOptions {
            max_count,
            modified_threshold: self.modified_threshold,
            telemetry_sample_every: self.telemetry_sample_every,
        }
    }

    /// Open the database and bring its schema up to date.
    pub async fn open_database(&self) -> Result<Database> {
        let db = Database::connect(&self.database_url).await?;
        db.migrate().await?;
        Ok(db)
    }
}

fn parse_var<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match var(name) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|_| ConfigError::Invalid { name, value }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ListingStats {
    pub listings: i64,
    pub unenriched: i64,
}

pub async fn listing_stats(db: &Database) -> Result<ListingStats> {
    Ok(ListingStats {
        listings: db.count_listings().await?,
        unenriched: db.count_unenriched().await?,
    })
}

pub async fn ingest_feed(
    config: &SyncConfig,
    max_count: Option<usize>,
    skip_update: bool,
) -> Result<IngestSummary> {
    let source = HttpFeedSource::new(config.http_fetcher()?, config.feed_url.clone());
    let db = config.open_database().await?;
    run_ingest(
        &db,
        &source,
        &TracingReporter,
        &config.ingest_options(max_count, skip_update),
        Utc::now(),
    )
    .await
}

pub async fn enrich_listings(config: &SyncConfig, max_count: usize) -> Result<EnrichSummary> {
    let api_key = config.require_api_key()?;
    let fetcher = config.http_fetcher()?;
    let search = SearchApiClient::new(fetcher.clone(), config.api_url.clone(), api_key);
    let documents = JobOrderDocuments::new(
        fetcher,
        config.document_base_url.clone(),
        config.not_found_url.clone(),
    );
    let db = config.open_database().await?;
    run_enrich(
        &db,
        EnrichSources {
            search: &search,
            documents: &documents,
        },
        &config.document_store(),
        &TracingReporter,
        &config.enrich_options(max_count),
        Utc::now(),
    )
    .await
}

pub async fn export_listings(
    config: &SyncConfig,
    options: &ExportOptions,
) -> Result<ExportSummary> {
    let mirror = config.export_mirror()?;
    let db = config.open_database().await?;
    let summary = run_export(
        &db,
        &config.media_root,
        &config.media_url,
        mirror.as_ref(),
        options,
        Utc::now().date_naive(),
    )
    .await?;
    info!(path = %summary.path.display(), rows = summary.rows, "export complete");
    Ok(summary)
}

pub async fn migrate(config: &SyncConfig) -> Result<()> {
    config
        .open_database()
        .await
        .with_context(|| format!("migrating {}", config.database_url))?;
    Ok(())
}
