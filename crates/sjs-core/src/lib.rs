//! Core domain model for the seasonal jobs scraper.

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "sjs-core";

/// Static value keys holding the feed's conditional fetch tokens between runs.
pub const FEED_ETAG_KEY: &str = "jobs_rss__etag";
pub const FEED_MODIFIED_KEY: &str = "jobs_rss__modified";

/// Field of a search result that carries the case number.
pub const CASE_NUMBER_FIELD: &str = "case_number";
pub const APPLY_URL_FIELD: &str = "apply_url";

/// Directory (relative to the media root) that holds job order PDFs.
pub const DOCUMENT_DIR: &str = "job_pdfs";

/// Maximal runs of letters, digits and hyphens; a case number must be a whole run.
static LINK_TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9-]+").expect("link token pattern is valid"));

static EXTERNAL_ID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Z]-\d{3}-\d{5}-\d{6}$").expect("external id pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExternalIdError {
    #[error("no case number found in link {0}")]
    Missing(String),
    #[error("{count} case numbers found in link {link}")]
    Ambiguous { link: String, count: usize },
}

/// Extract the single case number embedded in a feed link.
pub fn extract_external_id(link: &str) -> Result<String, ExternalIdError> {
    let mut matches = LINK_TOKEN_RE
        .find_iter(link)
        .filter(|token| EXTERNAL_ID_RE.is_match(token.as_str()));
    let Some(first) = matches.next() else {
        return Err(ExternalIdError::Missing(link.to_string()));
    };
    let extra = matches.count();
    if extra > 0 {
        return Err(ExternalIdError::Ambiguous {
            link: link.to_string(),
            count: extra + 1,
        });
    }
    Ok(first.as_str().to_string())
}

/// ETag / Last-Modified values remembered from the previous feed fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionalTokens {
    pub etag: Option<String>,
    pub modified: Option<String>,
}

impl ConditionalTokens {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.modified.is_none()
    }
}

/// Listing fields carried by one feed entry once its link and date are validated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedListing {
    pub external_id: String,
    pub link: String,
    pub title: String,
    pub description: String,
    pub publication_date: NaiveDate,
}

/// Persisted job listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: i64,
    pub external_id: String,
    pub link: String,
    pub title: String,
    pub description: String,
    pub publication_date: NaiveDate,
    pub first_seen: NaiveDate,
    pub last_seen: NaiveDate,
    pub is_enriched: bool,
    pub enrichment_data: Option<JsonValue>,
    pub document: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Snapshot of the fields whose change counts as a modification.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedFields {
    link: String,
    title: String,
    description: String,
    publication_date: NaiveDate,
    last_seen: NaiveDate,
    is_enriched: bool,
    enrichment_data: Option<JsonValue>,
    document: Option<String>,
}

impl Listing {
    pub fn tracked_fields(&self) -> TrackedFields {
        TrackedFields {
            link: self.link.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            publication_date: self.publication_date,
            last_seen: self.last_seen,
            is_enriched: self.is_enriched,
            enrichment_data: self.enrichment_data.clone(),
            document: self.document.clone(),
        }
    }

    /// Set `updated_at` when tracked fields differ from `before` and the row is
    /// older than `threshold`. A zero threshold stamps every real change.
    pub fn stamp_if_modified(
        &mut self,
        before: &TrackedFields,
        now: DateTime<Utc>,
        threshold: Duration,
    ) -> bool {
        if self.tracked_fields() == *before {
            return false;
        }
        let elapsed = now - self.created_at;
        if threshold <= Duration::zero() || elapsed > threshold {
            self.updated_at = Some(now);
            return true;
        }
        false
    }

    /// Refresh the listing from a reappearing feed entry.
    pub fn apply_feed(&mut self, entry: &FeedListing, today: NaiveDate) {
        self.link = entry.link.clone();
        self.title = entry.title.clone();
        self.description = entry.description.clone();
        self.publication_date = entry.publication_date;
        if today > self.last_seen {
            self.last_seen = today;
        }
    }

    /// Store a validated search payload. The payload's apply URL is normalised first.
    pub fn mark_enriched(&mut self, mut payload: JsonValue) {
        clean_apply_url(&mut payload);
        self.enrichment_data = Some(payload);
        self.is_enriched = true;
    }

    pub fn is_active(&self, today: NaiveDate) -> bool {
        self.last_seen >= today
    }

    pub fn document_file_name(&self) -> String {
        format!("{}.pdf", self.external_id)
    }
}

/// Repair malformed apply URLs returned by the search API.
pub fn clean_apply_url(payload: &mut JsonValue) {
    let Some(JsonValue::String(url)) = payload.get_mut(APPLY_URL_FIELD) else {
        return;
    };
    if url == "N/A" {
        url.clear();
    } else if url.contains("https://http:") {
        *url = url.replace("https://http:", "https://");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportWindow {
    Day,
    Week,
    Month,
    Year,
}

/// Half-open `last_seen` range: `start <= d < end`; an open end includes today.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: Option<NaiveDate>,
}

impl DateRange {
    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && self.end.map_or(true, |end| date < end)
    }
}

impl ExportWindow {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportWindow::Day => "day",
            ExportWindow::Week => "week",
            ExportWindow::Month => "month",
            ExportWindow::Year => "year",
        }
    }

    /// Day and week reach back from (and include) today; month and year select
    /// the previous calendar month / year and exclude the current one.
    pub fn range(&self, today: NaiveDate) -> DateRange {
        match self {
            ExportWindow::Day => DateRange {
                start: today - Duration::days(1),
                end: None,
            },
            ExportWindow::Week => DateRange {
                start: today - Duration::days(7),
                end: None,
            },
            ExportWindow::Month => {
                let this_month = today.with_day(1).unwrap_or(today);
                DateRange {
                    start: this_month - Months::new(1),
                    end: Some(this_month),
                }
            }
            ExportWindow::Year => {
                let this_year = today.with_ordinal(1).unwrap_or(today);
                DateRange {
                    start: this_year - Months::new(12),
                    end: Some(this_year),
                }
            }
        }
    }
}

impl std::str::FromStr for ExportWindow {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "day" => Ok(ExportWindow::Day),
            "week" => Ok(ExportWindow::Week),
            "month" => Ok(ExportWindow::Month),
            "year" => Ok(ExportWindow::Year),
            other => Err(format!("unknown export window {other}")),
        }
    }
}

/// Export columns filled from listing attributes rather than the search payload.
pub const BASE_EXPORT_FIELDS: &[&str] = &[
    "dol_id",
    "job_title",
    "job_description",
    "last_seen",
    "first_seen",
    "pub_date",
    "is_active",
    "job_order_pdf",
];

/// Ordered export columns consumed by downstream imports.
pub const EXPORT_FIELDS: &[&str] = &[
    "dol_id",
    "job_title",
    "pub_date",
    "first_seen",
    "last_seen",
    "is_active",
    "job_order_pdf",
    "job_description",
    "crop",
    "job_duties",
    "work_hour_num_basic",
    "total_positions",
    "basic_rate_to",
    "basic_rate_from",
    "overtime_rate_to",
    "overtime_rate_from",
    "full_time",
    "hourly_work_schedule_am",
    "hourly_work_schedule_pm",
    "begin_date",
    "end_date",
    "emp_experience_reqd",
    "emp_exp_num_months",
    "special_req",
    "training_req",
    "num_months_training",
    "education_level",
    "name_reqd_training",
    "pay_range_desc",
    "employer_business_name",
    "employer_trade_name",
    "employer_city",
    "employer_state",
    "employer_zip",
    "employer_phone",
    "employer_phone_ext",
    "employer_email",
    "naic_id",
    "naic_description",
    "visa_class",
    "worksite_locations",
    "worksite_address",
    "add_wage_info",
    "worksite_address_alt",
    "worksite_city",
    "worksite_state",
    "worksite_zip",
    "accepted_date",
    "affirmed_date",
    "soc_code_id",
    "soc_title",
    "soc_description",
    "coord",
    "job_order_exists",
    "apply_email",
    "apply_phone",
    "apply_url",
    "oflc_cms",
    "case_id",
    "case_status",
    "active",
    "document_available",
    "case_number",
    "job_order_id",
];
