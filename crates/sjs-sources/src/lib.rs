//! Source contracts for the job feed, the case search API and job order documents,
//! plus their HTTP-backed implementations.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sjs_core::{
    extract_external_id, ConditionalTokens, ExternalIdError, FeedListing, CASE_NUMBER_FIELD,
};
use sjs_storage::{ConditionalResponse, FetchError, HttpFetcher, StatusCode};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "sjs-sources";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("http status {status} for {target}")]
    HttpStatus { status: u16, target: String },
    #[error("invalid feed: {0}")]
    InvalidFeed(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("document rejected (status {status}, final url {url})")]
    DocumentRejected { status: u16, url: String },
}

/// Raw feed item; every field is optional until validated by [`feed_listing`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedEntry {
    pub link: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub published: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedDocument {
    pub entries: Vec<FeedEntry>,
    pub tokens: ConditionalTokens,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedFetch {
    NotModified,
    Fetched(FeedDocument),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EntryError {
    #[error("feed entry has no link")]
    MissingLink,
    #[error(transparent)]
    ExternalId(#[from] ExternalIdError),
    #[error("feed entry {0} has no publication date")]
    MissingDate(String),
    #[error("unparseable publication date {value:?} for {external_id}")]
    InvalidDate { external_id: String, value: String },
}

#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch_feed(
        &self,
        run_id: Uuid,
        tokens: &ConditionalTokens,
    ) -> Result<FeedFetch, SourceError>;
}

#[async_trait]
pub trait CaseSearch: Send + Sync {
    /// Look up one case; returns the first search hit.
    async fn search_case(&self, external_id: &str) -> Result<JsonValue, SourceError>;
}

#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn fetch_document(&self, external_id: &str) -> Result<Vec<u8>, SourceError>;
}

pub fn parse_feed(body: &[u8]) -> Result<Vec<FeedEntry>, SourceError> {
    let channel =
        rss::Channel::read_from(body).map_err(|err| SourceError::InvalidFeed(err.to_string()))?;
    Ok(channel
        .items()
        .iter()
        .map(|item| FeedEntry {
            link: item.link().map(str::to_string),
            title: item.title().map(str::to_string),
            description: item.description().map(str::to_string),
            published: item.pub_date().map(str::to_string),
        })
        .collect())
}

/// RFC 2822 first (the RSS format), RFC 3339 as fallback. Dates are taken in UTC.
pub fn parse_publication_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    DateTime::parse_from_rfc2822(value)
        .or_else(|_| DateTime::parse_from_rfc3339(value))
        .ok()
        .map(|dt| dt.with_timezone(&Utc).date_naive())
}

/// Validate a feed entry into the fields stored for a listing.
pub fn feed_listing(entry: &FeedEntry) -> Result<FeedListing, EntryError> {
    let link = entry
        .link
        .as_deref()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .ok_or(EntryError::MissingLink)?;
    let external_id = extract_external_id(link)?;

    let Some(published) = entry.published.as_deref().filter(|p| !p.trim().is_empty()) else {
        return Err(EntryError::MissingDate(external_id));
    };
    let publication_date = parse_publication_date(published).ok_or_else(|| EntryError::InvalidDate {
        external_id: external_id.clone(),
        value: published.to_string(),
    })?;

    Ok(FeedListing {
        external_id,
        link: link.to_string(),
        title: entry.title.clone().unwrap_or_default(),
        description: entry.description.clone().unwrap_or_default(),
        publication_date,
    })
}

pub struct HttpFeedSource {
    fetcher: HttpFetcher,
    url: String,
}

impl HttpFeedSource {
    pub fn new(fetcher: HttpFetcher, url: impl Into<String>) -> Self {
        Self {
            fetcher,
            url: url.into(),
        }
    }
}

#[async_trait]
impl FeedSource for HttpFeedSource {
    async fn fetch_feed(
        &self,
        run_id: Uuid,
        tokens: &ConditionalTokens,
    ) -> Result<FeedFetch, SourceError> {
        match self.fetcher.get_conditional(run_id, &self.url, tokens).await? {
            ConditionalResponse::NotModified => Ok(FeedFetch::NotModified),
            ConditionalResponse::Fetched { body, tokens } => {
                let entries = parse_feed(&body)?;
                debug!(entries = entries.len(), "feed parsed");
                Ok(FeedFetch::Fetched(FeedDocument { entries, tokens }))
            }
        }
    }
}

/// Request body understood by the search index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchQuery<'a> {
    pub search_fields: &'a str,
    pub search: &'a str,
    pub top: u32,
}

impl<'a> SearchQuery<'a> {
    pub fn case_number(external_id: &'a str) -> Self {
        Self {
            search_fields: CASE_NUMBER_FIELD,
            search: external_id,
            top: 1,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    value: Vec<JsonValue>,
}

/// Take the first hit of a search response body.
pub fn parse_search_response(body: &[u8]) -> Result<JsonValue, SourceError> {
    let response: SearchResponse =
        serde_json::from_slice(body).map_err(|err| SourceError::InvalidPayload(err.to_string()))?;
    response
        .value
        .into_iter()
        .next()
        .ok_or_else(|| SourceError::InvalidPayload("search returned no results".to_string()))
}

pub struct SearchApiClient {
    fetcher: HttpFetcher,
    url: String,
    api_key: String,
}

impl SearchApiClient {
    pub fn new(fetcher: HttpFetcher, url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            fetcher,
            url: url.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl CaseSearch for SearchApiClient {
    async fn search_case(&self, external_id: &str) -> Result<JsonValue, SourceError> {
        let resp = self
            .fetcher
            .post_json(
                &self.url,
                &[("api-key", self.api_key.as_str())],
                &SearchQuery::case_number(external_id),
            )
            .await?;
        if resp.status != StatusCode::OK {
            return Err(SourceError::HttpStatus {
                status: resp.status.as_u16(),
                target: external_id.to_string(),
            });
        }
        parse_search_response(&resp.body)
    }
}

/// A document fetch is good when it answered 200/301 and did not land on the not-found page.
pub fn accept_document(status: u16, final_url: &str, not_found_url: &str) -> bool {
    matches!(status, 200 | 301) && final_url != not_found_url
}

pub struct JobOrderDocuments {
    fetcher: HttpFetcher,
    base_url: String,
    not_found_url: String,
}

impl JobOrderDocuments {
    pub fn new(
        fetcher: HttpFetcher,
        base_url: impl Into<String>,
        not_found_url: impl Into<String>,
    ) -> Self {
        Self {
            fetcher,
            base_url: base_url.into(),
            not_found_url: not_found_url.into(),
        }
    }

    pub fn document_url(&self, external_id: &str) -> String {
        format!("{}{}", self.base_url, external_id)
    }
}

#[async_trait]
impl DocumentSource for JobOrderDocuments {
    async fn fetch_document(&self, external_id: &str) -> Result<Vec<u8>, SourceError> {
        let resp = self.fetcher.fetch_bytes(&self.document_url(external_id)).await?;
        let status = resp.status.as_u16();
        if !accept_document(status, &resp.final_url, &self.not_found_url) {
            return Err(SourceError::DocumentRejected {
                status,
                url: resp.final_url,
            });
        }
        Ok(resp.body)
    }
}
