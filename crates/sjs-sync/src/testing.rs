//! In-process fakes for the upstream source traits.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sjs_core::ConditionalTokens;
use sjs_sources::{
    CaseSearch, DocumentSource, FeedDocument, FeedEntry, FeedFetch, FeedSource, SourceError,
};
use uuid::Uuid;

pub(crate) fn item(link: &str, published: &str) -> FeedEntry {
    FeedEntry {
        link: Some(link.to_string()),
        title: Some("Farmworkers and Laborers, Crop".to_string()),
        description: Some("Hand harvest apples.".to_string()),
        published: Some(published.to_string()),
    }
}

pub(crate) struct FakeFeed {
    response: Mutex<Option<Result<FeedFetch, SourceError>>>,
    seen: Mutex<ConditionalTokens>,
}

impl FakeFeed {
    fn with(response: Result<FeedFetch, SourceError>) -> Self {
        Self {
            response: Mutex::new(Some(response)),
            seen: Mutex::new(ConditionalTokens::default()),
        }
    }

    pub(crate) fn fetched(entries: Vec<FeedEntry>, tokens: ConditionalTokens) -> Self {
        Self::with(Ok(FeedFetch::Fetched(FeedDocument { entries, tokens })))
    }

    pub(crate) fn not_modified() -> Self {
        Self::with(Ok(FeedFetch::NotModified))
    }

    pub(crate) fn failing(err: SourceError) -> Self {
        Self::with(Err(err))
    }

    pub(crate) fn seen_tokens(&self) -> ConditionalTokens {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl FeedSource for FakeFeed {
    async fn fetch_feed(
        &self,
        _run_id: Uuid,
        tokens: &ConditionalTokens,
    ) -> Result<FeedFetch, SourceError> {
        *self.seen.lock().unwrap() = tokens.clone();
        self.response
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| Err(SourceError::InvalidFeed("feed already consumed".to_string())))
    }
}

pub(crate) enum SearchReply {
    Hit(JsonValue),
    Status(u16),
    Invalid,
}

#[derive(Default)]
pub(crate) struct FakeSearch {
    replies: HashMap<String, SearchReply>,
    calls: Mutex<Vec<String>>,
}

impl FakeSearch {
    pub(crate) fn reply(mut self, external_id: &str, reply: SearchReply) -> Self {
        self.replies.insert(external_id.to_string(), reply);
        self
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CaseSearch for FakeSearch {
    async fn search_case(&self, external_id: &str) -> Result<JsonValue, SourceError> {
        self.calls.lock().unwrap().push(external_id.to_string());
        match self.replies.get(external_id) {
            Some(SearchReply::Hit(value)) => Ok(value.clone()),
            Some(SearchReply::Status(status)) => Err(SourceError::HttpStatus {
                status: *status,
                target: external_id.to_string(),
            }),
            Some(SearchReply::Invalid) | None => {
                Err(SourceError::InvalidPayload("search returned no results".to_string()))
            }
        }
    }
}

#[derive(Default)]
pub(crate) struct FakeDocuments {
    bodies: HashMap<String, Vec<u8>>,
    calls: Mutex<Vec<String>>,
}

impl FakeDocuments {
    pub(crate) fn body(mut self, external_id: &str, body: &[u8]) -> Self {
        self.bodies.insert(external_id.to_string(), body.to_vec());
        self
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl DocumentSource for FakeDocuments {
    async fn fetch_document(&self, external_id: &str) -> Result<Vec<u8>, SourceError> {
        self.calls.lock().unwrap().push(external_id.to_string());
        self.bodies
            .get(external_id)
            .cloned()
            .ok_or_else(|| SourceError::DocumentRejected {
                status: 200,
                url: "https://seasonaljobs.dol.gov/system/404".to_string(),
            })
    }
}
