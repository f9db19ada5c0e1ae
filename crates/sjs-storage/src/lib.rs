//! Document storage, persistence and HTTP fetch utilities for the scraper.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderName, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};

use serde::Serialize;
use sha2::{Digest, Sha256};
use sjs_core::{ConditionalTokens, DOCUMENT_DIR};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub mod db;
pub mod mirror;

pub use db::{Database, InsertOutcome};
pub use mirror::ExportMirror;
pub use reqwest::StatusCode;

pub const CRATE_NAME: &str = "sjs-storage";

#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
}

/// Job order PDFs under `<media_root>/job_pdfs/`, written via temp file + rename.
#[derive(Debug, Clone)]
pub struct DocumentStore {
    root: PathBuf,
}

impl DocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn document_relative_path(file_name: &str) -> PathBuf {
        PathBuf::from(DOCUMENT_DIR).join(file_name)
    }

    /// Store a document under its final name, replacing any earlier copy.
    pub async fn store_document(
        &self,
        file_name: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredDocument> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = Self::document_relative_path(file_name);
        let absolute_path = self.root.join(&relative_path);
        let parent = self.root.join(DOCUMENT_DIR);

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating document directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp document file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp document file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp document file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp document {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }

        Ok(StoredDocument {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum ConditionalResponse {
    NotModified,
    Fetched {
        body: Vec<u8>,
        tokens: ConditionalTokens,
    },
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Thin reqwest wrapper: one request per call, bounded by the client timeout.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    /// GET with `If-None-Match` / `If-Modified-Since` from cached tokens.
    /// 304 maps to `NotModified`; 4xx/5xx are errors.
    pub async fn get_conditional(
        &self,
        run_id: Uuid,
        url: &str,
        tokens: &ConditionalTokens,
    ) -> Result<ConditionalResponse, FetchError> {
        let span = info_span!("http_conditional_get", %run_id, url);
        async {
            let mut request = self.client.get(url);
            if let Some(etag) = &tokens.etag {
                request = request.header(IF_NONE_MATCH, etag);
            }
            if let Some(modified) = &tokens.modified {
                request = request.header(IF_MODIFIED_SINCE, modified);
            }

            let resp = request.send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            debug!(%status, "conditional fetch answered");

            if status == StatusCode::NOT_MODIFIED {
                return Ok(ConditionalResponse::NotModified);
            }
            if status.is_client_error() || status.is_server_error() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let tokens = tokens_from_headers(resp.headers());
            let body = resp.bytes().await?.to_vec();
            Ok(ConditionalResponse::Fetched { body, tokens })
        }
        .instrument(span)
        .await
    }

    /// POST a JSON body; any status is returned to the caller.
    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        body: &T,
    ) -> Result<FetchedResponse, FetchError> {
        let mut request = self.client.post(url).json(body);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        let resp = request.send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        let body = resp.bytes().await?.to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }

    /// GET following redirects; any status is returned with the final URL.
    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        let body = resp.bytes().await?.to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}

fn tokens_from_headers(headers: &HeaderMap) -> ConditionalTokens {
    let header_text = |name: HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    ConditionalTokens {
        etag: header_text(ETAG),
        modified: header_text(LAST_MODIFIED),
    }
}
