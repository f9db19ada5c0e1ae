//! Streamed CSV / JSON export of listings, optionally mirrored to object storage.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use futures::{Stream, TryStreamExt};
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use sha2::{Digest, Sha256};
use sjs_core::{ExportWindow, Listing, EXPORT_FIELDS};
use sjs_storage::{Database, ExportMirror};
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

pub const EXPORT_DIR: &str = "exports";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportFormat {
    #[default]
    Csv,
    Json,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Json => "json",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    pub window: Option<ExportWindow>,
    pub format: ExportFormat,
    /// Write to a stable `job-listings-latest.*` name instead of a dated one.
    pub fixed_destination: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportSummary {
    pub path: PathBuf,
    pub rows: usize,
    pub bytes: u64,
    pub sha256: String,
    pub mirrored_to: Option<String>,
}

pub fn export_file_name(options: &ExportOptions, today: NaiveDate) -> String {
    let ext = options.format.extension();
    if options.fixed_destination {
        return format!("job-listings-latest.{ext}");
    }
    match options.window {
        Some(window) => format!(
            "job-listings--last-{}--{}.{ext}",
            window.as_str(),
            today.format("%Y-%m-%d")
        ),
        None => format!("job-listings--{}.{ext}", today.format("%Y-%m-%d")),
    }
}

/// Public URL of a stored document under `media_url`.
pub fn document_url(media_url: &str, document: &str) -> String {
    format!("{}/{}", media_url.trim_end_matches('/'), document.trim_start_matches('/'))
}

/// One listing flattened into `EXPORT_FIELDS` order.
pub fn export_record(
    listing: &Listing,
    today: NaiveDate,
    media_url: &str,
) -> Map<String, JsonValue> {
    let mut record = Map::with_capacity(EXPORT_FIELDS.len());
    for field in EXPORT_FIELDS {
        let value = match *field {
            "dol_id" => JsonValue::from(listing.external_id.as_str()),
            "job_title" => JsonValue::from(listing.title.as_str()),
            "job_description" => JsonValue::from(listing.description.as_str()),
            "pub_date" => JsonValue::from(listing.publication_date.to_string()),
            "first_seen" => JsonValue::from(listing.first_seen.to_string()),
            "last_seen" => JsonValue::from(listing.last_seen.to_string()),
            "is_active" => JsonValue::from(listing.is_active(today)),
            "job_order_pdf" => JsonValue::from(
                listing
                    .document
                    .as_deref()
                    .map(|doc| document_url(media_url, doc))
                    .unwrap_or_default(),
            ),
            other => listing
                .enrichment_data
                .as_ref()
                .and_then(|data| data.get(other))
                .cloned()
                .unwrap_or_else(|| JsonValue::from("")),
        };
        record.insert((*field).to_string(), value);
    }
    record
}

/// CSV text for one value: strings as-is, null empty, nested values as compact JSON.
pub fn csv_cell(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.clone(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Tracks the digest and size of everything written through it.
struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    bytes: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes: 0,
        }
    }

    fn finish(mut self) -> std::io::Result<(String, u64)> {
        self.inner.flush()?;
        Ok((hex::encode(self.hasher.finalize()), self.bytes))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

enum RecordSink<W: Write> {
    Csv(csv::Writer<W>),
    Json { out: W, rows: usize },
}

impl<W: Write> RecordSink<W> {
    fn open(format: ExportFormat, mut out: W) -> Result<Self> {
        match format {
            ExportFormat::Csv => {
                let mut writer = csv::Writer::from_writer(out);
                writer.write_record(EXPORT_FIELDS).context("writing csv header")?;
                Ok(RecordSink::Csv(writer))
            }
            ExportFormat::Json => {
                out.write_all(b"[").context("writing json array start")?;
                Ok(RecordSink::Json { out, rows: 0 })
            }
        }
    }

    fn write(&mut self, record: &Map<String, JsonValue>) -> Result<()> {
        match self {
            RecordSink::Csv(writer) => writer
                .write_record(record.values().map(csv_cell))
                .context("writing csv row"),
            RecordSink::Json { out, rows } => {
                if *rows > 0 {
                    out.write_all(b",").context("writing json separator")?;
                }
                serde_json::to_writer(&mut *out, record).context("writing json row")?;
                *rows += 1;
                Ok(())
            }
        }
    }

    fn finish(self) -> Result<W> {
        match self {
            RecordSink::Csv(writer) => writer
                .into_inner()
                .map_err(|err| anyhow::anyhow!("flushing csv writer: {}", err.error())),
            RecordSink::Json { mut out, .. } => {
                out.write_all(b"]").context("writing json array end")?;
                Ok(out)
            }
        }
    }
}

pub async fn run_export(
    db: &Database,
    media_root: &Path,
    media_url: &str,
    mirror: Option<&ExportMirror>,
    options: &ExportOptions,
    today: NaiveDate,
) -> Result<ExportSummary> {
    let run_id = Uuid::new_v4();
    let span = info_span!("export_listings", %run_id);
    export(db, media_root, media_url, mirror, options, today)
        .instrument(span)
        .await
}

async fn export(
    db: &Database,
    media_root: &Path,
    media_url: &str,
    mirror: Option<&ExportMirror>,
    options: &ExportOptions,
    today: NaiveDate,
) -> Result<ExportSummary> {
    let dir = media_root.join(EXPORT_DIR);
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating export directory {}", dir.display()))?;

    let path = dir.join(export_file_name(options, today));
    let temp_path = dir.join(format!(".{}.tmp", Uuid::new_v4()));
    let listings = db.stream_listings(options.window.map(|w| w.range(today)));
    let written = write_rows(listings, &temp_path, options.format, today, media_url).await?;

    if let Err(err) = std::fs::rename(&temp_path, &path) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(err).with_context(|| format!("moving export into place at {}", path.display()));
    }
    info!(path = %path.display(), rows = written.rows, bytes = written.bytes, "export written");

    let mirrored_to = match mirror {
        Some(mirror) => Some(mirror.mirror_file(&path).await?),
        None => None,
    };

    Ok(ExportSummary {
        path,
        rows: written.rows,
        bytes: written.bytes,
        sha256: written.sha256,
        mirrored_to,
    })
}

struct WrittenFile {
    rows: usize,
    bytes: u64,
    sha256: String,
}

/// Stream rows into `temp_path`. The temp file is removed again on any failure.
async fn write_rows<S>(
    listings: S,
    temp_path: &Path,
    format: ExportFormat,
    today: NaiveDate,
    media_url: &str,
) -> Result<WrittenFile>
where
    S: Stream<Item = Result<Listing>> + Unpin,
{
    let result = write_rows_to(listings, temp_path, format, today, media_url).await;
    if result.is_err() {
        let _ = std::fs::remove_file(temp_path);
    }
    result
}

async fn write_rows_to<S>(
    mut listings: S,
    temp_path: &Path,
    format: ExportFormat,
    today: NaiveDate,
    media_url: &str,
) -> Result<WrittenFile>
where
    S: Stream<Item = Result<Listing>> + Unpin,
{
    let file = File::create(temp_path)
        .with_context(|| format!("creating {}", temp_path.display()))?;
    let mut sink = RecordSink::open(format, HashingWriter::new(BufWriter::new(file)))?;
    let mut rows = 0usize;
    while let Some(listing) = listings.try_next().await? {
        sink.write(&export_record(&listing, today, media_url))?;
        rows += 1;
    }

    let (sha256, bytes) = sink
        .finish()?
        .finish()
        .with_context(|| format!("flushing {}", temp_path.display()))?;
    Ok(WrittenFile {
        rows,
        bytes,
        sha256,
    })
}
