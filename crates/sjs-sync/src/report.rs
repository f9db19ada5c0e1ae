//! Telemetry sink for per-item failures.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Incident {
    pub severity: Severity,
    pub external_id: Option<String>,
    pub message: String,
}

impl Incident {
    pub fn error(external_id: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            external_id: external_id.map(str::to_string),
            message: message.into(),
        }
    }

    pub fn warning(external_id: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            external_id: external_id.map(str::to_string),
            message: message.into(),
        }
    }
}

pub trait ErrorReporter: Send + Sync {
    fn report(&self, incident: Incident);
}

/// Emits incidents as events on the `sjs_telemetry` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, incident: Incident) {
        let external_id = incident.external_id.as_deref().unwrap_or("-");
        match incident.severity {
            Severity::Warning => {
                warn!(target: "sjs_telemetry", external_id, "{}", incident.message)
            }
            Severity::Error => {
                error!(target: "sjs_telemetry", external_id, "{}", incident.message)
            }
        }
    }
}

/// Forwards the first incident and then one in every `every`.
pub struct SampledReporter<'a> {
    inner: &'a dyn ErrorReporter,
    every: u64,
    seen: AtomicU64,
}

impl<'a> SampledReporter<'a> {
    pub fn new(inner: &'a dyn ErrorReporter, every: u64) -> Self {
        Self {
            inner,
            every: every.max(1),
            seen: AtomicU64::new(0),
        }
    }

    pub fn seen(&self) -> u64 {
        self.seen.load(Ordering::Relaxed)
    }
}

impl ErrorReporter for SampledReporter<'_> {
    fn report(&self, incident: Incident) {
        let n = self.seen.fetch_add(1, Ordering::Relaxed);
        if n % self.every == 0 {
            self.inner.report(incident);
        }
    }
}

#[cfg(test)]
pub(crate) use recording::RecordingReporter;
