//! Run tracing.
//!
//! Environments record request/response/error events into a per-run buffer.
//! Recording is a short synchronous append; uploads only happen on
//! [`Tracer::flush`] or when the last environment detaches from a run.
//!
//! Upload failures never reach the caller. Transient failures (HTTP 429,
//! 5xx, network errors) are retried with exponential backoff; when the
//! retry budget runs out, or the service rejects the batch outright, the
//! events are appended to `<fallback_dir>/<run_id>.jsonl` and the run is
//! marked [`RunStatus::UploadFailed`].

use crate::config::{RetryPolicy, TracerConfig};
use crate::error::{CoreError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// External identifier grouping the traces of one or more environments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Generate a fresh run identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The identifier as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RunId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for RunId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Direction of a traced interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Something sent to the target
    Request,
    /// Something returned by the target
    Response,
    /// A failure
    Error,
}

/// One append-only trace record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    /// When the event was recorded
    pub timestamp: DateTime<Utc>,
    /// Event direction
    pub kind: EventKind,
    /// Event body
    pub payload: serde_json::Value,
    /// Run the event belongs to
    pub correlation_id: RunId,
    /// Environment that produced the event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_id: Option<String>,
    /// Step counter at the time of the event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<u64>,
}

impl TraceEvent {
    /// Create an event stamped with the current time.
    pub fn new(run: &RunId, kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            payload,
            correlation_id: run.clone(),
            environment_id: None,
            step: None,
        }
    }

    /// Tag the event with its environment.
    pub fn with_environment(mut self, id: impl Into<String>) -> Self {
        self.environment_id = Some(id.into());
        self
    }

    /// Tag the event with a step number.
    pub fn with_step(mut self, step: u64) -> Self {
        self.step = Some(step);
        self
    }
}

/// Upload state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Environments are attached and recording
    Active,
    /// Everything recorded so far reached the ingest service
    Uploaded,
    /// Events were kept locally because no ingest service is configured
    StoredLocally,
    /// Upload failed; events went to the fallback file
    UploadFailed,
    /// Last environment detached and the final flush ran
    Finalized,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "Active"),
            Self::Uploaded => write!(f, "Uploaded"),
            Self::StoredLocally => write!(f, "StoredLocally"),
            Self::UploadFailed => write!(f, "UploadFailed"),
            Self::Finalized => write!(f, "Finalized"),
        }
    }
}

/// Result of a flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was buffered
    Empty,
    /// Events reached the ingest service
    Uploaded {
        /// Number of events
        events: usize,
    },
    /// Events were appended to a local file
    WrittenLocally {
        /// Number of events
        events: usize,
        /// File written
        path: PathBuf,
        /// True when this was the fallback after a failed upload
        upload_failed: bool,
    },
    /// Neither upload nor local write succeeded; events stay buffered
    Retained {
        /// Number of events
        events: usize,
    },
}

/// Failure talking to the ingest service. Never leaves the tracer.
#[derive(Debug, Error)]
pub enum UploadError {
    /// Worth retrying (429, 5xx, network)
    #[error("transient upload failure: {0}")]
    Transient(String),

    /// Retrying will not help (other 4xx)
    #[error("upload rejected: {0}")]
    Permanent(String),
}

impl UploadError {
    /// True when another attempt may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Destination for trace batches.
#[async_trait]
pub trait IngestSink: Send + Sync {
    /// Upload one batch of events for `run`.
    async fn upload(&self, run: &RunId, events: &[TraceEvent]) -> std::result::Result<(), UploadError>;
}

/// Ingest over HTTP: `POST {base}/v1/runs/{run_id}/events` with `{"events": [...]}`.
pub struct HttpIngest {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpIngest {
    /// Create a client for the ingest service at `base_url`.
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| CoreError::Configuration(format!("ingest client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[derive(Serialize)]
struct EventBatch<'a> {
    events: &'a [TraceEvent],
}

#[async_trait]
impl IngestSink for HttpIngest {
    async fn upload(&self, run: &RunId, events: &[TraceEvent]) -> std::result::Result<(), UploadError> {
        let url = format!("{}/v1/runs/{}/events", self.base_url, run);
        let mut request = self.http.post(&url).json(&EventBatch { events });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| UploadError::Transient(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status.as_u16() == 429 || status.is_server_error() {
            Err(UploadError::Transient(format!("ingest returned {status}")))
        } else {
            Err(UploadError::Permanent(format!("ingest returned {status}")))
        }
    }
}

/// Settled runs (detached, nothing buffered) whose status stays queryable.
/// Older ones are forgotten first.
const MAX_SETTLED_RUNS: usize = 256;

#[derive(Debug)]
struct RunBuffer {
    events: Vec<TraceEvent>,
    attached: usize,
    status: RunStatus,
    /// Order in which the run settled
    settled: Option<u64>,
}

impl RunBuffer {
    fn new() -> Self {
        Self {
            events: Vec::new(),
            attached: 0,
            status: RunStatus::Active,
            settled: None,
        }
    }
}

struct TracerInner {
    runs: Mutex<HashMap<RunId, RunBuffer>>,
    settled_seq: AtomicU64,
    sink: Option<Arc<dyn IngestSink>>,
    retry: RetryPolicy,
    fallback_dir: PathBuf,
}

/// Per-run event recorder. Cheap to clone; clones share buffers.
#[derive(Clone)]
pub struct Tracer {
    inner: Arc<TracerInner>,
}

impl fmt::Debug for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracer")
            .field("has_sink", &self.inner.sink.is_some())
            .field("retry", &self.inner.retry)
            .field("fallback_dir", &self.inner.fallback_dir)
            .finish()
    }
}

impl Tracer {
    /// Build a tracer from configuration, uploading over HTTP when an ingest URL is set.
    pub fn from_config(config: &TracerConfig) -> Result<Self> {
        let sink = match &config.ingest_url {
            Some(url) => Some(Arc::new(HttpIngest::new(url.clone(), config.api_key.clone())?)
                as Arc<dyn IngestSink>),
            None => None,
        };
        Ok(Self::new(sink, config.retry.clone(), config.fallback_dir.clone()))
    }

    /// Build a tracer around an arbitrary sink.
    pub fn new(
        sink: Option<Arc<dyn IngestSink>>,
        retry: RetryPolicy,
        fallback_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            inner: Arc::new(TracerInner {
                runs: Mutex::new(HashMap::new()),
                settled_seq: AtomicU64::new(0),
                sink,
                retry,
                fallback_dir: fallback_dir.into(),
            }),
        }
    }

    /// A tracer that only writes local files under `dir`.
    pub fn local(dir: impl Into<PathBuf>) -> Self {
        Self::new(None, RetryPolicy::default(), dir)
    }

    fn runs(&self) -> MutexGuard<'_, HashMap<RunId, RunBuffer>> {
        // A poisoned lock only means another recorder panicked mid-push;
        // the map itself is still usable.
        self.inner
            .runs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start (or join) buffering for `run`.
    pub fn attach(&self, run: &RunId) {
        let mut runs = self.runs();
        let buffer = runs.entry(run.clone()).or_insert_with(RunBuffer::new);
        buffer.attached += 1;
        buffer.settled = None;
        if buffer.status == RunStatus::Finalized {
            buffer.status = RunStatus::Active;
        }
        tracing::debug!(run_id = %run, attached = buffer.attached, "Attached to run");
    }

    /// Append an event to its run's buffer.
    pub fn record(&self, event: TraceEvent) {
        let mut runs = self.runs();
        let buffer = runs
            .entry(event.correlation_id.clone())
            .or_insert_with(|| {
                tracing::debug!(run_id = %event.correlation_id, "Recording into unattached run");
                RunBuffer::new()
            });
        buffer.events.push(event);
    }

    /// Number of events waiting for the next flush.
    pub fn buffered(&self, run: &RunId) -> usize {
        self.runs().get(run).map_or(0, |b| b.events.len())
    }

    /// Snapshot of the buffered events for `run`.
    pub fn events(&self, run: &RunId) -> Vec<TraceEvent> {
        self.runs()
            .get(run)
            .map(|b| b.events.clone())
            .unwrap_or_default()
    }

    /// Upload state of `run`, if the tracer has seen it.
    pub fn status(&self, run: &RunId) -> Option<RunStatus> {
        self.runs().get(run).map(|b| b.status)
    }

    /// Path of the local file for `run`.
    pub fn fallback_path(&self, run: &RunId) -> PathBuf {
        self.inner.fallback_dir.join(format!("{run}.jsonl"))
    }

    /// Ship everything buffered for `run`.
    ///
    /// Never fails; the outcome says where the events went.
    pub async fn flush(&self, run: &RunId) -> FlushOutcome {
        let events = match self.runs().get_mut(run) {
            Some(buffer) => std::mem::take(&mut buffer.events),
            None => Vec::new(),
        };
        if events.is_empty() {
            return FlushOutcome::Empty;
        }

        let count = events.len();
        let start = std::time::Instant::now();

        let (upload_failed, status) = match &self.inner.sink {
            Some(sink) => match self.upload_with_retry(sink.as_ref(), run, &events).await {
                Ok(()) => {
                    self.set_status(run, RunStatus::Uploaded);
                    tracing::info!(
                        run_id = %run,
                        events = count,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Trace batch uploaded"
                    );
                    return FlushOutcome::Uploaded { events: count };
                }
                Err(e) => {
                    tracing::warn!(run_id = %run, events = count, error = %e, "Trace upload failed, writing fallback");
                    (true, RunStatus::UploadFailed)
                }
            },
            None => (false, RunStatus::StoredLocally),
        };

        let path = self.fallback_path(run);
        match append_jsonl(&path, &events).await {
            Ok(()) => {
                self.set_status(run, status);
                tracing::info!(run_id = %run, events = count, path = %path.display(), "Trace batch written locally");
                FlushOutcome::WrittenLocally {
                    events: count,
                    path,
                    upload_failed,
                }
            }
            Err(e) => {
                tracing::error!(run_id = %run, path = %path.display(), error = %e, "Trace fallback write failed, keeping events buffered");
                let mut runs = self.runs();
                let buffer = runs.entry(run.clone()).or_insert_with(RunBuffer::new);
                let newer = std::mem::replace(&mut buffer.events, events);
                buffer.events.extend(newer);
                if upload_failed {
                    buffer.status = RunStatus::UploadFailed;
                }
                FlushOutcome::Retained { events: count }
            }
        }
    }

    /// Leave `run`. The last environment to leave triggers the final flush.
    pub async fn detach(&self, run: &RunId) -> FlushOutcome {
        let remaining = {
            let mut runs = self.runs();
            match runs.get_mut(run) {
                Some(buffer) => {
                    buffer.attached = buffer.attached.saturating_sub(1);
                    buffer.attached
                }
                None => return FlushOutcome::Empty,
            }
        };
        tracing::debug!(run_id = %run, remaining, "Detached from run");
        if remaining > 0 {
            return FlushOutcome::Empty;
        }

        let outcome = self.flush(run).await;
        let mut runs = self.runs();
        if let Some(buffer) = runs.get_mut(run) {
            if buffer.attached == 0 && buffer.status != RunStatus::UploadFailed {
                buffer.status = RunStatus::Finalized;
            }
            if buffer.attached == 0 && buffer.events.is_empty() {
                buffer.settled = Some(self.inner.settled_seq.fetch_add(1, Ordering::Relaxed));
            }
        }
        forget_oldest_settled(&mut runs);
        outcome
    }

    fn set_status(&self, run: &RunId, status: RunStatus) {
        if let Some(buffer) = self.runs().get_mut(run) {
            // An earlier failure stays visible until the run is finalized.
            if buffer.status != RunStatus::UploadFailed || status == RunStatus::UploadFailed {
                buffer.status = status;
            }
        }
    }

    async fn upload_with_retry(
        &self,
        sink: &dyn IngestSink,
        run: &RunId,
        events: &[TraceEvent],
    ) -> std::result::Result<(), UploadError> {
        let policy = &self.inner.retry;
        let mut attempt = 1;
        loop {
            match sink.upload(run, events).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                    let delay = policy.backoff(attempt);
                    tracing::warn!(
                        run_id = %run,
                        attempt,
                        max_attempts = policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Trace upload failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn forget_oldest_settled(runs: &mut HashMap<RunId, RunBuffer>) {
    let mut settled: Vec<(u64, RunId)> = runs
        .iter()
        .filter(|(_, b)| b.attached == 0 && b.events.is_empty())
        .filter_map(|(id, b)| b.settled.map(|seq| (seq, id.clone())))
        .collect();
    if settled.len() <= MAX_SETTLED_RUNS {
        return;
    }
    settled.sort_unstable();
    let excess = settled.len() - MAX_SETTLED_RUNS;
    for (_, id) in settled.into_iter().take(excess) {
        runs.remove(&id);
    }
    tracing::debug!(forgotten = excess, "Dropped status of old runs");
}

async fn append_jsonl(path: &Path, events: &[TraceEvent]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut body = Vec::new();
    for event in events {
        serde_json::to_writer(&mut body, event)?;
        body.push(b'\n');
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(&body).await?;
    file.flush().await
}
