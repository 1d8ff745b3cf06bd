//! Local file plumbing (audit event log, download directory) and the retrying HTTP
//! client shared by every remote collaborator.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Local};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "stalkr-storage";

const EVENT_LOG_FIELDS: [&str; 9] = [
    "timestamp",
    "user_initials",
    "script",
    "action",
    "filename",
    "status",
    "error_message",
    "sheet_row",
    "extra_info",
];

/// One audit record. Empty optional fields are written as empty cells.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Event {
    pub action: String,
    pub status: String,
    pub filename: Option<String>,
    pub error_message: Option<String>,
    pub sheet_row: Option<usize>,
    pub extra: Map<String, JsonValue>,
}

impl Event {
    pub fn new(action: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            status: status.into(),
            ..Default::default()
        }
    }

    pub fn row(mut self, sheet_row: usize) -> Self {
        self.sheet_row = Some(sheet_row);
        self
    }

    pub fn filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn extra(mut self, key: &str, value: impl Into<JsonValue>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }
}

/// Append-only CSV audit log, one file per local calendar day.
#[derive(Debug, Clone)]
pub struct EventLog {
    dir: PathBuf,
    actor: String,
    script: String,
}

impl EventLog {
    pub fn new(dir: impl Into<PathBuf>, actor: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            actor: actor.into(),
            script: script.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for_day(&self, at: DateTime<Local>) -> PathBuf {
        self.dir.join(format!("{}.log.csv", at.format("%Y-%m-%d")))
    }

    pub fn append(&self, event: &Event) -> anyhow::Result<PathBuf> {
        self.append_at(event, Local::now())
    }

    pub fn append_at(&self, event: &Event, at: DateTime<Local>) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating log directory {}", self.dir.display()))?;
        let path = self.path_for_day(at);
        let write_header = !path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening event log {}", path.display()))?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if write_header {
            writer
                .write_record(EVENT_LOG_FIELDS)
                .with_context(|| format!("writing header to {}", path.display()))?;
        }
        let extra = if event.extra.is_empty() {
            String::new()
        } else {
            serde_json::to_string(&event.extra).context("serializing event extra_info")?
        };
        writer
            .write_record([
                at.format("%Y-%m-%dT%H:%M:%S").to_string(),
                self.actor.clone(),
                self.script.clone(),
                event.action.clone(),
                event.filename.clone().unwrap_or_default(),
                event.status.clone(),
                event.error_message.clone().unwrap_or_default(),
                event.sheet_row.map(|r| r.to_string()).unwrap_or_default(),
                extra,
            ])
            .with_context(|| format!("appending to {}", path.display()))?;
        writer
            .flush()
            .with_context(|| format!("flushing {}", path.display()))?;
        Ok(path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedFile {
    pub file_name: String,
    pub stem: String,
    pub extension: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenameOutcome {
    Renamed,
    AlreadyNamed,
}

const PARTIAL_EXTENSIONS: [&str; 4] = ["part", "crdownload", "tmp", "download"];

/// The download agent's destination directory.
#[derive(Debug, Clone)]
pub struct DownloadDir {
    root: PathBuf,
}

impl DownloadDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Regular files that look finished: no hidden files, no partial-download extensions.
    pub async fn list_completed(&self) -> anyhow::Result<Vec<DownloadedFile>> {
        let mut entries = fs::read_dir(&self.root)
            .await
            .with_context(|| format!("reading download directory {}", self.root.display()))?;
        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing {}", self.root.display()))?
        {
            let file_type = entry
                .file_type()
                .await
                .with_context(|| format!("inspecting {}", entry.path().display()))?;
            if !file_type.is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().to_string();
            if file_name.starts_with('.') {
                continue;
            }
            let path = Path::new(&file_name);
            let extension = path
                .extension()
                .map(|e| e.to_string_lossy().to_string())
                .unwrap_or_default();
            if PARTIAL_EXTENSIONS
                .iter()
                .any(|p| extension.eq_ignore_ascii_case(p))
            {
                continue;
            }
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            files.push(DownloadedFile {
                file_name,
                stem,
                extension,
            });
        }
        files.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        Ok(files)
    }

    /// Rename within the directory. Never replaces an existing file.
    pub async fn rename(&self, from: &str, to: &str) -> anyhow::Result<RenameOutcome> {
        if from == to {
            return Ok(RenameOutcome::AlreadyNamed);
        }
        let source = self.root.join(from);
        let target = self.root.join(to);
        if fs::try_exists(&target)
            .await
            .with_context(|| format!("checking rename target {}", target.display()))?
        {
            anyhow::bail!("refusing to overwrite existing file {}", target.display());
        }
        fs::rename(&source, &target).await.with_context(|| {
            format!(
                "renaming download {} -> {}",
                source.display(),
                target.display()
            )
        })?;
        Ok(RenameOutcome::Renamed)
    }
}

/// Whether a failed attempt is worth repeating. Only quota (429) and server-side
/// failures are; a 4xx from the Sheets API means the request itself is wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

impl RetryDisposition {
    pub fn for_status(status: StatusCode) -> Self {
        match status {
            StatusCode::TOO_MANY_REQUESTS => Self::Retryable,
            s if s.is_server_error() => Self::Retryable,
            _ => Self::NonRetryable,
        }
    }

    pub fn for_error(err: &reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Self::Retryable
        } else {
            Self::NonRetryable
        }
    }
}

/// Doubling delay between attempts, capped at `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `retry` (0-based).
    pub fn delay_before_retry(&self, retry: usize) -> Duration {
        u32::try_from(retry)
            .ok()
            .and_then(|n| 2u32.checked_pow(n))
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// Google Sheets allows 60 write requests per minute per user.
    pub fn sheets_write_quota() -> Self {
        Self {
            capacity: 60,
            refill_every: Duration::from_secs(1),
        }
    }
}

/// Write quota: `capacity` tokens, one more every `refill_every`.
#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl TokenBucketState {
    fn refill(&mut self, capacity: u32, every: Duration) {
        if every.is_zero() {
            self.tokens = capacity;
            return;
        }
        let earned = self.last_refill.elapsed().as_nanos() / every.as_nanos();
        let earned = u32::try_from(earned).unwrap_or(u32::MAX);
        if earned == 0 {
            return;
        }
        self.tokens = self.tokens.saturating_add(earned).min(capacity);
        if self.tokens == capacity {
            self.last_refill = Instant::now();
        } else {
            // Carry the unfinished interval forward.
            self.last_refill += every * earned;
        }
    }
}

impl SimpleTokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            capacity: config.capacity,
            refill_every: config.refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: config.capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Waits until a token is available and consumes it.
    pub async fn take(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                state.refill(self.capacity, self.refill_every);
                if let Some(left) = state.tokens.checked_sub(1) {
                    state.tokens = left;
                    return;
                }
                self.refill_every.saturating_sub(state.last_refill.elapsed())
            };
            debug!(wait_ms = wait.as_millis() as u64, "write quota exhausted");
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    pub write_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: Some(format!("stalkr/{}", env!("CARGO_PKG_VERSION"))),
            backoff: BackoffPolicy::default(),
            write_bucket: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, FetchError> {
        serde_json::from_slice(&self.body).map_err(|source| FetchError::Decode {
            url: self.final_url.clone(),
            source,
        })
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            FetchError::Request(err) => err.status().map(|s| s.as_u16()),
            FetchError::Decode { .. } => None,
        }
    }
}

/// Sequential HTTP client with retry/backoff. Write requests can be throttled through a
/// token bucket to stay under remote quotas.
#[derive(Debug)]
pub struct HttpClient {
    client: reqwest::Client,
    write_bucket: Option<SimpleTokenBucket>,
    backoff: BackoffPolicy,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            write_bucket: config.write_bucket.map(SimpleTokenBucket::new),
            backoff: config.backoff,
        })
    }

    /// Wait for write quota. A no-op when no bucket is configured.
    pub async fn throttle_write(&self) {
        if let Some(bucket) = &self.write_bucket {
            bucket.take().await;
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, label: &str, url: &str) -> Result<T, FetchError> {
        self.execute(label, |client| client.get(url)).await?.json()
    }

    /// Send the request built by `build`, retrying transient failures. `build` is called
    /// once per attempt, so only use this for requests that are safe to repeat.
    pub async fn execute<F>(&self, label: &str, build: F) -> Result<FetchedResponse, FetchError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let span = info_span!("http_request", label);
        self.send(build, self.backoff.max_retries)
            .instrument(span)
            .await
    }

    /// Send exactly one attempt. For requests that change remote state, where a resend
    /// after a lost reply would apply the change twice.
    pub async fn execute_once<F>(&self, label: &str, build: F) -> Result<FetchedResponse, FetchError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let span = info_span!("http_request", label, once = true);
        self.send(build, 0).instrument(span).await
    }

    async fn send<F>(&self, build: F, max_retries: usize) -> Result<FetchedResponse, FetchError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let mut retry = 0;
        loop {
            let can_retry = retry < max_retries;
            match build(&self.client).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let body = resp.bytes().await?.to_vec();

                    if status.is_success() {
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if !can_retry
                        || RetryDisposition::for_status(status) == RetryDisposition::NonRetryable
                    {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                            body: String::from_utf8_lossy(&body).chars().take(500).collect(),
                        });
                    }
                    debug!(retry, status = status.as_u16(), "retrying after http status");
                }
                Err(err) => {
                    if !can_retry || RetryDisposition::for_error(&err) == RetryDisposition::NonRetryable
                    {
                        return Err(FetchError::Request(err));
                    }
                    debug!(retry, error = %err, "retrying after request error");
                }
            }
            tokio::time::sleep(self.backoff.delay_before_retry(retry)).await;
            retry += 1;
        }
    }
}
