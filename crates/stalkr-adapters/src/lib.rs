//! Collaborator contracts (tabular store, metadata provider, download sink), their
//! Google Sheets / YouTube / JDownloader implementations, and in-memory fixtures.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::DateTime;
use regex::Regex;
use reqwest::header::REFERER;
use reqwest::Url;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use stalkr_core::{normalize_header, ContentId};
use stalkr_storage::{FetchError, HttpClient};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

pub const CRATE_NAME: &str = "stalkr-adapters";

pub const SHEETS_API_BASE: &str = "https://sheets.googleapis.com/v4/spreadsheets";
pub const YOUTUBE_API_BASE: &str = "https://www.googleapis.com/youtube/v3";
pub const JDOWNLOADER_DEFAULT_ENDPOINT: &str = "http://127.0.0.1:9666";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("worksheet '{tab}' not found (available: {})", .available.join(", "))]
    WorksheetNotFound { tab: String, available: Vec<String> },
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Remote spreadsheet tab. Row and column indices are 1-based.
#[async_trait]
pub trait TabularStore: Send + Sync {
    fn describe(&self) -> String;

    async fn fetch_all_rows(&self) -> Result<Vec<Vec<String>>, AdapterError>;

    async fn update_cell(&self, row: usize, column: usize, value: &str) -> Result<(), AdapterError>;

    /// Column index of `name`, appending a header cell at the rightmost free column when absent.
    async fn ensure_column(&self, name: &str) -> Result<usize, AdapterError>;

    /// Title of the whole document (not the tab); carries the job number.
    async fn document_title(&self) -> Result<String, AdapterError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub title: String,
    pub channel: String,
    /// `YYYY-MM-DD`
    pub published_date: String,
    /// `HH:MM:SS` or `MM:SS`
    pub duration: String,
}

#[async_trait]
pub trait MetadataProvider: Send + Sync {
    /// `Ok(None)` when the platform has no such video.
    async fn fetch_metadata(&self, id: &ContentId) -> Result<Option<VideoMetadata>, AdapterError>;
}

#[async_trait]
pub trait DownloadSink: Send + Sync {
    async fn add_link(
        &self,
        url: &str,
        display_name: &str,
        destination_dir: &Path,
    ) -> Result<(), AdapterError>;
}

/// `1 -> A`, `27 -> AA`.
pub fn column_letter(column: usize) -> String {
    let mut n = column.max(1);
    let mut letters = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push(char::from(b'A' + rem as u8));
        n = (n - 1) / 26;
    }
    letters.iter().rev().collect()
}

/// Accepts a full sheet URL or a bare spreadsheet id.
pub fn spreadsheet_id_from_url(sheet_url: &str) -> Option<String> {
    static ID: OnceLock<Regex> = OnceLock::new();
    let sheet_url = sheet_url.trim();
    let pattern = ID.get_or_init(|| {
        Regex::new(r"/spreadsheets/d/([A-Za-z0-9_-]+)").expect("static sheet id pattern compiles")
    });
    if let Some(caps) = pattern.captures(sheet_url) {
        return caps.get(1).map(|m| m.as_str().to_string());
    }
    let bare = !sheet_url.is_empty()
        && sheet_url
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    bare.then(|| sheet_url.to_string())
}

/// `PT1H2M3S -> 01:02:03`, `PT4M5S -> 04:05`. Days fold into hours. `None` when
/// the value does not parse or the hour count overflows.
pub fn format_iso8601_duration(value: &str) -> Option<String> {
    static ISO: OnceLock<Regex> = OnceLock::new();
    let pattern = ISO.get_or_init(|| {
        Regex::new(r"^P(?:(\d+)D)?(?:T(?:(\d+)H)?(?:(\d+)M)?(?:(\d+)S)?)?$")
            .expect("static duration pattern compiles")
    });
    let value = value.trim();
    let caps = pattern.captures(value)?;
    if (1..=4).all(|i| caps.get(i).is_none()) {
        return None;
    }
    let part = |i: usize| -> Option<u64> {
        caps.get(i).map_or(Some(0), |m| m.as_str().parse().ok())
    };
    let hours = part(1)?.checked_mul(24)?.checked_add(part(2)?)?;
    let minutes = part(3)?;
    let seconds = part(4)?;
    Some(if hours > 0 {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes:02}:{seconds:02}")
    })
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct SpreadsheetInfo {
    properties: SpreadsheetProperties,
    #[serde(default)]
    sheets: Vec<SheetInfo>,
}

#[derive(Debug, Deserialize)]
struct SpreadsheetProperties {
    title: String,
}

#[derive(Debug, Deserialize)]
struct SheetInfo {
    properties: SpreadsheetProperties,
}

/// Google Sheets values API over a bearer token.
#[derive(Debug, Clone)]
pub struct GoogleSheetsStore {
    http: Arc<HttpClient>,
    spreadsheet_id: String,
    tab: String,
    token: String,
    base_url: String,
}

impl GoogleSheetsStore {
    pub fn new(
        http: Arc<HttpClient>,
        sheet_url: &str,
        tab: impl Into<String>,
        token: impl Into<String>,
    ) -> Result<Self, AdapterError> {
        let spreadsheet_id = spreadsheet_id_from_url(sheet_url).ok_or_else(|| {
            AdapterError::Message(format!("cannot find a spreadsheet id in '{sheet_url}'"))
        })?;
        Ok(Self {
            http,
            spreadsheet_id,
            tab: tab.into(),
            token: token.into(),
            base_url: SHEETS_API_BASE.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn tab(&self) -> &str {
        &self.tab
    }

    /// A1 range scoped to this tab; single quotes in the tab name are doubled.
    pub fn range(&self, a1: Option<&str>) -> String {
        let quoted = format!("'{}'", self.tab.replace('\'', "''"));
        match a1 {
            Some(a1) => format!("{quoted}!{a1}"),
            None => quoted,
        }
    }

    fn values_url(&self, range: &str) -> Result<Url, AdapterError> {
        let mut url = Url::parse(&format!("{}/{}/values", self.base_url, self.spreadsheet_id))
            .map_err(|err| AdapterError::Message(format!("invalid sheets url: {err}")))?;
        url.path_segments_mut()
            .map_err(|_| AdapterError::Message("sheets base url cannot carry a path".into()))?
            .push(range);
        Ok(url)
    }

    async fn spreadsheet_info(&self) -> Result<SpreadsheetInfo, AdapterError> {
        let url = Url::parse_with_params(
            &format!("{}/{}", self.base_url, self.spreadsheet_id),
            &[("fields", "properties.title,sheets.properties.title")],
        )
        .map_err(|err| AdapterError::Message(format!("invalid sheets url: {err}")))?;
        let response = self
            .http
            .execute("sheets_properties", |client| {
                client.get(url.clone()).bearer_auth(&self.token)
            })
            .await?;
        Ok(response.json()?)
    }

    pub async fn list_tabs(&self) -> Result<Vec<String>, AdapterError> {
        Ok(self
            .spreadsheet_info()
            .await?
            .sheets
            .into_iter()
            .map(|s| s.properties.title)
            .collect())
    }

    async fn read_range(&self, range: &str) -> Result<Vec<Vec<String>>, AdapterError> {
        let url = self.values_url(range)?;
        let result = self
            .http
            .execute("sheets_read", |client| {
                client.get(url.clone()).bearer_auth(&self.token)
            })
            .await;
        match result {
            Ok(response) => Ok(response.json::<ValueRange>()?.values),
            Err(FetchError::HttpStatus { status: 400, body, .. })
                if body.contains("Unable to parse range") =>
            {
                let available = self.list_tabs().await.unwrap_or_default();
                Err(AdapterError::WorksheetNotFound {
                    tab: self.tab.clone(),
                    available,
                })
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl TabularStore for GoogleSheetsStore {
    fn describe(&self) -> String {
        format!("sheet {} tab '{}'", self.spreadsheet_id, self.tab)
    }

    async fn fetch_all_rows(&self) -> Result<Vec<Vec<String>>, AdapterError> {
        let mut rows = self.read_range(&self.range(None)).await?;
        let width = rows.iter().map(Vec::len).max().unwrap_or(0);
        for row in &mut rows {
            row.resize(width, String::new());
        }
        debug!(rows = rows.len(), width, "fetched sheet rows");
        Ok(rows)
    }

    async fn update_cell(&self, row: usize, column: usize, value: &str) -> Result<(), AdapterError> {
        let a1 = format!("{}{}", column_letter(column), row);
        let range = self.range(Some(&a1));
        let mut url = self.values_url(&range)?;
        url.query_pairs_mut().append_pair("valueInputOption", "RAW");
        let body = serde_json::json!({
            "range": range,
            "majorDimension": "ROWS",
            "values": [[value]],
        });
        self.http.throttle_write().await;
        self.http
            .execute("sheets_write", |client| {
                client.put(url.clone()).bearer_auth(&self.token).json(&body)
            })
            .await?;
        Ok(())
    }

    async fn ensure_column(&self, name: &str) -> Result<usize, AdapterError> {
        let header = self
            .read_range(&self.range(Some("1:1")))
            .await?
            .into_iter()
            .next()
            .unwrap_or_default();
        let wanted = normalize_header(name);
        if let Some(idx) = header.iter().position(|h| normalize_header(h) == wanted) {
            return Ok(idx + 1);
        }
        let column = header.len() + 1;
        self.update_cell(1, column, name).await?;
        Ok(column)
    }

    async fn document_title(&self) -> Result<String, AdapterError> {
        Ok(self.spreadsheet_info().await?.properties.title)
    }
}

#[derive(Debug, Deserialize)]
struct VideoListResponse {
    #[serde(default)]
    items: Vec<VideoItem>,
}

#[derive(Debug, Deserialize)]
struct VideoItem {
    snippet: VideoSnippet,
    #[serde(rename = "contentDetails")]
    content_details: VideoContentDetails,
}

#[derive(Debug, Deserialize)]
struct VideoSnippet {
    #[serde(default)]
    title: String,
    #[serde(rename = "channelTitle", default)]
    channel_title: String,
    #[serde(rename = "publishedAt", default)]
    published_at: String,
}

#[derive(Debug, Deserialize)]
struct VideoContentDetails {
    #[serde(default)]
    duration: String,
}

fn video_item_to_metadata(item: VideoItem) -> Result<VideoMetadata, AdapterError> {
    let published_date = match DateTime::parse_from_rfc3339(&item.snippet.published_at) {
        Ok(ts) => ts.format("%Y-%m-%d").to_string(),
        Err(_) => item
            .snippet
            .published_at
            .split('T')
            .next()
            .unwrap_or_default()
            .to_string(),
    };
    let duration = format_iso8601_duration(&item.content_details.duration).ok_or_else(|| {
        AdapterError::Malformed(format!(
            "unparseable duration '{}'",
            item.content_details.duration
        ))
    })?;
    Ok(VideoMetadata {
        title: item.snippet.title,
        channel: item.snippet.channel_title,
        published_date,
        duration,
    })
}

/// YouTube Data API v3 `videos.list`.
#[derive(Debug, Clone)]
pub struct YouTubeMetadataProvider {
    http: Arc<HttpClient>,
    api_key: String,
    base_url: String,
}

impl YouTubeMetadataProvider {
    pub fn new(http: Arc<HttpClient>, api_key: impl Into<String>) -> Self {
        Self {
            http,
            api_key: api_key.into(),
            base_url: YOUTUBE_API_BASE.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl MetadataProvider for YouTubeMetadataProvider {
    async fn fetch_metadata(&self, id: &ContentId) -> Result<Option<VideoMetadata>, AdapterError> {
        let url = Url::parse_with_params(
            &format!("{}/videos", self.base_url),
            &[
                ("part", "snippet,contentDetails"),
                ("id", id.as_str()),
                ("key", self.api_key.as_str()),
            ],
        )
        .map_err(|err| AdapterError::Message(format!("invalid youtube url: {err}")))?;
        let response: VideoListResponse = self.http.get_json("youtube_videos", url.as_str()).await?;
        response
            .items
            .into_iter()
            .next()
            .map(video_item_to_metadata)
            .transpose()
    }
}

/// JDownloader's local FlashGot endpoint (Click'n'Load port).
#[derive(Debug, Clone)]
pub struct JDownloaderSink {
    http: Arc<HttpClient>,
    endpoint: String,
}

impl JDownloaderSink {
    pub fn new(http: Arc<HttpClient>, endpoint: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// True when the running JDownloader answers on its local check script.
    pub async fn probe(&self) -> Result<bool, AdapterError> {
        let url = format!("{}/jdcheck.js", self.endpoint);
        let response = self
            .http
            .execute("jdownloader_check", |client| client.get(&url))
            .await?;
        Ok(response.text().contains("jdownloader=true"))
    }
}

#[async_trait]
impl DownloadSink for JDownloaderSink {
    async fn add_link(
        &self,
        url: &str,
        display_name: &str,
        destination_dir: &Path,
    ) -> Result<(), AdapterError> {
        let endpoint = format!("{}/flashgot", self.endpoint);
        let dir = destination_dir.display().to_string();
        let form = [
            ("urls", url),
            ("package", display_name),
            ("dir", dir.as_str()),
            ("autostart", "1"),
            ("source", "stalkr"),
        ];
        // Queues a download, so a resend after a lost reply would queue it twice.
        self.http
            .execute_once("jdownloader_flashgot", |client| {
                client
                    .post(&endpoint)
                    .header(REFERER, "http://localhost")
                    .form(&form)
            })
            .await?;
        Ok(())
    }
}

/// One recorded single-cell write (1-based coordinates).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellWrite {
    pub row: usize,
    pub column: usize,
    pub value: String,
}

/// In-memory tab used by tests and fixture runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    title: String,
    rows: Mutex<Vec<Vec<String>>>,
    writes: Mutex<Vec<CellWrite>>,
}

impl MemoryStore {
    pub fn new(rows: Vec<Vec<String>>) -> Self {
        Self {
            title: String::new(),
            rows: Mutex::new(rows),
            writes: Mutex::new(Vec::new()),
        }
    }

    pub fn from_fixture(fixture: SheetFixture) -> Self {
        Self::new(fixture.rows).with_title(fixture.title)
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub async fn rows(&self) -> Vec<Vec<String>> {
        self.rows.lock().await.clone()
    }

    pub async fn writes(&self) -> Vec<CellWrite> {
        self.writes.lock().await.clone()
    }

    /// 1-based cell read; cells past a ragged row end read as empty.
    pub async fn cell(&self, row: usize, column: usize) -> String {
        let rows = self.rows.lock().await;
        rows.get(row.saturating_sub(1))
            .and_then(|r| r.get(column.saturating_sub(1)))
            .cloned()
            .unwrap_or_default()
    }

    /// Simulates a human appending a row; not recorded as a write.
    pub async fn push_row(&self, row: Vec<String>) {
        self.rows.lock().await.push(row);
    }

    /// Simulates a human editing a cell; not recorded as a write.
    pub async fn edit_cell(&self, row: usize, column: usize, value: &str) {
        let mut rows = self.rows.lock().await;
        set_cell(&mut rows, row, column, value);
    }
}

fn set_cell(rows: &mut Vec<Vec<String>>, row: usize, column: usize, value: &str) {
    let (r, c) = (row.saturating_sub(1), column.saturating_sub(1));
    if rows.len() <= r {
        rows.resize(r + 1, Vec::new());
    }
    if rows[r].len() <= c {
        rows[r].resize(c + 1, String::new());
    }
    rows[r][c] = value.to_string();
}

#[async_trait]
impl TabularStore for MemoryStore {
    fn describe(&self) -> String {
        format!("in-memory tab '{}'", self.title)
    }

    async fn fetch_all_rows(&self) -> Result<Vec<Vec<String>>, AdapterError> {
        Ok(self.rows().await)
    }

    async fn update_cell(&self, row: usize, column: usize, value: &str) -> Result<(), AdapterError> {
        if row == 0 || column == 0 {
            return Err(AdapterError::Message(format!(
                "cell coordinates are 1-based, got ({row}, {column})"
            )));
        }
        let mut rows = self.rows.lock().await;
        set_cell(&mut rows, row, column, value);
        self.writes.lock().await.push(CellWrite {
            row,
            column,
            value: value.to_string(),
        });
        Ok(())
    }

    async fn ensure_column(&self, name: &str) -> Result<usize, AdapterError> {
        let width = {
            let rows = self.rows.lock().await;
            let header = rows.first().cloned().unwrap_or_default();
            let wanted = normalize_header(name);
            if let Some(idx) = header.iter().position(|h| normalize_header(h) == wanted) {
                return Ok(idx + 1);
            }
            header.len()
        };
        self.update_cell(1, width + 1, name).await?;
        Ok(width + 1)
    }

    async fn document_title(&self) -> Result<String, AdapterError> {
        Ok(self.title.clone())
    }
}

/// Metadata provider answering from a fixed table.
#[derive(Debug, Default)]
pub struct StaticMetadataProvider {
    entries: HashMap<String, std::result::Result<VideoMetadata, String>>,
    calls: Mutex<Vec<String>>,
}

impl StaticMetadataProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_video(mut self, id: &str, metadata: VideoMetadata) -> Self {
        self.entries.insert(id.to_string(), Ok(metadata));
        self
    }

    pub fn with_error(mut self, id: &str, message: &str) -> Self {
        self.entries.insert(id.to_string(), Err(message.to_string()));
        self
    }

    pub async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl MetadataProvider for StaticMetadataProvider {
    async fn fetch_metadata(&self, id: &ContentId) -> Result<Option<VideoMetadata>, AdapterError> {
        self.calls.lock().await.push(id.to_string());
        match self.entries.get(id.as_str()) {
            Some(Ok(metadata)) => Ok(Some(metadata.clone())),
            Some(Err(message)) => Err(AdapterError::Message(message.clone())),
            None => Ok(None),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkCall {
    pub url: String,
    pub display_name: String,
    pub destination_dir: PathBuf,
}

/// Download sink that records every dispatch, optionally failing each one.
#[derive(Debug, Default)]
pub struct RecordingSink {
    fail_with: Option<String>,
    calls: Mutex<Vec<SinkCall>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            fail_with: Some(message.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub async fn calls(&self) -> Vec<SinkCall> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl DownloadSink for RecordingSink {
    async fn add_link(
        &self,
        url: &str,
        display_name: &str,
        destination_dir: &Path,
    ) -> Result<(), AdapterError> {
        self.calls.lock().await.push(SinkCall {
            url: url.to_string(),
            display_name: display_name.to_string(),
            destination_dir: destination_dir.to_path_buf(),
        });
        match &self.fail_with {
            Some(message) => Err(AdapterError::Message(message.clone())),
            None => Ok(()),
        }
    }
}

/// Captured tab contents used to seed a `MemoryStore`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SheetFixture {
    pub title: String,
    pub tab: String,
    pub rows: Vec<Vec<String>>,
}

pub fn load_sheet_fixture(path: impl AsRef<Path>) -> Result<SheetFixture> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}
