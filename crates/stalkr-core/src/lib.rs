//! Core domain model for the research sheet: header map, typed rows, content identity,
//! graveyard boundary, status vocabulary and the archival filename contract.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "stalkr-core";

/// Advisory written to the duplicate cell when the clip already exists in the archive.
pub const ARCHIVE_ADVISORY: &str = "If clip ID is found, search PWC Archive tab for further data.";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StructuralError {
    #[error("snapshot has no header row")]
    EmptySnapshot,
    #[error("header '{name}' appears twice (columns {first_column} and {second_column})")]
    DuplicateHeader {
        name: String,
        first_column: usize,
        second_column: usize,
    },
    #[error("required column '{0}' is missing from the header row")]
    MissingColumn(&'static str),
}

/// Columns the reconciler reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Column {
    Researcher,
    Url,
    Title,
    Channel,
    PublishedDate,
    Duration,
    Status,
    Duplicate,
    JobNumber,
    Resolution,
}

impl Column {
    pub const REQUIRED: [Column; 8] = [
        Column::Researcher,
        Column::Url,
        Column::Title,
        Column::Channel,
        Column::PublishedDate,
        Column::Duration,
        Column::Status,
        Column::Duplicate,
    ];

    pub fn header_name(self) -> &'static str {
        match self {
            Column::Researcher => "Researcher Name",
            Column::Url => "URL",
            Column::Title => "Title",
            Column::Channel => "User",
            Column::PublishedDate => "date",
            Column::Duration => "duration",
            Column::Status => "Status",
            Column::Duplicate => "Duplicate",
            Column::JobNumber => "Job Number",
            Column::Resolution => "resolution",
        }
    }

    /// Columns that may be created by appending a header cell. URL and researcher are
    /// human-owned inputs; a tab without them is not a research tab.
    pub fn is_appendable(self) -> bool {
        !matches!(self, Column::Researcher | Column::Url)
    }
}

/// Case and whitespace normalisation used for header lookups.
pub fn normalize_header(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Alphanumeric-only lowercase form, used for initials and title matching.
pub fn normalize_token(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    by_name: HashMap<String, usize>,
    width: usize,
}

impl HeaderMap {
    /// Build from the first snapshot row. Two headers that normalise to the same key
    /// reject the snapshot.
    pub fn from_header_row(cells: &[String]) -> Result<Self, StructuralError> {
        let mut by_name = HashMap::new();
        for (idx, cell) in cells.iter().enumerate() {
            let key = normalize_header(cell);
            if key.is_empty() {
                continue;
            }
            if let Some(first) = by_name.insert(key.clone(), idx) {
                return Err(StructuralError::DuplicateHeader {
                    name: key,
                    first_column: first + 1,
                    second_column: idx + 1,
                });
            }
        }
        Ok(Self {
            by_name,
            width: cells.len(),
        })
    }

    pub fn get(&self, column: Column) -> Option<usize> {
        self.index_of_name(column.header_name())
    }

    pub fn index_of_name(&self, name: &str) -> Option<usize> {
        self.by_name.get(&normalize_header(name)).copied()
    }

    pub fn require(&self, column: Column) -> Result<usize, StructuralError> {
        self.get(column)
            .ok_or(StructuralError::MissingColumn(column.header_name()))
    }

    pub fn missing(&self, columns: &[Column]) -> Vec<Column> {
        columns
            .iter()
            .copied()
            .filter(|c| self.get(*c).is_none())
            .collect()
    }

    /// Record a column appended to the remote header (0-based index).
    pub fn insert(&mut self, column: Column, idx: usize) {
        self.by_name.insert(normalize_header(column.header_name()), idx);
        self.width = self.width.max(idx + 1);
    }

    pub fn width(&self) -> usize {
        self.width
    }
}

/// Processing status vocabulary. The sheet stores free text; anything outside the
/// vocabulary is kept as `Unrecognized` and never treated as blank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessingStatus {
    Blank,
    Todo(String),
    SentToJd2,
    Hold,
    Duplicate,
    NonPlatformLink,
    Renamed,
    Error(String),
    Unrecognized(String),
}

impl ProcessingStatus {
    pub fn parse(raw: &str) -> Self {
        let text = raw.trim();
        if text.is_empty() {
            return Self::Blank;
        }
        if text
            .get(..4)
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case("TODO"))
        {
            return Self::Todo(text.to_string());
        }
        if let Some(message) = text
            .get(..6)
            .filter(|prefix| prefix.eq_ignore_ascii_case("ERROR:"))
            .map(|_| text[6..].trim())
        {
            return Self::Error(message.to_string());
        }
        match text.to_ascii_lowercase().as_str() {
            "sent to jd2" => Self::SentToJd2,
            "hold" => Self::Hold,
            "duplicate" => Self::Duplicate,
            "non-youtube link" => Self::NonPlatformLink,
            "renamed" => Self::Renamed,
            _ => Self::Unrecognized(text.to_string()),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(message.into())
    }

    /// Text written to the status cell.
    pub fn cell_value(&self) -> String {
        match self {
            Self::Blank => String::new(),
            Self::Todo(text) | Self::Unrecognized(text) => text.clone(),
            Self::SentToJd2 => "Sent to JD2".to_string(),
            Self::Hold => "Hold".to_string(),
            Self::Duplicate => "DUPLICATE".to_string(),
            Self::NonPlatformLink => "Non-YouTube link".to_string(),
            Self::Renamed => "Renamed".to_string(),
            Self::Error(message) => format!("ERROR: {message}"),
        }
    }

    pub fn is_eligible(&self) -> bool {
        matches!(self, Self::Blank | Self::Todo(_))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::SentToJd2 | Self::Duplicate | Self::NonPlatformLink | Self::Renamed
        )
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.cell_value())
    }
}

/// Per-row lifecycle as driven by the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RowState {
    Unscanned,
    NonPlatformLink,
    ArchiveDuplicateProceed,
    ResearchDuplicateSkip,
    Ready,
    Held,
    Sent,
    SendError,
    Renamed,
}

const TRANSITIONS: &[(RowState, RowState)] = &[
    (RowState::Unscanned, RowState::NonPlatformLink),
    (RowState::Unscanned, RowState::ArchiveDuplicateProceed),
    (RowState::Unscanned, RowState::ResearchDuplicateSkip),
    (RowState::Unscanned, RowState::Ready),
    (RowState::ArchiveDuplicateProceed, RowState::Held),
    (RowState::ArchiveDuplicateProceed, RowState::Sent),
    (RowState::ArchiveDuplicateProceed, RowState::SendError),
    (RowState::Ready, RowState::Held),
    (RowState::Ready, RowState::Sent),
    (RowState::Ready, RowState::SendError),
    (RowState::Sent, RowState::Renamed),
];

impl RowState {
    pub fn can_transition_to(self, next: RowState) -> bool {
        TRANSITIONS.contains(&(self, next))
    }

    pub fn is_terminal(self) -> bool {
        !TRANSITIONS.iter().any(|(from, _)| *from == self)
    }
}

/// Platform-specific external id (an 11 character YouTube video id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentId(String);

fn url_shapes() -> &'static [Regex] {
    static SHAPES: OnceLock<Vec<Regex>> = OnceLock::new();
    SHAPES.get_or_init(|| {
        [
            r"^(?i:https?://)?(?i:(?:www\.|m\.|music\.)?youtube\.com)/watch\?(?:[^#]*&)?v=([0-9A-Za-z_-]{11})(?:[^0-9A-Za-z_-]|$)",
            r"^(?i:https?://)?(?i:(?:www\.)?youtu\.be)/([0-9A-Za-z_-]{11})(?:[^0-9A-Za-z_-]|$)",
            r"^(?i:https?://)?(?i:(?:www\.|m\.)?youtube(?:-nocookie)?\.com)/(?:embed|shorts|live|v)/([0-9A-Za-z_-]{11})(?:[^0-9A-Za-z_-]|$)",
        ]
        .iter()
        .map(|pattern| Regex::new(pattern).expect("static url pattern compiles"))
        .collect()
    })
}

impl ContentId {
    /// Extract the video id from any known URL shape.
    pub fn from_url(url: &str) -> Option<Self> {
        let url = url.trim();
        url_shapes()
            .iter()
            .find_map(|shape| shape.captures(url))
            .and_then(|caps| caps.get(1))
            .map(|m| Self(m.as_str().to_string()))
    }

    pub fn parse(id: &str) -> Option<Self> {
        let valid = id.len() == 11
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        valid.then(|| Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Typed view of one data row, built once per snapshot through the header map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SheetRow {
    /// 0-based snapshot index; the header row is index 0.
    pub index: usize,
    pub researcher: String,
    pub url: String,
    pub title: String,
    pub channel: String,
    pub published_date: String,
    pub duration: String,
    pub status: ProcessingStatus,
    pub duplicate: String,
    pub job_number: Option<String>,
    pub resolution: Option<String>,
}

impl SheetRow {
    fn from_cells(index: usize, cells: &[String], header: &HeaderMap) -> Result<Self, StructuralError> {
        let cell = |column: Column| -> Result<String, StructuralError> {
            let idx = header.require(column)?;
            Ok(cells.get(idx).map(|v| v.trim().to_string()).unwrap_or_default())
        };
        let optional = |column: Column| -> Option<String> {
            header
                .get(column)
                .and_then(|idx| cells.get(idx))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        Ok(Self {
            index,
            researcher: cell(Column::Researcher)?,
            url: cell(Column::Url)?,
            title: cell(Column::Title)?,
            channel: cell(Column::Channel)?,
            published_date: cell(Column::PublishedDate)?,
            duration: cell(Column::Duration)?,
            status: ProcessingStatus::parse(&cell(Column::Status)?),
            duplicate: cell(Column::Duplicate)?,
            job_number: optional(Column::JobNumber),
            resolution: optional(Column::Resolution),
        })
    }

    /// 1-based row number as shown in the spreadsheet UI.
    pub fn row_number(&self) -> usize {
        self.index + 1
    }

    pub fn content_id(&self) -> Option<ContentId> {
        ContentId::from_url(&self.url)
    }

    pub fn is_owned_by(&self, normalized_initials: &str) -> bool {
        !normalized_initials.is_empty() && normalize_token(&self.researcher) == normalized_initials
    }
}

/// One consistent read of the tab: header map plus typed rows.
#[derive(Debug, Clone)]
pub struct Snapshot {
    header: HeaderMap,
    raw: Vec<Vec<String>>,
    rows: Vec<SheetRow>,
}

impl Snapshot {
    pub fn from_rows(raw: Vec<Vec<String>>) -> Result<Self, StructuralError> {
        let header_cells = raw.first().ok_or(StructuralError::EmptySnapshot)?;
        let header = HeaderMap::from_header_row(header_cells)?;
        Self::with_header(header, raw)
    }

    /// Build with a header map that already accounts for appended columns.
    pub fn with_header(header: HeaderMap, raw: Vec<Vec<String>>) -> Result<Self, StructuralError> {
        if raw.is_empty() {
            return Err(StructuralError::EmptySnapshot);
        }
        for column in Column::REQUIRED {
            header.require(column)?;
        }
        let rows = raw
            .iter()
            .enumerate()
            .skip(1)
            .map(|(idx, cells)| SheetRow::from_cells(idx, cells, &header))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { header, raw, rows })
    }

    pub fn header(&self) -> &HeaderMap {
        &self.header
    }

    pub fn raw_rows(&self) -> &[Vec<String>] {
        &self.raw
    }

    /// Data rows, in snapshot order, excluding the header.
    pub fn rows(&self) -> &[SheetRow] {
        &self.rows
    }

    pub fn row(&self, index: usize) -> Option<&SheetRow> {
        index.checked_sub(1).and_then(|i| self.rows.get(i))
    }

    /// Table length including the header row.
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Region {
    Header,
    Research,
    Archive,
}

/// Keyword rule used to recognise header rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundaryRule {
    keywords: Vec<String>,
    min_matches: usize,
}

impl Default for BoundaryRule {
    fn default() -> Self {
        Self::new(["researcher name", "url", "title", "user"], 3)
    }
}

impl BoundaryRule {
    pub fn new<I, S>(keywords: I, min_matches: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            keywords: keywords
                .into_iter()
                .map(|k| normalize_header(k.as_ref()))
                .filter(|k| !k.is_empty())
                .collect(),
            min_matches: min_matches.max(1),
        }
    }

    pub fn hits(&self, row: &[String]) -> usize {
        let cells: HashSet<String> = row.iter().map(|c| normalize_header(c)).collect();
        self.keywords.iter().filter(|k| cells.contains(*k)).count()
    }

    pub fn is_header_like(&self, row: &[String]) -> bool {
        self.hits(row) >= self.min_matches
    }
}

/// Row index where the frozen archive region starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GraveyardBoundary {
    index: usize,
    detected: bool,
}

impl GraveyardBoundary {
    /// The first header-like row is the live header; the second marks the archive start.
    pub fn detect(rows: &[Vec<String>], rule: &BoundaryRule) -> Option<Self> {
        rows.iter()
            .enumerate()
            .filter(|(_, row)| rule.is_header_like(row))
            .map(|(idx, _)| idx)
            .nth(1)
            .map(|index| Self {
                index,
                detected: true,
            })
    }

    /// No archive region: every data row is research.
    pub fn whole_table(len: usize) -> Self {
        Self {
            index: len,
            detected: false,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn was_detected(&self) -> bool {
        self.detected
    }

    pub fn region_of(&self, row_index: usize) -> Region {
        if row_index == 0 {
            Region::Header
        } else if row_index < self.index {
            Region::Research
        } else {
            Region::Archive
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResearchMatch {
    pub row_number: usize,
    pub researcher: String,
    pub status: String,
}

/// Duplicate state of a row, recomputed on every pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DuplicateClassification {
    None,
    ArchiveMatch,
    ResearchMatch(Vec<ResearchMatch>),
}

impl DuplicateClassification {
    /// Text written to the duplicate cell. Deterministic for a given snapshot.
    pub fn cell_value(&self) -> String {
        match self {
            Self::None => String::new(),
            Self::ArchiveMatch => ARCHIVE_ADVISORY.to_string(),
            Self::ResearchMatch(matches) => {
                let rows = matches
                    .iter()
                    .map(|m| {
                        let status = if m.status.is_empty() {
                            "no status"
                        } else {
                            m.status.as_str()
                        };
                        format!("row {} ({}, {})", m.row_number, m.researcher, status)
                    })
                    .collect::<Vec<_>>()
                    .join("; ");
                format!("Duplicate of {rows}")
            }
        }
    }

    pub fn blocks_dispatch(&self) -> bool {
        matches!(self, Self::ResearchMatch(_))
    }
}

/// Inputs of the canonical archival filename.
#[derive(Debug, Clone, Copy)]
pub struct FilenameParts<'a> {
    pub content_id: &'a str,
    pub channel: &'a str,
    pub job_number: &'a str,
    pub resolution: &'a str,
    pub researcher_initials: &'a str,
    pub description: &'a str,
}

/// Replace every run of characters outside `[A-Za-z0-9_-]` (unicode letters and digits
/// included) with one underscore, then trim underscores.
pub fn sanitize_for_filename(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if c.is_alphanumeric() || c == '-' {
            out.push(c);
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}

pub fn generate_filename(parts: &FilenameParts<'_>) -> String {
    format!(
        "{}_yt_{}_{}_#ncm{}_#nr_{}_{}_stalkr",
        sanitize_for_filename(parts.description),
        parts.content_id,
        sanitize_for_filename(parts.channel),
        parts.job_number,
        sanitize_for_filename(parts.resolution),
        sanitize_for_filename(parts.researcher_initials),
    )
}

/// Job numbers prefix spreadsheet titles, e.g. `04512L-Client research`. Leading zeros
/// are kept.
pub fn extract_job_number(spreadsheet_title: &str) -> Option<String> {
    static JOB: OnceLock<Regex> = OnceLock::new();
    JOB.get_or_init(|| Regex::new(r"^([0-9]{4,})L?").expect("static job pattern compiles"))
        .captures(spreadsheet_title.trim())
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}
