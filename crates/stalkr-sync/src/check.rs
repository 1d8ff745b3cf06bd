use std::fmt;

use serde::Serialize;
use stalkr_adapters::{MetadataProvider, TabularStore};
use stalkr_core::{BoundaryRule, Column, ContentId, GraveyardBoundary, HeaderMap};

/// Well-known public video used to exercise the metadata provider.
pub const CHECK_VIDEO_ID: &str = "dQw4w9WgXcQ";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub ok: bool,
    pub detail: String,
}

impl CheckResult {
    pub fn ok(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ok: true,
            detail: detail.into(),
        }
    }

    pub fn error(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ok: false,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for CheckResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = if self.ok { "OK" } else { "ERROR" };
        write!(f, "[{label}] {}: {}", self.name, self.detail)
    }
}

/// Read-only: reports structure problems without appending columns.
pub async fn check_sheet(store: &dyn TabularStore, rule: &BoundaryRule) -> CheckResult {
    const NAME: &str = "sheet";
    let rows = match store.fetch_all_rows().await {
        Ok(rows) => rows,
        Err(err) => return CheckResult::error(NAME, err.to_string()),
    };
    let Some(first) = rows.first() else {
        return CheckResult::error(NAME, format!("{} is empty", store.describe()));
    };
    let header = match HeaderMap::from_header_row(first) {
        Ok(header) => header,
        Err(err) => return CheckResult::error(NAME, err.to_string()),
    };
    let missing = header.missing(&Column::REQUIRED);
    if let Some(fatal) = missing.iter().find(|c| !c.is_appendable()) {
        return CheckResult::error(
            NAME,
            format!("required column '{}' is missing", fatal.header_name()),
        );
    }
    let boundary = match GraveyardBoundary::detect(&rows, rule) {
        Some(boundary) => format!("graveyard starts at row {}", boundary.index() + 1),
        None => "no graveyard boundary found".to_string(),
    };
    let mut detail = format!("{}: {} rows, {boundary}", store.describe(), rows.len());
    if !missing.is_empty() {
        let names: Vec<&str> = missing.iter().map(|c| c.header_name()).collect();
        detail.push_str(&format!("; will append columns: {}", names.join(", ")));
    }
    CheckResult::ok(NAME, detail)
}

pub async fn check_metadata(provider: &dyn MetadataProvider) -> CheckResult {
    const NAME: &str = "metadata";
    let Some(id) = ContentId::parse(CHECK_VIDEO_ID) else {
        return CheckResult::error(NAME, "invalid probe id");
    };
    match provider.fetch_metadata(&id).await {
        Ok(Some(metadata)) => CheckResult::ok(
            NAME,
            format!("'{}' ({}, {})", metadata.title, metadata.channel, metadata.duration),
        ),
        Ok(None) => CheckResult::error(NAME, format!("video {id} not found")),
        Err(err) => CheckResult::error(NAME, err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stalkr_adapters::{MemoryStore, StaticMetadataProvider, VideoMetadata};

    fn cells(values: &[&str]) -> Vec<String> {
        values.iter().map(|c| c.to_string()).collect()
    }

    #[tokio::test]
    async fn sheet_check_reports_boundary_and_appendable_columns() {
        let store = MemoryStore::new(vec![
            cells(&["Researcher Name", "URL", "Title", "User", "Status"]),
            cells(&["pm", "https://youtu.be/dQw4w9WgXcQ", "", "", ""]),
            cells(&["Researcher Name", "URL", "Title", "User", "Status"]),
        ]);
        let result = check_sheet(&store, &BoundaryRule::default()).await;
        assert!(result.ok, "{result}");
        assert!(result.detail.contains("3 rows"));
        assert!(result.detail.contains("graveyard starts at row 3"));
        assert!(result.detail.contains("date, duration, Duplicate"));
        assert!(store.writes().await.is_empty());
    }

    #[tokio::test]
    async fn sheet_check_fails_without_url_column() {
        let store = MemoryStore::new(vec![cells(&["Researcher Name", "Title"])]);
        let result = check_sheet(&store, &BoundaryRule::default()).await;
        assert!(!result.ok);
        assert_eq!(result.to_string(), "[ERROR] sheet: required column 'URL' is missing");
    }

    #[tokio::test]
    async fn metadata_check_uses_probe_video() {
        let provider = StaticMetadataProvider::new().with_video(
            CHECK_VIDEO_ID,
            VideoMetadata {
                title: "Never Gonna Give You Up".into(),
                channel: "Rick Astley".into(),
                published_date: "2009-10-25".into(),
                duration: "03:33".into(),
            },
        );
        let result = check_metadata(&provider).await;
        assert!(result.ok);
        assert_eq!(provider.calls().await, vec![CHECK_VIDEO_ID.to_string()]);

        let result = check_metadata(&StaticMetadataProvider::new()).await;
        assert!(!result.ok);
    }
}
