use std::sync::Arc;

use stalkr_adapters::{AdapterError, MetadataProvider, TabularStore, VideoMetadata};
use stalkr_core::{Column, ContentId, DuplicateClassification, HeaderMap, ProcessingStatus, SheetRow};
use tracing::{debug, warn};

/// The only path by which row processing mutates the sheet. Every write targets a
/// single cell and is skipped when the snapshot already holds the same value.
#[derive(Clone)]
pub struct StateWriter {
    store: Arc<dyn TabularStore>,
    header: HeaderMap,
}

impl StateWriter {
    pub fn new(store: Arc<dyn TabularStore>, header: HeaderMap) -> Self {
        Self { store, header }
    }

    /// Returns whether a remote write happened.
    pub async fn write_cell(
        &self,
        row: &SheetRow,
        column: Column,
        current: &str,
        value: &str,
    ) -> Result<bool, AdapterError> {
        if current.trim() == value.trim() {
            return Ok(false);
        }
        let idx = self.header.get(column).ok_or_else(|| {
            AdapterError::Message(format!("column '{}' is not mapped", column.header_name()))
        })?;
        self.store
            .update_cell(row.row_number(), idx + 1, value)
            .await?;
        debug!(row = row.row_number(), column = column.header_name(), value, "cell written");
        Ok(true)
    }

    pub async fn write_status(
        &self,
        row: &SheetRow,
        status: &ProcessingStatus,
    ) -> Result<bool, AdapterError> {
        self.write_cell(row, Column::Status, &row.status.cell_value(), &status.cell_value())
            .await
    }

    pub async fn write_duplicate(
        &self,
        row: &SheetRow,
        classification: &DuplicateClassification,
    ) -> Result<bool, AdapterError> {
        self.write_cell(row, Column::Duplicate, &row.duplicate, &classification.cell_value())
            .await
    }

    /// Fills the metadata cells. A non-blank title is never replaced.
    pub async fn write_metadata(
        &self,
        row: &SheetRow,
        metadata: &VideoMetadata,
    ) -> Result<usize, AdapterError> {
        if !row.title.is_empty() {
            return Ok(0);
        }
        let cells = [
            (Column::Title, row.title.as_str(), metadata.title.as_str()),
            (Column::Channel, row.channel.as_str(), metadata.channel.as_str()),
            (
                Column::PublishedDate,
                row.published_date.as_str(),
                metadata.published_date.as_str(),
            ),
            (Column::Duration, row.duration.as_str(), metadata.duration.as_str()),
        ];
        let mut written = 0;
        for (column, current, value) in cells {
            if self.write_cell(row, column, current, value).await? {
                written += 1;
            }
        }
        Ok(written)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrichOutcome {
    /// Title already present.
    Skipped,
    Written(VideoMetadata),
    NotFound,
    Failed(String),
}

/// Best-effort metadata fill for rows with a blank title.
#[derive(Clone)]
pub struct MetadataEnricher {
    provider: Arc<dyn MetadataProvider>,
}

impl MetadataEnricher {
    pub fn new(provider: Arc<dyn MetadataProvider>) -> Self {
        Self { provider }
    }

    pub async fn enrich(&self, writer: &StateWriter, row: &SheetRow, id: &ContentId) -> EnrichOutcome {
        if !row.title.is_empty() {
            return EnrichOutcome::Skipped;
        }
        let metadata = match self.provider.fetch_metadata(id).await {
            Ok(Some(metadata)) if !metadata.title.trim().is_empty() => metadata,
            Ok(_) => {
                debug!(row = row.row_number(), content_id = %id, "no metadata found");
                return EnrichOutcome::NotFound;
            }
            Err(err) => {
                warn!(row = row.row_number(), content_id = %id, error = %err, "metadata lookup failed");
                return EnrichOutcome::Failed(err.to_string());
            }
        };
        match writer.write_metadata(row, &metadata).await {
            Ok(_) => EnrichOutcome::Written(metadata),
            Err(err) => {
                warn!(row = row.row_number(), error = %err, "writing metadata failed");
                EnrichOutcome::Failed(err.to_string())
            }
        }
    }
}
